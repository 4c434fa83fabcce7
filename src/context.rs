//! Backend selection and connection lifecycle.
//!
//! A [`BackendContext`] builds each backend on first use and shares it between the tables it
//! hands out. [`global`] is a process-wide context read from the environment; passing an
//! explicit context around is preferred in tests.

use crate::{
    backend::{
        Backend, BackendKind,
        document::{DocumentBackend, collection::MongoDatabase},
        dynamodb::KeyValueBackend,
    },
    config::Config,
    error::Result,
    schema::Schema,
    table::Table,
};

use parking_lot::Mutex;
use std::{
    fmt,
    sync::{Arc, OnceLock},
};

/// Lazily connected backends sharing one configuration.
pub struct BackendContext {
    config: Config,
    key_value: Mutex<Option<Arc<dyn Backend>>>,
    document: Mutex<Option<Arc<dyn Backend>>>,
}

impl BackendContext {
    /// Context without any connection yet.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            key_value: Mutex::new(None),
            document: Mutex::new(None),
        }
    }

    /// Installs a ready backend for its kind instead of connecting on first use.
    pub fn with_backend(self, backend: Arc<dyn Backend>) -> Self {
        let kind = backend.kind();
        *self.slot(kind).lock() = Some(backend);
        self
    }

    /// Configuration of the context.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn slot(&self, kind: BackendKind) -> &Mutex<Option<Arc<dyn Backend>>> {
        match kind {
            BackendKind::KeyValue => &self.key_value,
            BackendKind::Document => &self.document,
        }
    }

    /// Backend of the given kind, connecting on first use.
    pub fn backend(&self, kind: BackendKind) -> Result<Arc<dyn Backend>> {
        let mut slot = self.slot(kind).lock();
        if let Some(backend) = slot.as_ref() {
            return Ok(Arc::clone(backend));
        }
        let backend: Arc<dyn Backend> = match kind {
            BackendKind::KeyValue => Arc::new(KeyValueBackend::from_env(self.config.aws_region())?),
            BackendKind::Document => {
                let database = MongoDatabase::connect(
                    &self.config.mongo_uri()?,
                    &self.config.mongo_database()?,
                )?;
                Arc::new(DocumentBackend::new(Arc::new(database)))
            }
        };
        tracing::debug!(?kind, "backend connected");
        *slot = Some(Arc::clone(&backend));
        Ok(backend)
    }

    /// Table on the backend selected by the service mode.
    pub fn table(&self, schema: Arc<Schema>) -> Result<Table> {
        self.table_with(schema, self.config.backend_kind()?)
    }

    /// Table on an explicit backend.
    pub fn table_with(&self, schema: Arc<Schema>, kind: BackendKind) -> Result<Table> {
        Ok(Table::new(schema, self.backend(kind)?))
    }

    /// Drops the connections held by the context. Tables already handed out keep theirs.
    pub fn shutdown(&self) {
        for kind in [BackendKind::KeyValue, BackendKind::Document] {
            if self.slot(kind).lock().take().is_some() {
                tracing::debug!(?kind, "backend released");
            }
        }
    }
}

impl fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendContext")
            .field("config", &self.config)
            .field("key_value", &self.key_value.lock().is_some())
            .field("document", &self.document.lock().is_some())
            .finish()
    }
}

/// Process-wide context configured from the environment.
pub fn global() -> &'static BackendContext {
    static CONTEXT: OnceLock<BackendContext> = OnceLock::new();
    CONTEXT.get_or_init(|| BackendContext::new(Config::from_env()))
}
