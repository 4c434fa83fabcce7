//! Environment driven configuration.
//!
//! Every variable has a current name and, for most of them, a legacy lowercase name that is still
//! honored. Empty values count as unset.

use crate::{
    backend::BackendKind,
    error::{Error, Result},
};

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

/// Provider of raw configuration values.
pub trait ConfigSource: Send + Sync {
    /// Raw value of a variable.
    fn get(&self, key: &str) -> Option<String>;
}

/// The process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl ConfigSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Known configuration variables.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Env {
    /// `docker` selects the document store, `saas` the key-value store.
    ServiceMode,
    /// Document store user.
    MongoUser,
    /// Document store password.
    MongoPassword,
    /// Document store `host:port`.
    MongoUrl,
    /// Full document store connection string. Takes precedence over the parts.
    MongoUri,
    /// Document store database name.
    MongoDbName,
    /// Whether to use the `mongodb+srv` scheme.
    MongoSrv,
    /// Key-value store region.
    AwsRegion,
    /// Fallback key-value store region.
    AwsDefaultRegion,
    /// Log level of the installed subscriber.
    LogLevel,
    /// Lifetime of cached parameter store values.
    InnerCacheTtlSeconds,
}

impl Env {
    /// Every variable.
    pub const ALL: [Self; 11] = [
        Self::ServiceMode,
        Self::MongoUser,
        Self::MongoPassword,
        Self::MongoUrl,
        Self::MongoUri,
        Self::MongoDbName,
        Self::MongoSrv,
        Self::AwsRegion,
        Self::AwsDefaultRegion,
        Self::LogLevel,
        Self::InnerCacheTtlSeconds,
    ];

    /// Current name.
    pub fn name(self) -> &'static str {
        match self {
            Self::ServiceMode => "MODULAR_SDK_SERVICE_MODE",
            Self::MongoUser => "MODULAR_SDK_MONGO_USER",
            Self::MongoPassword => "MODULAR_SDK_MONGO_PASSWORD",
            Self::MongoUrl => "MODULAR_SDK_MONGO_URL",
            Self::MongoUri => "MODULAR_SDK_MONGO_URI",
            Self::MongoDbName => "MODULAR_SDK_MONGO_DB_NAME",
            Self::MongoSrv => "MODULAR_SDK_MONGO_SRV",
            Self::AwsRegion => "AWS_REGION",
            Self::AwsDefaultRegion => "AWS_DEFAULT_REGION",
            Self::LogLevel => "MODULAR_SDK_LOG_LEVEL",
            Self::InnerCacheTtlSeconds => "MODULAR_SDK_INNER_CACHE_TTL_SECONDS",
        }
    }

    /// Name still read when the current one is unset.
    pub fn legacy_name(self) -> Option<&'static str> {
        match self {
            Self::ServiceMode => Some("modular_service_mode"),
            Self::MongoUser => Some("modular_mongo_user"),
            Self::MongoPassword => Some("modular_mongo_password"),
            Self::MongoUrl => Some("modular_mongo_url"),
            Self::MongoUri => Some("modular_mongo_uri"),
            Self::MongoDbName => Some("modular_mongo_db_name"),
            Self::MongoSrv => Some("modular_mongo_srv"),
            Self::InnerCacheTtlSeconds => Some("INNER_CACHE_TTL_SECONDS"),
            Self::AwsRegion | Self::AwsDefaultRegion | Self::LogLevel => None,
        }
    }

    /// Value used when neither name is set.
    pub fn default_value(self) -> Option<&'static str> {
        match self {
            Self::ServiceMode => Some("saas"),
            Self::MongoSrv => Some("false"),
            Self::LogLevel => Some("INFO"),
            Self::InnerCacheTtlSeconds => Some("300"),
            _ => None,
        }
    }

    /// Whether the value must not be logged.
    pub fn is_secret(self) -> bool {
        matches!(self, Self::MongoPassword | Self::MongoUri)
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed view over a [`ConfigSource`].
///
/// ```rust
/// use std::collections::HashMap;
///
/// use modular_sdk::{backend::BackendKind, config::Config};
///
/// let config = Config::new(HashMap::from([(
///     "modular_service_mode".to_string(),
///     "docker".to_string(),
/// )]));
/// assert_eq!(config.backend_kind().unwrap(), BackendKind::Document);
/// ```
#[derive(Clone)]
pub struct Config {
    source: Arc<dyn ConfigSource>,
}

impl Config {
    /// Configuration read from the given source.
    pub fn new(source: impl ConfigSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Configuration read from the process environment.
    pub fn from_env() -> Self {
        Self::new(ProcessEnv)
    }

    fn lookup(&self, key: &str) -> Option<String> {
        self.source.get(key).filter(|value| !value.is_empty())
    }

    /// Raw value: the current name, then the legacy name, then the default.
    pub fn get(&self, env: Env) -> Option<String> {
        self.lookup(env.name())
            .or_else(|| env.legacy_name().and_then(|legacy| self.lookup(legacy)))
            .or_else(|| env.default_value().map(str::to_string))
    }

    fn invalid(env: Env, reason: impl Into<String>) -> Error {
        Error::Config {
            key: env.name().to_string(),
            reason: reason.into(),
        }
    }

    /// Boolean value. Accepts `true/t/y/yes/1` and `false/f/n/no/0` in any case.
    pub fn get_bool(&self, env: Env) -> Result<Option<bool>> {
        self.get(env)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "true" | "t" | "y" | "yes" | "1" => Ok(true),
                "false" | "f" | "n" | "no" | "0" => Ok(false),
                _ => Err(Self::invalid(env, format!("'{value}' is not a boolean"))),
            })
            .transpose()
    }

    /// Integer value.
    pub fn get_int(&self, env: Env) -> Result<Option<i64>> {
        self.get(env)
            .map(|value| {
                value
                    .trim()
                    .parse()
                    .map_err(|_| Self::invalid(env, format!("'{value}' is not an integer")))
            })
            .transpose()
    }

    /// Float value.
    pub fn get_float(&self, env: Env) -> Result<Option<f64>> {
        self.get(env)
            .map(|value| {
                value
                    .trim()
                    .parse()
                    .map_err(|_| Self::invalid(env, format!("'{value}' is not a number")))
            })
            .transpose()
    }

    /// Value parsed through [`FromStr`].
    pub fn get_enum<T>(&self, env: Env) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(env)
            .map(|value| {
                value
                    .parse()
                    .map_err(|error: T::Err| Self::invalid(env, error.to_string()))
            })
            .transpose()
    }

    /// Raw service mode, `saas` unless configured.
    pub fn service_mode(&self) -> String {
        self.get(Env::ServiceMode)
            .unwrap_or_else(|| "saas".to_string())
    }

    /// Backend selected by the service mode.
    pub fn backend_kind(&self) -> Result<BackendKind> {
        Ok(self
            .get_enum(Env::ServiceMode)?
            .unwrap_or(BackendKind::KeyValue))
    }

    /// Document store connection string.
    ///
    /// An explicit URI wins. Otherwise it is assembled from the URL, the optional credentials and
    /// the srv flag.
    pub fn mongo_uri(&self) -> Result<String> {
        if let Some(uri) = self.get(Env::MongoUri) {
            return Ok(uri);
        }
        let url = self
            .get(Env::MongoUrl)
            .ok_or_else(|| Self::invalid(Env::MongoUrl, "is not set"))?;
        let scheme = if self.get_bool(Env::MongoSrv)?.unwrap_or(false) {
            "mongodb+srv"
        } else {
            "mongodb"
        };
        Ok(match (self.get(Env::MongoUser), self.get(Env::MongoPassword)) {
            (Some(user), Some(password)) => format!("{scheme}://{user}:{password}@{url}/"),
            (Some(user), None) => format!("{scheme}://{user}@{url}/"),
            _ => format!("{scheme}://{url}/"),
        })
    }

    /// Document store database name.
    pub fn mongo_database(&self) -> Result<String> {
        self.get(Env::MongoDbName)
            .ok_or_else(|| Self::invalid(Env::MongoDbName, "is not set"))
    }

    /// Key-value store region, falling back to the default region.
    pub fn aws_region(&self) -> Option<String> {
        self.get(Env::AwsRegion)
            .or_else(|| self.get(Env::AwsDefaultRegion))
    }

    /// Log level, `INFO` unless configured.
    pub fn log_level(&self) -> String {
        self.get(Env::LogLevel)
            .unwrap_or_else(|| "INFO".to_string())
    }

    /// Lifetime of cached parameter store values. Malformed values fall back to the default.
    pub fn inner_cache_ttl(&self) -> Duration {
        const DEFAULT: u64 = 300;
        let seconds = match self.get(Env::InnerCacheTtlSeconds) {
            Some(value) => value.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(
                    key = Env::InnerCacheTtlSeconds.name(),
                    %value,
                    "cache ttl is not a number of seconds, using the default"
                );
                DEFAULT
            }),
            None => DEFAULT,
        };
        Duration::from_secs(seconds)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for env in Env::ALL {
            if let Some(value) = self.get(env) {
                if env.is_secret() {
                    map.entry(&env.name(), &"****");
                } else {
                    map.entry(&env.name(), &value);
                }
            }
        }
        map.finish()
    }
}
