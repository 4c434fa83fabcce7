//! Adapter facade binding a schema to a backend.
//!
//! A [`Table`] serializes native values through the schema, keeps undeclared stored attributes
//! alive across writes, and delegates every round trip to its [`Backend`].

use crate::{
    backend::{
        Backend, BackendKind, BatchWriteOutcome, Count, GetOptions, Query, Scan, Target,
        WriteRequest,
    },
    common::{
        condition::Condition,
        key::Keys,
        path::{Path, PathElement},
        update::Action,
    },
    cursor::ResultCursor,
    error::{Error, Result},
    item::{Identity, Item},
    safe_update,
    schema::{Map, Schema, Value},
};

use std::{fmt, mem, sync::Arc};

/// Schema bound to a backend.
///
/// ```rust
/// use std::sync::Arc;
///
/// use modular_sdk::{
///     backend::document::{DocumentBackend, memory::MemoryDatabase},
///     common::path::Path,
///     schema::{AttributeType, Field, Schema, Value},
///     table::Table,
/// };
///
/// let schema = Schema::builder("Counters")
///     .field(Field::new("name", AttributeType::Unicode).alias("n").hash_key())
///     .field(Field::new("count", AttributeType::Number).alias("c"))
///     .build()
///     .unwrap();
/// let backend = DocumentBackend::new(Arc::new(MemoryDatabase::new()));
/// let table = Table::new(Arc::new(schema), Arc::new(backend));
///
/// let mut item = table.new_item();
/// item.set("name", "x").set("count", 1);
/// table.save(&mut item).unwrap();
/// table.update(&mut item, vec![Path::new("c").increment(5)]).unwrap();
/// assert_eq!(item.get("count"), Some(&Value::from(6)));
/// ```
#[derive(Clone)]
pub struct Table {
    schema: Arc<Schema>,
    backend: Arc<dyn Backend>,
}

impl Table {
    /// Binds a schema to a backend.
    pub fn new(schema: Arc<Schema>, backend: Arc<dyn Backend>) -> Self {
        Self { schema, backend }
    }

    /// Schema of the table.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Storage system behind the table.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Storage path of a logical field path such as `settings.limits[0]`.
    pub fn path(&self, logical: &str) -> Result<Path> {
        self.schema.path(logical)
    }

    /// Unsaved item holding the declared defaults.
    pub fn new_item(&self) -> Item {
        let values: Map = self
            .schema
            .fields()
            .iter()
            .filter_map(|field| Some((field.name().to_string(), field.default_value()?)))
            .collect();
        Item::from_values(values)
    }

    fn keys(&self, hash_key: Value, range_key: Option<Value>) -> Result<Keys> {
        self.schema.keys(hash_key, range_key, self.backend.flavor())
    }

    fn does_not_exist(&self, keys: &Keys) -> Error {
        Error::DoesNotExist {
            table: self.schema.table_name().to_string(),
            hash_key: keys.partition_key.value.to_json(false).to_string(),
            range_key: keys
                .sort_key
                .as_ref()
                .map(|sort_key| sort_key.value.to_json(false).to_string()),
        }
    }

    /// Reads an item, failing with [`Error::DoesNotExist`] when there is none.
    pub fn get(&self, hash_key: impl Into<Value>, range_key: Option<Value>) -> Result<Item> {
        let keys = self.keys(hash_key.into(), range_key)?;
        self.backend
            .get(&self.schema, Target::keys(&keys), &GetOptions::default())?
            .ok_or_else(|| self.does_not_exist(&keys))
    }

    /// Reads an item, returning `None` when there is none.
    pub fn get_nullable(
        &self,
        hash_key: impl Into<Value>,
        range_key: Option<Value>,
    ) -> Result<Option<Item>> {
        self.get_with(hash_key, range_key, &GetOptions::default())
    }

    /// Reads an item with explicit read options.
    pub fn get_with(
        &self,
        hash_key: impl Into<Value>,
        range_key: Option<Value>,
        options: &GetOptions,
    ) -> Result<Option<Item>> {
        let keys = self.keys(hash_key.into(), range_key)?;
        self.backend
            .get(&self.schema, Target::keys(&keys), options)
    }

    /// Reloads an item from storage, replacing its values and its original-data snapshot.
    pub fn refresh(&self, item: &mut Item) -> Result<()> {
        let keys = self.item_keys(item)?;
        let target = Target {
            keys: &keys,
            identity: item.identity(),
        };
        let fresh = self
            .backend
            .get(&self.schema, target, &GetOptions::default())?
            .ok_or_else(|| self.does_not_exist(&keys))?;
        item.replace(fresh);
        Ok(())
    }

    fn item_keys(&self, item: &Item) -> Result<Keys> {
        match item.identity() {
            Some(Identity::Key(keys)) => Ok(keys.clone()),
            _ => self.schema.keys_of(item.values(), self.backend.flavor()),
        }
    }

    /// Serialized item with the undeclared attributes of its last read merged back.
    fn raw(&self, item: &Item) -> Result<Map> {
        let raw = self.schema.serialize(item.values(), self.backend.flavor())?;
        Ok(match item.original() {
            Some(original) => safe_update::merge(self.schema.fields(), raw, original),
            None => raw,
        })
    }

    /// Writes the whole item, creating it when missing.
    pub fn save(&self, item: &mut Item) -> Result<()> {
        self.save_with(item, None)
    }

    /// Writes the whole item if the condition holds on the stored one.
    pub fn save_if(&self, item: &mut Item, condition: &Condition) -> Result<()> {
        self.save_with(item, Some(condition))
    }

    fn save_with(&self, item: &mut Item, condition: Option<&Condition>) -> Result<()> {
        let raw = self.raw(item)?;
        let keys = self.schema.keys_of(item.values(), self.backend.flavor())?;
        let target = Target {
            keys: &keys,
            identity: item.identity(),
        };
        let identity = self.backend.put(&self.schema, target, &raw, condition)?;
        let values = mem::take(item).into_values();
        item.replace(Item::from_storage(values, identity, raw));
        Ok(())
    }

    /// Applies update actions to the stored item and reloads it with the outcome.
    ///
    /// Paths address storage names. Literals assigned to a top-level field are serialized through
    /// that field; assigning null removes the attribute.
    pub fn update(&self, item: &mut Item, actions: Vec<Action>) -> Result<()> {
        self.update_with(item, actions, None)
    }

    /// Applies update actions if the condition holds on the stored item.
    pub fn update_if(
        &self,
        item: &mut Item,
        actions: Vec<Action>,
        condition: &Condition,
    ) -> Result<()> {
        self.update_with(item, actions, Some(condition))
    }

    fn update_with(
        &self,
        item: &mut Item,
        actions: Vec<Action>,
        condition: Option<&Condition>,
    ) -> Result<()> {
        let actions = actions
            .into_iter()
            .map(|action| self.serialize_action(action))
            .collect::<Result<Vec<_>>>()?;
        let keys = self.item_keys(item)?;
        let target = Target {
            keys: &keys,
            identity: item.identity(),
        };
        let updated = self
            .backend
            .update(&self.schema, target, &actions, condition)?;
        item.replace(updated);
        Ok(())
    }

    fn serialize_action(&self, mut action: Action) -> Result<Action> {
        let field = match action.path().elements() {
            [PathElement::Name(name)] => self
                .schema
                .fields()
                .iter()
                .find(|field| field.attr_name() == name),
            _ => None,
        };
        let (Some(field), Some(value)) = (field, action.assigned_value_mut()) else {
            return Ok(action);
        };
        match field.serialize(value, self.backend.flavor())? {
            Some(serialized) => {
                *value = serialized;
                Ok(action)
            }
            None if matches!(action, Action::Set { .. }) => Ok(Action::Remove(action.path().clone())),
            None => Ok(action),
        }
    }

    /// Deletes the item. The instance must not be reused afterwards.
    pub fn delete(&self, item: &mut Item) -> Result<()> {
        self.delete_with(item, None)
    }

    /// Deletes the item if the condition holds on the stored one.
    pub fn delete_if(&self, item: &mut Item, condition: &Condition) -> Result<()> {
        self.delete_with(item, Some(condition))
    }

    fn delete_with(&self, item: &mut Item, condition: Option<&Condition>) -> Result<()> {
        let keys = self.item_keys(item)?;
        let target = Target {
            keys: &keys,
            identity: item.identity(),
        };
        self.backend.delete(&self.schema, target, condition)?;
        item.forget();
        Ok(())
    }

    /// Queries a partition of the table or of a secondary index.
    pub fn query(&self, query: Query) -> Result<ResultCursor> {
        self.backend.query(&self.schema, query)
    }

    /// Scans the table.
    pub fn scan(&self, scan: Scan) -> Result<ResultCursor> {
        self.backend.scan(&self.schema, scan)
    }

    /// Counts matching items.
    pub fn count(&self, count: Count) -> Result<u64> {
        self.backend.count(&self.schema, count)
    }

    /// Reads several items by native hash and range key. Missing items are skipped.
    pub fn batch_get<I>(&self, keys: I, attributes_to_get: Option<&[Path]>) -> Result<Vec<Item>>
    where
        I: IntoIterator<Item = (Value, Option<Value>)>,
    {
        let keys = keys
            .into_iter()
            .map(|(hash_key, range_key)| self.keys(hash_key, range_key))
            .collect::<Result<Vec<_>>>()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.backend
            .batch_get(&self.schema, &keys, attributes_to_get)
    }

    /// Starts a batch of puts and deletes.
    ///
    /// The batch is sent by [`BatchWriter::commit`], or when the writer is dropped.
    pub fn batch_write(&self) -> BatchWriter<'_> {
        BatchWriter {
            table: self,
            requests: Vec::new(),
        }
    }

    /// Whether the table exists.
    pub fn exists(&self) -> Result<bool> {
        self.backend.exists(&self.schema)
    }

    /// Drops the table with all its items.
    pub fn delete_table(&self) -> Result<()> {
        self.backend.delete_table(&self.schema)
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("table_name", &self.schema.table_name())
            .field("backend", &self.backend)
            .finish()
    }
}

/// Buffer of puts and deletes sent in one batch.
///
/// Dropping an uncommitted writer flushes it and logs failed requests instead of returning them.
#[derive(Debug)]
pub struct BatchWriter<'a> {
    table: &'a Table,
    requests: Vec<WriteRequest>,
}

impl BatchWriter<'_> {
    /// Queues a put of the item.
    pub fn save(&mut self, item: &Item) -> Result<&mut Self> {
        let raw = self.table.raw(item)?;
        let keys = self
            .table
            .schema
            .keys_of(item.values(), self.table.backend.flavor())?;
        self.requests.push(WriteRequest::Put {
            raw,
            keys,
            identity: item.identity().cloned(),
        });
        Ok(self)
    }

    /// Queues a delete of the item.
    pub fn delete(&mut self, item: &Item) -> Result<&mut Self> {
        let keys = self.table.item_keys(item)?;
        self.requests.push(WriteRequest::Delete {
            keys,
            identity: item.identity().cloned(),
        });
        Ok(self)
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Sends the queued requests and reports the ones that failed.
    pub fn commit(mut self) -> Result<BatchWriteOutcome> {
        self.flush()
    }

    fn flush(&mut self) -> Result<BatchWriteOutcome> {
        let requests = mem::take(&mut self.requests);
        if requests.is_empty() {
            return Ok(BatchWriteOutcome::default());
        }
        self.table
            .backend
            .batch_write(&self.table.schema, requests)
    }
}

impl Drop for BatchWriter<'_> {
    fn drop(&mut self) {
        if self.requests.is_empty() {
            return;
        }
        let table = self.table;
        let table = table.schema.table_name();
        match self.flush() {
            Ok(outcome) => {
                for failure in &outcome.failed {
                    tracing::warn!(
                        table,
                        index = failure.index,
                        error = %failure.error,
                        "batch write request failed on implicit flush"
                    );
                }
            }
            Err(error) => tracing::warn!(table, %error, "implicit batch write flush failed"),
        }
    }
}
