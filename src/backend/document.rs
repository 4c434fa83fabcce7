//! Document store backend.
//!
//! Items are stored as documents keyed by the store's own identity. Reads page with a skip
//! offset, writes upsert by identity or by key.

pub mod collection;
pub mod indexes;
pub mod memory;
pub mod translate;

use self::{
    collection::{DocumentCollection, DocumentDatabase, FindOptions},
    indexes::{IDENTITY_INDEX, IndexExtractor, IndexSyncReport},
    translate::key_filter,
};
use super::{
    Backend, BackendKind, BatchWriteFailure, BatchWriteOutcome, Count, GetOptions, Query, Scan,
    Target, WriteRequest, decode, hash_key_condition, start_offset,
};
use crate::{
    common::{condition::Condition, key::Keys, path::Path, update::Action},
    cursor::{OffsetSource, ResultCursor},
    error::{Error, Result},
    item::{Identity, Item},
    schema::{Flavor, Map, Schema, value},
};

use mongodb::bson::{Bson, Document, doc};

use std::{fmt, sync::Arc};

/// Backend over a document database.
#[derive(Clone)]
pub struct DocumentBackend {
    database: Arc<dyn DocumentDatabase>,
    extractor: IndexExtractor,
}

impl DocumentBackend {
    /// Backend over the given database.
    pub fn new(database: Arc<dyn DocumentDatabase>) -> Self {
        Self {
            database,
            extractor: IndexExtractor::default(),
        }
    }

    /// Uses another index extractor for [`sync_indexes`](Self::sync_indexes).
    pub fn with_index_extractor(mut self, extractor: IndexExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Converges the collection indexes to the ones the schema declares.
    pub fn sync_indexes(&self, schema: &Schema) -> Result<IndexSyncReport> {
        let desired = self.extractor.extract(schema)?;
        indexes::sync(self.collection(schema).as_ref(), &desired, &[IDENTITY_INDEX])
    }

    /// Creates the indexes the schema declares and the collection lacks.
    pub fn ensure_indexes(&self, schema: &Schema) -> Result<IndexSyncReport> {
        let desired = self.extractor.extract(schema)?;
        indexes::ensure(self.collection(schema).as_ref(), &desired)
    }

    fn collection(&self, schema: &Schema) -> Arc<dyn DocumentCollection> {
        self.database.collection(schema.table_name())
    }
}

impl fmt::Debug for DocumentBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentBackend")
            .field("extractor", &self.extractor)
            .finish_non_exhaustive()
    }
}

/// Filter addressing a single item: its identity when known, its keys otherwise.
fn target_filter(target: Target<'_>) -> Document {
    match target.identity {
        Some(Identity::Document(id)) => doc! { "_id": id.clone() },
        _ => key_filter(target.keys),
    }
}

fn guarded(filter: Document, condition: Option<&Condition>) -> Result<Document> {
    match condition {
        None => Ok(filter),
        Some(condition) => Ok(doc! { "$and": [filter, translate::filter(condition)?] }),
    }
}

fn decode_document(schema: &Schema, mut document: Document) -> Result<Item> {
    let id = document.remove("_id");
    let raw = value::document_to_map(document);
    let identity = match id {
        Some(id) => Identity::Document(id),
        None => {
            let values = schema.deserialize(&raw, Flavor::Document)?;
            Identity::Key(schema.keys_of(&values, Flavor::Document)?)
        }
    };
    decode(schema, Flavor::Document, raw, identity)
}

fn projection(paths: Option<&[Path]>) -> Result<Option<Document>> {
    paths.map_or(Ok(None), translate::projection)
}

impl Backend for DocumentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    #[tracing::instrument(name = "modular_sdk.get", skip_all, fields(table = schema.table_name()), err)]
    fn get(
        &self,
        schema: &Schema,
        target: Target<'_>,
        options: &GetOptions,
    ) -> Result<Option<Item>> {
        let projection = projection(options.attributes_to_get.as_deref())?;
        self.collection(schema)
            .find_one(target_filter(target), projection)?
            .map(|document| decode_document(schema, document))
            .transpose()
    }

    #[tracing::instrument(name = "modular_sdk.put", skip_all, fields(table = schema.table_name()), err)]
    fn put(
        &self,
        schema: &Schema,
        target: Target<'_>,
        raw: &Map,
        condition: Option<&Condition>,
    ) -> Result<Identity> {
        let collection = self.collection(schema);
        let filter = target_filter(target);
        let document = value::map_to_document(raw);
        let outcome = match condition {
            None => collection.replace_one(filter, document, true)?,
            Some(condition) => {
                let outcome = collection.replace_one(
                    guarded(filter.clone(), Some(condition))?,
                    document.clone(),
                    false,
                )?;
                if outcome.matched > 0 {
                    outcome
                } else if condition.holds_for_missing_item()
                    && collection.find_one(filter.clone(), Some(doc! { "_id": 1 }))?.is_none()
                {
                    collection.replace_one(filter, document, true)?
                } else {
                    return Err(Error::ConditionalCheckFailed {
                        table: schema.table_name().to_string(),
                    });
                }
            }
        };
        Ok(match (outcome.upserted_id, target.identity) {
            (Some(id), _) => Identity::Document(id),
            (None, Some(identity)) => identity.clone(),
            (None, None) => Identity::Key(target.keys.clone()),
        })
    }

    #[tracing::instrument(name = "modular_sdk.update", skip_all, fields(table = schema.table_name()), err)]
    fn update(
        &self,
        schema: &Schema,
        target: Target<'_>,
        actions: &[Action],
        condition: Option<&Condition>,
    ) -> Result<Item> {
        let update = translate::update(actions)?;
        let filter = guarded(target_filter(target), condition)?;
        let updated =
            self.collection(schema)
                .find_one_and_update(filter, update, condition.is_none())?;
        match updated {
            Some(document) => decode_document(schema, document),
            None => Err(Error::ConditionalCheckFailed {
                table: schema.table_name().to_string(),
            }),
        }
    }

    #[tracing::instrument(name = "modular_sdk.delete", skip_all, fields(table = schema.table_name()), err)]
    fn delete(
        &self,
        schema: &Schema,
        target: Target<'_>,
        condition: Option<&Condition>,
    ) -> Result<()> {
        let filter = guarded(target_filter(target), condition)?;
        let deleted = self.collection(schema).delete_one(filter)?;
        if condition.is_some() && deleted == 0 {
            return Err(Error::ConditionalCheckFailed {
                table: schema.table_name().to_string(),
            });
        }
        Ok(())
    }

    #[tracing::instrument(name = "modular_sdk.query", skip_all, fields(table = schema.table_name()), err)]
    fn query(&self, schema: &Arc<Schema>, query: Query) -> Result<ResultCursor> {
        let index_name = query.index_name.as_deref();
        let (_, range_key) = schema.key_fields(index_name)?;
        let hash_key = hash_key_condition(schema, Flavor::Document, index_name, &query.hash_key)?;
        let condition = Condition::all([
            Some(hash_key),
            query.range_key_condition,
            query.filter_condition,
        ]);
        let filter = match &condition {
            Some(condition) => translate::filter(condition)?,
            None => Document::new(),
        };
        let direction = if query.scan_index_forward.unwrap_or(true) { 1 } else { -1 };
        let options = FindOptions {
            skip: start_offset(schema.table_name(), query.last_evaluated_key.as_ref()),
            limit: query.limit,
            batch_size: query.page_size,
            sort: range_key.map(|range_key| doc! { range_key.attr_name(): direction }),
            projection: projection(query.attributes_to_get.as_deref())?,
        };
        read(self.collection(schema), schema, filter, options)
    }

    #[tracing::instrument(name = "modular_sdk.scan", skip_all, fields(table = schema.table_name()), err)]
    fn scan(&self, schema: &Arc<Schema>, scan: Scan) -> Result<ResultCursor> {
        if scan.segment.is_some() || scan.total_segments.is_some() {
            return Err(Error::not_implemented("parallel scan segments on the document store"));
        }
        if let Some(index_name) = &scan.index_name {
            schema.index(index_name)?;
        }
        let filter = match &scan.filter_condition {
            Some(condition) => translate::filter(condition)?,
            None => Document::new(),
        };
        let options = FindOptions {
            skip: start_offset(schema.table_name(), scan.last_evaluated_key.as_ref()),
            limit: scan.limit,
            batch_size: scan.page_size,
            sort: None,
            projection: projection(scan.attributes_to_get.as_deref())?,
        };
        read(self.collection(schema), schema, filter, options)
    }

    #[tracing::instrument(name = "modular_sdk.count", skip_all, fields(table = schema.table_name()), err)]
    fn count(&self, schema: &Schema, count: Count) -> Result<u64> {
        let index_name = count.index_name.as_deref();
        let hash_key = count
            .hash_key
            .as_ref()
            .map(|hash_key| hash_key_condition(schema, Flavor::Document, index_name, hash_key))
            .transpose()?;
        let condition = Condition::all([hash_key, count.range_key_condition, count.filter_condition]);
        let filter = match &condition {
            Some(condition) => translate::filter(condition)?,
            None => Document::new(),
        };
        self.collection(schema).count_documents(filter, count.limit)
    }

    #[tracing::instrument(name = "modular_sdk.batch_get", skip_all, fields(table = schema.table_name()), err)]
    fn batch_get(
        &self,
        schema: &Schema,
        keys: &[Keys],
        attributes_to_get: Option<&[Path]>,
    ) -> Result<Vec<Item>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let clauses: Vec<Bson> = keys
            .iter()
            .map(|keys| Bson::Document(key_filter(keys)))
            .collect();
        let options = FindOptions {
            projection: projection(attributes_to_get)?,
            ..Default::default()
        };
        self.collection(schema)
            .find(doc! { "$or": clauses }, options)?
            .map(|document| decode_document(schema, document?))
            .collect()
    }

    #[tracing::instrument(name = "modular_sdk.batch_write", skip_all, fields(table = schema.table_name()), err)]
    fn batch_write(
        &self,
        schema: &Schema,
        requests: Vec<WriteRequest>,
    ) -> Result<BatchWriteOutcome> {
        let collection = self.collection(schema);
        let mut outcome = BatchWriteOutcome::default();
        for (index, request) in requests.iter().enumerate() {
            let filter = target_filter(request.target());
            let written = match request {
                WriteRequest::Put { raw, .. } => collection
                    .replace_one(filter, value::map_to_document(raw), true)
                    .map(|_| ()),
                WriteRequest::Delete { .. } => collection.delete_one(filter).map(|_| ()),
            };
            match written {
                Ok(()) => outcome.written += 1,
                Err(error) => outcome.failed.push(BatchWriteFailure { index, error }),
            }
        }
        tracing::debug!(
            written = outcome.written,
            failed = outcome.failed.len(),
            "batch write applied"
        );
        Ok(outcome)
    }

    #[tracing::instrument(name = "modular_sdk.exists", skip_all, fields(table = schema.table_name()), err)]
    fn exists(&self, schema: &Schema) -> Result<bool> {
        Ok(self
            .database
            .collection_names()?
            .iter()
            .any(|name| name == schema.table_name()))
    }

    #[tracing::instrument(name = "modular_sdk.delete_table", skip_all, fields(table = schema.table_name()), err)]
    fn delete_table(&self, schema: &Schema) -> Result<()> {
        self.collection(schema).drop_collection()
    }
}

fn read(
    collection: Arc<dyn DocumentCollection>,
    schema: &Arc<Schema>,
    filter: Document,
    options: FindOptions,
) -> Result<ResultCursor> {
    let skip = options.skip;
    let total = collection.count_documents(filter.clone(), None)?;
    let documents = collection.find(filter, options)?;
    let schema = Arc::clone(schema);
    let items = documents.map(move |document| decode_document(&schema, document?));
    Ok(ResultCursor::new(OffsetSource::new(items, skip, total)))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        common::path::Path,
        schema::{AttributeType, Field, Value},
    };

    use super::memory::MemoryDatabase;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder("Jobs")
                .field(Field::new("name", AttributeType::Unicode).alias("n").hash_key())
                .field(Field::new("date", AttributeType::Number).alias("d").range_key())
                .field(Field::new("state", AttributeType::Unicode).alias("s"))
                .build()
                .unwrap(),
        )
    }

    fn backend() -> (Arc<MemoryDatabase>, DocumentBackend) {
        let database = Arc::new(MemoryDatabase::new());
        (database.clone(), DocumentBackend::new(database))
    }

    fn raw(name: &str, date: i64, state: &str) -> Map {
        Map::from([
            ("n".to_string(), Value::from(name)),
            ("d".to_string(), Value::from(date)),
            ("s".to_string(), Value::from(state)),
        ])
    }

    fn keys(schema: &Schema, name: &str, date: i64) -> Keys {
        schema
            .keys(Value::from(name), Some(Value::from(date)), Flavor::Document)
            .unwrap()
    }

    fn seed(backend: &DocumentBackend, schema: &Schema) {
        for date in 1..=5 {
            let keys = keys(schema, "job", date);
            backend
                .put(schema, Target::keys(&keys), &raw("job", date, "new"), None)
                .unwrap();
        }
        let keys = keys(schema, "other", 1);
        backend
            .put(schema, Target::keys(&keys), &raw("other", 1, "new"), None)
            .unwrap();
    }

    fn dates(cursor: ResultCursor) -> Vec<i64> {
        cursor
            .map(|item| {
                item.unwrap()
                    .get("date")
                    .and_then(Value::as_number)
                    .and_then(|number| number.as_i64())
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_put_assigns_identity_and_get_reads_back() {
        let schema = schema();
        let (_, backend) = backend();
        let keys = keys(&schema, "job", 1);
        let identity = backend
            .put(&schema, Target::keys(&keys), &raw("job", 1, "new"), None)
            .unwrap();
        assert!(matches!(identity, Identity::Document(Bson::ObjectId(_))));

        let item = backend
            .get(&schema, Target::keys(&keys), &GetOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(item.identity(), Some(&identity));
        assert_eq!(item.get("state"), Some(&Value::from("new")));
        assert_eq!(item.original(), Some(&raw("job", 1, "new")));
    }

    #[test]
    fn test_query_orders_and_pages() {
        let schema = schema();
        let (_, backend) = backend();
        seed(&backend, &schema);

        let query = Query {
            hash_key: Value::from("job"),
            scan_index_forward: Some(false),
            limit: Some(2),
            ..Default::default()
        };
        let mut cursor = backend.query(&schema, query.clone()).unwrap();
        let first: Vec<i64> = dates_of(&mut cursor);
        assert_eq!(first, vec![5, 4]);
        let next = cursor.last_evaluated_key().into_value();
        assert_eq!(next, Some(crate::cursor::StartKey::Offset(2)));

        let query = Query {
            last_evaluated_key: next,
            ..query
        };
        assert_eq!(dates(backend.query(&schema, query).unwrap()), vec![3, 2]);
    }

    fn dates_of(cursor: &mut ResultCursor) -> Vec<i64> {
        cursor
            .by_ref()
            .map(|item| {
                item.unwrap()
                    .get("date")
                    .and_then(Value::as_number)
                    .and_then(|number| number.as_i64())
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_query_with_conditions() {
        let schema = schema();
        let (_, backend) = backend();
        seed(&backend, &schema);
        let query = Query {
            hash_key: Value::from("job"),
            range_key_condition: Some(Path::new("d").between(2, 4)),
            filter_condition: Some(Path::new("d").ne(3)),
            ..Default::default()
        };
        assert_eq!(dates(backend.query(&schema, query).unwrap()), vec![2, 4]);
    }

    #[test]
    fn test_count_and_scan() {
        let schema = schema();
        let (_, backend) = backend();
        seed(&backend, &schema);
        let count = Count {
            hash_key: Some(Value::from("job")),
            range_key_condition: Some(Path::new("d").gt(2)),
            ..Default::default()
        };
        assert_eq!(backend.count(&schema, count).unwrap(), 3);
        assert_eq!(backend.count(&schema, Count::default()).unwrap(), 6);

        let scan = Scan {
            filter_condition: Some(Path::new("n").eq("other")),
            ..Default::default()
        };
        assert_eq!(dates(backend.scan(&schema, scan).unwrap()), vec![1]);

        let segmented = Scan {
            total_segments: Some(2),
            ..Default::default()
        };
        assert_eq!(
            backend.scan(&schema, segmented).unwrap_err().code(),
            "NOT_IMPLEMENTED"
        );
    }

    #[test]
    fn test_conditional_writes() {
        let schema = schema();
        let (_, backend) = backend();
        seed(&backend, &schema);
        let keys = keys(&schema, "job", 1);
        let condition = Path::new("s").eq("done");

        let error = backend
            .put(&schema, Target::keys(&keys), &raw("job", 1, "x"), Some(&condition))
            .unwrap_err();
        assert_eq!(error.code(), "CONDITIONAL_CHECK_FAILED");
        let error = backend
            .update(&schema, Target::keys(&keys), &[Path::new("s").set("x")], Some(&condition))
            .unwrap_err();
        assert_eq!(error.code(), "CONDITIONAL_CHECK_FAILED");
        let error = backend
            .delete(&schema, Target::keys(&keys), Some(&condition))
            .unwrap_err();
        assert_eq!(error.code(), "CONDITIONAL_CHECK_FAILED");

        let fresh = self::keys(&schema, "job", 9);
        let absent = Path::new("n").does_not_exist();
        let identity = backend
            .put(&schema, Target::keys(&fresh), &raw("job", 9, "new"), Some(&absent))
            .unwrap();
        assert!(matches!(identity, Identity::Document(Bson::ObjectId(_))));
        let error = backend
            .put(&schema, Target::keys(&fresh), &raw("job", 9, "x"), Some(&absent))
            .unwrap_err();
        assert_eq!(error.code(), "CONDITIONAL_CHECK_FAILED");
        let stored = backend
            .get(&schema, Target::keys(&fresh), &GetOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("state"), Some(&Value::from("new")));

        let condition = Path::new("s").eq("new");
        let item = backend
            .update(&schema, Target::keys(&keys), &[Path::new("s").set("done")], Some(&condition))
            .unwrap();
        assert_eq!(item.get("state"), Some(&Value::from("done")));
    }

    #[test]
    fn test_batch_operations() {
        let schema = schema();
        let (database, backend) = backend();
        let requests = vec![
            WriteRequest::Put {
                raw: raw("a", 1, "new"),
                keys: keys(&schema, "a", 1),
                identity: None,
            },
            WriteRequest::Put {
                raw: raw("b", 1, "new"),
                keys: keys(&schema, "b", 1),
                identity: None,
            },
            WriteRequest::Delete {
                keys: keys(&schema, "a", 1),
                identity: None,
            },
        ];
        let outcome = backend.batch_write(&schema, requests).unwrap();
        assert_eq!(outcome.written, 3);
        assert!(outcome.is_success());
        assert_eq!(database.memory_collection("Jobs").documents().len(), 1);

        let items = backend
            .batch_get(
                &schema,
                &[keys(&schema, "a", 1), keys(&schema, "b", 1)],
                None,
            )
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].get("name"), Some(&Value::from("b")));
        assert!(backend.batch_get(&schema, &[], None).unwrap().is_empty());
    }

    #[test]
    fn test_exists_and_delete_table() {
        let schema = schema();
        let (_, backend) = backend();
        assert!(!backend.exists(&schema).unwrap());
        seed(&backend, &schema);
        assert!(backend.exists(&schema).unwrap());
        backend.delete_table(&schema).unwrap();
        assert!(!backend.exists(&schema).unwrap());
    }

    #[test]
    fn test_sync_indexes() {
        let schema = schema();
        let (database, backend) = backend();
        let report = backend.sync_indexes(&schema).unwrap();
        assert_eq!(report.created, vec!["n_1_d_-1"]);
        assert!(backend.sync_indexes(&schema).unwrap().is_noop());
        assert!(backend.ensure_indexes(&schema).unwrap().is_noop());
        assert_eq!(database.memory_collection("Jobs").operations().len(), 1);
    }
}
