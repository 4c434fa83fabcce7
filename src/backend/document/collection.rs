//! Collection seam between the document backend and the document store driver.

use super::{
    indexes::{IndexOrder, IndexSpec},
    translate::UpdateDocument,
};
use crate::error::{Error, Result};

use mongodb::{
    IndexModel,
    bson::{Bson, Document},
    options::{IndexOptions, ReturnDocument},
    sync,
};
use parking_lot::Mutex;

use std::{collections::HashMap, sync::Arc, time::Duration};

/// Lazily evaluated documents of a find.
pub type DocumentStream = Box<dyn Iterator<Item = Result<Document>>>;

/// Options of a find.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FindOptions {
    /// Matching documents to skip.
    pub skip: u64,
    /// Maximum number of documents to return.
    pub limit: Option<u64>,
    /// Documents fetched per round trip.
    pub batch_size: Option<u32>,
    /// Sort specification.
    pub sort: Option<Document>,
    /// Projection specification.
    pub projection: Option<Document>,
}

/// Outcome of a replace.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplaceOutcome {
    /// Number of documents matched by the filter.
    pub matched: u64,
    /// Identity of the document created by an upsert.
    pub upserted_id: Option<Bson>,
}

/// Operations the document backend needs from a collection.
pub trait DocumentCollection: Send + Sync {
    /// Collection name.
    fn name(&self) -> &str;

    /// First document matching the filter.
    fn find_one(&self, filter: Document, projection: Option<Document>) -> Result<Option<Document>>;

    /// Documents matching the filter.
    fn find(&self, filter: Document, options: FindOptions) -> Result<DocumentStream>;

    /// Number of documents matching the filter, bounded by the limit.
    fn count_documents(&self, filter: Document, limit: Option<u64>) -> Result<u64>;

    /// Replaces the first matching document, inserting it when `upsert` is set.
    fn replace_one(&self, filter: Document, replacement: Document, upsert: bool)
    -> Result<ReplaceOutcome>;

    /// Updates the first matching document and returns it as stored afterwards.
    fn find_one_and_update(
        &self,
        filter: Document,
        update: UpdateDocument,
        upsert: bool,
    ) -> Result<Option<Document>>;

    /// Deletes the first matching document. Returns the number of deleted documents.
    fn delete_one(&self, filter: Document) -> Result<u64>;

    /// Indexes of the collection.
    fn list_indexes(&self) -> Result<Vec<IndexSpec>>;

    /// Creates an index.
    fn create_index(&self, index: &IndexSpec) -> Result<()>;

    /// Drops an index by name.
    fn drop_index(&self, name: &str) -> Result<()>;

    /// Drops the collection.
    fn drop_collection(&self) -> Result<()>;
}

/// Database holding collections.
pub trait DocumentDatabase: Send + Sync {
    /// Collection handle. Handles are cheap and shared.
    fn collection(&self, name: &str) -> Arc<dyn DocumentCollection>;

    /// Names of the existing collections.
    fn collection_names(&self) -> Result<Vec<String>>;
}

/// Collection of a MongoDB database reached through the blocking driver.
#[derive(Clone, Debug)]
pub struct MongoCollection {
    inner: sync::Collection<Document>,
}

impl MongoCollection {
    /// Wraps a driver collection.
    pub fn new(inner: sync::Collection<Document>) -> Self {
        Self { inner }
    }
}

impl DocumentCollection for MongoCollection {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn find_one(&self, filter: Document, projection: Option<Document>) -> Result<Option<Document>> {
        let mut action = self.inner.find_one(filter);
        if let Some(projection) = projection {
            action = action.projection(projection);
        }
        Ok(action.run()?)
    }

    fn find(&self, filter: Document, options: FindOptions) -> Result<DocumentStream> {
        let mut action = self.inner.find(filter).skip(options.skip);
        if let Some(limit) = options.limit {
            action = action.limit(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if let Some(batch_size) = options.batch_size {
            action = action.batch_size(batch_size);
        }
        if let Some(sort) = options.sort {
            action = action.sort(sort);
        }
        if let Some(projection) = options.projection {
            action = action.projection(projection);
        }
        let cursor = action.run()?;
        Ok(Box::new(cursor.map(|document| document.map_err(Error::from))))
    }

    fn count_documents(&self, filter: Document, limit: Option<u64>) -> Result<u64> {
        let mut action = self.inner.count_documents(filter);
        if let Some(limit) = limit {
            action = action.limit(limit);
        }
        Ok(action.run()?)
    }

    fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
        upsert: bool,
    ) -> Result<ReplaceOutcome> {
        let result = self
            .inner
            .replace_one(filter, replacement)
            .upsert(upsert)
            .run()?;
        Ok(ReplaceOutcome {
            matched: result.matched_count,
            upserted_id: result.upserted_id,
        })
    }

    fn find_one_and_update(
        &self,
        filter: Document,
        update: UpdateDocument,
        upsert: bool,
    ) -> Result<Option<Document>> {
        Ok(self
            .inner
            .find_one_and_update(filter, update)
            .upsert(upsert)
            .return_document(ReturnDocument::After)
            .run()?)
    }

    fn delete_one(&self, filter: Document) -> Result<u64> {
        Ok(self.inner.delete_one(filter).run()?.deleted_count)
    }

    fn list_indexes(&self) -> Result<Vec<IndexSpec>> {
        self.inner
            .list_indexes()
            .run()?
            .map(|model| model.map(index_spec).map_err(Error::from))
            .collect()
    }

    fn create_index(&self, index: &IndexSpec) -> Result<()> {
        self.inner.create_index(index_model(index)).run()?;
        Ok(())
    }

    fn drop_index(&self, name: &str) -> Result<()> {
        Ok(self.inner.drop_index(name).run()?)
    }

    fn drop_collection(&self) -> Result<()> {
        Ok(self.inner.drop().run()?)
    }
}

fn index_model(index: &IndexSpec) -> IndexModel {
    let keys: Document = index
        .keys
        .iter()
        .map(|(field, order)| (field.clone(), order.to_bson()))
        .collect();
    let mut options = IndexOptions::default();
    options.name = Some(index.name.clone());
    if index.unique {
        options.unique = Some(true);
    }
    options.expire_after = index.expire_after_seconds.map(Duration::from_secs);
    IndexModel::builder().keys(keys).options(Some(options)).build()
}

fn index_spec(model: IndexModel) -> IndexSpec {
    let options = model.options.unwrap_or_default();
    IndexSpec {
        name: options.name.unwrap_or_default(),
        keys: model
            .keys
            .into_iter()
            .map(|(field, order)| (field, IndexOrder::from_bson(order)))
            .collect(),
        unique: options.unique.unwrap_or(false),
        expire_after_seconds: options.expire_after.map(|duration| duration.as_secs()),
    }
}

/// MongoDB database reached through the blocking driver.
#[derive(Debug)]
pub struct MongoDatabase {
    inner: sync::Database,
    collections: Mutex<HashMap<String, Arc<MongoCollection>>>,
}

impl MongoDatabase {
    /// Connects to the database named `database` at `uri`.
    pub fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = sync::Client::with_uri_str(uri)?;
        tracing::info!(database, "connected to the document store");
        Ok(Self::new(client.database(database)))
    }

    /// Wraps a driver database.
    pub fn new(inner: sync::Database) -> Self {
        Self {
            inner,
            collections: Mutex::new(HashMap::new()),
        }
    }
}

impl DocumentDatabase for MongoDatabase {
    fn collection(&self, name: &str) -> Arc<dyn DocumentCollection> {
        let mut collections = self.collections.lock();
        collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MongoCollection::new(self.inner.collection(name))))
            .clone()
    }

    fn collection_names(&self) -> Result<Vec<String>> {
        Ok(self.inner.list_collection_names().run()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mongodb::bson::doc;

    #[test]
    fn test_index_model_round_trip() {
        let spec = IndexSpec {
            name: "n_1_d_-1".to_string(),
            keys: vec![
                ("n".to_string(), IndexOrder::Ascending),
                ("d".to_string(), IndexOrder::Descending),
            ],
            unique: true,
            expire_after_seconds: None,
        };
        let model = index_model(&spec);
        assert_eq!(model.keys, doc! {"n": 1, "d": -1});
        assert_eq!(index_spec(model), spec);
    }

    #[test]
    fn test_ttl_index_model() {
        let spec = IndexSpec {
            name: "ttl_1".to_string(),
            keys: vec![("ttl".to_string(), IndexOrder::Ascending)],
            unique: false,
            expire_after_seconds: Some(0),
        };
        let model = index_model(&spec);
        let options = model.options.clone().unwrap_or_default();
        assert_eq!(options.expire_after, Some(Duration::from_secs(0)));
        assert_eq!(options.unique, None);
        assert_eq!(index_spec(model), spec);
    }
}
