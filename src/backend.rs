//! Storage backends.
//!
//! A [`Backend`] executes the facade operations against one storage system. Requests carry native
//! values and logical conditions; each backend serializes them for its [`Flavor`] and renders
//! them in its own query language.

pub mod document;
pub mod dynamodb;

use crate::{
    common::{condition::Condition, key::Keys, path::Path, update::Action},
    cursor::{ResultCursor, StartKey},
    error::{Error, Result},
    item::{Identity, Item},
    schema::{Flavor, Map, Schema, Value},
};

use std::{fmt, str::FromStr, sync::Arc};

/// Storage system behind a table.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BackendKind {
    /// Managed key-value store.
    KeyValue,
    /// Self-hosted document store.
    Document,
}

impl BackendKind {
    /// Serialization flavor of the backend.
    pub fn flavor(self) -> Flavor {
        match self {
            Self::KeyValue => Flavor::KeyValue,
            Self::Document => Flavor::Document,
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "saas" | "dynamodb" | "key_value" => Ok(Self::KeyValue),
            "docker" | "mongodb" | "document" => Ok(Self::Document),
            other => Err(format!("unknown service mode '{other}'")),
        }
    }
}

/// Item addressed by a write or a single read.
///
/// The document store prefers the identity it assigned, the key-value store always uses the keys.
#[derive(Clone, Copy, Debug)]
pub struct Target<'a> {
    /// Serialized primary key.
    pub keys: &'a Keys,
    /// Identity known from a previous read or write.
    pub identity: Option<&'a Identity>,
}

impl<'a> Target<'a> {
    /// Target addressed by keys only.
    pub fn keys(keys: &'a Keys) -> Self {
        Self {
            keys,
            identity: None,
        }
    }
}

/// Options of a single-item read.
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    /// Strongly consistent read on the key-value store.
    pub consistent_read: Option<bool>,
    /// Storage paths to return. All attributes when absent.
    pub attributes_to_get: Option<Vec<Path>>,
}

/// Query over a partition, optionally through a secondary index.
#[derive(Clone, Debug, Default)]
pub struct Query {
    /// Native hash key value of the table or of the index.
    pub hash_key: Value,
    /// Condition on the range key, expressed on storage paths.
    pub range_key_condition: Option<Condition>,
    /// Condition on the remaining attributes.
    pub filter_condition: Option<Condition>,
    /// Secondary index to read through.
    pub index_name: Option<String>,
    /// Ascending range key order. Defaults to ascending.
    pub scan_index_forward: Option<bool>,
    /// Maximum number of items to return.
    pub limit: Option<u64>,
    /// Position to resume from.
    pub last_evaluated_key: Option<StartKey>,
    /// Storage paths to return.
    pub attributes_to_get: Option<Vec<Path>>,
    /// Items fetched per round trip.
    pub page_size: Option<u32>,
    /// Strongly consistent read on the key-value store.
    pub consistent_read: Option<bool>,
}

/// Full table scan.
#[derive(Clone, Debug, Default)]
pub struct Scan {
    /// Condition on the attributes.
    pub filter_condition: Option<Condition>,
    /// Secondary index to read through.
    pub index_name: Option<String>,
    /// Maximum number of items to return.
    pub limit: Option<u64>,
    /// Position to resume from.
    pub last_evaluated_key: Option<StartKey>,
    /// Storage paths to return.
    pub attributes_to_get: Option<Vec<Path>>,
    /// Items fetched per round trip.
    pub page_size: Option<u32>,
    /// Strongly consistent read on the key-value store.
    pub consistent_read: Option<bool>,
    /// Segment of a parallel scan, with [`total_segments`](Self::total_segments).
    pub segment: Option<i32>,
    /// Number of segments of a parallel scan.
    pub total_segments: Option<i32>,
}

/// Count of the items matching a partition and conditions.
#[derive(Clone, Debug, Default)]
pub struct Count {
    /// Native hash key value. Counts the whole table when absent.
    pub hash_key: Option<Value>,
    /// Condition on the range key.
    pub range_key_condition: Option<Condition>,
    /// Condition on the remaining attributes.
    pub filter_condition: Option<Condition>,
    /// Secondary index to count through.
    pub index_name: Option<String>,
    /// Upper bound of the count.
    pub limit: Option<u64>,
    /// Strongly consistent read on the key-value store.
    pub consistent_read: Option<bool>,
}

/// One request of a batch write.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteRequest {
    /// Upserts a serialized item.
    Put {
        /// Serialized item, safe-update merge already applied.
        raw: Map,
        /// Serialized primary key.
        keys: Keys,
        /// Identity known from a previous read or write.
        identity: Option<Identity>,
    },
    /// Deletes an item.
    Delete {
        /// Serialized primary key.
        keys: Keys,
        /// Identity known from a previous read or write.
        identity: Option<Identity>,
    },
}

impl WriteRequest {
    /// Addressed item.
    pub fn target(&self) -> Target<'_> {
        match self {
            Self::Put { keys, identity, .. } | Self::Delete { keys, identity } => Target {
                keys,
                identity: identity.as_ref(),
            },
        }
    }
}

/// Request of a batch write that did not go through.
#[derive(Debug)]
pub struct BatchWriteFailure {
    /// Position of the request in submission order.
    pub index: usize,
    /// Why it failed.
    pub error: Error,
}

/// Result of a batch write.
#[derive(Debug, Default)]
pub struct BatchWriteOutcome {
    /// Number of requests applied.
    pub written: usize,
    /// Requests that were not applied.
    pub failed: Vec<BatchWriteFailure>,
}

impl BatchWriteOutcome {
    /// Whether every request was applied.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Turns partial failure into [`Error::BatchWrite`].
    pub fn into_result(self) -> Result<usize> {
        if self.failed.is_empty() {
            Ok(self.written)
        } else {
            Err(Error::BatchWrite {
                failed: self.failed.len(),
            })
        }
    }
}

/// Strategy executing the facade operations against one storage system.
///
/// Every method receives serialized keys and raw maps, and returns items decoded through the
/// schema. Implementations are shared between threads.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Storage system of the backend.
    fn kind(&self) -> BackendKind;

    /// Serialization flavor of the backend.
    fn flavor(&self) -> Flavor {
        self.kind().flavor()
    }

    /// Reads a single item.
    fn get(&self, schema: &Schema, target: Target<'_>, options: &GetOptions)
    -> Result<Option<Item>>;

    /// Writes a serialized item, creating it when missing. Returns its identity.
    ///
    /// With a condition nothing is created and [`Error::ConditionalCheckFailed`] is returned when
    /// the condition does not hold.
    fn put(
        &self,
        schema: &Schema,
        target: Target<'_>,
        raw: &Map,
        condition: Option<&Condition>,
    ) -> Result<Identity>;

    /// Applies update actions and returns the item as stored afterwards.
    fn update(
        &self,
        schema: &Schema,
        target: Target<'_>,
        actions: &[Action],
        condition: Option<&Condition>,
    ) -> Result<Item>;

    /// Deletes an item. Deleting a missing item is not an error.
    fn delete(&self, schema: &Schema, target: Target<'_>, condition: Option<&Condition>)
    -> Result<()>;

    /// Queries a partition.
    fn query(&self, schema: &Arc<Schema>, query: Query) -> Result<ResultCursor>;

    /// Scans the table.
    fn scan(&self, schema: &Arc<Schema>, scan: Scan) -> Result<ResultCursor>;

    /// Counts matching items.
    fn count(&self, schema: &Schema, count: Count) -> Result<u64>;

    /// Reads several items by key. Missing items are skipped and the order is not guaranteed.
    fn batch_get(
        &self,
        schema: &Schema,
        keys: &[Keys],
        attributes_to_get: Option<&[Path]>,
    ) -> Result<Vec<Item>>;

    /// Applies puts and deletes, reporting requests that failed.
    fn batch_write(&self, schema: &Schema, requests: Vec<WriteRequest>)
    -> Result<BatchWriteOutcome>;

    /// Whether the table exists.
    fn exists(&self, schema: &Schema) -> Result<bool>;

    /// Drops the table with all its items.
    fn delete_table(&self, schema: &Schema) -> Result<()>;
}

/// Decodes a raw stored map into an item, keeping the raw map for the next write.
pub(crate) fn decode(schema: &Schema, flavor: Flavor, raw: Map, identity: Identity) -> Result<Item> {
    let values = schema.deserialize(&raw, flavor)?;
    Ok(Item::from_storage(values, identity, raw))
}

/// Equality condition on the serialized hash key of the table or of an index.
pub(crate) fn hash_key_condition(
    schema: &Schema,
    flavor: Flavor,
    index_name: Option<&str>,
    hash_key: &Value,
) -> Result<Condition> {
    let (hash_field, _) = schema.key_fields(index_name)?;
    let raw = hash_field
        .serialize(hash_key, flavor)?
        .ok_or_else(|| Error::MissingAttribute {
            attribute: hash_field.name().to_string(),
        })?;
    Ok(Path::new(hash_field.attr_name()).eq(raw))
}

/// Offset of a document store read, resetting positions issued by the other backend.
pub(crate) fn start_offset(table: &str, start: Option<&StartKey>) -> u64 {
    match start {
        None => 0,
        Some(StartKey::Offset(offset)) => *offset,
        Some(StartKey::Key(_)) => {
            tracing::warn!(table, "continuation key is not an offset, reading from the start");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    #[rstest]
    #[case::saas("saas", BackendKind::KeyValue)]
    #[case::docker("docker", BackendKind::Document)]
    #[case::upper("DOCKER", BackendKind::Document)]
    #[case::name("mongodb", BackendKind::Document)]
    fn test_backend_kind_from_str(#[case] value: &str, #[case] expected: BackendKind) {
        assert_eq!(value.parse::<BackendKind>(), Ok(expected));
    }

    #[test]
    fn test_backend_kind_rejects() {
        assert!("onprem".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_batch_write_outcome() {
        let outcome = BatchWriteOutcome {
            written: 2,
            failed: Vec::new(),
        };
        assert!(outcome.is_success());
        assert_eq!(outcome.into_result().unwrap(), 2);

        let outcome = BatchWriteOutcome {
            written: 1,
            failed: vec![BatchWriteFailure {
                index: 1,
                error: Error::not_implemented("x"),
            }],
        };
        assert!(matches!(
            outcome.into_result(),
            Err(Error::BatchWrite { failed: 1 })
        ));
    }

    #[rstest]
    #[case::none(None, 0)]
    #[case::offset(Some(StartKey::Offset(4)), 4)]
    #[case::foreign(Some(StartKey::Key(serde_json::Map::new())), 0)]
    fn test_start_offset(#[case] start: Option<StartKey>, #[case] expected: u64) {
        assert_eq!(start_offset("T", start.as_ref()), expected);
    }
}
