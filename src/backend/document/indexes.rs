//! Index synchronization between a schema and a document store collection.
//!
//! Desired indexes are extracted from the schema: a unique primary index on the hash and range
//! keys, one index per secondary index and an expiring index on the TTL attribute. Names are
//! generated from the key composition (`n_1_d_-1`) unless configured otherwise.
//!
//! [`sync`] converges the collection to the desired set and is idempotent: a second run issues
//! no index operation. [`ensure`] only creates what is missing.

use super::collection::DocumentCollection;
use crate::{error::Result, schema::Schema};

use mongodb::bson::Bson;

use std::collections::HashSet;

/// Index name the store creates for the identity field.
pub const IDENTITY_INDEX: &str = "_id_";

/// Direction of an index key.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexOrder {
    /// `1`
    Ascending,
    /// `-1`
    Descending,
    /// Special index kinds such as `"text"` or `"2dsphere"`.
    Other(Bson),
}

impl IndexOrder {
    pub(crate) fn to_bson(&self) -> Bson {
        match self {
            Self::Ascending => Bson::Int32(1),
            Self::Descending => Bson::Int32(-1),
            Self::Other(other) => other.clone(),
        }
    }

    pub(crate) fn from_bson(value: Bson) -> Self {
        let direction = match &value {
            Bson::Int32(direction) => Some(i64::from(*direction)),
            Bson::Int64(direction) => Some(*direction),
            Bson::Double(direction) if direction.fract() == 0.0 => Some(*direction as i64),
            _ => None,
        };
        match direction {
            Some(1) => Self::Ascending,
            Some(-1) => Self::Descending,
            _ => Self::Other(value),
        }
    }

    fn name_suffix(&self) -> String {
        match self {
            Self::Ascending => "1".to_string(),
            Self::Descending => "-1".to_string(),
            Self::Other(Bson::String(kind)) => kind.clone(),
            Self::Other(other) => other.to_string(),
        }
    }
}

/// Index definition as stored by the collection.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexSpec {
    /// Index name.
    pub name: String,
    /// Indexed fields with their direction, in order.
    pub keys: Vec<(String, IndexOrder)>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
    /// Expiry of documents indexed by a date field.
    pub expire_after_seconds: Option<u64>,
}

impl IndexSpec {
    /// Index with a name generated from its keys.
    pub fn new(keys: Vec<(String, IndexOrder)>) -> Self {
        Self {
            name: generated_name(&keys),
            keys,
            unique: false,
            expire_after_seconds: None,
        }
    }

    /// Whether both definitions index the same way, names aside.
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.keys == other.keys
            && self.unique == other.unique
            && self.expire_after_seconds == other.expire_after_seconds
    }
}

/// Name the store would generate for the keys, such as `n_1_d_-1`.
pub fn generated_name(keys: &[(String, IndexOrder)]) -> String {
    keys.iter()
        .map(|(field, order)| format!("{field}_{}", order.name_suffix()))
        .collect::<Vec<_>>()
        .join("_")
}

/// Derives the desired indexes of a schema.
#[derive(Clone, Debug)]
pub struct IndexExtractor {
    primary_index_name: Option<String>,
    hash_key_order: IndexOrder,
    range_key_order: IndexOrder,
    use_declared_names: bool,
}

impl Default for IndexExtractor {
    fn default() -> Self {
        Self {
            primary_index_name: None,
            hash_key_order: IndexOrder::Ascending,
            range_key_order: IndexOrder::Descending,
            use_declared_names: false,
        }
    }
}

impl IndexExtractor {
    /// Fixed name of the primary index.
    pub fn primary_index_name(mut self, name: impl Into<String>) -> Self {
        self.primary_index_name = Some(name.into());
        self
    }

    /// Direction of hash keys.
    pub fn hash_key_order(mut self, order: IndexOrder) -> Self {
        self.hash_key_order = order;
        self
    }

    /// Direction of range keys.
    pub fn range_key_order(mut self, order: IndexOrder) -> Self {
        self.range_key_order = order;
        self
    }

    /// Names secondary indexes as declared instead of generating names.
    pub fn use_declared_names(mut self, use_declared_names: bool) -> Self {
        self.use_declared_names = use_declared_names;
        self
    }

    /// Desired indexes of the schema. Definitions sharing a name keep the first one.
    pub fn extract(&self, schema: &Schema) -> Result<Vec<IndexSpec>> {
        let mut primary = IndexSpec::new(self.keys(
            schema.hash_key().attr_name(),
            schema.range_key().map(|field| field.attr_name()),
        ));
        primary.unique = true;
        if let Some(name) = &self.primary_index_name {
            primary.name = name.clone();
        }
        let mut desired = vec![primary];
        for index in schema.indexes() {
            let (hash_key, range_key) = schema.key_fields(Some(index.name()))?;
            let mut spec = IndexSpec::new(
                self.keys(hash_key.attr_name(), range_key.map(|field| field.attr_name())),
            );
            if self.use_declared_names {
                spec.name = index.name().to_string();
            }
            desired.push(spec);
        }
        if let Some(ttl) = schema.ttl_field() {
            let mut spec = IndexSpec::new(vec![(ttl.attr_name().to_string(), IndexOrder::Ascending)]);
            spec.expire_after_seconds = Some(0);
            desired.push(spec);
        }
        let mut names = HashSet::new();
        desired.retain(|spec| names.insert(spec.name.clone()));
        Ok(desired)
    }

    fn keys(&self, hash_key: &str, range_key: Option<&str>) -> Vec<(String, IndexOrder)> {
        let mut keys = vec![(hash_key.to_string(), self.hash_key_order.clone())];
        if let Some(range_key) = range_key {
            keys.push((range_key.to_string(), self.range_key_order.clone()));
        }
        keys
    }
}

/// Index operations issued by a synchronization.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexSyncReport {
    /// Names of the created indexes.
    pub created: Vec<String>,
    /// Names of the dropped indexes.
    pub dropped: Vec<String>,
    /// Names of the existing indexes left untouched.
    pub kept: Vec<String>,
}

impl IndexSyncReport {
    /// Whether the collection already matched.
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.dropped.is_empty()
    }
}

/// Converges the collection indexes to `desired`.
///
/// - an index with a desired name and the same definition is kept;
/// - an index with a desired name and another definition is dropped and recreated;
/// - an undesired index equivalent to a desired one is kept and satisfies it;
/// - any other index is dropped unless listed in `always_keep`.
#[tracing::instrument(name = "modular_sdk.sync_indexes", skip_all, fields(collection = collection.name()), err)]
pub fn sync(
    collection: &dyn DocumentCollection,
    desired: &[IndexSpec],
    always_keep: &[&str],
) -> Result<IndexSyncReport> {
    let existing = collection.list_indexes()?;
    let mut report = IndexSyncReport::default();
    let mut satisfied = HashSet::new();
    for index in &existing {
        if always_keep.contains(&index.name.as_str()) {
            report.kept.push(index.name.clone());
            continue;
        }
        if let Some(wanted) = desired.iter().find(|wanted| wanted.name == index.name) {
            if wanted.is_equivalent(index) {
                satisfied.insert(wanted.name.clone());
                report.kept.push(index.name.clone());
            } else {
                tracing::warn!(index = %index.name, "index definition changed, recreating it");
                collection.drop_index(&index.name)?;
                report.dropped.push(index.name.clone());
            }
            continue;
        }
        let equivalent = desired.iter().find(|wanted| {
            wanted.is_equivalent(index)
                && !satisfied.contains(&wanted.name)
                && !existing.iter().any(|other| other.name == wanted.name)
        });
        match equivalent {
            Some(wanted) => {
                tracing::warn!(
                    index = %index.name,
                    desired = %wanted.name,
                    "equivalent index exists under another name, keeping it"
                );
                satisfied.insert(wanted.name.clone());
                report.kept.push(index.name.clone());
            }
            None => {
                tracing::warn!(index = %index.name, "dropping index not declared by the schema");
                collection.drop_index(&index.name)?;
                report.dropped.push(index.name.clone());
            }
        }
    }
    for wanted in desired {
        if satisfied.contains(&wanted.name) {
            continue;
        }
        tracing::info!(index = %wanted.name, "creating index");
        collection.create_index(wanted)?;
        report.created.push(wanted.name.clone());
    }
    Ok(report)
}

/// Creates the desired indexes that are missing. Nothing is dropped.
#[tracing::instrument(name = "modular_sdk.ensure_indexes", skip_all, fields(collection = collection.name()), err)]
pub fn ensure(collection: &dyn DocumentCollection, desired: &[IndexSpec]) -> Result<IndexSyncReport> {
    let existing = collection.list_indexes()?;
    let mut report = IndexSyncReport::default();
    for wanted in desired {
        if let Some(index) = existing.iter().find(|index| index.name == wanted.name) {
            if !index.is_equivalent(wanted) {
                tracing::warn!(
                    index = %wanted.name,
                    "index exists with another definition, run a sync to recreate it"
                );
            }
            report.kept.push(index.name.clone());
            continue;
        }
        if let Some(index) = existing.iter().find(|index| index.is_equivalent(wanted)) {
            tracing::warn!(
                index = %index.name,
                desired = %wanted.name,
                "equivalent index exists under another name"
            );
            report.kept.push(index.name.clone());
            continue;
        }
        tracing::info!(index = %wanted.name, "creating index");
        collection.create_index(wanted)?;
        report.created.push(wanted.name.clone());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        backend::document::memory::{IndexOperation, MemoryCollection},
        schema::{AttributeType, Field, SecondaryIndex},
    };

    use rstest::rstest;

    fn schema(with_index: bool) -> Schema {
        let mut builder = Schema::builder("Jobs")
            .field(Field::new("name", AttributeType::Unicode).alias("n").hash_key())
            .field(Field::new("date", AttributeType::Unicode).alias("d").range_key())
            .field(Field::new("owner", AttributeType::Unicode).alias("o"))
            .field(Field::new("expires", AttributeType::Ttl).alias("ttl"));
        if with_index {
            builder = builder.index(SecondaryIndex::new("owner-index", "owner").range_key("date"));
        }
        builder.build().unwrap()
    }

    fn names(specs: &[IndexSpec]) -> Vec<&str> {
        specs.iter().map(|spec| spec.name.as_str()).collect()
    }

    #[rstest]
    #[case::generated(IndexExtractor::default(), vec!["n_1_d_-1", "o_1_d_-1", "ttl_1"])]
    #[case::fixed_primary(
        IndexExtractor::default().primary_index_name("main"),
        vec!["main", "o_1_d_-1", "ttl_1"]
    )]
    #[case::declared(
        IndexExtractor::default().use_declared_names(true),
        vec!["n_1_d_-1", "owner-index", "ttl_1"]
    )]
    #[case::orders(
        IndexExtractor::default()
            .hash_key_order(IndexOrder::Descending)
            .range_key_order(IndexOrder::Ascending),
        vec!["n_-1_d_1", "o_-1_d_1", "ttl_1"]
    )]
    fn test_extract(#[case] extractor: IndexExtractor, #[case] expected: Vec<&str>) {
        let desired = extractor.extract(&schema(true)).unwrap();
        assert_eq!(names(&desired), expected);
        assert!(desired[0].unique);
        assert!(!desired[1].unique);
        assert_eq!(desired[2].expire_after_seconds, Some(0));
    }

    #[test]
    fn test_generated_name_of_special_kind() {
        let keys = vec![
            ("body".to_string(), IndexOrder::Other(Bson::String("text".to_string()))),
            ("n".to_string(), IndexOrder::Ascending),
        ];
        assert_eq!(generated_name(&keys), "body_text_n_1");
    }

    #[test]
    fn test_sync_converges() {
        let collection = MemoryCollection::new("Jobs");
        let extractor = IndexExtractor::default();

        let desired = extractor.extract(&schema(false)).unwrap();
        let first = sync(&collection, &desired, &[IDENTITY_INDEX]).unwrap();
        assert_eq!(first.created, vec!["n_1_d_-1", "ttl_1"]);
        assert!(first.dropped.is_empty());

        collection.clear_operations();
        let second = sync(&collection, &desired, &[IDENTITY_INDEX]).unwrap();
        assert!(second.is_noop());
        assert!(collection.operations().is_empty());

        let desired = extractor.extract(&schema(true)).unwrap();
        let third = sync(&collection, &desired, &[IDENTITY_INDEX]).unwrap();
        assert_eq!(third.created, vec!["o_1_d_-1"]);
        assert!(third.dropped.is_empty());
        assert_eq!(
            collection.operations(),
            vec![IndexOperation::Create("o_1_d_-1".to_string())]
        );
    }

    #[test]
    fn test_sync_repairs_changed_definition() {
        let collection = MemoryCollection::new("Jobs");
        let mut stale = IndexSpec::new(vec![("n".to_string(), IndexOrder::Ascending)]);
        stale.name = "n_1_d_-1".to_string();
        collection.create_index(&stale).unwrap();
        collection.clear_operations();

        let desired = IndexExtractor::default().extract(&schema(false)).unwrap();
        let report = sync(&collection, &desired, &[IDENTITY_INDEX]).unwrap();
        assert_eq!(report.dropped, vec!["n_1_d_-1"]);
        assert_eq!(
            collection.operations(),
            vec![
                IndexOperation::Drop("n_1_d_-1".to_string()),
                IndexOperation::Create("n_1_d_-1".to_string()),
                IndexOperation::Create("ttl_1".to_string()),
            ]
        );
    }

    #[test]
    fn test_sync_drops_unknown_and_keeps_equivalent() {
        let collection = MemoryCollection::new("Jobs");
        let mut renamed = IndexSpec::new(vec![("ttl".to_string(), IndexOrder::Ascending)]);
        renamed.name = "expiry".to_string();
        renamed.expire_after_seconds = Some(0);
        collection.create_index(&renamed).unwrap();
        collection
            .create_index(&IndexSpec::new(vec![("legacy".to_string(), IndexOrder::Ascending)]))
            .unwrap();
        collection.clear_operations();

        let desired = IndexExtractor::default().extract(&schema(false)).unwrap();
        let report = sync(&collection, &desired, &[IDENTITY_INDEX]).unwrap();
        assert_eq!(report.kept, vec!["_id_", "expiry"]);
        assert_eq!(report.dropped, vec!["legacy_1"]);
        assert_eq!(report.created, vec!["n_1_d_-1"]);
    }

    #[test]
    fn test_ensure_only_creates() {
        let collection = MemoryCollection::new("Jobs");
        collection
            .create_index(&IndexSpec::new(vec![("legacy".to_string(), IndexOrder::Ascending)]))
            .unwrap();
        collection.clear_operations();

        let desired = IndexExtractor::default().extract(&schema(false)).unwrap();
        let report = ensure(&collection, &desired).unwrap();
        assert_eq!(report.created, vec!["n_1_d_-1", "ttl_1"]);
        assert!(report.dropped.is_empty());
        let again = ensure(&collection, &desired).unwrap();
        assert!(again.is_noop());
        assert_eq!(collection.operations().len(), 2);
    }
}
