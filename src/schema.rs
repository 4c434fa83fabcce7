//! Attribute type registry and model schemas.
//!
//! A [`Schema`] is an explicit, validated declaration of a model: its table, its ordered fields
//! and its secondary indexes. It is immutable once built and is shared read-only by every
//! operation.
//!
//! ```rust
//! use modular_sdk::schema::{AttributeType, Field, Schema, Value};
//!
//! fn empty() -> Value {
//!     Value::List(Vec::new())
//! }
//!
//! let schema = Schema::builder("Counters")
//!     .field(Field::new("name", AttributeType::Unicode).alias("n").hash_key())
//!     .field(Field::new("count", AttributeType::Number).alias("c"))
//!     .field(
//!         Field::new("tags", AttributeType::list_of(AttributeType::Unicode))
//!             .alias("t")
//!             .with_default_factory(empty),
//!     )
//!     .build()
//!     .unwrap();
//! assert_eq!(schema.path("count").unwrap().to_string(), "c");
//! ```

/// Per-type serialization rules.
pub mod attribute;

/// Field descriptors.
pub mod field;

/// Secondary index descriptors.
pub mod index;

/// Native values.
pub mod value;

pub use attribute::{AttributeType, Flavor};
pub use field::{DefaultValue, Field};
pub use index::SecondaryIndex;
pub use value::{Map, Number, Value};

use crate::{
    common::{
        key::{Key, Keys},
        path::{Path, PathElement},
    },
    error::{Error, Result},
};

use std::collections;

/// Validated model schema.
#[derive(Clone, Debug)]
pub struct Schema {
    table_name: String,
    fields: Vec<Field>,
    hash_key: usize,
    range_key: Option<usize>,
    indexes: Vec<SecondaryIndex>,
}

impl Schema {
    /// Starts declaring a schema for the given table.
    pub fn builder(table_name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            table_name: table_name.into(),
            fields: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Table or collection name.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Declared fields in declaration order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Field by logical name.
    pub fn field(&self, name: &str) -> Result<&Field> {
        self.fields
            .iter()
            .find(|field| field.name() == name)
            .ok_or_else(|| Error::UnknownAttribute {
                table: self.table_name.clone(),
                attribute: name.to_string(),
            })
    }

    /// Hash key field.
    pub fn hash_key(&self) -> &Field {
        &self.fields[self.hash_key]
    }

    /// Range key field, if declared.
    pub fn range_key(&self) -> Option<&Field> {
        self.range_key.map(|position| &self.fields[position])
    }

    /// Declared secondary indexes.
    pub fn indexes(&self) -> &[SecondaryIndex] {
        &self.indexes
    }

    /// Secondary index by name.
    pub fn index(&self, name: &str) -> Result<&SecondaryIndex> {
        self.indexes
            .iter()
            .find(|index| index.name() == name)
            .ok_or_else(|| Error::UnknownIndex {
                table: self.table_name.clone(),
                index: name.to_string(),
            })
    }

    /// Hash and range key fields of the table, or of a secondary index.
    pub fn key_fields(&self, index_name: Option<&str>) -> Result<(&Field, Option<&Field>)> {
        match index_name {
            None => Ok((self.hash_key(), self.range_key())),
            Some(index_name) => {
                let index = self.index(index_name)?;
                let hash_key = self.field(index.hash_key_field())?;
                let range_key = index
                    .range_key_field()
                    .map(|name| self.field(name))
                    .transpose()?;
                Ok((hash_key, range_key))
            }
        }
    }

    /// First field typed as an expiration timestamp.
    pub fn ttl_field(&self) -> Option<&Field> {
        self.fields
            .iter()
            .find(|field| matches!(field.attribute_type(), AttributeType::Ttl))
    }

    /// Resolves a logical attribute path into a storage path.
    ///
    /// Names are translated while the path walks through declared fields and typed maps. Below
    /// untyped maps and lists the names are kept verbatim.
    pub fn path(&self, logical: &str) -> Result<Path> {
        #[derive(Clone, Copy)]
        enum Scope<'a> {
            Fields(&'a [Field]),
            ListOf(&'a [Field]),
            Raw,
        }

        let parsed = Path::parse(logical)?;
        let mut scope = Scope::Fields(&self.fields);
        let mut elements = Vec::with_capacity(parsed.elements().len());
        for element in parsed.elements() {
            match (element, scope) {
                (PathElement::Name(name), Scope::Fields(fields)) => {
                    let field = fields
                        .iter()
                        .find(|field| field.name() == name)
                        .ok_or_else(|| Error::UnknownAttribute {
                            table: self.table_name.clone(),
                            attribute: logical.to_string(),
                        })?;
                    elements.push(PathElement::Name(field.attr_name().to_string()));
                    scope = match field.attribute_type() {
                        AttributeType::TypedMap(inner) => Scope::Fields(inner),
                        attribute_type => match attribute_type.inner_fields() {
                            Some(inner) => Scope::ListOf(inner),
                            None => Scope::Raw,
                        },
                    };
                }
                (PathElement::Index(index), Scope::ListOf(inner)) => {
                    elements.push(PathElement::Index(*index));
                    scope = Scope::Fields(inner);
                }
                (element, _) => {
                    elements.push(element.clone());
                    scope = Scope::Raw;
                }
            }
        }
        Ok(Path::from_elements(elements))
    }

    /// Serializes logical values into a raw map keyed by storage names.
    pub fn serialize(&self, values: &Map, flavor: Flavor) -> Result<Map> {
        field::serialize_fields(&self.table_name, &self.fields, values, flavor)
    }

    /// Deserializes a raw map keyed by storage names into logical values.
    pub fn deserialize(&self, raw: &Map, flavor: Flavor) -> Result<Map> {
        field::deserialize_fields(&self.fields, raw, flavor)
    }

    /// Serializes native key values.
    pub fn keys(&self, hash_key: Value, range_key: Option<Value>, flavor: Flavor) -> Result<Keys> {
        let partition_key = key(self.hash_key(), &hash_key, flavor)?;
        let sort_key = match (self.range_key(), range_key) {
            (Some(field), Some(value)) => Some(key(field, &value, flavor)?),
            (Some(field), None) => {
                return Err(Error::MissingAttribute {
                    attribute: field.name().to_string(),
                });
            }
            (None, Some(_)) => {
                return Err(Error::InvalidSchema(format!(
                    "table '{}' has no range key",
                    self.table_name
                )));
            }
            (None, None) => None,
        };
        Ok(Keys {
            partition_key,
            sort_key,
        })
    }

    /// Extracts the serialized key of an item from its logical values.
    pub fn keys_of(&self, values: &Map, flavor: Flavor) -> Result<Keys> {
        let hash_key = values
            .get(self.hash_key().name())
            .cloned()
            .unwrap_or_default();
        let range_key = match self.range_key() {
            Some(field) => Some(values.get(field.name()).cloned().unwrap_or_default()),
            None => None,
        };
        self.keys(hash_key, range_key, flavor)
    }
}

fn key(field: &Field, value: &Value, flavor: Flavor) -> Result<Key> {
    let value = field
        .serialize(value, flavor)?
        .ok_or_else(|| Error::MissingAttribute {
            attribute: field.name().to_string(),
        })?;
    Ok(Key {
        name: field.attr_name().to_string(),
        value,
    })
}

/// Builder validating schema invariants eagerly.
#[derive(Clone, Debug)]
pub struct SchemaBuilder {
    table_name: String,
    fields: Vec<Field>,
    indexes: Vec<SecondaryIndex>,
}

impl SchemaBuilder {
    /// Declares a field.
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Declares a secondary index.
    pub fn index(mut self, index: SecondaryIndex) -> Self {
        self.indexes.push(index);
        self
    }

    /// Validates the declaration.
    ///
    /// Exactly one hash key, at most one range key, unique logical and storage names at every
    /// nesting level, scalar key types and indexes over declared top-level fields.
    pub fn build(self) -> Result<Schema> {
        let invalid = |message: String| Error::InvalidSchema(format!("{}: {message}", self.table_name));
        if self.table_name.is_empty() {
            return Err(Error::InvalidSchema("table name cannot be empty".to_string()));
        }
        check_unique_names(&self.fields).map_err(invalid)?;
        if self.fields.iter().any(|field| field.attr_name() == "_id") {
            return Err(invalid("'_id' is reserved by the document store".to_string()));
        }
        let hash_keys: Vec<_> = positions(&self.fields, Field::is_hash_key);
        let hash_key = match hash_keys.as_slice() {
            [position] => *position,
            [] => return Err(invalid("no hash key declared".to_string())),
            _ => return Err(invalid("more than one hash key declared".to_string())),
        };
        let range_keys: Vec<_> = positions(&self.fields, Field::is_range_key);
        let range_key = match range_keys.as_slice() {
            [] => None,
            [position] if *position == hash_key => {
                return Err(invalid("a field cannot be both hash and range key".to_string()));
            }
            [position] => Some(*position),
            _ => return Err(invalid("more than one range key declared".to_string())),
        };
        for position in std::iter::once(hash_key).chain(range_key) {
            let field = &self.fields[position];
            if !is_key_type(field.attribute_type()) {
                return Err(invalid(format!(
                    "key field '{}' has non-scalar type {}",
                    field.name(),
                    field.attribute_type().name()
                )));
            }
        }
        let mut index_names = collections::HashSet::new();
        for index in &self.indexes {
            if !index_names.insert(index.name()) {
                return Err(invalid(format!("duplicate index '{}'", index.name())));
            }
            for name in std::iter::once(index.hash_key_field()).chain(index.range_key_field()) {
                if !self.fields.iter().any(|field| field.name() == name) {
                    return Err(invalid(format!(
                        "index '{}' references undeclared field '{name}'",
                        index.name()
                    )));
                }
            }
        }
        Ok(Schema {
            table_name: self.table_name,
            fields: self.fields,
            hash_key,
            range_key,
            indexes: self.indexes,
        })
    }
}

fn positions(fields: &[Field], predicate: fn(&Field) -> bool) -> Vec<usize> {
    fields
        .iter()
        .enumerate()
        .filter(|(_, field)| predicate(field))
        .map(|(position, _)| position)
        .collect()
}

fn is_key_type(attribute_type: &AttributeType) -> bool {
    matches!(
        attribute_type,
        AttributeType::Unicode
            | AttributeType::Number
            | AttributeType::Binary
            | AttributeType::Enum(_)
            | AttributeType::DateTime
    )
}

fn check_unique_names(fields: &[Field]) -> std::result::Result<(), String> {
    let mut names = collections::HashSet::new();
    let mut attr_names = collections::HashSet::new();
    for field in fields {
        if !names.insert(field.name()) {
            return Err(format!("duplicate field name '{}'", field.name()));
        }
        if !attr_names.insert(field.attr_name()) {
            return Err(format!("duplicate storage name '{}'", field.attr_name()));
        }
        if let Some(inner) = field.attribute_type().inner_fields() {
            check_unique_names(inner)?;
        }
    }
    Ok(())
}
