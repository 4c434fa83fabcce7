use crate::{common::path::Path, common::condition::Condition, schema::Value};

use std::fmt;

/// Key component addressed by storage name.
///
/// ```rust
/// use modular_sdk::common::key;
///
/// let key = key::Key {
///     name: "n".to_string(),
///     value: "x".into(),
/// };
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Key {
    /// Storage name of the key attribute.
    pub name: String,
    /// Serialized key value.
    pub value: Value,
}

/// Primary key (partition key and optional sort key).
///
/// ```rust
/// use modular_sdk::common::key;
///
/// let keys = key::Keys {
///     partition_key: key::Key {
///         name: "n".to_string(),
///         value: "x".into(),
///     },
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Keys {
    /// The partition key (required).
    pub partition_key: Key,
    /// The sort key (optional, only for tables with composite primary keys).
    pub sort_key: Option<Key>,
}

impl Keys {
    /// Equality condition matching exactly this key.
    pub fn condition(&self) -> Condition {
        let partition = Path::new(&self.partition_key.name).eq(self.partition_key.value.clone());
        match &self.sort_key {
            Some(sort_key) => partition & Path::new(&sort_key.name).eq(sort_key.value.clone()),
            None => partition,
        }
    }
}

impl fmt::Display for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.partition_key.value.to_json(false))?;
        if let Some(sort_key) = &self.sort_key {
            write!(f, "/{}", sort_key.value.to_json(false))?;
        }
        Ok(())
    }
}
