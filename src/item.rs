use crate::{
    common::key::Keys,
    schema::{Map, Value},
};

use mongodb::bson::Bson;

/// Backend identity of a persisted item.
#[derive(Clone, Debug, PartialEq)]
pub enum Identity {
    /// Identity assigned by the document store.
    Document(Bson),
    /// Hash and range key on the key-value store.
    Key(Keys),
}

/// Item instance: field values keyed by logical name plus read bookkeeping.
///
/// An item is unsaved until a read or a write assigns it an [`Identity`]. Every read also keeps
/// the raw stored representation so that attributes unknown to the schema survive the next
/// write. Items are not synchronized; mutate one from a single caller at a time.
///
/// ```rust
/// use modular_sdk::item::Item;
///
/// let mut item = Item::new();
/// item.set("name", "x");
/// assert_eq!(item.get("name").and_then(|value| value.as_str()), Some("x"));
/// assert!(!item.is_persisted());
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Item {
    values: Map,
    identity: Option<Identity>,
    original: Option<Map>,
}

impl Item {
    /// Empty unsaved item.
    pub fn new() -> Self {
        Self::default()
    }

    /// Unsaved item holding the given logical values.
    pub fn from_values(values: Map) -> Self {
        Self {
            values,
            ..Default::default()
        }
    }

    pub(crate) fn from_storage(values: Map, identity: Identity, original: Map) -> Self {
        Self {
            values,
            identity: Some(identity),
            original: Some(original),
        }
    }

    /// Value of a field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Assigns a field. Assigning [`Value::Null`] clears it.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let value = value.into();
        let name = name.into();
        if value.is_null() {
            self.values.shift_remove(&name);
        } else {
            self.values.insert(name, value);
        }
        self
    }

    /// Clears a field and returns its previous value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.shift_remove(name)
    }

    /// All field values.
    pub fn values(&self) -> &Map {
        &self.values
    }

    /// Consumes the item into its field values.
    pub fn into_values(self) -> Map {
        self.values
    }

    /// Backend identity, absent for unsaved items.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Whether the item was read from or written to storage.
    pub fn is_persisted(&self) -> bool {
        self.identity.is_some()
    }

    /// Raw stored representation captured by the last read.
    pub fn original(&self) -> Option<&Map> {
        self.original.as_ref()
    }

    /// JSON view keyed by logical names.
    pub fn to_json(&self, exclude_none: bool) -> serde_json::Value {
        Value::Map(self.values.clone()).to_json(exclude_none)
    }

    pub(crate) fn replace(&mut self, other: Item) {
        *self = other;
    }

    pub(crate) fn forget(&mut self) {
        self.identity = None;
        self.original = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_set_and_remove() {
        let mut item = Item::new();
        item.set("a", 1).set("b", "x");
        assert_eq!(item.get("a"), Some(&Value::from(1)));
        item.set("a", Value::Null);
        assert_eq!(item.get("a"), None);
        assert_eq!(item.remove("b"), Some(Value::from("x")));
        assert!(item.values().is_empty());
    }

    #[test]
    fn test_to_json() {
        let item = Item::from_values(Map::from([
            ("name".to_string(), Value::from("x")),
            ("tags".to_string(), Value::List(vec![Value::from("a")])),
        ]));
        assert_eq!(item.to_json(true), json!({"name": "x", "tags": ["a"]}));
    }
}
