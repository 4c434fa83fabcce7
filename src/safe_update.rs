//! Keeps stored attributes that the schema does not declare.
//!
//! Reads keep the raw stored map next to the item. Writes merge that map back into the freshly
//! serialized one: undeclared keys are injected where they were, declared typed maps are merged
//! recursively and lists of typed maps position by position.
//!
//! List merging is positional. When a list of maps is reordered or shrunk between read and
//! write, undeclared keys follow the position, not the element, and positions past the current
//! length are dropped.

use crate::schema::{Field, Map, Value};

/// Merges the originally stored map into a freshly serialized one.
///
/// Keys keep their stored order so that writing back an unchanged item reproduces the stored
/// document exactly. Declared attributes the item no longer holds stay removed. A type
/// mismatch at a merge point keeps the new value and logs a warning.
pub fn merge(fields: &[Field], serialized: Map, original: &Map) -> Map {
    merge_at("", fields, serialized, original)
}

fn merge_at(prefix: &str, fields: &[Field], mut serialized: Map, original: &Map) -> Map {
    let mut merged = Map::with_capacity(serialized.len().max(original.len()));
    for (key, stored) in original {
        let field = fields.iter().find(|field| field.attr_name() == key);
        let current = serialized.shift_remove(key);
        match (field, current) {
            (None, Some(current)) => {
                merged.insert(key.clone(), current);
            }
            (None, None) => {
                merged.insert(key.clone(), stored.clone());
            }
            (Some(_), None) => {}
            (Some(field), Some(current)) => {
                let path = join(prefix, key);
                let value = match field.attribute_type().inner_fields() {
                    Some(inner) => merge_nested(&path, inner, current, stored),
                    None => current,
                };
                merged.insert(key.clone(), value);
            }
        }
    }
    merged.extend(serialized);
    merged
}

fn merge_nested(path: &str, inner: &[Field], current: Value, stored: &Value) -> Value {
    match (current, stored) {
        (Value::Map(current), Value::Map(stored)) => {
            Value::Map(merge_at(path, inner, current, stored))
        }
        (Value::List(current), Value::List(stored)) => Value::List(
            current
                .into_iter()
                .enumerate()
                .map(|(position, element)| match (element, stored.get(position)) {
                    (Value::Map(element), Some(Value::Map(stored))) => {
                        let path = format!("{path}[{position}]");
                        Value::Map(merge_at(&path, inner, element, stored))
                    }
                    (element, _) => element,
                })
                .collect(),
        ),
        (current, stored) => {
            tracing::warn!(
                path,
                stored = stored.kind(),
                current = current.kind(),
                "stored value type differs from the new one, keeping the new value"
            );
            current
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}
