use crate::{
    error::{Error, Result},
    schema::{
        field::{self, Field},
        value::{ISO_FORMAT, Number, Value},
    },
};

use chrono::{DateTime, TimeZone, Utc};
use std::{collections, sync::Arc};

/// Physical representation targeted by serialization.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Flavor {
    /// Key-value store: datetimes as ISO strings, TTL as epoch seconds, native sets.
    KeyValue,
    /// Document store: native dates, sets as arrays.
    Document,
}

/// Semantic type of an attribute.
///
/// Each variant knows how to turn a native [`Value`] into the raw value stored by a backend and
/// back.
///
/// ```rust
/// use modular_sdk::schema::{AttributeType, Flavor, Value};
///
/// let raw = AttributeType::Number.serialize("c", &Value::from(1), Flavor::Document).unwrap();
/// assert_eq!(raw, Some(Value::from(1)));
/// ```
#[derive(Clone, Debug)]
pub enum AttributeType {
    /// Unicode string.
    Unicode,
    /// Number.
    Number,
    /// Boolean. Numbers written by older clients are read as `value != 0`.
    Boolean,
    /// Raw bytes.
    Binary,
    /// Untyped map stored as is.
    Map,
    /// Map with declared inner fields.
    TypedMap(Arc<Vec<Field>>),
    /// List, optionally with a declared element type.
    List(Option<Box<AttributeType>>),
    /// Set of strings.
    UnicodeSet,
    /// Set of numbers.
    NumberSet,
    /// Set of byte strings.
    BinarySet,
    /// String restricted to a list of allowed values.
    Enum(Arc<[String]>),
    /// UTC timestamp.
    DateTime,
    /// Expiration timestamp.
    Ttl,
    /// Type inferred from the runtime value.
    Dynamic,
}

impl AttributeType {
    /// Map with the given inner fields.
    pub fn typed_map(fields: impl IntoIterator<Item = Field>) -> Self {
        Self::TypedMap(Arc::new(fields.into_iter().collect()))
    }

    /// List whose elements have the given type.
    pub fn list_of(element: Self) -> Self {
        Self::List(Some(Box::new(element)))
    }

    /// String restricted to the given values.
    pub fn enumeration<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Enum(allowed.into_iter().map(Into::into).collect())
    }

    /// Type name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unicode => "unicode",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Binary => "binary",
            Self::Map => "map",
            Self::TypedMap(_) => "typed map",
            Self::List(_) => "list",
            Self::UnicodeSet => "unicode set",
            Self::NumberSet => "number set",
            Self::BinarySet => "binary set",
            Self::Enum(_) => "enum",
            Self::DateTime => "datetime",
            Self::Ttl => "ttl",
            Self::Dynamic => "dynamic",
        }
    }

    /// Inner fields of a typed map, or of the elements of a list of typed maps.
    pub(crate) fn inner_fields(&self) -> Option<&[Field]> {
        match self {
            Self::TypedMap(fields) => Some(fields),
            Self::List(Some(element)) => match element.as_ref() {
                Self::TypedMap(fields) => Some(fields),
                _ => None,
            },
            _ => None,
        }
    }

    /// Converts a native value into the raw value stored by a backend.
    ///
    /// `None` means the attribute is not written at all, which is the case for nulls and for
    /// empty sets on the key-value store.
    pub fn serialize(&self, attribute: &str, value: &Value, flavor: Flavor) -> Result<Option<Value>> {
        if value.is_null() {
            return Ok(None);
        }
        let mismatch = || Error::Serialization {
            attribute: attribute.to_string(),
            reason: format!("expected {} value, got {}", self.name(), value.kind()),
        };
        let raw = match (self, value) {
            (Self::Unicode, Value::String(_))
            | (Self::Number, Value::Number(_))
            | (Self::Boolean, Value::Bool(_))
            | (Self::Binary, Value::Binary(_))
            | (Self::Map, Value::Map(_))
            | (Self::List(None), Value::List(_)) => value.clone(),
            (Self::TypedMap(fields), Value::Map(map)) => {
                Value::Map(field::serialize_fields(attribute, fields, map, flavor)?)
            }
            (Self::List(Some(element)), Value::List(list)) => {
                let mut raw = Vec::with_capacity(list.len());
                for (position, item) in list.iter().enumerate() {
                    let item_attribute = format!("{attribute}[{position}]");
                    let item = element.serialize(&item_attribute, item, flavor)?;
                    raw.push(item.unwrap_or_default());
                }
                Value::List(raw)
            }
            (Self::UnicodeSet, Value::StringSet(set)) => {
                let set = set.iter().cloned().map(Value::String).collect();
                return Ok(set_for_flavor(value.clone(), set, flavor));
            }
            (Self::UnicodeSet, Value::List(list)) => {
                let set = list
                    .iter()
                    .map(|item| item.as_str().map(str::to_string).ok_or_else(mismatch))
                    .collect::<Result<collections::BTreeSet<_>>>()?;
                return self.serialize(attribute, &Value::StringSet(set), flavor);
            }
            (Self::NumberSet, Value::NumberSet(set)) => {
                let mut deduplicated: Vec<Number> = Vec::with_capacity(set.len());
                for number in set {
                    if !deduplicated.contains(number) {
                        deduplicated.push(number.clone());
                    }
                }
                let list = deduplicated.iter().cloned().map(Value::Number).collect();
                return Ok(set_for_flavor(
                    Value::NumberSet(deduplicated),
                    list,
                    flavor,
                ));
            }
            (Self::BinarySet, Value::BinarySet(set)) => {
                let list = set.iter().cloned().map(Value::Binary).collect();
                return Ok(set_for_flavor(value.clone(), list, flavor));
            }
            (Self::Enum(allowed), Value::String(string)) => {
                if !allowed.contains(string) {
                    return Err(Error::Serialization {
                        attribute: attribute.to_string(),
                        reason: format!(
                            "'{string}' is not one of the allowed values: {}",
                            allowed.join(", ")
                        ),
                    });
                }
                value.clone()
            }
            (Self::DateTime, Value::DateTime(datetime)) => match flavor {
                Flavor::KeyValue => Value::String(datetime.format(ISO_FORMAT).to_string()),
                Flavor::Document => value.clone(),
            },
            (Self::Ttl, Value::DateTime(datetime)) => match flavor {
                Flavor::KeyValue => Value::Number(Number::Int(datetime.timestamp())),
                Flavor::Document => value.clone(),
            },
            (Self::Ttl, Value::Number(number)) => {
                let datetime = epoch_to_datetime(number).ok_or_else(mismatch)?;
                return self.serialize(attribute, &Value::DateTime(datetime), flavor);
            }
            (
                Self::Dynamic,
                Value::String(_)
                | Value::Number(_)
                | Value::Bool(_)
                | Value::Binary(_)
                | Value::List(_)
                | Value::Map(_),
            ) => value.clone(),
            (Self::Dynamic, _) => {
                return Err(Error::Serialization {
                    attribute: attribute.to_string(),
                    reason: format!("dynamic attribute does not support {} values", value.kind()),
                });
            }
            _ => return Err(mismatch()),
        };
        Ok(Some(raw))
    }

    /// Converts a raw stored value back into a native value.
    ///
    /// Fails with [`Error::Deserialization`] when the stored value does not match the declared
    /// type. Booleans are the one tolerated mismatch: numbers are accepted.
    pub fn deserialize(&self, attribute: &str, raw: Value, flavor: Flavor) -> Result<Value> {
        let mismatch = |found: &Value| Error::Deserialization {
            attribute: attribute.to_string(),
            expected: self.name().to_string(),
            found: found.kind().to_string(),
        };
        let value = match (self, raw) {
            (_, Value::Null) => Value::Null,
            (Self::Unicode | Self::Enum(_), raw @ Value::String(_))
            | (Self::Number, raw @ Value::Number(_))
            | (Self::Boolean, raw @ Value::Bool(_))
            | (Self::Binary, raw @ Value::Binary(_))
            | (Self::Map, raw @ Value::Map(_))
            | (Self::List(None), raw @ Value::List(_))
            | (Self::UnicodeSet, raw @ Value::StringSet(_))
            | (Self::NumberSet, raw @ Value::NumberSet(_))
            | (Self::BinarySet, raw @ Value::BinarySet(_))
            | (Self::DateTime | Self::Ttl, raw @ Value::DateTime(_)) => raw,
            (Self::Boolean, Value::Number(number)) => Value::Bool(number.as_f64() != 0.0),
            (Self::TypedMap(fields), Value::Map(map)) => {
                Value::Map(field::deserialize_fields(fields, &map, flavor)?)
            }
            (Self::List(Some(element)), Value::List(list)) => {
                let mut values = Vec::with_capacity(list.len());
                for (position, item) in list.into_iter().enumerate() {
                    let item_attribute = format!("{attribute}[{position}]");
                    values.push(element.deserialize(&item_attribute, item, flavor)?);
                }
                Value::List(values)
            }
            (Self::UnicodeSet, Value::List(list)) => {
                let mut set = collections::BTreeSet::new();
                for item in list {
                    match item {
                        Value::String(string) => set.insert(string),
                        other => return Err(mismatch(&other)),
                    };
                }
                Value::StringSet(set)
            }
            (Self::NumberSet, Value::List(list)) => {
                let mut set = Vec::with_capacity(list.len());
                for item in list {
                    match item {
                        Value::Number(number) => set.push(number),
                        other => return Err(mismatch(&other)),
                    }
                }
                Value::NumberSet(set)
            }
            (Self::BinarySet, Value::List(list)) => {
                let mut set = collections::BTreeSet::new();
                for item in list {
                    match item {
                        Value::Binary(bytes) => set.insert(bytes),
                        other => return Err(mismatch(&other)),
                    };
                }
                Value::BinarySet(set)
            }
            (Self::DateTime, Value::String(string)) => {
                let datetime = parse_datetime(&string).ok_or_else(|| Error::Deserialization {
                    attribute: attribute.to_string(),
                    expected: "ISO datetime".to_string(),
                    found: format!("'{string}'"),
                })?;
                Value::DateTime(datetime)
            }
            (Self::Ttl, Value::Number(number)) => {
                let datetime = epoch_to_datetime(&number)
                    .ok_or_else(|| mismatch(&Value::Number(number.clone())))?;
                Value::DateTime(datetime)
            }
            (Self::Dynamic, raw) => raw,
            (_, raw) => return Err(mismatch(&raw)),
        };
        Ok(value)
    }
}

fn set_for_flavor(native: Value, list: Vec<Value>, flavor: Flavor) -> Option<Value> {
    match flavor {
        Flavor::KeyValue if list.is_empty() => None,
        Flavor::KeyValue => Some(native),
        Flavor::Document => Some(Value::List(list)),
    }
}

fn epoch_to_datetime(number: &Number) -> Option<DateTime<Utc>> {
    let seconds = number.as_i64()?;
    Utc.timestamp_opt(seconds, 0).single()
}

pub(crate) fn parse_datetime(string: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(string, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(string))
        .ok()
        .map(|datetime| datetime.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::schema::value::Map;
    use rstest::rstest;

    fn moment() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap()
    }

    #[rstest]
    #[case::unicode(AttributeType::Unicode, Value::from("a"))]
    #[case::number(AttributeType::Number, Value::from(1.5))]
    #[case::boolean(AttributeType::Boolean, Value::from(true))]
    #[case::binary(AttributeType::Binary, Value::Binary(vec![0, 1, 2]))]
    #[case::map(
        AttributeType::Map,
        Value::Map(Map::from([("k".to_string(), Value::from(1))]))
    )]
    #[case::list(AttributeType::List(None), Value::List(vec![Value::from("a"), Value::from(2)]))]
    #[case::unicode_set(
        AttributeType::UnicodeSet,
        Value::StringSet(["a".to_string(), "b".to_string()].into())
    )]
    #[case::number_set(AttributeType::NumberSet, Value::NumberSet(vec![Number::Int(1), Number::Int(2)]))]
    #[case::enumeration(AttributeType::enumeration(["on", "off"]), Value::from("on"))]
    #[case::datetime(AttributeType::DateTime, Value::DateTime(moment()))]
    #[case::ttl(AttributeType::Ttl, Value::DateTime(moment()))]
    #[case::dynamic(AttributeType::Dynamic, Value::from("a"))]
    fn test_round_trip(#[case] attribute_type: AttributeType, #[case] value: Value) {
        for flavor in [Flavor::KeyValue, Flavor::Document] {
            let raw = attribute_type
                .serialize("x", &value, flavor)
                .unwrap()
                .unwrap();
            let actual = attribute_type.deserialize("x", raw, flavor).unwrap();
            assert_eq!(actual, value, "{flavor:?}");
        }
    }

    #[rstest]
    #[case::datetime_key_value(
        AttributeType::DateTime,
        Flavor::KeyValue,
        Value::from("2024-05-06T07:08:09.000000+0000")
    )]
    #[case::datetime_document(AttributeType::DateTime, Flavor::Document, Value::DateTime(moment()))]
    #[case::ttl_key_value(AttributeType::Ttl, Flavor::KeyValue, Value::from(1_714_979_289_i64))]
    #[case::set_document(
        AttributeType::UnicodeSet,
        Flavor::Document,
        Value::List(vec![Value::from("a")])
    )]
    fn test_flavor(#[case] attribute_type: AttributeType, #[case] flavor: Flavor, #[case] expected: Value) {
        let value = match attribute_type {
            AttributeType::UnicodeSet => Value::StringSet(["a".to_string()].into()),
            _ => Value::DateTime(moment()),
        };
        let raw = attribute_type.serialize("x", &value, flavor).unwrap();
        assert_eq!(raw, Some(expected));
    }

    #[test]
    fn test_empty_set_is_omitted_on_key_value_store() {
        let empty = Value::StringSet(collections::BTreeSet::new());
        let raw = AttributeType::UnicodeSet
            .serialize("x", &empty, Flavor::KeyValue)
            .unwrap();
        assert_eq!(raw, None);
        let raw = AttributeType::UnicodeSet
            .serialize("x", &empty, Flavor::Document)
            .unwrap();
        assert_eq!(raw, Some(Value::List(Vec::new())));
    }

    #[rstest]
    #[case::one(Value::from(1), true)]
    #[case::zero(Value::from(0), false)]
    #[case::boolean(Value::from(true), true)]
    fn test_boolean_accepts_numbers(#[case] raw: Value, #[case] expected: bool) {
        let value = AttributeType::Boolean
            .deserialize("b", raw, Flavor::KeyValue)
            .unwrap();
        assert_eq!(value, Value::Bool(expected));
    }

    #[test]
    fn test_boolean_rejects_strings() {
        let error = AttributeType::Boolean
            .deserialize("b", Value::from("yes"), Flavor::Document)
            .unwrap_err();
        match error {
            Error::Deserialization {
                attribute,
                expected,
                found,
            } => {
                assert_eq!(attribute, "b");
                assert_eq!(expected, "boolean");
                assert_eq!(found, "string");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[rstest]
    #[case::set(Value::StringSet(["a".to_string()].into()))]
    #[case::datetime(Value::DateTime(moment()))]
    fn test_dynamic_rejects_unsupported(#[case] value: Value) {
        let error = AttributeType::Dynamic
            .serialize("d", &value, Flavor::Document)
            .unwrap_err();
        assert!(error.to_string().contains("dynamic attribute does not support"));
    }

    #[test]
    fn test_enum_rejects_unknown_value() {
        let error = AttributeType::enumeration(["on", "off"])
            .serialize("e", &Value::from("maybe"), Flavor::Document)
            .unwrap_err();
        assert!(matches!(error, Error::Serialization { .. }));
    }

    #[test]
    fn test_typed_map() {
        let attribute_type = AttributeType::typed_map([
            Field::new("owner", AttributeType::Unicode).alias("o"),
            Field::new("size", AttributeType::Number).alias("s"),
        ]);
        let value = Value::Map(Map::from([
            ("owner".to_string(), Value::from("me")),
            ("size".to_string(), Value::from(3)),
        ]));
        let raw = attribute_type
            .serialize("m", &value, Flavor::Document)
            .unwrap()
            .unwrap();
        let expected = Value::Map(Map::from([
            ("o".to_string(), Value::from("me")),
            ("s".to_string(), Value::from(3)),
        ]));
        assert_eq!(raw, expected);
        let actual = attribute_type
            .deserialize("m", raw, Flavor::Document)
            .unwrap();
        assert_eq!(actual, value);
    }

    #[test]
    fn test_mismatch_is_reported() {
        let error = AttributeType::Number
            .deserialize("c", Value::from("1"), Flavor::Document)
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "cannot deserialize attribute 'c' as number: found string"
        );
    }
}
