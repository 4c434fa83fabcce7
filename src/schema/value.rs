use crate::error::{Error, Result};

use aws_sdk_dynamodb::{primitives::Blob, types::AttributeValue};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use indexmap::IndexMap;
use mongodb::bson::{self, Bson, spec::BinarySubtype};
use std::{cmp, collections, fmt};

/// Ordered map of attribute names to values.
pub type Map = IndexMap<String, Value>;

/// Format used for datetimes stored as strings.
pub(crate) const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f+0000";

/// Numeric value.
///
/// Decimals keep their textual form so that values read from the key-value store survive a
/// round trip without losing precision. The document store cannot hold them and receives a
/// float instead.
#[derive(Clone, Debug)]
pub enum Number {
    /// Signed integer.
    Int(i64),
    /// Double precision float.
    Float(f64),
    /// Arbitrary precision decimal literal.
    Decimal(String),
}

impl Number {
    /// Parses a numeric literal.
    ///
    /// ```rust
    /// use modular_sdk::schema::Number;
    ///
    /// assert_eq!(Number::parse("42").unwrap(), Number::Int(42));
    /// assert!(Number::parse("forty-two").is_err());
    /// ```
    pub fn parse(literal: &str) -> Result<Self> {
        let literal = literal.trim();
        if let Ok(int) = literal.parse::<i64>() {
            return Ok(Self::Int(int));
        }
        match literal.parse::<f64>() {
            Ok(float) if float.is_finite() => Ok(Self::Decimal(literal.to_string())),
            _ => Err(Error::InvalidNumber(literal.to_string())),
        }
    }

    /// Lossy conversion to a float.
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Int(int) => *int as f64,
            Self::Float(float) => *float,
            Self::Decimal(decimal) => decimal.parse().unwrap_or(f64::NAN),
        }
    }

    /// Integer view of the number when it has no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(int) => Some(*int),
            Self::Float(float) if float.fract() == 0.0 && float.abs() < i64::MAX as f64 => {
                Some(*float as i64)
            }
            Self::Float(_) => None,
            Self::Decimal(decimal) => decimal.parse().ok(),
        }
    }

    /// Returns the number with its sign flipped.
    pub fn negate(&self) -> Self {
        match self {
            Self::Int(int) => match int.checked_neg() {
                Some(negated) => Self::Int(negated),
                None => Self::Float(-(*int as f64)),
            },
            Self::Float(float) => Self::Float(-float),
            Self::Decimal(decimal) => match decimal.strip_prefix('-') {
                Some(positive) => Self::Decimal(positive.to_string()),
                None => Self::Decimal(format!("-{decimal}")),
            },
        }
    }

    pub(crate) fn to_bson(&self) -> Bson {
        match self {
            Self::Int(int) => match i32::try_from(*int) {
                Ok(small) => Bson::Int32(small),
                Err(_) => Bson::Int64(*int),
            },
            Self::Float(float) => Bson::Double(*float),
            Self::Decimal(decimal) => match decimal.parse::<i64>() {
                Ok(int) => Self::Int(int).to_bson(),
                Err(_) => Bson::Double(self.as_f64()),
            },
        }
    }

    pub(crate) fn to_wire(&self) -> Result<String> {
        match self {
            Self::Float(float) if !float.is_finite() => {
                Err(Error::InvalidNumber(float.to_string()))
            }
            number => Ok(number.to_string()),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(left), Self::Int(right)) => left == right,
            (Self::Decimal(left), Self::Decimal(right)) if left == right => true,
            (left, right) => left.as_f64() == right.as_f64(),
        }
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        match (self, other) {
            (Self::Int(left), Self::Int(right)) => left.partial_cmp(right),
            (left, right) => left.as_f64().partial_cmp(&right.as_f64()),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(int) => write!(f, "{int}"),
            Self::Float(float) => write!(f, "{float}"),
            Self::Decimal(decimal) => f.write_str(decimal),
        }
    }
}

impl From<i64> for Number {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Number {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for Number {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Native attribute value.
///
/// Items hold their fields as `Value`s keyed by logical name. The attribute type registry turns
/// them into the raw representation of either backend and back.
///
/// ```rust
/// use modular_sdk::schema::Value;
///
/// let tags = Value::from(vec![Value::from("a"), Value::from("b")]);
/// assert_eq!(tags.kind(), "list");
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    /// Absent or explicit null.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Number.
    Number(Number),
    /// Unicode string.
    String(String),
    /// Raw bytes.
    Binary(Vec<u8>),
    /// Heterogeneous list.
    List(Vec<Value>),
    /// Nested map.
    Map(Map),
    /// Set of strings.
    StringSet(collections::BTreeSet<String>),
    /// Set of numbers.
    NumberSet(Vec<Number>),
    /// Set of byte strings.
    BinarySet(collections::BTreeSet<Vec<u8>>),
    /// UTC timestamp.
    DateTime(DateTime<Utc>),
    /// Document store value with no native counterpart, such as an object id.
    Raw(Bson),
}

impl Value {
    /// Short name of the value kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Binary(_) => "binary",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::StringSet(_) => "string set",
            Self::NumberSet(_) => "number set",
            Self::BinarySet(_) => "binary set",
            Self::DateTime(_) => "datetime",
            Self::Raw(_) => "raw document value",
        }
    }

    /// Whether the value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(string) => Some(string),
            _ => None,
        }
    }

    /// Number view.
    pub fn as_number(&self) -> Option<&Number> {
        match self {
            Self::Number(number) => Some(number),
            _ => None,
        }
    }

    /// Boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(boolean) => Some(*boolean),
            _ => None,
        }
    }

    /// List view.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(list) => Some(list),
            _ => None,
        }
    }

    /// Map view.
    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Converts the value to its document store representation.
    ///
    /// Decimals become floats, sets become arrays and binary data uses the generic subtype.
    pub fn to_bson(&self) -> Bson {
        match self {
            Self::Null => Bson::Null,
            Self::Bool(boolean) => Bson::Boolean(*boolean),
            Self::Number(number) => number.to_bson(),
            Self::String(string) => Bson::String(string.clone()),
            Self::Binary(bytes) => binary_to_bson(bytes),
            Self::List(list) => Bson::Array(list.iter().map(Self::to_bson).collect()),
            Self::Map(map) => Bson::Document(map_to_document(map)),
            Self::StringSet(set) => Bson::Array(set.iter().cloned().map(Bson::String).collect()),
            Self::NumberSet(set) => Bson::Array(set.iter().map(Number::to_bson).collect()),
            Self::BinarySet(set) => Bson::Array(set.iter().map(|b| binary_to_bson(b)).collect()),
            Self::DateTime(datetime) => {
                Bson::DateTime(bson::DateTime::from_millis(datetime.timestamp_millis()))
            }
            Self::Raw(raw) => raw.clone(),
        }
    }

    /// Builds a value from its document store representation.
    pub fn from_bson(raw: Bson) -> Self {
        match raw {
            Bson::Null | Bson::Undefined => Self::Null,
            Bson::Boolean(boolean) => Self::Bool(boolean),
            Bson::Int32(int) => Self::Number(Number::Int(int.into())),
            Bson::Int64(int) => Self::Number(Number::Int(int)),
            Bson::Double(float) => Self::Number(Number::Float(float)),
            Bson::String(string) => Self::String(string),
            Bson::Binary(binary) => Self::Binary(binary.bytes),
            Bson::Array(array) => Self::List(array.into_iter().map(Self::from_bson).collect()),
            Bson::Document(document) => Self::Map(document_to_map(document)),
            Bson::DateTime(datetime) => match Utc
                .timestamp_millis_opt(datetime.timestamp_millis())
                .single()
            {
                Some(datetime) => Self::DateTime(datetime),
                None => Self::Raw(Bson::DateTime(datetime)),
            },
            other => Self::Raw(other),
        }
    }

    /// Converts the value to its key-value store representation.
    ///
    /// Datetimes are written as ISO strings. Document store values without a wire counterpart
    /// are rejected.
    pub fn to_attribute_value(&self) -> Result<AttributeValue> {
        let attribute_value = match self {
            Self::Null => AttributeValue::Null(true),
            Self::Bool(boolean) => AttributeValue::Bool(*boolean),
            Self::Number(number) => AttributeValue::N(number.to_wire()?),
            Self::String(string) => AttributeValue::S(string.clone()),
            Self::Binary(bytes) => AttributeValue::B(Blob::new(bytes.clone())),
            Self::List(list) => {
                let list = list
                    .iter()
                    .map(Self::to_attribute_value)
                    .collect::<Result<_>>()?;
                AttributeValue::L(list)
            }
            Self::Map(map) => AttributeValue::M(map_to_item(map)?),
            Self::StringSet(set) => AttributeValue::Ss(set.iter().cloned().collect()),
            Self::NumberSet(set) => {
                let set = set.iter().map(Number::to_wire).collect::<Result<_>>()?;
                AttributeValue::Ns(set)
            }
            Self::BinarySet(set) => {
                AttributeValue::Bs(set.iter().cloned().map(Blob::new).collect())
            }
            Self::DateTime(datetime) => AttributeValue::S(datetime.format(ISO_FORMAT).to_string()),
            Self::Raw(raw) => {
                return Err(Error::not_implemented(format!(
                    "{:?} value on the key-value store",
                    raw.element_type()
                )));
            }
        };
        Ok(attribute_value)
    }

    /// Builds a value from its key-value store representation.
    pub fn from_attribute_value(attribute_value: AttributeValue) -> Result<Self> {
        let value = match attribute_value {
            AttributeValue::Null(_) => Self::Null,
            AttributeValue::Bool(boolean) => Self::Bool(boolean),
            AttributeValue::N(number) => Self::Number(Number::parse(&number)?),
            AttributeValue::S(string) => Self::String(string),
            AttributeValue::B(blob) => Self::Binary(blob.into_inner()),
            AttributeValue::L(list) => Self::List(
                list.into_iter()
                    .map(Self::from_attribute_value)
                    .collect::<Result<_>>()?,
            ),
            AttributeValue::M(map) => Self::Map(item_to_map(map)?),
            AttributeValue::Ss(set) => Self::StringSet(set.into_iter().collect()),
            AttributeValue::Ns(set) => Self::NumberSet(
                set.iter()
                    .map(|number| Number::parse(number))
                    .collect::<Result<_>>()?,
            ),
            AttributeValue::Bs(set) => {
                Self::BinarySet(set.into_iter().map(Blob::into_inner).collect())
            }
            other => {
                return Err(Error::Deserialization {
                    attribute: String::new(),
                    expected: "attribute value".to_string(),
                    found: format!("{other:?}"),
                });
            }
        };
        Ok(value)
    }

    /// JSON view of the value.
    ///
    /// Binary data is decoded as lossy UTF-8, datetimes are rendered as ISO strings and sets as
    /// arrays. Nulls inside maps are dropped when `exclude_none` is set.
    pub fn to_json(&self, exclude_none: bool) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Null => Json::Null,
            Self::Bool(boolean) => Json::Bool(*boolean),
            Self::Number(number) => number_to_json(number),
            Self::String(string) => Json::String(string.clone()),
            Self::Binary(bytes) => Json::String(String::from_utf8_lossy(bytes).into_owned()),
            Self::List(list) => Json::Array(
                list.iter()
                    .map(|value| value.to_json(exclude_none))
                    .collect(),
            ),
            Self::Map(map) => Json::Object(
                map.iter()
                    .filter(|(_, value)| !(exclude_none && value.is_null()))
                    .map(|(key, value)| (key.clone(), value.to_json(exclude_none)))
                    .collect(),
            ),
            Self::StringSet(set) => Json::Array(set.iter().cloned().map(Json::String).collect()),
            Self::NumberSet(set) => Json::Array(set.iter().map(number_to_json).collect()),
            Self::BinarySet(set) => Json::Array(
                set.iter()
                    .map(|bytes| Json::String(String::from_utf8_lossy(bytes).into_owned()))
                    .collect(),
            ),
            Self::DateTime(datetime) => {
                Json::String(datetime.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            Self::Raw(raw) => raw.clone().into_relaxed_extjson(),
        }
    }
}

fn number_to_json(number: &Number) -> serde_json::Value {
    match number {
        Number::Int(int) => serde_json::Value::from(*int),
        number => serde_json::Number::from_f64(number.as_f64())
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
    }
}

fn binary_to_bson(bytes: &[u8]) -> Bson {
    Bson::Binary(bson::Binary {
        subtype: BinarySubtype::Generic,
        bytes: bytes.to_vec(),
    })
}

pub(crate) fn map_to_document(map: &Map) -> bson::Document {
    map.iter()
        .map(|(key, value)| (key.clone(), value.to_bson()))
        .collect()
}

pub(crate) fn document_to_map(document: bson::Document) -> Map {
    document
        .into_iter()
        .map(|(key, value)| (key, Value::from_bson(value)))
        .collect()
}

pub(crate) fn map_to_item(map: &Map) -> Result<collections::HashMap<String, AttributeValue>> {
    map.iter()
        .map(|(key, value)| Ok((key.clone(), value.to_attribute_value()?)))
        .collect()
}

pub(crate) fn item_to_map(item: collections::HashMap<String, AttributeValue>) -> Result<Map> {
    let mut map = item
        .into_iter()
        .map(|(key, value)| Ok((key, Value::from_attribute_value(value)?)))
        .collect::<Result<Map>>()?;
    // the wire map is unordered
    map.sort_keys();
    Ok(map)
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value.into())
    }
}

impl From<Number> for Value {
    fn from(value: Number) -> Self {
        Self::Number(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::List(value)
    }
}

impl From<Map> for Value {
    fn from(value: Map) -> Self {
        Self::Map(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::DateTime(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(boolean) => Self::Bool(boolean),
            serde_json::Value::Number(number) => match number.as_i64() {
                Some(int) => Self::Number(Number::Int(int)),
                None => Self::Number(Number::Float(number.as_f64().unwrap_or(f64::NAN))),
            },
            serde_json::Value::String(string) => Self::String(string),
            serde_json::Value::Array(array) => {
                Self::List(array.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(object) => Self::Map(
                object
                    .into_iter()
                    .map(|(key, value)| (key, Self::from(value)))
                    .collect(),
            ),
        }
    }
}
