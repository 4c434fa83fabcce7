use crate::{
    error::{Error, Result},
    schema::{
        attribute::{AttributeType, Flavor},
        value::{Map, Value},
    },
};

/// Default assigned to a field of a freshly constructed item.
#[derive(Clone, Debug)]
pub enum DefaultValue {
    /// Constant value.
    Value(Value),
    /// Factory called for every new item.
    Factory(fn() -> Value),
}

impl DefaultValue {
    /// Produces the default value.
    pub fn get(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Factory(factory) => factory(),
        }
    }
}

/// Attribute descriptor: logical name, storage name, type, key role, nullability and default.
///
/// ```rust
/// use modular_sdk::schema::{AttributeType, Field};
///
/// let field = Field::new("name", AttributeType::Unicode).alias("n").hash_key();
/// assert_eq!(field.attr_name(), "n");
/// assert!(!field.is_nullable());
/// ```
#[derive(Clone, Debug)]
pub struct Field {
    name: String,
    attr_name: String,
    attribute_type: AttributeType,
    hash_key: bool,
    range_key: bool,
    nullable: bool,
    default: Option<DefaultValue>,
}

impl Field {
    /// Nullable field stored under its logical name.
    pub fn new(name: impl Into<String>, attribute_type: AttributeType) -> Self {
        let name = name.into();
        Self {
            attr_name: name.clone(),
            name,
            attribute_type,
            hash_key: false,
            range_key: false,
            nullable: true,
            default: None,
        }
    }

    /// Stores the field under a short name.
    pub fn alias(mut self, attr_name: impl Into<String>) -> Self {
        self.attr_name = attr_name.into();
        self
    }

    /// Marks the field as the hash key. Key fields are never nullable.
    pub fn hash_key(mut self) -> Self {
        self.hash_key = true;
        self.nullable = false;
        self
    }

    /// Marks the field as the range key. Key fields are never nullable.
    pub fn range_key(mut self) -> Self {
        self.range_key = true;
        self.nullable = false;
        self
    }

    /// Rejects items that have no value for this field.
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Constant default.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Value(value.into()));
        self
    }

    /// Default computed for every new item.
    pub fn with_default_factory(mut self, factory: fn() -> Value) -> Self {
        self.default = Some(DefaultValue::Factory(factory));
        self
    }

    /// Logical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage name.
    pub fn attr_name(&self) -> &str {
        &self.attr_name
    }

    /// Declared type.
    pub fn attribute_type(&self) -> &AttributeType {
        &self.attribute_type
    }

    /// Whether the field is the hash key.
    pub fn is_hash_key(&self) -> bool {
        self.hash_key
    }

    /// Whether the field is the range key.
    pub fn is_range_key(&self) -> bool {
        self.range_key
    }

    /// Whether the field may be absent.
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Default for new items, if any.
    pub fn default_value(&self) -> Option<Value> {
        self.default.as_ref().map(DefaultValue::get)
    }

    /// Serializes a single value of this field.
    pub fn serialize(&self, value: &Value, flavor: Flavor) -> Result<Option<Value>> {
        self.attribute_type.serialize(&self.attr_name, value, flavor)
    }

    /// Deserializes a single raw value of this field.
    pub fn deserialize(&self, raw: Value, flavor: Flavor) -> Result<Value> {
        self.attribute_type.deserialize(&self.attr_name, raw, flavor)
    }
}

/// Serializes logical values into a map keyed by storage names.
pub(crate) fn serialize_fields(
    scope: &str,
    fields: &[Field],
    values: &Map,
    flavor: Flavor,
) -> Result<Map> {
    if let Some(unknown) = values
        .keys()
        .find(|key| !fields.iter().any(|field| field.name == **key))
    {
        return Err(Error::UnknownAttribute {
            table: scope.to_string(),
            attribute: unknown.clone(),
        });
    }
    let mut raw = Map::with_capacity(fields.len());
    for field in fields {
        let value = values.get(&field.name).unwrap_or(&Value::Null);
        match field.serialize(value, flavor)? {
            Some(serialized) => {
                raw.insert(field.attr_name.clone(), serialized);
            }
            None if !field.nullable => {
                return Err(Error::MissingAttribute {
                    attribute: field.name.clone(),
                });
            }
            None => {}
        }
    }
    Ok(raw)
}

/// Deserializes declared storage keys into a map keyed by logical names.
///
/// Undeclared keys are ignored here; the safe update engine keeps them.
pub(crate) fn deserialize_fields(fields: &[Field], raw: &Map, flavor: Flavor) -> Result<Map> {
    let mut values = Map::with_capacity(fields.len());
    for field in fields {
        if let Some(stored) = raw.get(&field.attr_name) {
            let value = field.deserialize(stored.clone(), flavor)?;
            if !value.is_null() {
                values.insert(field.name.clone(), value);
            }
        }
    }
    Ok(values)
}
