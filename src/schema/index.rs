/// Secondary index declared by a schema.
///
/// Indexes are metadata only. Key fields are referenced by logical name and resolved when the
/// schema is built.
///
/// ```rust
/// use modular_sdk::schema::SecondaryIndex;
///
/// let index = SecondaryIndex::new("customer-type-index", "customer").range_key("type");
/// assert_eq!(index.range_key_field(), Some("type"));
/// ```
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SecondaryIndex {
    name: String,
    hash_key: String,
    range_key: Option<String>,
}

impl SecondaryIndex {
    /// Index hashed on the given field.
    pub fn new(name: impl Into<String>, hash_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash_key: hash_key.into(),
            range_key: None,
        }
    }

    /// Adds a range key.
    pub fn range_key(mut self, range_key: impl Into<String>) -> Self {
        self.range_key = Some(range_key.into());
        self
    }

    /// Index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical name of the hash key field.
    pub fn hash_key_field(&self) -> &str {
        &self.hash_key
    }

    /// Logical name of the range key field.
    pub fn range_key_field(&self) -> Option<&str> {
        self.range_key.as_deref()
    }
}
