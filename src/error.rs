use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the data layer.
///
/// Every variant names the table, attribute, index or construct involved so a failure can be
/// diagnosed from the message alone.
#[derive(Debug, Error)]
pub enum Error {
    /// A strict lookup found no item for the given key.
    #[error("item does not exist in table '{table}' (hash key: {hash_key}, range key: {range_key:?})")]
    DoesNotExist {
        /// Table or collection name.
        table: String,
        /// Rendered hash key value.
        hash_key: String,
        /// Rendered range key value, when the table has one.
        range_key: Option<String>,
    },

    /// A stored value does not match the declared attribute type.
    #[error("cannot deserialize attribute '{attribute}' as {expected}: found {found}")]
    Deserialization {
        /// Storage name of the attribute.
        attribute: String,
        /// Declared type.
        expected: String,
        /// Kind of the stored value.
        found: String,
    },

    /// A native value cannot be written as the declared attribute type.
    #[error("cannot serialize attribute '{attribute}': {reason}")]
    Serialization {
        /// Storage name of the attribute.
        attribute: String,
        /// What went wrong.
        reason: String,
    },

    /// The translator met a condition operator, update action or operand it cannot render.
    #[error("not implemented for this backend: {construct}")]
    NotImplemented {
        /// Name of the unsupported construct.
        construct: String,
    },

    /// An attribute path has a shape the target backend cannot address.
    #[error("unsupported attribute path '{path}': {reason}")]
    UnsupportedPath {
        /// Rendered path.
        path: String,
        /// Why it is rejected.
        reason: String,
    },

    /// Two update actions address the same attribute path.
    #[error("conflicting update actions for path '{path}'")]
    ConflictingActions {
        /// Rendered path.
        path: String,
    },

    /// A schema declaration violates a structural invariant.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// An attribute name is not declared by the schema.
    #[error("attribute '{attribute}' is not declared by table '{table}'")]
    UnknownAttribute {
        /// Table name.
        table: String,
        /// Logical attribute name.
        attribute: String,
    },

    /// An index name is not declared by the schema.
    #[error("index '{index}' is not declared by table '{table}'")]
    UnknownIndex {
        /// Table name.
        table: String,
        /// Index name.
        index: String,
    },

    /// A non-nullable attribute has no value at write time.
    #[error("attribute '{attribute}' cannot be null")]
    MissingAttribute {
        /// Logical attribute name.
        attribute: String,
    },

    /// A number literal could not be parsed.
    #[error("invalid number: '{0}'")]
    InvalidNumber(String),

    /// A configuration value is missing or malformed.
    #[error("invalid configuration value for '{key}': {reason}")]
    Config {
        /// Environment key.
        key: String,
        /// What went wrong.
        reason: String,
    },

    /// The key-value store rejected or failed a request.
    #[error("key-value store request failed: {0}")]
    KeyValue(String),

    /// The document store rejected or failed a request.
    #[error("document store request failed: {0}")]
    Document(#[from] mongodb::error::Error),

    /// The blocking runtime backing the key-value client could not be built.
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    /// A continuation key could not be converted between its JSON and wire forms.
    #[error("continuation key conversion failed: {0}")]
    TokenCodec(#[from] serde_dynamo::Error),

    /// The condition attached to a write did not hold.
    #[error("conditional write on table '{table}' was rejected")]
    ConditionalCheckFailed {
        /// Table or collection name.
        table: String,
    },

    /// A parameter store request failed.
    #[error("parameter '{name}' is unavailable: {reason}")]
    Parameter {
        /// Parameter name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// A batch write finished with failed requests.
    #[error("{failed} batch write request(s) failed")]
    BatchWrite {
        /// Number of failed requests.
        failed: usize,
    },
}

impl Error {
    /// Returns a stable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DoesNotExist { .. } => "DOES_NOT_EXIST",
            Self::Deserialization { .. } => "DESERIALIZATION",
            Self::Serialization { .. } => "SERIALIZATION",
            Self::NotImplemented { .. } => "NOT_IMPLEMENTED",
            Self::UnsupportedPath { .. } => "UNSUPPORTED_PATH",
            Self::ConflictingActions { .. } => "CONFLICTING_ACTIONS",
            Self::InvalidSchema(_) => "INVALID_SCHEMA",
            Self::UnknownAttribute { .. } => "UNKNOWN_ATTRIBUTE",
            Self::UnknownIndex { .. } => "UNKNOWN_INDEX",
            Self::MissingAttribute { .. } => "MISSING_ATTRIBUTE",
            Self::InvalidNumber(_) => "INVALID_NUMBER",
            Self::Config { .. } => "CONFIG",
            Self::KeyValue(_) => "KEY_VALUE",
            Self::Document(_) => "DOCUMENT",
            Self::Runtime(_) => "RUNTIME",
            Self::TokenCodec(_) => "TOKEN_CODEC",
            Self::ConditionalCheckFailed { .. } => "CONDITIONAL_CHECK_FAILED",
            Self::Parameter { .. } => "PARAMETER",
            Self::BatchWrite { .. } => "BATCH_WRITE",
        }
    }

    /// Whether the error is the not-found outcome of a strict lookup.
    pub fn is_does_not_exist(&self) -> bool {
        matches!(self, Self::DoesNotExist { .. })
    }

    pub(crate) fn not_implemented(construct: impl Into<String>) -> Self {
        Self::NotImplemented {
            construct: construct.into(),
        }
    }

    pub(crate) fn key_value(error: impl std::fmt::Display) -> Self {
        Self::KeyValue(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    #[rstest]
    #[case::does_not_exist(
        Error::DoesNotExist {
            table: "Customers".to_string(),
            hash_key: "\"x\"".to_string(),
            range_key: None,
        },
        "DOES_NOT_EXIST"
    )]
    #[case::not_implemented(Error::not_implemented("size"), "NOT_IMPLEMENTED")]
    #[case::batch_write(Error::BatchWrite { failed: 2 }, "BATCH_WRITE")]
    fn test_code(#[case] error: Error, #[case] expected: &str) {
        assert_eq!(error.code(), expected);
    }

    #[test]
    fn test_messages_carry_context() {
        let error = Error::Deserialization {
            attribute: "c".to_string(),
            expected: "number".to_string(),
            found: "string".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "cannot deserialize attribute 'c' as number: found string"
        );
        let error = Error::not_implemented("comparison between two attributes");
        assert!(error.to_string().contains("comparison between two attributes"));
    }
}
