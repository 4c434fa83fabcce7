use crate::{
    common::{condition, update},
    error::{Error, Result},
    schema::{Number, Value},
};

use std::fmt;

/// Single step of an attribute path.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum PathElement {
    /// Map key.
    Name(String),
    /// List position.
    Index(usize),
}

/// Attribute path made of map keys and list positions.
///
/// Paths address storage names. Use [`Schema::path`](crate::schema::Schema::path) to resolve a
/// logical path against a schema.
///
/// ```rust
/// use modular_sdk::common::path::Path;
///
/// let path = Path::parse("two.three[12]").unwrap();
/// assert_eq!(path.to_string(), "two.three[12]");
/// ```
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Path {
    elements: Vec<PathElement>,
}

impl Path {
    /// Path of a single top-level attribute. The name is taken verbatim.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            elements: vec![PathElement::Name(name.into())],
        }
    }

    /// Parses a dotted path with optional `[n]` list positions.
    pub fn parse(path: &str) -> Result<Self> {
        let unsupported = |reason: &str| Error::UnsupportedPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        let mut elements = Vec::new();
        for part in path.split('.') {
            let (name, mut rest) = match part.find('[') {
                Some(position) => part.split_at(position),
                None => (part, ""),
            };
            if name.is_empty() {
                return Err(unsupported("empty attribute name"));
            }
            elements.push(PathElement::Name(name.to_string()));
            while !rest.is_empty() {
                let end = rest
                    .find(']')
                    .ok_or_else(|| unsupported("unclosed list index"))?;
                let index = rest[1..end]
                    .parse()
                    .map_err(|_| unsupported("list index is not a non-negative integer"))?;
                elements.push(PathElement::Index(index));
                rest = &rest[end + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(unsupported("unexpected characters after list index"));
                }
            }
        }
        Ok(Self { elements })
    }

    /// Appends a map key.
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.elements.push(PathElement::Name(name.into()));
        self
    }

    /// Appends a list position.
    pub fn index(mut self, index: usize) -> Self {
        self.elements.push(PathElement::Index(index));
        self
    }

    /// Path steps.
    pub fn elements(&self) -> &[PathElement] {
        &self.elements
    }

    /// Top-level attribute name.
    pub fn root(&self) -> &str {
        match self.elements.first() {
            Some(PathElement::Name(name)) => name,
            _ => "",
        }
    }

    /// Whether one path is a prefix of the other. Equal paths overlap.
    pub fn overlaps(&self, other: &Path) -> bool {
        let shared = self.elements.len().min(other.elements.len());
        self.elements[..shared] == other.elements[..shared]
    }

    pub(crate) fn from_elements(elements: Vec<PathElement>) -> Self {
        Self { elements }
    }

    /// `path = value`
    pub fn eq(&self, value: impl Into<Value>) -> condition::Condition {
        self.compare(condition::ComparisonOperator::Eq, value)
    }

    /// `path <> value`
    pub fn ne(&self, value: impl Into<Value>) -> condition::Condition {
        self.compare(condition::ComparisonOperator::Ne, value)
    }

    /// `path > value`
    pub fn gt(&self, value: impl Into<Value>) -> condition::Condition {
        self.compare(condition::ComparisonOperator::Gt, value)
    }

    /// `path >= value`
    pub fn ge(&self, value: impl Into<Value>) -> condition::Condition {
        self.compare(condition::ComparisonOperator::Ge, value)
    }

    /// `path < value`
    pub fn lt(&self, value: impl Into<Value>) -> condition::Condition {
        self.compare(condition::ComparisonOperator::Lt, value)
    }

    /// `path <= value`
    pub fn le(&self, value: impl Into<Value>) -> condition::Condition {
        self.compare(condition::ComparisonOperator::Le, value)
    }

    fn compare(
        &self,
        operator: condition::ComparisonOperator,
        value: impl Into<Value>,
    ) -> condition::Condition {
        condition::Condition::Comparison {
            path: self.clone(),
            operator,
            operand: condition::Operand::Value(value.into()),
        }
    }

    /// Compares the attribute with another attribute of the same item.
    pub fn compare_path(
        &self,
        operator: condition::ComparisonOperator,
        other: &Path,
    ) -> condition::Condition {
        condition::Condition::Comparison {
            path: self.clone(),
            operator,
            operand: condition::Operand::Path(other.clone()),
        }
    }

    /// Inclusive range check.
    pub fn between(&self, low: impl Into<Value>, high: impl Into<Value>) -> condition::Condition {
        condition::Condition::Between {
            path: self.clone(),
            low: low.into(),
            high: high.into(),
        }
    }

    /// String prefix check.
    pub fn begins_with(&self, prefix: impl Into<String>) -> condition::Condition {
        condition::Condition::BeginsWith {
            path: self.clone(),
            prefix: prefix.into(),
        }
    }

    /// Substring or element membership check.
    pub fn contains(&self, value: impl Into<Value>) -> condition::Condition {
        condition::Condition::Contains {
            path: self.clone(),
            value: value.into(),
        }
    }

    /// Membership of the attribute value in a literal list.
    pub fn is_in<I, V>(&self, values: I) -> condition::Condition
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        condition::Condition::In {
            path: self.clone(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// The attribute is present.
    pub fn exists(&self) -> condition::Condition {
        condition::Condition::Exists(self.clone())
    }

    /// The attribute is absent.
    pub fn does_not_exist(&self) -> condition::Condition {
        condition::Condition::NotExists(self.clone())
    }

    /// Assigns a literal.
    pub fn set(&self, value: impl Into<Value>) -> update::Action {
        update::Action::Set {
            path: self.clone(),
            value: value.into(),
        }
    }

    /// Assigns a literal unless the attribute already exists.
    pub fn set_if_not_exists(&self, value: impl Into<Value>) -> update::Action {
        update::Action::SetIfNotExists {
            path: self.clone(),
            value: value.into(),
        }
    }

    /// Appends values to the end of a list.
    pub fn append<I, V>(&self, values: I) -> update::Action
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        update::Action::ListAppend {
            path: self.clone(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Inserts values at the beginning of a list.
    pub fn prepend<I, V>(&self, values: I) -> update::Action
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        update::Action::ListPrepend {
            path: self.clone(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Adds a delta to a numeric attribute.
    pub fn increment(&self, by: impl Into<Number>) -> update::Action {
        update::Action::Increment {
            path: self.clone(),
            by: by.into(),
        }
    }

    /// Subtracts a delta from a numeric attribute.
    pub fn decrement(&self, by: impl Into<Number>) -> update::Action {
        update::Action::Decrement {
            path: self.clone(),
            by: by.into(),
        }
    }

    /// Removes the attribute, or the list element when the path ends with a position.
    pub fn remove(&self) -> update::Action {
        update::Action::Remove(self.clone())
    }

    /// Adds a number, or adds elements to a set.
    pub fn add(&self, value: impl Into<Value>) -> update::Action {
        update::Action::Add {
            path: self.clone(),
            value: value.into(),
        }
    }

    /// Deletes elements from a set.
    pub fn delete(&self, value: impl Into<Value>) -> update::Action {
        update::Action::Delete {
            path: self.clone(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, element) in self.elements.iter().enumerate() {
            match element {
                PathElement::Name(name) if position == 0 => f.write_str(name)?,
                PathElement::Name(name) => write!(f, ".{name}")?,
                PathElement::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

impl From<&str> for Path {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
