use crate::{
    common::{condition::Operand, path::Path},
    error::{Error, Result},
    schema::{Number, Value},
};

/// Operator of a cross-attribute arithmetic assignment.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ArithmeticOperator {
    /// `left + right`
    Add,
    /// `left - right`
    Subtract,
}

/// Single attribute mutation applied server-side.
///
/// ```rust
/// use modular_sdk::common::path::Path;
///
/// let actions = vec![
///     Path::new("c").increment(5),
///     Path::new("t").append(["b"]),
/// ];
/// ```
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Assigns a literal.
    Set {
        /// Target attribute.
        path: Path,
        /// New value.
        value: Value,
    },
    /// Assigns a literal only when the attribute is absent.
    SetIfNotExists {
        /// Target attribute.
        path: Path,
        /// Value used when absent.
        value: Value,
    },
    /// Appends to the end of a list.
    ListAppend {
        /// Target list.
        path: Path,
        /// Appended elements.
        values: Vec<Value>,
    },
    /// Inserts at the beginning of a list.
    ListPrepend {
        /// Target list.
        path: Path,
        /// Inserted elements.
        values: Vec<Value>,
    },
    /// Adds a delta to a number.
    Increment {
        /// Target attribute.
        path: Path,
        /// Delta.
        by: Number,
    },
    /// Subtracts a delta from a number.
    Decrement {
        /// Target attribute.
        path: Path,
        /// Delta.
        by: Number,
    },
    /// Assigns `left <operator> right` where either side may reference another attribute.
    Arithmetic {
        /// Target attribute.
        path: Path,
        /// Left operand.
        left: Operand,
        /// Operator.
        operator: ArithmeticOperator,
        /// Right operand.
        right: Operand,
    },
    /// Removes the attribute, or removes the list element and shifts the rest.
    Remove(Path),
    /// Adds a number to a numeric attribute, or elements to a set.
    Add {
        /// Target attribute.
        path: Path,
        /// Number or set.
        value: Value,
    },
    /// Deletes elements from a set.
    Delete {
        /// Target set.
        path: Path,
        /// Elements to delete.
        value: Value,
    },
}

impl Action {
    /// Assigns `left <operator> right`.
    pub fn arithmetic(
        path: Path,
        left: impl Into<Operand>,
        operator: ArithmeticOperator,
        right: impl Into<Operand>,
    ) -> Self {
        Self::Arithmetic {
            path,
            left: left.into(),
            operator,
            right: right.into(),
        }
    }

    /// Attribute targeted by the action.
    pub fn path(&self) -> &Path {
        match self {
            Self::Set { path, .. }
            | Self::SetIfNotExists { path, .. }
            | Self::ListAppend { path, .. }
            | Self::ListPrepend { path, .. }
            | Self::Increment { path, .. }
            | Self::Decrement { path, .. }
            | Self::Arithmetic { path, .. }
            | Self::Remove(path)
            | Self::Add { path, .. }
            | Self::Delete { path, .. } => path,
        }
    }

    /// Mutable access to the literal carried by a plain or conditional assignment.
    pub(crate) fn assigned_value_mut(&mut self) -> Option<&mut Value> {
        match self {
            Self::Set { value, .. } | Self::SetIfNotExists { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Rejects action lists where one path equals or contains another.
pub(crate) fn ensure_disjoint(actions: &[Action]) -> Result<()> {
    for (position, action) in actions.iter().enumerate() {
        let path = action.path();
        if actions[..position]
            .iter()
            .any(|earlier| earlier.path().overlaps(path))
        {
            return Err(Error::ConflictingActions {
                path: path.to_string(),
            });
        }
    }
    Ok(())
}

impl From<Path> for Operand {
    fn from(path: Path) -> Self {
        Self::Path(path)
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Self::Value(value.into())
    }
}

impl From<i32> for Operand {
    fn from(value: i32) -> Self {
        Self::Value(value.into())
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Self::Value(value.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    #[rstest]
    #[case::set(Path::new("a").set("x"), "a")]
    #[case::remove(Path::new("l").index(2).remove(), "l[2]")]
    #[case::arithmetic(
        Action::arithmetic(Path::new("total"), Path::new("a"), ArithmeticOperator::Add, Path::new("b")),
        "total"
    )]
    fn test_path(#[case] action: Action, #[case] expected: &str) {
        assert_eq!(action.path().to_string(), expected);
    }

    #[rstest]
    #[case::distinct(vec![Path::new("a").set(1), Path::new("b").remove()], None)]
    #[case::same(vec![Path::new("a").set(1), Path::new("a").increment(1)], Some("a"))]
    #[case::nested(vec![Path::new("a").set(1), Path::new("a").field("b").remove()], Some("a.b"))]
    #[case::list_positions(
        vec![Path::new("l").index(1).remove(), Path::new("l").index(3).remove()],
        None
    )]
    fn test_ensure_disjoint(#[case] actions: Vec<Action>, #[case] conflict: Option<&str>) {
        match ensure_disjoint(&actions) {
            Ok(()) => assert_eq!(conflict, None),
            Err(Error::ConflictingActions { path }) => assert_eq!(Some(path.as_str()), conflict),
            Err(error) => panic!("unexpected error: {error}"),
        }
    }

    #[test]
    fn test_assigned_value_mut() {
        let mut action = Path::new("a").set("x");
        if let Some(value) = action.assigned_value_mut() {
            *value = Value::from("y");
        }
        assert_eq!(action, Path::new("a").set("y"));
        assert!(Path::new("a").remove().assigned_value_mut().is_none());
    }
}
