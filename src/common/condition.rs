use crate::{common::path::Path, schema::Value};

use std::ops;

/// Comparison operator of a leaf condition.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ComparisonOperator {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
}

/// Right-hand side of a comparison.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// Literal value.
    Value(Value),
    /// Another attribute of the same item.
    Path(Path),
}

/// Condition tree used to filter reads and to gate conditional writes.
///
/// Leaves address storage paths. Conditions combine with `&`, `|` and `!`:
///
/// ```rust
/// use modular_sdk::common::path::Path;
///
/// let condition = Path::new("num").between(10, 20) & !Path::new("s").begins_with("test");
/// ```
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// Binary comparison.
    Comparison {
        /// Left-hand attribute.
        path: Path,
        /// Operator.
        operator: ComparisonOperator,
        /// Right-hand literal or attribute.
        operand: Operand,
    },
    /// Inclusive range.
    Between {
        /// Attribute.
        path: Path,
        /// Lower bound.
        low: Value,
        /// Upper bound.
        high: Value,
    },
    /// String prefix.
    BeginsWith {
        /// Attribute.
        path: Path,
        /// Prefix.
        prefix: String,
    },
    /// Substring of a string, or element of a list or set.
    Contains {
        /// Attribute.
        path: Path,
        /// Searched value.
        value: Value,
    },
    /// Membership in a literal list.
    In {
        /// Attribute.
        path: Path,
        /// Accepted values.
        values: Vec<Value>,
    },
    /// Attribute is present.
    Exists(Path),
    /// Attribute is absent.
    NotExists(Path),
    /// All children hold.
    And(Vec<Condition>),
    /// At least one child holds.
    Or(Vec<Condition>),
    /// The child does not hold.
    Not(Box<Condition>),
}

impl Condition {
    /// Conjunction, flattening nested conjunctions.
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), right) => {
                left.push(right);
                Self::And(left)
            }
            (left, Self::And(mut right)) => {
                right.insert(0, left);
                Self::And(right)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }

    /// Disjunction, flattening nested disjunctions.
    pub fn or(self, other: Self) -> Self {
        match (self, other) {
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), right) => {
                left.push(right);
                Self::Or(left)
            }
            (left, Self::Or(mut right)) => {
                right.insert(0, left);
                Self::Or(right)
            }
            (left, right) => Self::Or(vec![left, right]),
        }
    }

    /// Whether the condition holds for an item that is not stored yet.
    ///
    /// Every attribute is missing, so only absence checks and inequalities against literals
    /// hold, the way a key-value store evaluates a conditional put of a new item.
    pub fn holds_for_missing_item(&self) -> bool {
        match self {
            Self::Comparison {
                operator: ComparisonOperator::Ne,
                operand: Operand::Value(_),
                ..
            } => true,
            Self::Comparison { .. }
            | Self::Between { .. }
            | Self::BeginsWith { .. }
            | Self::Contains { .. }
            | Self::In { .. }
            | Self::Exists(_) => false,
            Self::NotExists(_) => true,
            Self::And(conditions) => conditions.iter().all(Self::holds_for_missing_item),
            Self::Or(conditions) => conditions.iter().any(Self::holds_for_missing_item),
            Self::Not(condition) => !condition.holds_for_missing_item(),
        }
    }

    /// Combines optional conditions with `AND`.
    pub fn all(conditions: impl IntoIterator<Item = Option<Self>>) -> Option<Self> {
        conditions
            .into_iter()
            .flatten()
            .reduce(|left, right| left.and(right))
    }
}

impl ops::BitAnd for Condition {
    type Output = Self;

    fn bitand(self, other: Self) -> Self {
        self.and(other)
    }
}

impl ops::BitOr for Condition {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        self.or(other)
    }
}

impl ops::Not for Condition {
    type Output = Self;

    fn not(self) -> Self {
        Self::Not(Box::new(self))
    }
}
