//! Condition, update and projection expressions with name and value placeholders.

use crate::{
    common::{
        condition::{ComparisonOperator, Condition, Operand},
        path::{Path, PathElement},
        update::{Action, ArithmeticOperator, ensure_disjoint},
    },
    error::{Error, Result},
    schema::Value,
};

use aws_sdk_dynamodb::types;
use std::collections;

const AND: &str = " AND ";
const OR: &str = " OR ";

fn get_expression(left: String, operator: &str, right: String) -> String {
    if left.is_empty() {
        right
    } else if right.is_empty() {
        left
    } else {
        format!("{left}{operator}{right}")
    }
}

/// expression operation
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ExpressionInput {
    pub(crate) expression: String,
    pub(crate) expression_attribute_names: collections::HashMap<String, String>,
    pub(crate) expression_attribute_values: collections::HashMap<String, types::AttributeValue>,
}

impl ExpressionInput {
    pub(crate) fn merge(operator: &str, items: Vec<Self>) -> Self {
        let mut operation = Self::default();
        for item in items {
            operation
                .expression_attribute_names
                .extend(item.expression_attribute_names);
            operation
                .expression_attribute_values
                .extend(item.expression_attribute_values);
            operation.expression = get_expression(operation.expression, operator, item.expression);
        }
        operation
    }

    pub(crate) fn merge_into(
        self,
        names: &mut Option<collections::HashMap<String, String>>,
        values: &mut Option<collections::HashMap<String, types::AttributeValue>>,
    ) -> String {
        if !self.expression_attribute_names.is_empty() {
            names
                .get_or_insert_with(collections::HashMap::new)
                .extend(self.expression_attribute_names);
        }
        if !self.expression_attribute_values.is_empty() {
            values
                .get_or_insert_with(collections::HashMap::new)
                .extend(self.expression_attribute_values);
        }
        self.expression
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Renders expressions of one request, numbering value placeholders across all of them.
#[derive(Debug, Default)]
pub(crate) struct ExpressionBuilder {
    index: usize,
    placeholders: collections::HashMap<String, String>,
    taken: collections::HashSet<String>,
}

impl ExpressionBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Placeholder for an attribute name. Characters outside `[A-Za-z0-9_]` become `_`, and a
    /// numeric suffix keeps names that sanitize alike apart.
    fn name_placeholder(&mut self, name: &str) -> String {
        if let Some(placeholder) = self.placeholders.get(name) {
            return placeholder.clone();
        }
        let base = format!("#{}", sanitize(name));
        let mut placeholder = base.clone();
        let mut suffix = 0;
        while self.taken.contains(&placeholder) {
            suffix += 1;
            placeholder = format!("{base}_{suffix}");
        }
        self.taken.insert(placeholder.clone());
        self.placeholders
            .insert(name.to_string(), placeholder.clone());
        placeholder
    }

    fn path(&mut self, path: &Path, names: &mut collections::HashMap<String, String>) -> String {
        let mut rendered = String::new();
        for element in path.elements() {
            match element {
                PathElement::Name(name) => {
                    let placeholder = self.name_placeholder(name);
                    if !rendered.is_empty() {
                        rendered.push('.');
                    }
                    rendered.push_str(&placeholder);
                    names.insert(placeholder, name.clone());
                }
                PathElement::Index(index) => rendered.push_str(&format!("[{index}]")),
            }
        }
        rendered
    }

    fn value(
        &mut self,
        prefix: &str,
        value: &Value,
        values: &mut collections::HashMap<String, types::AttributeValue>,
    ) -> Result<String> {
        let placeholder = format!(":{prefix}{}", self.index);
        self.index += 1;
        values.insert(placeholder.clone(), value.to_attribute_value()?);
        Ok(placeholder)
    }

    /// Condition or filter expression.
    pub(crate) fn condition(&mut self, condition: &Condition) -> Result<ExpressionInput> {
        self.condition_recursive(condition, false)
    }

    fn condition_recursive(
        &mut self,
        condition: &Condition,
        is_nested: bool,
    ) -> Result<ExpressionInput> {
        let mut names = collections::HashMap::new();
        let mut values = collections::HashMap::new();
        let expression = match condition {
            Condition::Comparison {
                path,
                operator,
                operand,
            } => {
                let (symbol, suffix) = match operator {
                    ComparisonOperator::Eq => ("=", "eq"),
                    ComparisonOperator::Ne => ("<>", "ne"),
                    ComparisonOperator::Gt => (">", "gt"),
                    ComparisonOperator::Ge => (">=", "gte"),
                    ComparisonOperator::Lt => ("<", "lt"),
                    ComparisonOperator::Le => ("<=", "lte"),
                };
                let left = self.path(path, &mut names);
                let right = match operand {
                    Operand::Value(value) => {
                        let prefix = format!("{}_{suffix}", value_prefix(path));
                        self.value(&prefix, value, &mut values)?
                    }
                    Operand::Path(other) => self.path(other, &mut names),
                };
                format!("{left} {symbol} {right}")
            }
            Condition::Between { path, low, high } => {
                let left = self.path(path, &mut names);
                let prefix = format!("{}_between", value_prefix(path));
                let low = self.value(&prefix, low, &mut values)?;
                let high = self.value(&prefix, high, &mut values)?;
                format!("{left} BETWEEN {low} AND {high}")
            }
            Condition::BeginsWith { path, prefix } => {
                let left = self.path(path, &mut names);
                let placeholder = format!(":{}_begins_with{}", value_prefix(path), self.index);
                self.index += 1;
                values.insert(
                    placeholder.clone(),
                    types::AttributeValue::S(prefix.clone()),
                );
                format!("begins_with({left}, {placeholder})")
            }
            Condition::Contains { path, value } => {
                let left = self.path(path, &mut names);
                let prefix = format!("{}_contains", value_prefix(path));
                let right = self.value(&prefix, value, &mut values)?;
                format!("contains({left}, {right})")
            }
            Condition::In {
                path,
                values: candidates,
            } => {
                if candidates.is_empty() {
                    return Err(Error::not_implemented(format!(
                        "membership in an empty list on '{path}'"
                    )));
                }
                let left = self.path(path, &mut names);
                let index = self.index;
                let mut placeholders = Vec::with_capacity(candidates.len());
                for (in_index, candidate) in candidates.iter().enumerate() {
                    let placeholder = format!(":{}_in{index}_{in_index}", value_prefix(path));
                    values.insert(placeholder.clone(), candidate.to_attribute_value()?);
                    placeholders.push(placeholder);
                }
                self.index += 1;
                format!("{left} IN ({})", placeholders.join(", "))
            }
            Condition::Exists(path) => {
                format!("attribute_exists({})", self.path(path, &mut names))
            }
            Condition::NotExists(path) => {
                format!("attribute_not_exists({})", self.path(path, &mut names))
            }
            Condition::And(children) | Condition::Or(children) => {
                let operator = match condition {
                    Condition::And(_) => AND,
                    _ => OR,
                };
                let mut operations = Vec::with_capacity(children.len());
                for child in children {
                    operations.push(self.condition_recursive(child, true)?);
                }
                let mut operation = ExpressionInput::merge(operator, operations);
                if is_nested && children.len() > 1 {
                    operation.expression = format!("({})", operation.expression);
                }
                return Ok(operation);
            }
            Condition::Not(child) => {
                let mut operation = self.condition_recursive(child, true)?;
                operation.expression = format!("NOT ({})", operation.expression);
                return Ok(operation);
            }
        };
        Ok(ExpressionInput {
            expression,
            expression_attribute_names: names,
            expression_attribute_values: values,
        })
    }

    /// Update expression grouped in `SET`, `REMOVE`, `ADD` and `DELETE` clauses.
    pub(crate) fn update(&mut self, actions: &[Action]) -> Result<ExpressionInput> {
        ensure_disjoint(actions)?;
        let mut names = collections::HashMap::new();
        let mut values = collections::HashMap::new();
        let mut set = Vec::new();
        let mut remove = Vec::new();
        let mut add = Vec::new();
        let mut delete = Vec::new();
        for action in actions {
            let path = self.path(action.path(), &mut names);
            match action {
                Action::Set { value, .. } => {
                    let value = self.value("set", value, &mut values)?;
                    set.push(format!("{path} = {value}"));
                }
                Action::SetIfNotExists { value, .. } => {
                    let value = self.value("set", value, &mut values)?;
                    set.push(format!("{path} = if_not_exists({path}, {value})"));
                }
                Action::ListAppend { values: list, .. } => {
                    let value = self.value("set", &Value::List(list.clone()), &mut values)?;
                    set.push(format!("{path} = list_append({path}, {value})"));
                }
                Action::ListPrepend { values: list, .. } => {
                    let value = self.value("set", &Value::List(list.clone()), &mut values)?;
                    set.push(format!("{path} = list_append({value}, {path})"));
                }
                Action::Increment { by, .. } => {
                    let value = self.value("set", &Value::Number(by.clone()), &mut values)?;
                    set.push(format!("{path} = {path} + {value}"));
                }
                Action::Decrement { by, .. } => {
                    let value = self.value("set", &Value::Number(by.clone()), &mut values)?;
                    set.push(format!("{path} = {path} - {value}"));
                }
                Action::Arithmetic {
                    left,
                    operator,
                    right,
                    ..
                } => {
                    let left = self.operand(left, &mut names, &mut values)?;
                    let right = self.operand(right, &mut names, &mut values)?;
                    let symbol = match operator {
                        ArithmeticOperator::Add => "+",
                        ArithmeticOperator::Subtract => "-",
                    };
                    set.push(format!("{path} = {left} {symbol} {right}"));
                }
                Action::Remove(_) => remove.push(path),
                Action::Add { value, .. } => {
                    let value = self.value("add_or_delete", value, &mut values)?;
                    add.push(format!("{path} {value}"));
                }
                Action::Delete { value, .. } => {
                    let value = self.value("add_or_delete", value, &mut values)?;
                    delete.push(format!("{path} {value}"));
                }
            }
        }
        let clauses = [
            ("SET", set),
            ("REMOVE", remove),
            ("ADD", add),
            ("DELETE", delete),
        ];
        let expression = clauses
            .into_iter()
            .filter(|(_, parts)| !parts.is_empty())
            .map(|(keyword, parts)| format!("{keyword} {}", parts.join(", ")))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(ExpressionInput {
            expression,
            expression_attribute_names: names,
            expression_attribute_values: values,
        })
    }

    fn operand(
        &mut self,
        operand: &Operand,
        names: &mut collections::HashMap<String, String>,
        values: &mut collections::HashMap<String, types::AttributeValue>,
    ) -> Result<String> {
        match operand {
            Operand::Path(path) => Ok(self.path(path, names)),
            Operand::Value(value) => self.value("set", value, values),
        }
    }

    /// Projection expression. Only attribute names are involved.
    pub(crate) fn projection(&mut self, paths: &[Path]) -> ExpressionInput {
        let mut names = collections::HashMap::with_capacity(paths.len());
        let expression = paths
            .iter()
            .map(|path| self.path(path, &mut names))
            .collect::<Vec<_>>()
            .join(", ");
        ExpressionInput {
            expression,
            expression_attribute_names: names,
            ..Default::default()
        }
    }
}

fn value_prefix(path: &Path) -> String {
    let last = path
        .elements()
        .iter()
        .rev()
        .find_map(|element| match element {
            PathElement::Name(name) => Some(name.as_str()),
            PathElement::Index(_) => None,
        })
        .unwrap_or_default();
    sanitize(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    fn names(pairs: &[(&str, &str)]) -> collections::HashMap<String, String> {
        pairs
            .iter()
            .map(|(placeholder, name)| (placeholder.to_string(), name.to_string()))
            .collect()
    }

    fn values(
        pairs: Vec<(&str, types::AttributeValue)>,
    ) -> collections::HashMap<String, types::AttributeValue> {
        pairs
            .into_iter()
            .map(|(placeholder, value)| (placeholder.to_string(), value))
            .collect()
    }

    fn n(number: &str) -> types::AttributeValue {
        types::AttributeValue::N(number.to_string())
    }

    fn s(string: &str) -> types::AttributeValue {
        types::AttributeValue::S(string.to_string())
    }

    #[rstest]
    #[case::equals(
        Path::new("a").eq(1),
        ExpressionInput {
            expression: "#a = :a_eq0".to_string(),
            expression_attribute_names: names(&[("#a", "a")]),
            expression_attribute_values: values(vec![(":a_eq0", n("1"))]),
        }
    )]
    #[case::between(
        Path::new("num").between(10, 20),
        ExpressionInput {
            expression: "#num BETWEEN :num_between0 AND :num_between1".to_string(),
            expression_attribute_names: names(&[("#num", "num")]),
            expression_attribute_values: values(vec![
                (":num_between0", n("10")),
                (":num_between1", n("20")),
            ]),
        }
    )]
    #[case::begins_with(
        Path::new("s").begins_with("test"),
        ExpressionInput {
            expression: "begins_with(#s, :s_begins_with0)".to_string(),
            expression_attribute_names: names(&[("#s", "s")]),
            expression_attribute_values: values(vec![(":s_begins_with0", s("test"))]),
        }
    )]
    #[case::is_in(
        Path::new("a").is_in(["x", "y"]),
        ExpressionInput {
            expression: "#a IN (:a_in0_0, :a_in0_1)".to_string(),
            expression_attribute_names: names(&[("#a", "a")]),
            expression_attribute_values: values(vec![
                (":a_in0_0", s("x")),
                (":a_in0_1", s("y")),
            ]),
        }
    )]
    #[case::nested_path(
        Path::parse("two.three[12]").unwrap().exists(),
        ExpressionInput {
            expression: "attribute_exists(#two.#three[12])".to_string(),
            expression_attribute_names: names(&[("#two", "two"), ("#three", "three")]),
            ..Default::default()
        }
    )]
    #[case::compare_paths(
        Path::new("a").compare_path(ComparisonOperator::Lt, &Path::new("b")),
        ExpressionInput {
            expression: "#a < #b".to_string(),
            expression_attribute_names: names(&[("#a", "a"), ("#b", "b")]),
            ..Default::default()
        }
    )]
    #[case::and_or_not(
        Path::new("a").eq("b") & (Path::new("c").gt(1) | !Path::new("d").does_not_exist()),
        ExpressionInput {
            expression:
                "#a = :a_eq0 AND (#c > :c_gt1 OR NOT (attribute_not_exists(#d)))".to_string(),
            expression_attribute_names: names(&[("#a", "a"), ("#c", "c"), ("#d", "d")]),
            expression_attribute_values: values(vec![(":a_eq0", s("b")), (":c_gt1", n("1"))]),
        }
    )]
    #[case::sanitized_alike(
        Path::new("a-b").eq(1) & Path::new("a_b").eq(2),
        ExpressionInput {
            expression: "#a_b = :a_b_eq0 AND #a_b_1 = :a_b_eq1".to_string(),
            expression_attribute_names: names(&[("#a_b", "a-b"), ("#a_b_1", "a_b")]),
            expression_attribute_values: values(vec![(":a_b_eq0", n("1")), (":a_b_eq1", n("2"))]),
        }
    )]
    fn test_condition(#[case] condition: Condition, #[case] expected: ExpressionInput) {
        let operation = ExpressionBuilder::new().condition(&condition).unwrap();
        assert_eq!(operation, expected);
    }

    #[test]
    fn test_condition_rejects_empty_membership() {
        let condition = Path::new("a").is_in(Vec::<Value>::new());
        let error = ExpressionBuilder::new().condition(&condition).unwrap_err();
        assert_eq!(error.code(), "NOT_IMPLEMENTED");
    }

    #[rstest]
    #[case::set(
        vec![Path::new("attr").set("val")],
        ExpressionInput {
            expression: "SET #attr = :set0".to_string(),
            expression_attribute_names: names(&[("#attr", "attr")]),
            expression_attribute_values: values(vec![(":set0", s("val"))]),
        }
    )]
    #[case::increment_and_append(
        vec![Path::new("c").increment(5), Path::new("t").append(["b"])],
        ExpressionInput {
            expression: "SET #c = #c + :set0, #t = list_append(#t, :set1)".to_string(),
            expression_attribute_names: names(&[("#c", "c"), ("#t", "t")]),
            expression_attribute_values: values(vec![
                (":set0", n("5")),
                (":set1", types::AttributeValue::L(vec![s("b")])),
            ]),
        }
    )]
    #[case::prepend_and_default(
        vec![Path::new("t").prepend(["a"]), Path::new("d").set_if_not_exists(0)],
        ExpressionInput {
            expression:
                "SET #t = list_append(:set0, #t), #d = if_not_exists(#d, :set1)".to_string(),
            expression_attribute_names: names(&[("#t", "t"), ("#d", "d")]),
            expression_attribute_values: values(vec![
                (":set0", types::AttributeValue::L(vec![s("a")])),
                (":set1", n("0")),
            ]),
        }
    )]
    #[case::arithmetic(
        vec![Action::arithmetic(
            Path::new("a"),
            Path::new("b"),
            ArithmeticOperator::Subtract,
            Path::new("c"),
        )],
        ExpressionInput {
            expression: "SET #a = #b - #c".to_string(),
            expression_attribute_names: names(&[("#a", "a"), ("#b", "b"), ("#c", "c")]),
            ..Default::default()
        }
    )]
    #[case::combined(
        vec![
            Path::new("a").remove(),
            Path::new("n").decrement(2),
            Path::new("s").add(1),
            Path::parse("m.l[1]").unwrap().remove(),
        ],
        ExpressionInput {
            expression: "SET #n = #n - :set0 REMOVE #a, #m.#l[1] ADD #s :add_or_delete1"
                .to_string(),
            expression_attribute_names: names(&[
                ("#a", "a"),
                ("#n", "n"),
                ("#s", "s"),
                ("#m", "m"),
                ("#l", "l"),
            ]),
            expression_attribute_values: values(vec![
                (":set0", n("2")),
                (":add_or_delete1", n("1")),
            ]),
        }
    )]
    fn test_update(#[case] actions: Vec<Action>, #[case] expected: ExpressionInput) {
        let operation = ExpressionBuilder::new().update(&actions).unwrap();
        assert_eq!(operation, expected);
    }

    #[test]
    fn test_update_rejects_conflicting_actions() {
        let actions = vec![Path::new("c").increment(1), Path::new("c").set(3)];
        let error = ExpressionBuilder::new().update(&actions).unwrap_err();
        assert!(matches!(error, Error::ConflictingActions { path } if path == "c"));
    }

    #[test]
    fn test_projection() {
        let paths = vec![Path::new("f"), Path::parse("g.h[0]").unwrap()];
        let operation = ExpressionBuilder::new().projection(&paths);
        assert_eq!(operation.expression, "#f, #g.#h[0]");
        assert_eq!(
            operation.expression_attribute_names,
            names(&[("#f", "f"), ("#g", "g"), ("#h", "h")])
        );
        assert!(operation.expression_attribute_values.is_empty());
    }

    #[test]
    fn test_placeholders_are_sanitized() {
        let mut builder = ExpressionBuilder::new();
        assert_eq!(builder.name_placeholder("a-b.c"), "#a_b_c");
        assert_eq!(builder.name_placeholder("a-b.c"), "#a_b_c");
        assert_eq!(builder.name_placeholder("a_b_c"), "#a_b_c_1");
    }

    #[test]
    fn test_merge_into_extends_existing() {
        let mut names_slot = Some(names(&[("#a", "a")]));
        let mut values_slot = None;
        let expression = ExpressionInput {
            expression: "#b = :b_eq0".to_string(),
            expression_attribute_names: names(&[("#b", "b")]),
            expression_attribute_values: values(vec![(":b_eq0", n("1"))]),
        }
        .merge_into(&mut names_slot, &mut values_slot);
        assert_eq!(expression, "#b = :b_eq0");
        assert_eq!(names_slot, Some(names(&[("#a", "a"), ("#b", "b")])));
        assert_eq!(values_slot, Some(values(vec![(":b_eq0", n("1"))])));
    }
}
