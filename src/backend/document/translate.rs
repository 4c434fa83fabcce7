//! Translation of condition trees and update actions into the document store's filter, update
//! and pipeline syntax.

use crate::{
    common::{
        condition::{ComparisonOperator, Condition, Operand},
        key::Keys,
        path::{Path, PathElement},
        update::{Action, ArithmeticOperator, ensure_disjoint},
    },
    error::{Error, Result},
    schema::Value,
};

use indexmap::IndexMap;
use mongodb::{
    bson::{Bson, Document, doc},
    options::UpdateModifications,
};

/// Update in one of the two shapes accepted by the document store.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateDocument {
    /// Operator document such as `{"$set": {...}, "$inc": {...}}`.
    Document(Document),
    /// Aggregation pipeline, needed when a new value depends on stored values.
    Pipeline(Vec<Document>),
}

impl From<UpdateDocument> for UpdateModifications {
    fn from(update: UpdateDocument) -> Self {
        match update {
            UpdateDocument::Document(document) => Self::Document(document),
            UpdateDocument::Pipeline(pipeline) => Self::Pipeline(pipeline),
        }
    }
}

/// Renders a path in dotted notation: `two.three[12]` becomes `two.three.12`.
///
/// A single list position is supported and only as the last step.
pub fn mongo_path(path: &Path) -> Result<String> {
    let elements = path.elements();
    let mut rendered = Vec::with_capacity(elements.len());
    for (position, element) in elements.iter().enumerate() {
        match element {
            PathElement::Name(name) => rendered.push(name.clone()),
            PathElement::Index(index) if position == elements.len() - 1 && position > 0 => {
                rendered.push(index.to_string());
            }
            PathElement::Index(_) => {
                return Err(Error::UnsupportedPath {
                    path: path.to_string(),
                    reason: "the document store only addresses a list position as the last step"
                        .to_string(),
                });
            }
        }
    }
    Ok(rendered.join("."))
}

/// Equality filter on the key attributes.
pub fn key_filter(keys: &Keys) -> Document {
    let mut filter = doc! { keys.partition_key.name.clone(): keys.partition_key.value.to_bson() };
    if let Some(sort_key) = &keys.sort_key {
        filter.insert(sort_key.name.clone(), sort_key.value.to_bson());
    }
    filter
}

/// Translates a condition tree into a filter document.
///
/// ```rust
/// use modular_sdk::{backend::document::translate, common::path::Path};
/// use mongodb::bson::doc;
///
/// let filter = translate::filter(&Path::new("num").between(10, 20)).unwrap();
/// assert_eq!(filter, doc! {"num": {"$gte": 10, "$lte": 20}});
/// ```
pub fn filter(condition: &Condition) -> Result<Document> {
    let filter = match condition {
        Condition::And(children) if children.is_empty() => Document::new(),
        Condition::And(children) => doc! { "$and": filters(children)? },
        Condition::Or(children) if children.is_empty() => doc! { "$nor": [{}] },
        Condition::Or(children) => doc! { "$or": filters(children)? },
        Condition::Not(child) => doc! { "$nor": [filter(child)?] },
        Condition::Exists(path) => doc! { mongo_path(path)?: { "$exists": true } },
        Condition::NotExists(path) => doc! { mongo_path(path)?: { "$exists": false } },
        Condition::Contains {
            path,
            value: Value::String(substring),
        } => doc! { mongo_path(path)?: { "$regex": regex::escape(substring) } },
        Condition::Contains { path, value } => doc! { mongo_path(path)?: value.to_bson() },
        Condition::BeginsWith { path, prefix } => {
            doc! { mongo_path(path)?: { "$regex": format!("^{}", regex::escape(prefix)) } }
        }
        Condition::In { path, values } => {
            let values: Vec<Bson> = values.iter().map(Value::to_bson).collect();
            doc! { mongo_path(path)?: { "$in": values } }
        }
        Condition::Between { path, low, high } => {
            doc! { mongo_path(path)?: { "$gte": low.to_bson(), "$lte": high.to_bson() } }
        }
        Condition::Comparison {
            operand: Operand::Path(other),
            path,
            ..
        } => {
            return Err(Error::not_implemented(format!(
                "comparison between attributes '{path}' and '{other}'"
            )));
        }
        Condition::Comparison {
            path,
            operator,
            operand: Operand::Value(value),
        } => {
            let path = mongo_path(path)?;
            match operator {
                ComparisonOperator::Eq => doc! { path: value.to_bson() },
                operator => doc! { path: { comparison_operator(*operator): value.to_bson() } },
            }
        }
    };
    Ok(filter)
}

fn filters(children: &[Condition]) -> Result<Vec<Document>> {
    children.iter().map(filter).collect()
}

fn comparison_operator(operator: ComparisonOperator) -> &'static str {
    match operator {
        ComparisonOperator::Eq => "$eq",
        ComparisonOperator::Ne => "$ne",
        ComparisonOperator::Gt => "$gt",
        ComparisonOperator::Ge => "$gte",
        ComparisonOperator::Lt => "$lt",
        ComparisonOperator::Le => "$lte",
    }
}

/// Projection document for the given attributes.
pub fn projection(paths: &[Path]) -> Result<Option<Document>> {
    if paths.is_empty() {
        return Ok(None);
    }
    let mut projection = Document::new();
    for path in paths {
        projection.insert(mongo_path(path)?, 1);
    }
    Ok(Some(projection))
}

/// Fragment produced by a single action.
enum Fragment {
    /// Operator, path and argument of an operator document.
    Operator(&'static str, String, Bson),
    /// Ready pipeline stages.
    Stages(Vec<Document>),
}

/// Translates update actions into an update document, or into a pipeline when any action
/// needs stored values.
///
/// Two actions on the same path are rejected.
///
/// ```rust
/// use modular_sdk::{backend::document::translate, common::path::Path};
/// use mongodb::bson::doc;
///
/// let update = translate::update(&[Path::new("c").increment(5), Path::new("t").append(["b"])]).unwrap();
/// assert_eq!(
///     update,
///     translate::UpdateDocument::Document(doc! {
///         "$inc": {"c": 5},
///         "$push": {"t": {"$each": ["b"]}},
///     })
/// );
/// ```
pub fn update(actions: &[Action]) -> Result<UpdateDocument> {
    ensure_disjoint(actions)?;
    let mut operators: IndexMap<&'static str, Document> = IndexMap::new();
    let mut stages = Vec::new();
    for action in actions {
        match fragment(action)? {
            Fragment::Operator(operator, path, argument) => {
                operators.entry(operator).or_default().insert(path, argument);
            }
            Fragment::Stages(action_stages) => stages.extend(action_stages),
        }
    }
    if stages.is_empty() {
        return Ok(UpdateDocument::Document(
            operators
                .into_iter()
                .map(|(operator, arguments)| (operator.to_string(), Bson::Document(arguments)))
                .collect(),
        ));
    }
    let mut pipeline = Vec::with_capacity(operators.len() + stages.len());
    for (operator, arguments) in operators {
        pipeline.push(operator_stage(operator, arguments)?);
    }
    pipeline.extend(stages);
    Ok(UpdateDocument::Pipeline(pipeline))
}

fn fragment(action: &Action) -> Result<Fragment> {
    let fragment = match action {
        Action::Set { path, value } => Fragment::Operator("$set", mongo_path(path)?, value.to_bson()),
        Action::ListAppend { path, values } => Fragment::Operator(
            "$push",
            mongo_path(path)?,
            Bson::Document(doc! { "$each": list(values) }),
        ),
        Action::ListPrepend { path, values } => Fragment::Operator(
            "$push",
            mongo_path(path)?,
            Bson::Document(doc! { "$each": list(values), "$position": 0 }),
        ),
        Action::Increment { path, by } => Fragment::Operator("$inc", mongo_path(path)?, by.to_bson()),
        Action::Decrement { path, by } => {
            Fragment::Operator("$inc", mongo_path(path)?, by.negate().to_bson())
        }
        Action::Add {
            path,
            value: Value::Number(number),
        } => Fragment::Operator("$inc", mongo_path(path)?, number.to_bson()),
        Action::Add {
            path,
            value: set @ (Value::StringSet(_) | Value::NumberSet(_) | Value::BinarySet(_)),
        } => Fragment::Operator(
            "$addToSet",
            mongo_path(path)?,
            Bson::Document(doc! { "$each": set.to_bson() }),
        ),
        Action::Delete {
            path,
            value: set @ (Value::StringSet(_) | Value::NumberSet(_) | Value::BinarySet(_)),
        } => Fragment::Operator("$pullAll", mongo_path(path)?, set.to_bson()),
        Action::Add { value, .. } => {
            return Err(Error::not_implemented(format!(
                "ADD of a {} value",
                value.kind()
            )));
        }
        Action::Delete { value, .. } => {
            return Err(Error::not_implemented(format!(
                "DELETE of a {} value",
                value.kind()
            )));
        }
        Action::Remove(path) => match path.elements().split_last() {
            Some((PathElement::Index(index), list_path)) if !list_path.is_empty() => {
                let list_path = mongo_path(&Path::from_elements(list_path.to_vec()))?;
                Fragment::Stages(vec![remove_list_element(&list_path, *index)?])
            }
            _ => Fragment::Operator("$unset", mongo_path(path)?, Bson::String(String::new())),
        },
        Action::SetIfNotExists { path, value } => {
            let path = stage_path(path)?;
            let reference = format!("${path}");
            Fragment::Stages(vec![doc! {
                "$set": { path: { "$ifNull": [reference, literal(value.to_bson())] } }
            }])
        }
        Action::Arithmetic {
            path,
            left,
            operator,
            right,
        } => {
            let operator = match operator {
                ArithmeticOperator::Add => "$add",
                ArithmeticOperator::Subtract => "$subtract",
            };
            Fragment::Stages(vec![doc! {
                "$set": { stage_path(path)?: { operator: [operand(left)?, operand(right)?] } }
            }])
        }
    };
    Ok(fragment)
}

fn list(values: &[Value]) -> Vec<Bson> {
    values.iter().map(Value::to_bson).collect()
}

/// Removes a list element and shifts the rest: `arr = arr[..i] + arr[i + 1..]`.
fn remove_list_element(list_path: &str, index: usize) -> Result<Document> {
    let index = i64::try_from(index).map_err(|_| Error::UnsupportedPath {
        path: list_path.to_string(),
        reason: "list position out of range".to_string(),
    })?;
    let reference = format!("${list_path}");
    Ok(doc! {
        "$set": {
            list_path: {
                "$concatArrays": [
                    { "$slice": [reference.clone(), index] },
                    { "$slice": [reference.clone(), { "$add": [1_i64, index] }, { "$size": reference }] },
                ]
            }
        }
    })
}

/// Paths inside pipeline stages cannot address list positions.
fn stage_path(path: &Path) -> Result<String> {
    if path
        .elements()
        .iter()
        .any(|element| matches!(element, PathElement::Index(_)))
    {
        return Err(Error::UnsupportedPath {
            path: path.to_string(),
            reason: "list positions cannot be assigned by a pipeline update".to_string(),
        });
    }
    mongo_path(path)
}

fn operand(operand: &Operand) -> Result<Bson> {
    match operand {
        Operand::Path(path) => Ok(Bson::String(format!("${}", stage_path(path)?))),
        Operand::Value(Value::Number(number)) => Ok(number.to_bson()),
        Operand::Value(value) => Err(Error::not_implemented(format!(
            "arithmetic with a {} operand",
            value.kind()
        ))),
    }
}

/// Wraps a literal so that the pipeline does not read strings starting with `$` as references.
fn literal(value: Bson) -> Bson {
    match value {
        number @ (Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => number,
        other => Bson::Document(doc! { "$literal": other }),
    }
}

/// Rewrites an operator document section as a pipeline stage.
fn operator_stage(operator: &str, arguments: Document) -> Result<Document> {
    let mut assignments = Document::new();
    match operator {
        "$set" => {
            for (path, value) in arguments {
                check_stage_path(&path)?;
                assignments.insert(path, literal(value));
            }
        }
        "$unset" => {
            let paths: Vec<Bson> = arguments
                .into_iter()
                .map(|(path, _)| -> Result<Bson> {
                    check_stage_path(&path)?;
                    Ok(Bson::String(path))
                })
                .collect::<Result<_>>()?;
            return Ok(doc! { "$unset": paths });
        }
        "$inc" => {
            for (path, delta) in arguments {
                check_stage_path(&path)?;
                let reference = format!("${path}");
                assignments.insert(path, doc! { "$add": [{ "$ifNull": [reference, 0] }, delta] });
            }
        }
        "$push" => {
            for (path, argument) in arguments {
                check_stage_path(&path)?;
                let reference = format!("${path}");
                let Bson::Document(mut argument) = argument else {
                    return Err(Error::not_implemented("$push without $each in a pipeline"));
                };
                let items = literal(argument.remove("$each").unwrap_or(Bson::Array(Vec::new())));
                let current = doc! { "$ifNull": [reference, []] };
                let parts = if argument.contains_key("$position") {
                    vec![items, Bson::Document(current)]
                } else {
                    vec![Bson::Document(current), items]
                };
                assignments.insert(path, doc! { "$concatArrays": parts });
            }
        }
        operator => {
            return Err(Error::not_implemented(format!(
                "{operator} combined with a pipeline update"
            )));
        }
    }
    Ok(doc! { "$set": assignments })
}

fn check_stage_path(path: &str) -> Result<()> {
    if path.split('.').skip(1).any(|part| part.parse::<usize>().is_ok()) {
        return Err(Error::UnsupportedPath {
            path: path.to_string(),
            reason: "list positions cannot be assigned by a pipeline update".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::schema::Number;

    use rstest::rstest;

    fn path(path: &str) -> Path {
        Path::parse(path).unwrap()
    }

    #[rstest]
    #[case::equals(path("a").eq("x"), doc! {"a": "x"})]
    #[case::not_equals(path("a").ne(1), doc! {"a": {"$ne": 1}})]
    #[case::greater(path("a").gt(1), doc! {"a": {"$gt": 1}})]
    #[case::greater_or_equal(path("a").ge(1), doc! {"a": {"$gte": 1}})]
    #[case::less(path("a").lt(1), doc! {"a": {"$lt": 1}})]
    #[case::less_or_equal(path("a").le(1), doc! {"a": {"$lte": 1}})]
    #[case::between(path("num").between(10, 20), doc! {"num": {"$gte": 10, "$lte": 20}})]
    #[case::begins_with(path("s").begins_with("test"), doc! {"s": {"$regex": "^test"}})]
    #[case::begins_with_escaped(path("s").begins_with("a.b"), doc! {"s": {"$regex": "^a\\.b"}})]
    #[case::contains(path("s").contains("mid"), doc! {"s": {"$regex": "mid"}})]
    #[case::contains_element(path("l").contains(3), doc! {"l": 3})]
    #[case::is_in(path("a").is_in(["x", "y"]), doc! {"a": {"$in": ["x", "y"]}})]
    #[case::exists(path("a").exists(), doc! {"a": {"$exists": true}})]
    #[case::not_exists(path("a").does_not_exist(), doc! {"a": {"$exists": false}})]
    #[case::nested(path("two.three[12]").eq(1), doc! {"two.three.12": 1})]
    #[case::and(
        path("a").eq(1) & path("b").exists(),
        doc! {"$and": [{"a": 1}, {"b": {"$exists": true}}]}
    )]
    #[case::or(path("a").eq(1) | path("a").eq(2), doc! {"$or": [{"a": 1}, {"a": 2}]})]
    #[case::not(!path("a").eq(1), doc! {"$nor": [{"a": 1}]})]
    #[case::not_of_or(
        !(path("a").eq(1) | path("b").eq(2)),
        doc! {"$nor": [{"$or": [{"a": 1}, {"b": 2}]}]}
    )]
    #[case::decimal(
        path("a").eq(Value::Number(Number::Decimal("1.5".to_string()))),
        doc! {"a": 1.5}
    )]
    #[case::empty_and(Condition::And(Vec::new()), doc! {})]
    fn test_filter(#[case] condition: Condition, #[case] expected: Document) {
        assert_eq!(filter(&condition).unwrap(), expected);
    }

    #[rstest]
    #[case::deep_index(path("a.b[3].c").eq(1))]
    #[case::two_indexes(path("a[1][2]").eq(1))]
    fn test_filter_rejects_deep_indexes(#[case] condition: Condition) {
        assert!(matches!(
            filter(&condition),
            Err(Error::UnsupportedPath { .. })
        ));
    }

    #[test]
    fn test_filter_rejects_path_operand() {
        let condition = path("a").compare_path(ComparisonOperator::Gt, &path("b"));
        let error = filter(&condition).unwrap_err();
        assert!(matches!(error, Error::NotImplemented { .. }));
        assert!(error.to_string().contains("'a' and 'b'"));
    }

    #[rstest]
    #[case::set(
        vec![path("a").set("x"), path("b.c").set(1)],
        UpdateDocument::Document(doc! {"$set": {"a": "x", "b.c": 1}})
    )]
    #[case::append(
        vec![path("t").append(["b"])],
        UpdateDocument::Document(doc! {"$push": {"t": {"$each": ["b"]}}})
    )]
    #[case::prepend(
        vec![path("t").prepend(["z"])],
        UpdateDocument::Document(doc! {"$push": {"t": {"$each": ["z"], "$position": 0}}})
    )]
    #[case::increment(
        vec![path("c").increment(5)],
        UpdateDocument::Document(doc! {"$inc": {"c": 5}})
    )]
    #[case::decrement(
        vec![path("c").decrement(2)],
        UpdateDocument::Document(doc! {"$inc": {"c": -2}})
    )]
    #[case::add_number(
        vec![path("c").add(1)],
        UpdateDocument::Document(doc! {"$inc": {"c": 1}})
    )]
    #[case::add_set(
        vec![path("s").add(Value::StringSet(["x".to_string()].into()))],
        UpdateDocument::Document(doc! {"$addToSet": {"s": {"$each": ["x"]}}})
    )]
    #[case::delete_set(
        vec![path("s").delete(Value::StringSet(["x".to_string()].into()))],
        UpdateDocument::Document(doc! {"$pullAll": {"s": ["x"]}})
    )]
    #[case::remove(
        vec![path("a").remove(), path("b.c").remove()],
        UpdateDocument::Document(doc! {"$unset": {"a": "", "b.c": ""}})
    )]
    #[case::mixed_operators(
        vec![path("a").set(1), path("b").remove(), path("c").increment(1)],
        UpdateDocument::Document(doc! {"$set": {"a": 1}, "$unset": {"b": ""}, "$inc": {"c": 1}})
    )]
    #[case::remove_list_element(
        vec![path("arr[2]").remove()],
        UpdateDocument::Pipeline(vec![doc! {
            "$set": {
                "arr": {
                    "$concatArrays": [
                        {"$slice": ["$arr", 2_i64]},
                        {"$slice": ["$arr", {"$add": [1_i64, 2_i64]}, {"$size": "$arr"}]},
                    ]
                }
            }
        }])
    )]
    #[case::arithmetic_two_paths(
        vec![Action::arithmetic(path("total"), path("a"), ArithmeticOperator::Add, path("b"))],
        UpdateDocument::Pipeline(vec![doc! {"$set": {"total": {"$add": ["$a", "$b"]}}}])
    )]
    #[case::arithmetic_literal(
        vec![Action::arithmetic(path("left"), path("total"), ArithmeticOperator::Subtract, 3)],
        UpdateDocument::Pipeline(vec![doc! {"$set": {"left": {"$subtract": ["$total", 3]}}}])
    )]
    #[case::set_if_not_exists(
        vec![path("a").set_if_not_exists("x")],
        UpdateDocument::Pipeline(vec![doc! {"$set": {"a": {"$ifNull": ["$a", {"$literal": "x"}]}}}])
    )]
    #[case::operators_become_stages(
        vec![path("a").set("$x"), path("b").remove(), path("c").increment(1), path("arr[0]").remove()],
        UpdateDocument::Pipeline(vec![
            doc! {"$set": {"a": {"$literal": "$x"}}},
            doc! {"$unset": ["b"]},
            doc! {"$set": {"c": {"$add": [{"$ifNull": ["$c", 0]}, 1]}}},
            doc! {
                "$set": {
                    "arr": {
                        "$concatArrays": [
                            {"$slice": ["$arr", 0_i64]},
                            {"$slice": ["$arr", {"$add": [1_i64, 0_i64]}, {"$size": "$arr"}]},
                        ]
                    }
                }
            },
        ])
    )]
    #[case::push_becomes_concat(
        vec![path("t").append(["b"]), Action::arithmetic(path("n"), path("n"), ArithmeticOperator::Add, 1)],
        UpdateDocument::Pipeline(vec![
            doc! {"$set": {"t": {"$concatArrays": [{"$ifNull": ["$t", []]}, {"$literal": ["b"]}]}}},
            doc! {"$set": {"n": {"$add": ["$n", 1]}}},
        ])
    )]
    fn test_update(#[case] actions: Vec<Action>, #[case] expected: UpdateDocument) {
        assert_eq!(update(&actions).unwrap(), expected);
    }

    #[rstest]
    #[case::conflict(
        vec![path("a").set(1), path("a").increment(1)],
        "CONFLICTING_ACTIONS"
    )]
    #[case::nested_conflict(
        vec![path("a").set(1), path("a.b").remove()],
        "CONFLICTING_ACTIONS"
    )]
    #[case::add_string(vec![path("a").add("x")], "NOT_IMPLEMENTED")]
    #[case::set_union_in_pipeline(
        vec![
            path("s").add(Value::StringSet(["x".to_string()].into())),
            path("arr[0]").remove(),
        ],
        "NOT_IMPLEMENTED"
    )]
    #[case::index_in_pipeline(
        vec![path("l[1]").set_if_not_exists(1)],
        "UNSUPPORTED_PATH"
    )]
    #[case::string_arithmetic(
        vec![Action::arithmetic(path("a"), path("b"), ArithmeticOperator::Add, Value::from("x"))],
        "NOT_IMPLEMENTED"
    )]
    fn test_update_rejects(#[case] actions: Vec<Action>, #[case] code: &str) {
        assert_eq!(update(&actions).unwrap_err().code(), code);
    }

    #[test]
    fn test_projection() {
        assert_eq!(projection(&[]).unwrap(), None);
        assert_eq!(
            projection(&[path("a"), path("b.c")]).unwrap(),
            Some(doc! {"a": 1, "b.c": 1})
        );
    }

    #[test]
    fn test_key_filter() {
        let keys = Keys {
            partition_key: crate::common::key::Key {
                name: "n".to_string(),
                value: Value::from("x"),
            },
            sort_key: Some(crate::common::key::Key {
                name: "d".to_string(),
                value: Value::from(1),
            }),
        };
        assert_eq!(key_filter(&keys), doc! {"n": "x", "d": 1});
    }
}
