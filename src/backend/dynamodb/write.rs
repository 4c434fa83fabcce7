use super::{
    expression::{ExpressionBuilder, ExpressionInput},
    read::{RawItem, key_item},
};
use crate::{
    backend::WriteRequest,
    common::{condition::Condition, key::Keys, update::Action},
    error::{Error, Result},
    schema::{Map, value},
};

use aws_sdk_dynamodb::types;
use std::collections;

/// Maximum number of requests of a single batch write call.
pub(crate) const BATCH_WRITE_SIZE: usize = 25;

/// apply common write operation settings to a builder
macro_rules! apply_write_operation {
    ($builder:expr, $write_operation:expr) => {
        $builder
            .set_condition_expression($write_operation.condition_expression)
            .set_expression_attribute_names($write_operation.expression_attribute_names)
            .set_expression_attribute_values($write_operation.expression_attribute_values)
            .set_return_values($write_operation.return_values)
            .table_name($write_operation.table_name)
    };
}

pub(crate) use apply_write_operation;

/// write operation
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct WriteInput {
    pub(crate) condition_expression: Option<String>,
    pub(crate) expression_attribute_names: Option<collections::HashMap<String, String>>,
    pub(crate) expression_attribute_values:
        Option<collections::HashMap<String, types::AttributeValue>>,
    pub(crate) return_values: Option<types::ReturnValue>,
    pub(crate) table_name: String,
}

impl WriteInput {
    fn new(
        table_name: &str,
        builder: &mut ExpressionBuilder,
        condition: Option<&Condition>,
    ) -> Result<Self> {
        let mut operation = Self {
            table_name: table_name.to_string(),
            ..Default::default()
        };
        if let Some(condition) = condition {
            let condition_operation = builder.condition(condition)?;
            operation.condition_expression = Some(operation.merge_expression(condition_operation));
        }
        Ok(operation)
    }

    pub(crate) fn merge_expression(&mut self, operation: ExpressionInput) -> String {
        operation.merge_into(
            &mut self.expression_attribute_names,
            &mut self.expression_attribute_values,
        )
    }
}

/// put item operation
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct PutItemInput {
    pub(crate) item: RawItem,
    pub(crate) write_operation: WriteInput,
}

impl PutItemInput {
    pub(crate) fn new(table_name: &str, raw: &Map, condition: Option<&Condition>) -> Result<Self> {
        let mut builder = ExpressionBuilder::new();
        Ok(Self {
            item: value::map_to_item(raw)?,
            write_operation: WriteInput::new(table_name, &mut builder, condition)?,
        })
    }
}

/// update item operation
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct UpdateItemInput {
    pub(crate) keys: RawItem,
    pub(crate) update_expression: String,
    pub(crate) write_operation: WriteInput,
}

impl UpdateItemInput {
    pub(crate) fn new(
        table_name: &str,
        keys: &Keys,
        actions: &[Action],
        condition: Option<&Condition>,
    ) -> Result<Self> {
        if actions.is_empty() {
            return Err(Error::not_implemented("update without actions"));
        }
        let mut builder = ExpressionBuilder::new();
        let update_operation = builder.update(actions)?;
        let mut write_operation = WriteInput::new(table_name, &mut builder, condition)?;
        write_operation.return_values = Some(types::ReturnValue::AllNew);
        let update_expression = write_operation.merge_expression(update_operation);
        Ok(Self {
            keys: key_item(keys)?,
            update_expression,
            write_operation,
        })
    }
}

/// delete item operation
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct DeleteItemInput {
    pub(crate) keys: RawItem,
    pub(crate) write_operation: WriteInput,
}

impl DeleteItemInput {
    pub(crate) fn new(table_name: &str, keys: &Keys, condition: Option<&Condition>) -> Result<Self> {
        let mut builder = ExpressionBuilder::new();
        Ok(Self {
            keys: key_item(keys)?,
            write_operation: WriteInput::new(table_name, &mut builder, condition)?,
        })
    }
}

impl TryFrom<&WriteRequest> for types::WriteRequest {
    type Error = Error;

    fn try_from(write_request: &WriteRequest) -> Result<Self> {
        let builder = match write_request {
            WriteRequest::Put { raw, .. } => {
                let put_request = types::PutRequest::builder()
                    .set_item(Some(value::map_to_item(raw)?))
                    .build()
                    .map_err(Error::key_value)?;
                Self::builder().put_request(put_request)
            }
            WriteRequest::Delete { keys, .. } => {
                let delete_request = types::DeleteRequest::builder()
                    .set_key(Some(key_item(keys)?))
                    .build()
                    .map_err(Error::key_value)?;
                Self::builder().delete_request(delete_request)
            }
        };
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        common::{key::Key, path::Path},
        schema::Value,
    };

    use rstest::rstest;

    fn keys() -> Keys {
        Keys {
            partition_key: Key {
                name: "n".to_string(),
                value: Value::from("x"),
            },
            ..Default::default()
        }
    }

    fn s(string: &str) -> types::AttributeValue {
        types::AttributeValue::S(string.to_string())
    }

    fn n(number: &str) -> types::AttributeValue {
        types::AttributeValue::N(number.to_string())
    }

    #[rstest]
    #[case::empty(
        None,
        WriteInput {
            table_name: "a".to_string(),
            ..Default::default()
        }
    )]
    #[case::full(
        Some(Path::new("n").does_not_exist()),
        WriteInput {
            condition_expression: Some("attribute_not_exists(#n)".to_string()),
            expression_attribute_names: Some(collections::HashMap::from([(
                "#n".to_string(),
                "n".to_string(),
            )])),
            table_name: "a".to_string(),
            ..Default::default()
        }
    )]
    fn test_put_item_input(#[case] condition: Option<Condition>, #[case] expected: WriteInput) {
        let raw = Map::from([
            ("n".to_string(), Value::from("x")),
            ("c".to_string(), Value::from(1)),
        ]);
        let input = PutItemInput::new("a", &raw, condition.as_ref()).unwrap();
        assert_eq!(
            input.item,
            collections::HashMap::from([("n".to_string(), s("x")), ("c".to_string(), n("1"))])
        );
        assert_eq!(input.write_operation, expected);
    }

    #[test]
    fn test_update_item_input() {
        let actions = vec![Path::new("c").increment(5), Path::new("t").append(["b"])];
        let condition = Path::new("c").ge(0);
        let input = UpdateItemInput::new("a", &keys(), &actions, Some(&condition)).unwrap();
        assert_eq!(
            input,
            UpdateItemInput {
                keys: collections::HashMap::from([("n".to_string(), s("x"))]),
                update_expression: "SET #c = #c + :set0, #t = list_append(#t, :set1)".to_string(),
                write_operation: WriteInput {
                    condition_expression: Some("#c >= :c_gte2".to_string()),
                    expression_attribute_names: Some(collections::HashMap::from([
                        ("#c".to_string(), "c".to_string()),
                        ("#t".to_string(), "t".to_string()),
                    ])),
                    expression_attribute_values: Some(collections::HashMap::from([
                        (":set0".to_string(), n("5")),
                        (":set1".to_string(), types::AttributeValue::L(vec![s("b")])),
                        (":c_gte2".to_string(), n("0")),
                    ])),
                    return_values: Some(types::ReturnValue::AllNew),
                    table_name: "a".to_string(),
                },
            }
        );
    }

    #[test]
    fn test_update_item_input_rejects_empty_actions() {
        let error = UpdateItemInput::new("a", &keys(), &[], None).unwrap_err();
        assert_eq!(error.code(), "NOT_IMPLEMENTED");
    }

    #[test]
    fn test_delete_item_input() {
        let input = DeleteItemInput::new("a", &keys(), None).unwrap();
        assert_eq!(
            input,
            DeleteItemInput {
                keys: collections::HashMap::from([("n".to_string(), s("x"))]),
                write_operation: WriteInput {
                    table_name: "a".to_string(),
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn test_write_requests() {
        let put = WriteRequest::Put {
            raw: Map::from([("n".to_string(), Value::from("x"))]),
            keys: keys(),
            identity: None,
        };
        let request = types::WriteRequest::try_from(&put).unwrap();
        assert_eq!(
            request.put_request().map(|put| put.item().clone()),
            Some(collections::HashMap::from([("n".to_string(), s("x"))]))
        );
        let delete = WriteRequest::Delete {
            keys: keys(),
            identity: None,
        };
        let request = types::WriteRequest::try_from(&delete).unwrap();
        assert_eq!(
            request.delete_request().map(|delete| delete.key().clone()),
            Some(collections::HashMap::from([("n".to_string(), s("x"))]))
        );
    }
}
