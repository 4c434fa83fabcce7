use super::expression::{ExpressionBuilder, ExpressionInput};
use crate::{
    backend::{GetOptions, Query, Scan, hash_key_condition},
    common::{condition::Condition, key::Keys, path::Path},
    cursor::{CursorSource, StartKey},
    error::{Error, Result},
    item::{Identity, Item},
    schema::{Flavor, Schema, Value, value},
};

use aws_sdk_dynamodb::{Client, error::DisplayErrorContext, types};
use tokio::runtime::Runtime;

use std::{
    collections::{self, VecDeque},
    sync::Arc,
};

pub(crate) type RawItem = collections::HashMap<String, types::AttributeValue>;

/// apply common single read operation settings to a builder
macro_rules! apply_single_read_operation {
    ($builder:expr, $single_read_operation:expr) => {
        $builder
            .set_consistent_read($single_read_operation.consistent_read)
            .set_expression_attribute_names($single_read_operation.expression_attribute_names)
            .set_projection_expression($single_read_operation.projection_expression)
            .table_name($single_read_operation.table_name)
    };
}

/// apply common multiple read operation settings to a builder
macro_rules! apply_multiple_read_operation {
    ($builder:expr, $multiple_read_operation:expr) => {
        $builder
            .set_consistent_read($multiple_read_operation.consistent_read)
            .set_exclusive_start_key($multiple_read_operation.exclusive_start_key)
            .set_expression_attribute_names($multiple_read_operation.expression_attribute_names)
            .set_expression_attribute_values($multiple_read_operation.expression_attribute_values)
            .set_filter_expression($multiple_read_operation.filter_expression)
            .set_index_name($multiple_read_operation.index_name)
            .set_limit($multiple_read_operation.limit)
            .set_projection_expression($multiple_read_operation.projection_expression)
            .set_select($multiple_read_operation.select)
            .table_name($multiple_read_operation.table_name)
    };
}

pub(crate) use apply_single_read_operation;

/// Wire form of a primary key.
pub(crate) fn key_item(keys: &Keys) -> Result<RawItem> {
    let mut item = collections::HashMap::with_capacity(2);
    item.insert(
        keys.partition_key.name.clone(),
        keys.partition_key.value.to_attribute_value()?,
    );
    if let Some(sort_key) = &keys.sort_key {
        item.insert(sort_key.name.clone(), sort_key.value.to_attribute_value()?);
    }
    Ok(item)
}

/// Decodes a wire item, taking its identity from its key attributes.
pub(crate) fn decode_item(schema: &Schema, item: RawItem) -> Result<Item> {
    let raw = value::item_to_map(item)?;
    let values = schema.deserialize(&raw, Flavor::KeyValue)?;
    let keys = schema.keys_of(&values, Flavor::KeyValue)?;
    Ok(Item::from_storage(values, Identity::Key(keys), raw))
}

/// Storage names of the table key and of the index key, without duplicates.
pub(crate) fn key_names(schema: &Schema, index_name: Option<&str>) -> Result<Vec<String>> {
    let mut names = Vec::with_capacity(4);
    let (hash, range) = schema.key_fields(None)?;
    let (index_hash, index_range) = schema.key_fields(index_name)?;
    for field in [Some(hash), range, Some(index_hash), index_range]
        .into_iter()
        .flatten()
    {
        let name = field.attr_name().to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    Ok(names)
}

/// Requested paths plus the key attributes items are identified by.
pub(crate) fn projection_paths(
    key_names: &[String],
    attributes_to_get: Option<&[Path]>,
) -> Option<Vec<Path>> {
    let mut paths = attributes_to_get?.to_vec();
    for name in key_names {
        let path = Path::new(name);
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    Some(paths)
}

fn exclusive_start_key(table: &str, start: Option<&StartKey>) -> Result<Option<RawItem>> {
    match start {
        None => Ok(None),
        Some(StartKey::Key(key)) => Ok(Some(serde_dynamo::to_item(key)?)),
        Some(StartKey::Offset(offset)) => {
            tracing::warn!(table, offset, "continuation key is an offset, reading from the start");
            Ok(None)
        }
    }
}

fn page_limit(page_size: Option<u32>, limit: Option<u64>) -> Option<i32> {
    page_size
        .map(u64::from)
        .or(limit)
        .map(|size| i32::try_from(size).unwrap_or(i32::MAX))
}

/// single read operation
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct SingleReadInput {
    pub(crate) consistent_read: Option<bool>,
    pub(crate) expression_attribute_names: Option<collections::HashMap<String, String>>,
    pub(crate) projection_expression: Option<String>,
    pub(crate) table_name: String,
}

/// get item operation
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct GetItemInput {
    pub(crate) keys: RawItem,
    pub(crate) single_read_operation: SingleReadInput,
}

impl GetItemInput {
    pub(crate) fn new(schema: &Schema, keys: &Keys, options: &GetOptions) -> Result<Self> {
        let key_names = key_names(schema, None)?;
        let (expression_attribute_names, projection_expression) =
            match projection_paths(&key_names, options.attributes_to_get.as_deref()) {
                Some(paths) => {
                    let selection_operation = ExpressionBuilder::new().projection(&paths);
                    (
                        Some(selection_operation.expression_attribute_names),
                        Some(selection_operation.expression),
                    )
                }
                None => (None, None),
            };
        Ok(Self {
            keys: key_item(keys)?,
            single_read_operation: SingleReadInput {
                consistent_read: options.consistent_read,
                expression_attribute_names,
                projection_expression,
                table_name: schema.table_name().to_string(),
            },
        })
    }
}

/// multiple read operation
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct MultipleReadInput {
    pub(crate) consistent_read: Option<bool>,
    pub(crate) exclusive_start_key: Option<RawItem>,
    pub(crate) expression_attribute_names: Option<collections::HashMap<String, String>>,
    pub(crate) expression_attribute_values:
        Option<collections::HashMap<String, types::AttributeValue>>,
    pub(crate) filter_expression: Option<String>,
    pub(crate) index_name: Option<String>,
    pub(crate) limit: Option<i32>,
    pub(crate) projection_expression: Option<String>,
    pub(crate) select: Option<types::Select>,
    pub(crate) table_name: String,
}

/// Settings shared by queries, scans and counts.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct MultipleReadArgs<'a> {
    pub(crate) consistent_read: Option<bool>,
    pub(crate) exclusive_start_key: Option<&'a StartKey>,
    pub(crate) filter: Option<&'a Condition>,
    pub(crate) index_name: Option<&'a str>,
    pub(crate) limit: Option<i32>,
    pub(crate) selection: Option<&'a [Path]>,
    pub(crate) select: Option<&'a types::Select>,
}

impl MultipleReadInput {
    fn new(
        schema: &Schema,
        builder: &mut ExpressionBuilder,
        args: MultipleReadArgs<'_>,
    ) -> Result<Self> {
        if let Some(index_name) = args.index_name {
            schema.index(index_name)?;
        }
        let key_names = key_names(schema, args.index_name)?;
        let condition_operation = args
            .filter
            .map(|condition| builder.condition(condition))
            .transpose()?;
        let selection_operation =
            projection_paths(&key_names, args.selection).map(|paths| builder.projection(&paths));
        let mut operation = Self {
            consistent_read: args.consistent_read,
            exclusive_start_key: exclusive_start_key(
                schema.table_name(),
                args.exclusive_start_key,
            )?,
            index_name: args.index_name.map(str::to_string),
            limit: args.limit,
            select: args.select.cloned(),
            table_name: schema.table_name().to_string(),
            ..Default::default()
        };
        if let Some(condition_operation) = condition_operation {
            operation.filter_expression = Some(operation.merge_expression(condition_operation));
        }
        if let Some(selection_operation) = selection_operation {
            operation.projection_expression = Some(operation.merge_expression(selection_operation));
        }
        Ok(operation)
    }

    fn merge_expression(&mut self, operation: ExpressionInput) -> String {
        operation.merge_into(
            &mut self.expression_attribute_names,
            &mut self.expression_attribute_values,
        )
    }
}

/// query operation
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct QueryInput {
    pub(crate) key_condition_expression: String,
    pub(crate) multiple_read_operation: MultipleReadInput,
    pub(crate) scan_index_forward: Option<bool>,
}

impl QueryInput {
    pub(crate) fn new(schema: &Schema, query: &Query) -> Result<Self> {
        let args = MultipleReadArgs {
            consistent_read: query.consistent_read,
            exclusive_start_key: query.last_evaluated_key.as_ref(),
            filter: query.filter_condition.as_ref(),
            index_name: query.index_name.as_deref(),
            limit: page_limit(query.page_size, query.limit),
            selection: query.attributes_to_get.as_deref(),
            select: None,
        };
        Self::with_args(schema, &query.hash_key, query.range_key_condition.as_ref(), args)
            .map(|input| Self {
                scan_index_forward: query.scan_index_forward,
                ..input
            })
    }

    pub(crate) fn with_args(
        schema: &Schema,
        hash_key: &Value,
        range_key_condition: Option<&Condition>,
        args: MultipleReadArgs<'_>,
    ) -> Result<Self> {
        let partition =
            hash_key_condition(schema, Flavor::KeyValue, args.index_name, hash_key)?;
        let key_condition = match range_key_condition {
            Some(range) => partition & range.clone(),
            None => partition,
        };
        let mut builder = ExpressionBuilder::new();
        let key_condition_operation = builder.condition(&key_condition)?;
        let mut multiple_read_operation = MultipleReadInput::new(schema, &mut builder, args)?;
        let key_condition_expression =
            multiple_read_operation.merge_expression(key_condition_operation);
        Ok(Self {
            key_condition_expression,
            multiple_read_operation,
            scan_index_forward: None,
        })
    }
}

/// scan operation
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ScanInput {
    pub(crate) multiple_read_operation: MultipleReadInput,
    pub(crate) segment: Option<i32>,
    pub(crate) total_segments: Option<i32>,
}

impl ScanInput {
    pub(crate) fn new(schema: &Schema, scan: &Scan) -> Result<Self> {
        let args = MultipleReadArgs {
            consistent_read: scan.consistent_read,
            exclusive_start_key: scan.last_evaluated_key.as_ref(),
            filter: scan.filter_condition.as_ref(),
            index_name: scan.index_name.as_deref(),
            limit: page_limit(scan.page_size, scan.limit),
            selection: scan.attributes_to_get.as_deref(),
            select: None,
        };
        let mut input = Self::with_args(schema, args)?;
        input.segment = scan.segment;
        input.total_segments = scan.total_segments;
        Ok(input)
    }

    pub(crate) fn with_args(schema: &Schema, args: MultipleReadArgs<'_>) -> Result<Self> {
        let mut builder = ExpressionBuilder::new();
        Ok(Self {
            multiple_read_operation: MultipleReadInput::new(schema, &mut builder, args)?,
            ..Default::default()
        })
    }
}

/// Single page of a query or a scan.
#[derive(Debug, Default)]
pub(crate) struct Page {
    pub(crate) items: Vec<RawItem>,
    pub(crate) count: i32,
    pub(crate) last_evaluated_key: Option<RawItem>,
}

/// Paged read request.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ReadRequest {
    Query(QueryInput),
    Scan(ScanInput),
}

impl ReadRequest {
    fn exclusive_start_key(&self) -> Option<RawItem> {
        match self {
            Self::Query(query) => query.multiple_read_operation.exclusive_start_key.clone(),
            Self::Scan(scan) => scan.multiple_read_operation.exclusive_start_key.clone(),
        }
    }

    /// Fetches the page starting after `exclusive_start_key`.
    pub(crate) async fn send(
        &self,
        client: &Client,
        exclusive_start_key: Option<RawItem>,
    ) -> Result<Page> {
        match self.clone() {
            Self::Query(query) => {
                let mut multiple_read_operation = query.multiple_read_operation;
                multiple_read_operation.exclusive_start_key = exclusive_start_key;
                let builder = client
                    .query()
                    .key_condition_expression(query.key_condition_expression)
                    .set_scan_index_forward(query.scan_index_forward);
                let output = apply_multiple_read_operation!(builder, multiple_read_operation)
                    .send()
                    .await
                    .map_err(|error| Error::key_value(DisplayErrorContext(error)))?;
                Ok(Page {
                    items: output.items.unwrap_or_default(),
                    count: output.count,
                    last_evaluated_key: output.last_evaluated_key,
                })
            }
            Self::Scan(scan) => {
                let mut multiple_read_operation = scan.multiple_read_operation;
                multiple_read_operation.exclusive_start_key = exclusive_start_key;
                let builder = client
                    .scan()
                    .set_segment(scan.segment)
                    .set_total_segments(scan.total_segments);
                let output = apply_multiple_read_operation!(builder, multiple_read_operation)
                    .send()
                    .await
                    .map_err(|error| Error::key_value(DisplayErrorContext(error)))?;
                Ok(Page {
                    items: output.items.unwrap_or_default(),
                    count: output.count,
                    last_evaluated_key: output.last_evaluated_key,
                })
            }
        }
    }
}

/// Counts the items of every page, stopping once `limit` is reached.
pub(crate) fn count_pages(
    client: &Client,
    runtime: &Runtime,
    request: &ReadRequest,
    limit: Option<u64>,
) -> Result<u64> {
    let mut total: u64 = 0;
    let mut next_key = request.exclusive_start_key();
    loop {
        let page = runtime.block_on(request.send(client, next_key))?;
        total = total.saturating_add(u64::try_from(page.count).unwrap_or_default());
        next_key = page.last_evaluated_key;
        if let Some(limit) = limit {
            if total >= limit {
                return Ok(limit);
            }
        }
        if next_key.is_none() {
            return Ok(total);
        }
    }
}

/// Cursor source fetching pages lazily with the store's own continuation key.
///
/// The position reported mid-page is the key of the last item yielded, so resuming skips exactly
/// the consumed items.
pub(crate) struct PagedSource {
    client: Client,
    runtime: Arc<Runtime>,
    request: ReadRequest,
    schema: Arc<Schema>,
    key_names: Vec<String>,
    buffer: VecDeque<RawItem>,
    next_key: Option<RawItem>,
    position: Option<RawItem>,
    fetched: bool,
    remaining: Option<u64>,
}

impl PagedSource {
    pub(crate) fn new(
        client: Client,
        runtime: Arc<Runtime>,
        request: ReadRequest,
        schema: Arc<Schema>,
        index_name: Option<&str>,
        limit: Option<u64>,
    ) -> Result<Self> {
        let key_names = key_names(&schema, index_name)?;
        let next_key = request.exclusive_start_key();
        Ok(Self {
            client,
            runtime,
            request,
            schema,
            key_names,
            buffer: VecDeque::new(),
            next_key,
            position: None,
            fetched: false,
            remaining: limit,
        })
    }

    fn position_of(&self, item: &RawItem) -> RawItem {
        self.key_names
            .iter()
            .filter_map(|name| Some((name.clone(), item.get(name)?.clone())))
            .collect()
    }
}

impl CursorSource for PagedSource {
    fn next_item(&mut self) -> Option<Result<Item>> {
        loop {
            if self.remaining == Some(0) {
                return None;
            }
            if let Some(item) = self.buffer.pop_front() {
                self.position = Some(self.position_of(&item));
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Some(decode_item(&self.schema, item));
            }
            if self.fetched && self.next_key.is_none() {
                return None;
            }
            let page = self
                .runtime
                .block_on(self.request.send(&self.client, self.next_key.take()));
            self.fetched = true;
            match page {
                Ok(page) => {
                    tracing::debug!(items = page.items.len(), "fetched page");
                    self.next_key = page.last_evaluated_key;
                    self.buffer.extend(page.items);
                }
                Err(error) => return Some(Err(error)),
            }
        }
    }

    fn last_evaluated_key(&self) -> Option<StartKey> {
        let key = if self.buffer.is_empty() {
            self.next_key.clone()
        } else {
            self.position.clone()
        }?;
        match serde_dynamo::from_item(key) {
            Ok(key) => Some(StartKey::Key(key)),
            Err(error) => {
                tracing::warn!(%error, "cannot render continuation key");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::schema::{AttributeType, Field, SecondaryIndex};

    use rstest::rstest;

    fn schema() -> Schema {
        Schema::builder("Events")
            .field(Field::new("customer", AttributeType::Unicode).alias("c").hash_key())
            .field(Field::new("date", AttributeType::Number).alias("d").range_key())
            .field(Field::new("state", AttributeType::Unicode).alias("s"))
            .index(SecondaryIndex::new("s-index", "state").range_key("date"))
            .build()
            .unwrap()
    }

    fn names(pairs: &[(&str, &str)]) -> Option<collections::HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(placeholder, name)| (placeholder.to_string(), name.to_string()))
                .collect(),
        )
    }

    fn s(string: &str) -> types::AttributeValue {
        types::AttributeValue::S(string.to_string())
    }

    fn n(number: &str) -> types::AttributeValue {
        types::AttributeValue::N(number.to_string())
    }

    #[rstest]
    #[case::empty(
        GetOptions::default(),
        SingleReadInput {
            table_name: "Events".to_string(),
            ..Default::default()
        }
    )]
    #[case::full(
        GetOptions {
            consistent_read: Some(true),
            attributes_to_get: Some(vec![Path::new("s")]),
        },
        SingleReadInput {
            consistent_read: Some(true),
            expression_attribute_names: names(&[("#s", "s"), ("#c", "c"), ("#d", "d")]),
            projection_expression: Some("#s, #c, #d".to_string()),
            table_name: "Events".to_string(),
        }
    )]
    fn test_get_item_input(#[case] options: GetOptions, #[case] expected: SingleReadInput) {
        let schema = schema();
        let keys = schema
            .keys(Value::from("x"), Some(Value::from(1)), Flavor::KeyValue)
            .unwrap();
        let input = GetItemInput::new(&schema, &keys, &options).unwrap();
        assert_eq!(
            input.keys,
            collections::HashMap::from([("c".to_string(), s("x")), ("d".to_string(), n("1"))])
        );
        assert_eq!(input.single_read_operation, expected);
    }

    #[rstest]
    #[case::empty(
        Query {
            hash_key: Value::from("x"),
            ..Default::default()
        },
        QueryInput {
            key_condition_expression: "#c = :c_eq0".to_string(),
            multiple_read_operation: MultipleReadInput {
                expression_attribute_names: names(&[("#c", "c")]),
                expression_attribute_values: Some(collections::HashMap::from([(
                    ":c_eq0".to_string(),
                    s("x"),
                )])),
                table_name: "Events".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    )]
    #[case::full(
        Query {
            hash_key: Value::from("open"),
            range_key_condition: Some(Path::new("d").gt(5)),
            filter_condition: Some(Path::new("c").eq("x")),
            index_name: Some("s-index".to_string()),
            scan_index_forward: Some(false),
            limit: Some(10),
            page_size: Some(3),
            attributes_to_get: Some(vec![Path::new("s")]),
            consistent_read: Some(false),
            ..Default::default()
        },
        QueryInput {
            key_condition_expression: "#s = :s_eq0 AND #d > :d_gt1".to_string(),
            multiple_read_operation: MultipleReadInput {
                consistent_read: Some(false),
                expression_attribute_names: names(&[("#s", "s"), ("#d", "d"), ("#c", "c")]),
                expression_attribute_values: Some(collections::HashMap::from([
                    (":s_eq0".to_string(), s("open")),
                    (":d_gt1".to_string(), n("5")),
                    (":c_eq2".to_string(), s("x")),
                ])),
                filter_expression: Some("#c = :c_eq2".to_string()),
                index_name: Some("s-index".to_string()),
                limit: Some(3),
                projection_expression: Some("#s, #c, #d".to_string()),
                table_name: "Events".to_string(),
                ..Default::default()
            },
            scan_index_forward: Some(false),
        }
    )]
    fn test_query_input(#[case] query: Query, #[case] expected: QueryInput) {
        let input = QueryInput::new(&schema(), &query).unwrap();
        assert_eq!(input, expected);
    }

    #[test]
    fn test_query_input_rejects_unknown_index() {
        let query = Query {
            hash_key: Value::from("x"),
            index_name: Some("missing".to_string()),
            ..Default::default()
        };
        let error = QueryInput::new(&schema(), &query).unwrap_err();
        assert_eq!(error.code(), "UNKNOWN_INDEX");
    }

    #[test]
    fn test_scan_input() {
        let mut start = serde_json::Map::new();
        start.insert("c".to_string(), serde_json::json!("x"));
        start.insert("d".to_string(), serde_json::json!(4));
        let scan = Scan {
            filter_condition: Some(Path::new("s").begins_with("op")),
            limit: Some(20),
            last_evaluated_key: Some(StartKey::Key(start)),
            segment: Some(1),
            total_segments: Some(4),
            ..Default::default()
        };
        let input = ScanInput::new(&schema(), &scan).unwrap();
        assert_eq!(
            input,
            ScanInput {
                multiple_read_operation: MultipleReadInput {
                    exclusive_start_key: Some(collections::HashMap::from([
                        ("c".to_string(), s("x")),
                        ("d".to_string(), n("4")),
                    ])),
                    expression_attribute_names: names(&[("#s", "s")]),
                    expression_attribute_values: Some(collections::HashMap::from([(
                        ":s_begins_with0".to_string(),
                        s("op"),
                    )])),
                    filter_expression: Some("begins_with(#s, :s_begins_with0)".to_string()),
                    limit: Some(20),
                    table_name: "Events".to_string(),
                    ..Default::default()
                },
                segment: Some(1),
                total_segments: Some(4),
            }
        );
    }

    #[test]
    fn test_offset_start_key_is_ignored() {
        let scan = Scan {
            last_evaluated_key: Some(StartKey::Offset(3)),
            ..Default::default()
        };
        let input = ScanInput::new(&schema(), &scan).unwrap();
        assert_eq!(input.multiple_read_operation.exclusive_start_key, None);
    }

    #[test]
    fn test_key_names_include_index_keys() {
        let schema = schema();
        assert_eq!(key_names(&schema, None).unwrap(), vec!["c", "d"]);
        assert_eq!(key_names(&schema, Some("s-index")).unwrap(), vec!["c", "d", "s"]);
    }

    #[test]
    fn test_decode_item() {
        let item = collections::HashMap::from([
            ("c".to_string(), s("x")),
            ("d".to_string(), n("2")),
            ("z".to_string(), s("undeclared")),
        ]);
        let item = decode_item(&schema(), item).unwrap();
        assert_eq!(item.get("customer"), Some(&Value::from("x")));
        assert_eq!(item.get("date"), Some(&Value::from(2)));
        assert_eq!(
            item.original().and_then(|original| original.get("z")),
            Some(&Value::from("undeclared"))
        );
        assert!(matches!(item.identity(), Some(Identity::Key(_))));
    }
}
