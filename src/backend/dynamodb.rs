//! Key-value store backend over DynamoDB.
//!
//! Requests are rendered into expression strings with `#name` and `:value` placeholders and sent
//! through the AWS SDK. The SDK is asynchronous: the backend owns a small runtime and blocks on
//! every call, so it must not be used from inside another Tokio runtime.

mod expression;
mod read;
mod write;

use self::{
    read::{
        GetItemInput, MultipleReadArgs, PagedSource, QueryInput, ReadRequest, ScanInput,
        apply_single_read_operation, count_pages, decode_item, key_item, key_names,
        projection_paths,
    },
    write::{
        BATCH_WRITE_SIZE, DeleteItemInput, PutItemInput, UpdateItemInput, apply_write_operation,
    },
};
use super::{
    Backend, BackendKind, BatchWriteFailure, BatchWriteOutcome, Count, GetOptions, Query, Scan,
    Target, WriteRequest,
};
use crate::{
    common::{condition::Condition, key::Keys, path::Path, update::Action},
    cursor::ResultCursor,
    error::{Error, Result},
    item::{Identity, Item},
    schema::{Map, Schema},
};

use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::{Client, config::Region, error::DisplayErrorContext, types};
use tokio::runtime::{self, Runtime};

use std::{sync::Arc, thread, time::Duration};

/// Maximum number of keys of a single batch get call.
const BATCH_GET_SIZE: usize = 100;

/// Attempts at sending unprocessed batch requests before reporting them.
const MAX_BATCH_ATTEMPTS: u32 = 5;

const BATCH_BACKOFF: Duration = Duration::from_millis(50);

/// Backend over a DynamoDB client.
#[derive(Clone, Debug)]
pub struct KeyValueBackend {
    client: Client,
    runtime: Arc<Runtime>,
}

impl KeyValueBackend {
    /// Backend over an existing client.
    pub fn new(client: Client) -> Result<Self> {
        Ok(Self {
            client,
            runtime: Arc::new(build_runtime()?),
        })
    }

    /// Backend over a client configured from the environment, optionally in a fixed region.
    pub fn from_env(region: Option<String>) -> Result<Self> {
        let runtime = build_runtime()?;
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let config = runtime.block_on(loader.load());
        tracing::info!(region = ?config.region(), "key-value store client configured");
        Ok(Self {
            client: Client::new(&config),
            runtime: Arc::new(runtime),
        })
    }

    /// Underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn cursor(
        &self,
        schema: &Arc<Schema>,
        request: ReadRequest,
        index_name: Option<&str>,
        limit: Option<u64>,
    ) -> Result<ResultCursor> {
        let source = PagedSource::new(
            self.client.clone(),
            Arc::clone(&self.runtime),
            request,
            Arc::clone(schema),
            index_name,
            limit,
        )?;
        Ok(ResultCursor::new(source))
    }
}

fn build_runtime() -> Result<Runtime> {
    Ok(runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("modular-sdk-dynamodb")
        .enable_all()
        .build()?)
}

fn conditional_check_failed(schema: &Schema) -> Error {
    Error::ConditionalCheckFailed {
        table: schema.table_name().to_string(),
    }
}

impl Backend for KeyValueBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::KeyValue
    }

    #[tracing::instrument(name = "modular_sdk.get", skip_all, fields(table = schema.table_name()), err)]
    fn get(
        &self,
        schema: &Schema,
        target: Target<'_>,
        options: &GetOptions,
    ) -> Result<Option<Item>> {
        let get_item = GetItemInput::new(schema, target.keys, options)?;
        let builder = self.client.get_item().set_key(Some(get_item.keys));
        let output = self
            .runtime
            .block_on(apply_single_read_operation!(builder, get_item.single_read_operation).send())
            .map_err(|error| Error::key_value(DisplayErrorContext(error)))?;
        output
            .item
            .filter(|item| !item.is_empty())
            .map(|item| decode_item(schema, item))
            .transpose()
    }

    #[tracing::instrument(name = "modular_sdk.put", skip_all, fields(table = schema.table_name()), err)]
    fn put(
        &self,
        schema: &Schema,
        target: Target<'_>,
        raw: &Map,
        condition: Option<&Condition>,
    ) -> Result<Identity> {
        let put_item = PutItemInput::new(schema.table_name(), raw, condition)?;
        let builder = self.client.put_item().set_item(Some(put_item.item));
        self.runtime
            .block_on(apply_write_operation!(builder, put_item.write_operation).send())
            .map_err(|error| {
                if error
                    .as_service_error()
                    .is_some_and(|error| error.is_conditional_check_failed_exception())
                {
                    conditional_check_failed(schema)
                } else {
                    Error::key_value(DisplayErrorContext(error))
                }
            })?;
        Ok(Identity::Key(target.keys.clone()))
    }

    #[tracing::instrument(name = "modular_sdk.update", skip_all, fields(table = schema.table_name()), err)]
    fn update(
        &self,
        schema: &Schema,
        target: Target<'_>,
        actions: &[Action],
        condition: Option<&Condition>,
    ) -> Result<Item> {
        let update_item =
            UpdateItemInput::new(schema.table_name(), target.keys, actions, condition)?;
        let builder = self
            .client
            .update_item()
            .set_key(Some(update_item.keys))
            .update_expression(update_item.update_expression);
        let output = self
            .runtime
            .block_on(apply_write_operation!(builder, update_item.write_operation).send())
            .map_err(|error| {
                if error
                    .as_service_error()
                    .is_some_and(|error| error.is_conditional_check_failed_exception())
                {
                    conditional_check_failed(schema)
                } else {
                    Error::key_value(DisplayErrorContext(error))
                }
            })?;
        let attributes = output
            .attributes
            .ok_or_else(|| Error::KeyValue("update returned no attributes".to_string()))?;
        decode_item(schema, attributes)
    }

    #[tracing::instrument(name = "modular_sdk.delete", skip_all, fields(table = schema.table_name()), err)]
    fn delete(
        &self,
        schema: &Schema,
        target: Target<'_>,
        condition: Option<&Condition>,
    ) -> Result<()> {
        let delete_item = DeleteItemInput::new(schema.table_name(), target.keys, condition)?;
        let builder = self.client.delete_item().set_key(Some(delete_item.keys));
        self.runtime
            .block_on(apply_write_operation!(builder, delete_item.write_operation).send())
            .map_err(|error| {
                if error
                    .as_service_error()
                    .is_some_and(|error| error.is_conditional_check_failed_exception())
                {
                    conditional_check_failed(schema)
                } else {
                    Error::key_value(DisplayErrorContext(error))
                }
            })?;
        Ok(())
    }

    #[tracing::instrument(name = "modular_sdk.query", skip_all, fields(table = schema.table_name()), err)]
    fn query(&self, schema: &Arc<Schema>, query: Query) -> Result<ResultCursor> {
        let input = QueryInput::new(schema, &query)?;
        self.cursor(
            schema,
            ReadRequest::Query(input),
            query.index_name.as_deref(),
            query.limit,
        )
    }

    #[tracing::instrument(name = "modular_sdk.scan", skip_all, fields(table = schema.table_name()), err)]
    fn scan(&self, schema: &Arc<Schema>, scan: Scan) -> Result<ResultCursor> {
        let input = ScanInput::new(schema, &scan)?;
        self.cursor(
            schema,
            ReadRequest::Scan(input),
            scan.index_name.as_deref(),
            scan.limit,
        )
    }

    #[tracing::instrument(name = "modular_sdk.count", skip_all, fields(table = schema.table_name()), err)]
    fn count(&self, schema: &Schema, count: Count) -> Result<u64> {
        let select = types::Select::Count;
        let args = MultipleReadArgs {
            consistent_read: count.consistent_read,
            index_name: count.index_name.as_deref(),
            select: Some(&select),
            ..Default::default()
        };
        let request = match &count.hash_key {
            Some(hash_key) => {
                let args = MultipleReadArgs {
                    filter: count.filter_condition.as_ref(),
                    ..args
                };
                ReadRequest::Query(QueryInput::with_args(
                    schema,
                    hash_key,
                    count.range_key_condition.as_ref(),
                    args,
                )?)
            }
            None => {
                let filter = Condition::all([
                    count.range_key_condition.clone(),
                    count.filter_condition.clone(),
                ]);
                let args = MultipleReadArgs {
                    filter: filter.as_ref(),
                    ..args
                };
                ReadRequest::Scan(ScanInput::with_args(schema, args)?)
            }
        };
        count_pages(&self.client, &self.runtime, &request, count.limit)
    }

    #[tracing::instrument(name = "modular_sdk.batch_get", skip_all, fields(table = schema.table_name()), err)]
    fn batch_get(
        &self,
        schema: &Schema,
        keys: &[Keys],
        attributes_to_get: Option<&[Path]>,
    ) -> Result<Vec<Item>> {
        let projection = projection_paths(&key_names(schema, None)?, attributes_to_get)
            .map(|paths| expression::ExpressionBuilder::new().projection(&paths));
        let mut items = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(BATCH_GET_SIZE) {
            let chunk_keys = chunk.iter().map(key_item).collect::<Result<Vec<_>>>()?;
            let mut pending = types::KeysAndAttributes::builder()
                .set_keys(Some(chunk_keys))
                .set_projection_expression(projection.as_ref().map(|p| p.expression.clone()))
                .set_expression_attribute_names(
                    projection
                        .as_ref()
                        .map(|p| p.expression_attribute_names.clone()),
                )
                .build()
                .map_err(Error::key_value)?;
            for attempt in 1..=MAX_BATCH_ATTEMPTS {
                let output = self
                    .runtime
                    .block_on(
                        self.client
                            .batch_get_item()
                            .request_items(schema.table_name(), pending.clone())
                            .send(),
                    )
                    .map_err(|error| Error::key_value(DisplayErrorContext(error)))?;
                let mut responses = output.responses.unwrap_or_default();
                for item in responses.remove(schema.table_name()).unwrap_or_default() {
                    items.push(decode_item(schema, item)?);
                }
                match output
                    .unprocessed_keys
                    .and_then(|mut unprocessed| unprocessed.remove(schema.table_name()))
                {
                    Some(unprocessed) if !unprocessed.keys().is_empty() => {
                        if attempt == MAX_BATCH_ATTEMPTS {
                            return Err(Error::KeyValue(format!(
                                "{} key(s) left unprocessed by batch get",
                                unprocessed.keys().len()
                            )));
                        }
                        tracing::debug!(
                            unprocessed = unprocessed.keys().len(),
                            attempt,
                            "retrying unprocessed keys"
                        );
                        pending = unprocessed;
                        thread::sleep(BATCH_BACKOFF * attempt);
                    }
                    _ => break,
                }
            }
        }
        Ok(items)
    }

    #[tracing::instrument(name = "modular_sdk.batch_write", skip_all, fields(table = schema.table_name()), err)]
    fn batch_write(
        &self,
        schema: &Schema,
        requests: Vec<WriteRequest>,
    ) -> Result<BatchWriteOutcome> {
        let mut outcome = BatchWriteOutcome::default();
        let mut offset = 0;
        for chunk in requests.chunks(BATCH_WRITE_SIZE) {
            let mut pending: Vec<(usize, types::WriteRequest)> = Vec::with_capacity(chunk.len());
            for (position, request) in chunk.iter().enumerate() {
                let index = offset + position;
                match types::WriteRequest::try_from(request) {
                    Ok(request) => pending.push((index, request)),
                    Err(error) => outcome.failed.push(BatchWriteFailure { index, error }),
                }
            }
            offset += chunk.len();
            let mut attempt = 0;
            while !pending.is_empty() {
                attempt += 1;
                let sent = pending.iter().map(|(_, request)| request.clone()).collect();
                let result = self.runtime.block_on(
                    self.client
                        .batch_write_item()
                        .request_items(schema.table_name(), sent)
                        .send(),
                );
                let unprocessed = match result {
                    Ok(output) => output
                        .unprocessed_items
                        .and_then(|mut unprocessed| unprocessed.remove(schema.table_name()))
                        .unwrap_or_default(),
                    Err(error) => {
                        let message = DisplayErrorContext(error).to_string();
                        for (index, _) in pending.drain(..) {
                            outcome.failed.push(BatchWriteFailure {
                                index,
                                error: Error::KeyValue(message.clone()),
                            });
                        }
                        break;
                    }
                };
                let (left, done): (Vec<_>, Vec<_>) = pending
                    .drain(..)
                    .partition(|(_, request)| unprocessed.contains(request));
                outcome.written += done.len();
                if left.is_empty() {
                    break;
                }
                if attempt >= MAX_BATCH_ATTEMPTS {
                    for (index, _) in left {
                        outcome.failed.push(BatchWriteFailure {
                            index,
                            error: Error::KeyValue("left unprocessed by batch write".to_string()),
                        });
                    }
                    break;
                }
                tracing::debug!(unprocessed = left.len(), attempt, "retrying unprocessed requests");
                pending = left;
                thread::sleep(BATCH_BACKOFF * attempt);
            }
        }
        tracing::debug!(
            written = outcome.written,
            failed = outcome.failed.len(),
            "batch write applied"
        );
        Ok(outcome)
    }

    #[tracing::instrument(name = "modular_sdk.exists", skip_all, fields(table = schema.table_name()), err)]
    fn exists(&self, schema: &Schema) -> Result<bool> {
        let result = self.runtime.block_on(
            self.client
                .describe_table()
                .table_name(schema.table_name())
                .send(),
        );
        match result {
            Ok(_) => Ok(true),
            Err(error)
                if error
                    .as_service_error()
                    .is_some_and(|error| error.is_resource_not_found_exception()) =>
            {
                Ok(false)
            }
            Err(error) => Err(Error::key_value(DisplayErrorContext(error))),
        }
    }

    #[tracing::instrument(name = "modular_sdk.delete_table", skip_all, fields(table = schema.table_name()), err)]
    fn delete_table(&self, schema: &Schema) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .delete_table()
                    .table_name(schema.table_name())
                    .send(),
            )
            .map_err(|error| Error::key_value(DisplayErrorContext(error)))?;
        tracing::info!("table deleted");
        Ok(())
    }
}
