//! DynamoDB-backed store.
//!
//! Table layout: `BatchIndex` (N, hash key), `subject_timepoint` (S, range
//! key), and one numeric 0/1 attribute per flag.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, KeySchemaElement, KeyType, ProvisionedThroughput,
    PutRequest, ScalarAttributeType, TableStatus, WriteRequest,
};
use tracing::{debug, info};

use super::{ScanPage, WorkItemStore};
use crate::error::{Error, Result};
use crate::model::{Flag, GroupKey, ItemRef, Projection, ScanQuery, ScanRow, Stage, WorkItem};

pub const GROUP_ATTR: &str = "BatchIndex";
pub const ITEM_ATTR: &str = "subject_timepoint";
pub const IN_PROGRESS_ATTR: &str = "InProcessing";

/// Most put requests one `BatchWriteItem` call accepts.
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;

const THROTTLING_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
    "InternalServerError",
];

const TABLE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const TABLE_POLL_ATTEMPTS: u32 = 90;

/// Stored attribute name of a flag.
pub fn flag_attribute(flag: Flag) -> &'static str {
    match flag {
        Flag::InProgress => IN_PROGRESS_ATTR,
        Flag::Stage(Stage::Segmented) => "Segmented",
        Flag::Stage(Stage::Parcellated) => "Parcellated",
    }
}

pub struct DynamoStore {
    client: Client,
    table: String,
    read_capacity: i64,
    write_capacity: i64,
}

impl DynamoStore {
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
            read_capacity: 100,
            write_capacity: 100,
        }
    }

    pub fn with_capacity(mut self, read: i64, write: i64) -> Self {
        self.read_capacity = read;
        self.write_capacity = write;
        self
    }

    async fn table_status(&self) -> Result<Option<TableStatus>> {
        match self
            .client
            .describe_table()
            .table_name(&self.table)
            .send()
            .await
        {
            Ok(output) => Ok(output.table().and_then(|t| t.table_status()).cloned()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                Ok(None)
            }
            Err(e) => Err(store_error("describe_table", e)),
        }
    }

    async fn create_table(&self) -> Result<()> {
        let hash = KeySchemaElement::builder()
            .attribute_name(GROUP_ATTR)
            .key_type(KeyType::Hash)
            .build()
            .map_err(build_error)?;
        let range = KeySchemaElement::builder()
            .attribute_name(ITEM_ATTR)
            .key_type(KeyType::Range)
            .build()
            .map_err(build_error)?;
        let group_def = AttributeDefinition::builder()
            .attribute_name(GROUP_ATTR)
            .attribute_type(ScalarAttributeType::N)
            .build()
            .map_err(build_error)?;
        let item_def = AttributeDefinition::builder()
            .attribute_name(ITEM_ATTR)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(build_error)?;
        let throughput = ProvisionedThroughput::builder()
            .read_capacity_units(self.read_capacity)
            .write_capacity_units(self.write_capacity)
            .build()
            .map_err(build_error)?;

        self.client
            .create_table()
            .table_name(&self.table)
            .key_schema(hash)
            .key_schema(range)
            .attribute_definitions(group_def)
            .attribute_definitions(item_def)
            .provisioned_throughput(throughput)
            .send()
            .await
            .map_err(|e| store_error("create_table", e))?;
        info!(table = %self.table, "tracking table created");
        Ok(())
    }
}

#[async_trait]
impl WorkItemStore for DynamoStore {
    async fn ensure_table(&self) -> Result<()> {
        if self.table_status().await?.is_none() {
            self.create_table().await?;
        }

        for _ in 0..TABLE_POLL_ATTEMPTS {
            match self.table_status().await? {
                Some(TableStatus::Active) => return Ok(()),
                status => {
                    debug!(table = %self.table, ?status, "waiting for table");
                    tokio::time::sleep(TABLE_POLL_INTERVAL).await;
                }
            }
        }
        Err(Error::TransientStore(format!(
            "table {} did not become active",
            self.table
        )))
    }

    async fn write_batch(&self, items: &[WorkItem]) -> Result<Vec<WorkItem>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let requests = items
            .iter()
            .map(|item| {
                let put = PutRequest::builder()
                    .set_item(Some(item_attributes(item)))
                    .build()
                    .map_err(build_error)?;
                Ok(WriteRequest::builder().put_request(put).build())
            })
            .collect::<Result<Vec<_>>>()?;

        let output = self
            .client
            .batch_write_item()
            .request_items(self.table.clone(), requests)
            .send()
            .await
            .map_err(|e| store_error("batch_write_item", e))?;

        let unprocessed: HashSet<ItemRef> = output
            .unprocessed_items()
            .and_then(|tables| tables.get(&self.table))
            .map(|requests| {
                requests
                    .iter()
                    .filter_map(|r| r.put_request())
                    .filter_map(|put| key_from_attributes(put.item()).ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(items
            .iter()
            .filter(|item| unprocessed.contains(&item.key()))
            .cloned()
            .collect())
    }

    async fn scan_page(
        &self,
        query: &ScanQuery,
        start: Option<ItemRef>,
        limit: usize,
    ) -> Result<ScanPage> {
        let expr = ScanExpression::build(query);
        let mut request = self
            .client
            .scan()
            .table_name(&self.table)
            .consistent_read(true)
            .limit(i32::try_from(limit.max(1)).unwrap_or(i32::MAX))
            .projection_expression(expr.projection)
            .set_expression_attribute_names(Some(expr.names));
        if let Some(filter) = expr.filter {
            request = request
                .filter_expression(filter)
                .set_expression_attribute_values(Some(expr.values));
        }
        if let Some(key) = start {
            request = request.set_exclusive_start_key(Some(key_attributes(&key)));
        }

        let output = request
            .send()
            .await
            .map_err(|e| store_error("scan", e))?;

        let rows = output
            .items()
            .iter()
            .map(|attrs| row_from_attributes(attrs, query.projection))
            .collect::<Result<Vec<_>>>()?;
        let next = output
            .last_evaluated_key()
            .map(key_from_attributes)
            .transpose()?;

        Ok(ScanPage { rows, next })
    }

    async fn set_flag(&self, key: &ItemRef, flag: Flag, value: bool) -> Result<()> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table)
            .set_key(Some(key_attributes(key)))
            .update_expression("SET #f = :v")
            .condition_expression("attribute_exists(#g)")
            .expression_attribute_names("#f", flag_attribute(flag))
            .expression_attribute_names("#g", GROUP_ATTR)
            .expression_attribute_values(":v", bool_attribute(value))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Err(Error::NotFound(key.to_string()))
            }
            Err(e) => Err(store_error("update_item", e)),
        }
    }
}

/// Filter, projection and placeholder maps for one scan.
struct ScanExpression {
    filter: Option<String>,
    projection: String,
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl ScanExpression {
    fn build(query: &ScanQuery) -> Self {
        let mut names = HashMap::from([("#g".to_string(), GROUP_ATTR.to_string())]);
        let mut values = HashMap::new();
        let mut clauses = Vec::new();

        if let Some(group) = query.group {
            clauses.push("#g = :g".to_string());
            values.insert(":g".to_string(), AttributeValue::N(group.to_string()));
        }
        for (n, &(flag, value)) in query.conditions.iter().enumerate() {
            names.insert(format!("#f{n}"), flag_attribute(flag).to_string());
            values.insert(format!(":f{n}"), bool_attribute(value));
            clauses.push(format!("#f{n} = :f{n}"));
        }

        let projection = match query.projection {
            Projection::Keys => {
                names.insert("#i".to_string(), ITEM_ATTR.to_string());
                "#g, #i".to_string()
            }
            Projection::GroupKey => "#g".to_string(),
        };

        Self {
            filter: (!clauses.is_empty()).then(|| clauses.join(" AND ")),
            projection,
            names,
            values,
        }
    }
}

fn bool_attribute(value: bool) -> AttributeValue {
    AttributeValue::N(if value { "1" } else { "0" }.to_string())
}

fn key_attributes(key: &ItemRef) -> HashMap<String, AttributeValue> {
    HashMap::from([
        (
            GROUP_ATTR.to_string(),
            AttributeValue::N(key.group_key.to_string()),
        ),
        (ITEM_ATTR.to_string(), AttributeValue::S(key.item_key.clone())),
    ])
}

fn item_attributes(item: &WorkItem) -> HashMap<String, AttributeValue> {
    let mut attrs = key_attributes(&item.key());
    attrs.insert(
        IN_PROGRESS_ATTR.to_string(),
        bool_attribute(item.in_progress),
    );
    for stage in Stage::ALL {
        attrs.insert(
            flag_attribute(Flag::Stage(stage)).to_string(),
            bool_attribute(item.stages.get(stage)),
        );
    }
    attrs
}

fn group_from_attributes(attrs: &HashMap<String, AttributeValue>) -> Result<GroupKey> {
    // Tables imported from CSV store every column as a string.
    let raw = match attrs.get(GROUP_ATTR) {
        Some(AttributeValue::N(n)) | Some(AttributeValue::S(n)) => n,
        _ => return Err(Error::Other(format!("record missing {GROUP_ATTR}"))),
    };
    raw.parse()
}

fn key_from_attributes(attrs: &HashMap<String, AttributeValue>) -> Result<ItemRef> {
    let group_key = group_from_attributes(attrs)?;
    let item_key = attrs
        .get(ITEM_ATTR)
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| Error::Other(format!("record missing {ITEM_ATTR}")))?;
    Ok(ItemRef::new(group_key, item_key.clone()))
}

fn row_from_attributes(
    attrs: &HashMap<String, AttributeValue>,
    projection: Projection,
) -> Result<ScanRow> {
    match projection {
        Projection::Keys => {
            let key = key_from_attributes(attrs)?;
            Ok(ScanRow {
                group_key: key.group_key,
                item_key: Some(key.item_key),
            })
        }
        Projection::GroupKey => Ok(ScanRow {
            group_key: group_from_attributes(attrs)?,
            item_key: None,
        }),
    }
}

fn build_error(e: aws_sdk_dynamodb::error::BuildError) -> Error {
    Error::Other(format!("invalid dynamodb request: {e}"))
}

/// Map an SDK failure to a store error, marking throttling as transient.
fn store_error<E, R>(operation: &str, err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let transient = matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)
    ) || err
        .as_service_error()
        .and_then(|se| se.code())
        .is_some_and(|code| THROTTLING_CODES.contains(&code));

    let message = format!("{operation}: {}", DisplayErrorContext(&err));
    if transient {
        Error::TransientStore(message)
    } else {
        Error::Other(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_expression_uses_only_referenced_names() {
        let query = ScanQuery::all()
            .in_group(GroupKey(4))
            .with(Flag::InProgress, false)
            .with(Flag::Stage(Stage::Segmented), false)
            .project(Projection::GroupKey);
        let expr = ScanExpression::build(&query);

        assert_eq!(
            expr.filter.as_deref(),
            Some("#g = :g AND #f0 = :f0 AND #f1 = :f1")
        );
        assert_eq!(expr.projection, "#g");
        assert_eq!(expr.names.len(), 3);
        assert_eq!(expr.names["#f0"], IN_PROGRESS_ATTR);
        assert_eq!(expr.names["#f1"], "Segmented");
        assert_eq!(expr.values[":g"], AttributeValue::N("4".to_string()));
    }

    #[test]
    fn unfiltered_scan_has_no_filter_or_values() {
        let expr = ScanExpression::build(&ScanQuery::all());
        assert!(expr.filter.is_none());
        assert!(expr.values.is_empty());
        assert_eq!(expr.projection, "#g, #i");
    }

    #[test]
    fn item_attributes_round_trip_keys() {
        let mut item = WorkItem::new(GroupKey(7), "NDAR_1_baseline");
        item.stages.segmented = true;
        let attrs = item_attributes(&item);

        assert_eq!(attrs["Segmented"], AttributeValue::N("1".to_string()));
        assert_eq!(attrs["Parcellated"], AttributeValue::N("0".to_string()));
        assert_eq!(key_from_attributes(&attrs).unwrap(), item.key());
    }

    #[test]
    fn string_group_keys_from_csv_imports_parse() {
        let attrs = HashMap::from([
            (GROUP_ATTR.to_string(), AttributeValue::S("12".to_string())),
            (ITEM_ATTR.to_string(), AttributeValue::S("X_1".to_string())),
        ]);
        assert_eq!(key_from_attributes(&attrs).unwrap().group_key, GroupKey(12));
    }
}
