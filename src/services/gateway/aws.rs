//! AWS gateway: payloads in S3, records in DynamoDB.
//!
//! An endpoint override (LocalStack and friends) is applied to both clients
//! and switches S3 to path-style addressing.

use super::{BlobStore, GatewayError, GatewayResult, RecordFilter, RecordTable};
use crate::models::image::{ImageRecord, ImageStatus, RecordKey};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_dynamodb::{Client as DynamoClient, types::AttributeValue};
use aws_sdk_s3::{
    Client as S3Client, config::Region, error::DisplayErrorContext,
    presigning::PresigningConfig, primitives::ByteStream,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, time::Duration};
use tracing::debug;

type Item = HashMap<String, AttributeValue>;

/// Load the shared SDK config from the default provider chain.
pub async fn load_sdk_config(region: Option<String>, endpoint_url: Option<String>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(r) = region {
        loader = loader.region(Region::new(r));
    }
    if let Some(url) = endpoint_url {
        loader = loader.endpoint_url(url);
    }
    loader.load().await
}

fn sdk_error<E>(operation: &'static str) -> impl FnOnce(E) -> GatewayError
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |err| GatewayError::backend(operation, DisplayErrorContext(err).to_string())
}

pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn from_sdk_config(
        config: &SdkConfig,
        bucket: impl Into<String>,
        force_path_style: bool,
    ) -> Self {
        let s3_config = aws_sdk_s3::config::Builder::from(config)
            .force_path_style(force_path_style)
            .build();
        Self::new(S3Client::from_conf(s3_config), bucket)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        owner_id: &str,
        content_type: &str,
    ) -> GatewayResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .metadata("userId", owner_id)
            .send()
            .await
            .map_err(sdk_error("s3 PutObject"))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> GatewayResult<()> {
        // S3 answers 204 for keys that do not exist.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(sdk_error("s3 DeleteObject"))?;
        Ok(())
    }

    async fn access_url(&self, key: &str, ttl: Duration) -> GatewayResult<String> {
        let presigning =
            PresigningConfig::expires_in(ttl).map_err(|e| GatewayError::backend("s3 presign", e))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(sdk_error("s3 GetObject presign"))?;

        debug!(bucket = %self.bucket, key = %key, ttl_secs = ttl.as_secs(), "presigned GET url");
        Ok(presigned.uri().to_string())
    }

    async fn ping(&self) -> GatewayResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(sdk_error("s3 HeadBucket"))?;
        Ok(())
    }
}

pub struct DynamoRecordTable {
    client: DynamoClient,
    table: String,
}

impl DynamoRecordTable {
    pub fn new(client: DynamoClient, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    pub fn from_sdk_config(config: &SdkConfig, table: impl Into<String>) -> Self {
        Self::new(DynamoClient::new(config), table)
    }
}

fn key_item(key: &RecordKey) -> Item {
    HashMap::from([
        ("imageId".to_string(), AttributeValue::S(key.image_id.clone())),
        ("userId".to_string(), AttributeValue::S(key.user_id.clone())),
    ])
}

fn record_to_item(record: &ImageRecord) -> Item {
    let mut item = key_item(&record.key());
    let mut put = |name: &str, value: AttributeValue| {
        item.insert(name.to_string(), value);
    };
    put("fileName", AttributeValue::S(record.file_name.clone()));
    put("contentType", AttributeValue::S(record.content_type.clone()));
    put("s3Key", AttributeValue::S(record.s3_key.clone()));
    put("status", AttributeValue::S(record.status.as_str().to_string()));
    put("description", AttributeValue::S(record.description.clone()));
    if let Some(title) = &record.title {
        put("title", AttributeValue::S(title.clone()));
    }
    put(
        "tags",
        AttributeValue::L(record.tags.iter().cloned().map(AttributeValue::S).collect()),
    );
    put("sizeBytes", AttributeValue::N(record.size_bytes.to_string()));
    put("createdAt", AttributeValue::S(record.created_at.to_rfc3339()));
    item
}

fn optional_string(item: &Item, name: &str) -> Option<String> {
    match item.get(name) {
        Some(AttributeValue::S(s)) => Some(s.clone()),
        _ => None,
    }
}

fn required_string(item: &Item, name: &str) -> GatewayResult<String> {
    optional_string(item, name)
        .ok_or_else(|| GatewayError::MalformedRecord(format!("missing string attribute `{}`", name)))
}

/// Items written by older tooling may lack the newer attributes; those fall
/// back to defaults rather than failing the whole read.
fn item_to_record(item: &Item) -> GatewayResult<ImageRecord> {
    let status = match optional_string(item, "status") {
        Some(s) => s.parse().map_err(GatewayError::MalformedRecord)?,
        None => ImageStatus::Active,
    };

    let tags = match item.get("tags") {
        Some(AttributeValue::L(values)) => values
            .iter()
            .filter_map(|v| v.as_s().ok().cloned())
            .collect(),
        Some(AttributeValue::Ss(values)) => values.clone(),
        _ => Vec::new(),
    };

    let size_bytes = match item.get("sizeBytes") {
        Some(AttributeValue::N(n)) => n
            .parse()
            .map_err(|_| GatewayError::MalformedRecord(format!("bad sizeBytes `{}`", n)))?,
        _ => 0,
    };

    let created_at = match optional_string(item, "createdAt") {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map_err(|_| GatewayError::MalformedRecord(format!("bad createdAt `{}`", raw)))?
            .with_timezone(&Utc),
        None => DateTime::<Utc>::UNIX_EPOCH,
    };

    Ok(ImageRecord {
        image_id: required_string(item, "imageId")?,
        user_id: required_string(item, "userId")?,
        file_name: optional_string(item, "fileName").unwrap_or_default(),
        content_type: optional_string(item, "contentType").unwrap_or_default(),
        s3_key: required_string(item, "s3Key")?,
        status,
        description: optional_string(item, "description").unwrap_or_default(),
        title: optional_string(item, "title"),
        tags,
        size_bytes,
        created_at,
    })
}

/// Filter expression, attribute names and values for a scan.
///
/// `contains()` on a DynamoDB list tests element equality, not substring, so
/// the tag predicate is left to [`RecordFilter::matches`] on the results.
fn scan_expression(filter: &RecordFilter) -> (String, HashMap<String, String>, Item) {
    let mut clauses = vec!["#userId = :userId"];
    let mut names = HashMap::from([("#userId".to_string(), "userId".to_string())]);
    let mut values = HashMap::from([(
        ":userId".to_string(),
        AttributeValue::S(filter.user_id.clone()),
    )]);

    if let Some(title) = &filter.title {
        clauses.push("contains(#title, :title)");
        names.insert("#title".to_string(), "title".to_string());
        values.insert(":title".to_string(), AttributeValue::S(title.clone()));
    }

    (clauses.join(" AND "), names, values)
}

#[async_trait]
impl RecordTable for DynamoRecordTable {
    async fn put_record(&self, record: &ImageRecord) -> GatewayResult<()> {
        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(record_to_item(record)))
            .send()
            .await
            .map_err(sdk_error("dynamodb PutItem"))?;
        Ok(())
    }

    async fn get_record(&self, key: &RecordKey) -> GatewayResult<Option<ImageRecord>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .set_key(Some(key_item(key)))
            .send()
            .await
            .map_err(sdk_error("dynamodb GetItem"))?;

        output.item().map(item_to_record).transpose()
    }

    async fn delete_record(&self, key: &RecordKey) -> GatewayResult<()> {
        self.client
            .delete_item()
            .table_name(&self.table)
            .set_key(Some(key_item(key)))
            .send()
            .await
            .map_err(sdk_error("dynamodb DeleteItem"))?;
        Ok(())
    }

    async fn scan_records(&self, filter: &RecordFilter) -> GatewayResult<Vec<ImageRecord>> {
        let (expression, names, values) = scan_expression(filter);
        let mut records = Vec::new();
        let mut start_key: Option<Item> = None;
        let mut pages = 0usize;

        loop {
            let output = self
                .client
                .scan()
                .table_name(&self.table)
                .filter_expression(&expression)
                .set_expression_attribute_names(Some(names.clone()))
                .set_expression_attribute_values(Some(values.clone()))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(sdk_error("dynamodb Scan"))?;
            pages += 1;

            for item in output.items() {
                let record = item_to_record(item)?;
                if filter.matches(&record) {
                    records.push(record);
                }
            }

            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        debug!(table = %self.table, pages, matched = records.len(), "scan complete");
        Ok(records)
    }

    async fn ping(&self) -> GatewayResult<()> {
        self.client
            .describe_table()
            .table_name(&self.table)
            .send()
            .await
            .map_err(sdk_error("dynamodb DescribeTable"))?;
        Ok(())
    }
}
