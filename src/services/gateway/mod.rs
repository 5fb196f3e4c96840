//! Storage gateway: the two external stores behind named operations.
//!
//! [`BlobStore`] holds image bytes, [`RecordTable`] holds one
//! [`ImageRecord`] per `(image_id, user_id)`. Each trait has one
//! implementation per backing store:
//!
//! - [`memory`]: in-process maps (tests, throwaway dev runs)
//! - [`local`]: sharded files on disk + SQLite
//! - [`aws`]: S3 + DynamoDB

pub mod aws;
pub mod local;
pub mod memory;

use crate::models::image::{ImageRecord, RecordKey};
use async_trait::async_trait;
use bytes::Bytes;
use std::{io, time::Duration};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("{operation} failed: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: BoxError,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn backend(operation: &'static str, source: impl Into<BoxError>) -> Self {
        GatewayError::Backend {
            operation,
            source: source.into(),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Object storage for image payloads. The bucket is fixed at construction.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `key`, tagging the object with its owner.
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        owner_id: &str,
        content_type: &str,
    ) -> GatewayResult<()>;

    /// Remove the object at `key`. An already absent object is not an error.
    async fn delete_object(&self, key: &str) -> GatewayResult<()>;

    /// Time-bounded read URL for `key`. Existence is not checked.
    async fn access_url(&self, key: &str, ttl: Duration) -> GatewayResult<String>;

    /// Cheap connectivity check for readiness probes.
    async fn ping(&self) -> GatewayResult<()>;
}

/// Key-value table of image records. The table is fixed at construction.
#[async_trait]
pub trait RecordTable: Send + Sync {
    /// Insert or overwrite unconditionally.
    async fn put_record(&self, record: &ImageRecord) -> GatewayResult<()>;

    async fn get_record(&self, key: &RecordKey) -> GatewayResult<Option<ImageRecord>>;

    /// Remove the record. An already absent record is not an error.
    async fn delete_record(&self, key: &RecordKey) -> GatewayResult<()>;

    /// All records accepted by `filter`, in no particular order.
    async fn scan_records(&self, filter: &RecordFilter) -> GatewayResult<Vec<ImageRecord>>;

    async fn ping(&self) -> GatewayResult<()>;
}

/// Conjunctive scan filter: owner equality, plus optional substring matches
/// on the title and on any tag.
///
/// [`RecordFilter::matches`] is the reference semantics; backends may push
/// part of it down to the store but must return exactly the records it
/// accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub user_id: String,
    pub title: Option<String>,
    pub tag: Option<String>,
}

impl RecordFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Blank values leave the filter unchanged.
    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title.filter(|t| !t.trim().is_empty());
        self
    }

    /// Blank values leave the filter unchanged.
    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn matches(&self, record: &ImageRecord) -> bool {
        if record.user_id != self.user_id {
            return false;
        }
        if let Some(title) = &self.title {
            match &record.title {
                Some(t) if t.contains(title.as_str()) => {}
                _ => return false,
            }
        }
        if let Some(tag) = &self.tag {
            if !record.tags.iter().any(|t| t.contains(tag.as_str())) {
                return false;
            }
        }
        true
    }
}
