//! In-process gateway backed by maps. Nothing survives a restart.

use super::{BlobStore, GatewayResult, RecordFilter, RecordTable};
use crate::models::image::{ImageRecord, RecordKey};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub owner_id: String,
    pub content_type: String,
}

pub struct MemoryBlobStore {
    bucket: String,
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub async fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().await.get(key).cloned()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        owner_id: &str,
        content_type: &str,
    ) -> GatewayResult<()> {
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                bytes,
                owner_id: owner_id.to_string(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> GatewayResult<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn access_url(&self, key: &str, ttl: Duration) -> GatewayResult<String> {
        Ok(format!(
            "memory://{}/{}?expires_in={}",
            self.bucket,
            key,
            ttl.as_secs()
        ))
    }

    async fn ping(&self) -> GatewayResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRecordTable {
    records: RwLock<BTreeMap<RecordKey, ImageRecord>>,
}

impl MemoryRecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl RecordTable for MemoryRecordTable {
    async fn put_record(&self, record: &ImageRecord) -> GatewayResult<()> {
        self.records
            .write()
            .await
            .insert(record.key(), record.clone());
        Ok(())
    }

    async fn get_record(&self, key: &RecordKey) -> GatewayResult<Option<ImageRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn delete_record(&self, key: &RecordKey) -> GatewayResult<()> {
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn scan_records(&self, filter: &RecordFilter) -> GatewayResult<Vec<ImageRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> GatewayResult<()> {
        Ok(())
    }
}
