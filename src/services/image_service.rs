//! src/services/image_service.rs
//!
//! ImageService: the four image operations (upload, get, list, delete).
//! Each one validates input, enforces ownership through the
//! `(image_id, user_id)` record key, and keeps the blob store and the record
//! table in step. The service knows nothing about HTTP; handlers translate
//! its errors into status codes.

use crate::{
    models::image::{
        DeleteImageResponse, GetImageResponse, ImageRecord, ImageStatus, ListImagesResponse,
        RecordKey, UploadImageResponse,
    },
    services::{
        gateway::{BlobStore, GatewayError, RecordFilter, RecordTable},
        identity::IdentityPolicy,
        validation::{ImageMetadata, ImagePolicy, process_metadata},
    },
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Caller input is malformed or outside policy.
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Everything an upload needs, already pulled off the transport.
#[derive(Debug, Default)]
pub struct UploadRequest {
    pub user_id: String,
    /// Raw `content-type`; parameters after `;` are ignored.
    pub content_type: Option<String>,
    /// Raw metadata header; absent behaves like `{}`.
    pub metadata: Option<String>,
    pub body: Bytes,
    /// Body arrived base64 encoded.
    pub base64_encoded: bool,
}

/// ImageService is cheap to clone; all clones share the same stores.
#[derive(Clone)]
pub struct ImageService {
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordTable>,
    policy: ImagePolicy,
    identity: IdentityPolicy,
    url_ttl: Duration,
}

/// `images/{user}/{image}.{ext}`.
pub fn storage_key(user_id: &str, image_id: &str, ext: &str) -> String {
    format!("images/{}/{}.{}", user_id, image_id, ext)
}

/// File extension for a content type, `bin` when unknown.
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        _ => "bin",
    }
}

fn normalize_content_type(raw: Option<&str>) -> String {
    raw.and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

fn not_found() -> ServiceError {
    ServiceError::NotFound("Image not found".into())
}

impl ImageService {
    pub fn new(blobs: Arc<dyn BlobStore>, records: Arc<dyn RecordTable>) -> Self {
        Self {
            blobs,
            records,
            policy: ImagePolicy::default(),
            identity: IdentityPolicy::default(),
            url_ttl: DEFAULT_URL_TTL,
        }
    }

    pub fn with_policy(mut self, policy: ImagePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_identity(mut self, identity: IdentityPolicy) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_url_ttl(mut self, url_ttl: Duration) -> Self {
        self.url_ttl = url_ttl;
        self
    }

    pub fn identity(&self) -> &IdentityPolicy {
        &self.identity
    }

    /// Store a new image and its record.
    ///
    /// The blob is written first. If the record write then fails, the blob is
    /// removed again (best effort) so no orphan is left behind.
    pub async fn upload(&self, req: UploadRequest) -> ServiceResult<UploadImageResponse> {
        let body = if req.base64_encoded {
            let decoded = general_purpose::STANDARD
                .decode(&req.body)
                .map_err(|_| ServiceError::Validation("Invalid base64 body".into()))?;
            Bytes::from(decoded)
        } else {
            req.body
        };
        if body.is_empty() {
            return Err(ServiceError::Validation("No body found in request".into()));
        }

        let content_type = normalize_content_type(req.content_type.as_deref());
        let user_id = req.user_id;

        let metadata = process_metadata(req.metadata.as_deref().unwrap_or("{}"))?;
        let metadata = ImageMetadata::from_map(&metadata);

        let image_id = Uuid::new_v4().to_string();
        let ext = extension_for(&content_type);
        let s3_key = storage_key(&user_id, &image_id, ext);

        self.policy.validate_image(&content_type, body.len())?;

        let record = ImageRecord {
            image_id: image_id.clone(),
            user_id: user_id.clone(),
            file_name: format!("{}.{}", image_id, ext),
            content_type: content_type.clone(),
            s3_key: s3_key.clone(),
            status: ImageStatus::Active,
            description: metadata.description,
            title: metadata.title,
            tags: metadata.tags,
            size_bytes: body.len() as i64,
            created_at: Utc::now(),
        };

        self.blobs
            .put_object(&s3_key, body, &user_id, &content_type)
            .await?;

        if let Err(err) = self.records.put_record(&record).await {
            if let Err(cleanup) = self.blobs.delete_object(&s3_key).await {
                warn!(
                    s3_key = %s3_key,
                    error = %cleanup,
                    "failed to remove blob after record write failure; blob is orphaned"
                );
            }
            return Err(err.into());
        }

        info!(image_id = %image_id, user_id = %user_id, size = record.size_bytes, "image uploaded");
        Ok(UploadImageResponse {
            image_id,
            metadata: record,
        })
    }

    /// Look up the caller's record and hand out a time-bounded download URL.
    pub async fn get(&self, key: RecordKey) -> ServiceResult<GetImageResponse> {
        let record = self.records.get_record(&key).await?.ok_or_else(not_found)?;
        let download_url = self.blobs.access_url(&record.s3_key, self.url_ttl).await?;

        Ok(GetImageResponse {
            image_id: key.image_id,
            download_url,
            metadata: record,
        })
    }

    /// All of the caller's records, optionally narrowed by title and tag
    /// substrings. Ordered oldest first.
    pub async fn list(
        &self,
        user_id: &str,
        title: Option<String>,
        tag: Option<String>,
    ) -> ServiceResult<ListImagesResponse> {
        let filter = RecordFilter::for_user(user_id)
            .with_title(title)
            .with_tag(tag);
        let mut images = self.records.scan_records(&filter).await?;
        images.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.image_id.cmp(&b.image_id))
        });

        Ok(ListImagesResponse {
            count: images.len(),
            images,
        })
    }

    /// Remove the blob, then the record.
    ///
    /// If the record delete fails after the blob is gone, the record dangles
    /// until the delete is retried; blob deletes tolerate absent objects.
    pub async fn delete(&self, key: RecordKey) -> ServiceResult<DeleteImageResponse> {
        let record = self.records.get_record(&key).await?.ok_or_else(not_found)?;

        self.blobs.delete_object(&record.s3_key).await?;
        self.records.delete_record(&key).await?;

        info!(key = %key, "image deleted");
        Ok(DeleteImageResponse {
            message: "Image deleted successfully".into(),
            image_id: key.image_id,
        })
    }

    /// Ping both stores concurrently.
    pub async fn check_ready(&self) -> (Result<(), GatewayError>, Result<(), GatewayError>) {
        futures::join!(self.blobs.ping(), self.records.ping())
    }
}
