//! Represents an uploaded image: its persisted metadata record and the
//! response bodies built around it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{fmt, str::FromStr};

/// Lifecycle marker of an image record.
///
/// Uploads always write `Active`. Deletes remove the record outright, so
/// `Deleted` is only ever seen on records written by other tooling.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    #[default]
    Active,
    Deleted,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Active => "active",
            ImageStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ImageStatus::Active),
            "deleted" => Ok(ImageStatus::Deleted),
            other => Err(format!("unknown image status `{}`", other)),
        }
    }
}

/// Metadata record stored in the key-value table, one per uploaded image.
///
/// The bytes themselves live in the blob store under `s3_key`.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    /// Generated UUID, immutable.
    pub image_id: String,

    /// Owner of the image; forms the record key together with `image_id`.
    pub user_id: String,

    /// `{image_id}.{ext}`, extension inferred from the content type.
    pub file_name: String,

    /// MIME type accepted at upload.
    pub content_type: String,

    /// Location of the payload inside the blob store.
    pub s3_key: String,

    pub status: ImageStatus,

    /// Caller-supplied description (required at upload).
    pub description: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    pub tags: Vec<String>,

    /// Size of the decoded payload in bytes.
    pub size_bytes: i64,

    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.image_id, &self.user_id)
    }
}

/// Compound key of an [`ImageRecord`].
///
/// Both halves are required for every lookup so a caller can only reach
/// records they own.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub image_id: String,
    pub user_id: String,
}

impl RecordKey {
    pub fn new(image_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.image_id)
    }
}

/// Body of a successful upload.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadImageResponse {
    pub image_id: String,
    pub metadata: ImageRecord,
}

/// Body of a successful single-image lookup.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GetImageResponse {
    pub image_id: String,
    pub download_url: String,
    pub metadata: ImageRecord,
}

#[derive(Serialize, Debug)]
pub struct ListImagesResponse {
    pub images: Vec<ImageRecord>,
    pub count: usize,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DeleteImageResponse {
    pub message: String,
    pub image_id: String,
}
