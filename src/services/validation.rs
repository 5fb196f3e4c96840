//! Upload policy checks: content-type allow-list, size cap, and the
//! caller-supplied metadata blob.

use crate::services::image_service::{ServiceError, ServiceResult};
use serde_json::{Map, Value};

pub const DEFAULT_ALLOWED_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/gif"];
pub const DEFAULT_MAX_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Which payloads an upload may carry.
#[derive(Clone, Debug)]
pub struct ImagePolicy {
    pub allowed_types: Vec<String>,
    pub max_size_bytes: usize,
}

impl Default for ImagePolicy {
    fn default() -> Self {
        Self {
            allowed_types: DEFAULT_ALLOWED_TYPES.iter().map(|t| t.to_string()).collect(),
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
        }
    }
}

impl ImagePolicy {
    pub fn new(allowed_types: Vec<String>, max_size_bytes: usize) -> Self {
        Self {
            allowed_types,
            max_size_bytes,
        }
    }

    /// Reject content types outside the allow-list and payloads over the cap.
    ///
    /// A payload of exactly `max_size_bytes` is accepted.
    pub fn validate_image(&self, content_type: &str, size: usize) -> ServiceResult<()> {
        if !self.allowed_types.iter().any(|t| t == content_type) {
            return Err(ServiceError::Validation(format!(
                "Unsupported image type: {}",
                content_type
            )));
        }

        if size > self.max_size_bytes {
            return Err(ServiceError::Validation(
                "Image size exceeds maximum allowed size".into(),
            ));
        }

        Ok(())
    }
}

/// Parse the raw metadata header and require a `description` key.
///
/// The parsed object is returned as-is; other keys are not inspected here.
pub fn process_metadata(raw: &str) -> ServiceResult<Map<String, Value>> {
    let parsed: Value = serde_json::from_str(raw)
        .map_err(|_| ServiceError::Validation("Invalid metadata format".into()))?;

    let Value::Object(map) = parsed else {
        return Err(ServiceError::Validation("Invalid metadata format".into()));
    };

    if !map.contains_key("description") {
        return Err(ServiceError::Validation(
            "Missing required metadata key: 'description'".into(),
        ));
    }

    Ok(map)
}

/// The metadata fields an [`ImageRecord`](crate::models::image::ImageRecord)
/// keeps.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    pub description: String,
    pub title: Option<String>,
    pub tags: Vec<String>,
}

impl ImageMetadata {
    /// Pull the record fields out of an already processed metadata object.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let description = match map.get("description") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };

        let title = map
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string);

        // tags: ["a", "b"] or "a, b"
        let tags = match map.get("tags") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        Self {
            description,
            title,
            tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_allow_listed_types_up_to_the_cap() {
        let policy = ImagePolicy::default();
        for ct in DEFAULT_ALLOWED_TYPES {
            assert!(policy.validate_image(ct, 1024).is_ok());
        }
        assert!(policy.validate_image("image/png", DEFAULT_MAX_SIZE_BYTES).is_ok());
    }

    #[test]
    fn rejects_unknown_content_type() {
        let err = ImagePolicy::default()
            .validate_image("application/pdf", 10)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ref m) if m == "Unsupported image type: application/pdf"));
    }

    #[test]
    fn rejects_payload_over_the_cap() {
        let err = ImagePolicy::default()
            .validate_image("image/jpeg", DEFAULT_MAX_SIZE_BYTES + 1)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ref m) if m.contains("exceeds maximum")));
    }

    #[test]
    fn custom_policy_is_honoured() {
        let policy = ImagePolicy::new(vec!["image/webp".into()], 8);
        assert!(policy.validate_image("image/webp", 8).is_ok());
        assert!(policy.validate_image("image/jpeg", 1).is_err());
        assert!(policy.validate_image("image/webp", 9).is_err());
    }

    #[test]
    fn metadata_requires_description() {
        let err = process_metadata(r#"{"title":"x"}"#).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ref m) if m.contains("'description'")));

        let err = process_metadata("{}").unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn metadata_must_be_a_json_object() {
        for raw in ["not json", "[1,2]", "\"description\""] {
            let err = process_metadata(raw).unwrap_err();
            assert!(
                matches!(err, ServiceError::Validation(ref m) if m == "Invalid metadata format"),
                "{raw}"
            );
        }
    }

    #[test]
    fn metadata_is_returned_unchanged() {
        let map = process_metadata(r#"{"description":"d","extra":{"k":1}}"#).unwrap();
        assert_eq!(map["extra"]["k"], 1);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn extracts_title_and_tags() {
        let map =
            process_metadata(r#"{"description":"sunset","title":"Beach","tags":["sea","sky"]}"#)
                .unwrap();
        let meta = ImageMetadata::from_map(&map);
        assert_eq!(meta.description, "sunset");
        assert_eq!(meta.title.as_deref(), Some("Beach"));
        assert_eq!(meta.tags, vec!["sea", "sky"]);

        let map = process_metadata(r#"{"description":42,"tags":"a, b,,c"}"#).unwrap();
        let meta = ImageMetadata::from_map(&map);
        assert_eq!(meta.description, "42");
        assert_eq!(meta.title, None);
        assert_eq!(meta.tags, vec!["a", "b", "c"]);
    }
}
