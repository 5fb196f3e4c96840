//! Resolves the calling user from the authorizer claims forwarded by the
//! upstream gateway.
//!
//! The claims are trusted as-is: verification happens before the request
//! reaches this service.

use crate::services::image_service::{ServiceError, ServiceResult};
use serde::Deserialize;

/// Header carrying the API Gateway request context as JSON.
pub const REQUEST_CONTEXT_HEADER: &str = "x-amzn-request-context";

pub const DEFAULT_FALLBACK_USER_ID: &str = "default-user-id";

/// `{"authorizer": {"claims": {"sub": "..."}}}`
#[derive(Debug, Default, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub authorizer: Option<Authorizer>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Authorizer {
    #[serde(default)]
    pub claims: Option<Claims>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
}

impl RequestContext {
    /// Parse a raw header value; malformed context is treated as absent.
    pub fn from_header(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(ctx) => Some(ctx),
            Err(err) => {
                tracing::debug!(error = %err, "ignoring malformed request context");
                None
            }
        }
    }

    fn subject(&self) -> Option<&str> {
        self.authorizer
            .as_ref()
            .and_then(|a| a.claims.as_ref())
            .and_then(|c| c.sub.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// What to do when a request arrives without a caller identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IdentityPolicy {
    #[default]
    Required,
    AllowAnonymous { fallback_user_id: String },
}

impl IdentityPolicy {
    pub fn resolve_user_id(&self, context: Option<&RequestContext>) -> ServiceResult<String> {
        if let Some(sub) = context.and_then(RequestContext::subject) {
            return Ok(sub.to_string());
        }

        match self {
            IdentityPolicy::Required => {
                Err(ServiceError::Unauthorized("Missing caller identity".into()))
            }
            IdentityPolicy::AllowAnonymous { fallback_user_id } => Ok(fallback_user_id.clone()),
        }
    }
}
