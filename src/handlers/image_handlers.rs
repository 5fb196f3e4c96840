//! HTTP handlers for the image operations.
//! Each handler pulls its inputs off the request and delegates to
//! `ImageService`; service errors become `AppError`s.

use crate::{
    errors::AppError,
    models::image::{
        DeleteImageResponse, GetImageResponse, ListImagesResponse, RecordKey, UploadImageResponse,
    },
    services::{
        identity::{REQUEST_CONTEXT_HEADER, RequestContext},
        image_service::{ImageService, UploadRequest},
    },
};
use axum::{
    Json,
    extract::{
        FromRequestParts, Path, Query, State,
        rejection::{BytesRejection, PathRejection, QueryRejection},
    },
    http::{HeaderMap, header, request::Parts},
};
use bytes::Bytes;
use serde::Deserialize;

/// JSON blob with at least a `description` key.
pub const METADATA_HEADER: &str = "x-image-metadata";

/// `base64` marks a transport-encoded body.
pub const TRANSFER_ENCODING_HEADER: &str = "content-transfer-encoding";

/// Query params accepted by `GET /images`.
#[derive(Debug, Deserialize)]
pub struct ListImagesQuery {
    pub title: Option<String>,
    pub tag: Option<String>,
}

/// The calling user, resolved from the forwarded request context under the
/// service's identity policy.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
}

impl FromRequestParts<ImageService> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        service: &ImageService,
    ) -> Result<Self, Self::Rejection> {
        let context = header_str(&parts.headers, REQUEST_CONTEXT_HEADER)
            .and_then(RequestContext::from_header);
        let user_id = service.identity().resolve_user_id(context.as_ref())?;
        Ok(Caller { user_id })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `POST /images`: upload an image.
pub async fn upload_image(
    State(service): State<ImageService>,
    caller: Caller,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<UploadImageResponse>, AppError> {
    let body = body?;
    let base64_encoded = header_str(&headers, TRANSFER_ENCODING_HEADER)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("base64"));

    let request = UploadRequest {
        user_id: caller.user_id,
        content_type: header_str(&headers, header::CONTENT_TYPE.as_str()).map(str::to_string),
        metadata: header_str(&headers, METADATA_HEADER).map(str::to_string),
        body,
        base64_encoded,
    };

    Ok(Json(service.upload(request).await?))
}

/// `GET /images/{image_id}`: record plus a time-bounded download URL.
pub async fn get_image(
    State(service): State<ImageService>,
    caller: Caller,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<GetImageResponse>, AppError> {
    let Path(image_id) = path?;
    let key = RecordKey::new(image_id, caller.user_id);
    Ok(Json(service.get(key).await?))
}

/// `GET /images`: the caller's images, supports ?title=&tag=
pub async fn list_images(
    State(service): State<ImageService>,
    caller: Caller,
    query: Result<Query<ListImagesQuery>, QueryRejection>,
) -> Result<Json<ListImagesResponse>, AppError> {
    let Query(q) = query?;
    Ok(Json(service.list(&caller.user_id, q.title, q.tag).await?))
}

/// `DELETE /images/{image_id}`: remove the blob and the record.
pub async fn delete_image(
    State(service): State<ImageService>,
    caller: Caller,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<DeleteImageResponse>, AppError> {
    let Path(image_id) = path?;
    let key = RecordKey::new(image_id, caller.user_id);
    Ok(Json(service.delete(key).await?))
}

/// Fallback for unknown routes and unsupported methods.
pub async fn method_not_allowed() -> AppError {
    AppError::method_not_allowed()
}
