//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that pings the blob store and the record table

use crate::services::{gateway::GatewayError, image_service::ImageService};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe. Always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Pings both stores. HTTP 200 when all checks pass, HTTP 503 when any check
/// fails; the body reports each check.
pub async fn readyz(State(service): State<ImageService>) -> impl IntoResponse {
    let (blob_check, record_check) = service.check_ready().await;

    let mut checks = HashMap::new();
    checks.insert("blob_store", CheckStatus::from(blob_check));
    checks.insert("record_table", CheckStatus::from(record_check));

    let overall_ok = checks.values().all(|c| c.ok);
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl From<Result<(), GatewayError>> for CheckStatus {
    fn from(result: Result<(), GatewayError>) -> Self {
        match result {
            Ok(()) => CheckStatus {
                ok: true,
                error: None,
            },
            Err(err) => {
                tracing::warn!(error = %err, "readiness check failed");
                CheckStatus {
                    ok: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}
