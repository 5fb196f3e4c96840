//! Defines routes for the image operations.
//!
//! ## Structure
//! - `POST   /images`            : upload an image
//! - `GET    /images`            : list the caller's images (`?title=&tag=`)
//! - `GET    /images/{image_id}` : image record plus download URL
//! - `DELETE /images/{image_id}` : delete the image
//! - `GET    /healthz`, `/readyz`: probes
//!
//! Any other method or path answers 405. Every response carries
//! `access-control-allow-origin: *`, including panics turned into 500s.

use crate::{
    errors::panic_response,
    handlers::{
        health_handlers::{healthz, readyz},
        image_handlers::{delete_image, get_image, list_images, method_not_allowed, upload_image},
    },
    services::image_service::ImageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, header},
    routing::get,
};
use tower_http::{
    catch_panic::CatchPanicLayer, set_header::SetResponseHeaderLayer, trace::TraceLayer,
};

/// Build the router. `body_limit` caps request bodies before they are
/// buffered; it must leave room for base64 overhead above the image cap.
pub fn routes(body_limit: usize) -> Router<ImageService> {
    let router = Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/images", get(list_images).post(upload_image))
        .route("/images/{image_id}", get(get_image).delete(delete_image))
        .fallback(method_not_allowed)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(DefaultBodyLimit::max(body_limit));

    with_response_layers(router)
}

/// Panic catching, the fixed CORS header, and request tracing, outermost last.
fn with_response_layers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        gateway::memory::{MemoryBlobStore, MemoryRecordTable},
        identity::{IdentityPolicy, REQUEST_CONTEXT_HEADER},
    };
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
        response::Response,
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    const LIMIT: usize = 10 * 1024 * 1024;

    fn app_with(identity: IdentityPolicy) -> Router {
        let service = ImageService::new(
            Arc::new(MemoryBlobStore::new("imagehost")),
            Arc::new(MemoryRecordTable::new()),
        )
        .with_identity(identity);
        routes(LIMIT).with_state(service)
    }

    fn app() -> Router {
        app_with(IdentityPolicy::Required)
    }

    fn context(user: &str) -> String {
        format!(r#"{{"authorizer":{{"claims":{{"sub":"{}"}}}}}}"#, user)
    }

    fn request(method: Method, uri: &str, user: Option<&str>) -> axum::http::request::Builder {
        let builder = Request::builder().method(method).uri(uri);
        match user {
            Some(u) => builder.header(REQUEST_CONTEXT_HEADER, context(u)),
            None => builder,
        }
    }

    fn upload(user: &str, content_type: &str, metadata: &str, body: Vec<u8>) -> Request<Body> {
        request(Method::POST, "/images", Some(user))
            .header("content-type", content_type)
            .header("x-image-metadata", metadata)
            .body(Body::from(body))
            .unwrap()
    }

    async fn json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn assert_fixed_headers(response: &Response) {
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
    }

    #[tokio::test]
    async fn upload_get_delete_round() {
        let app = app();

        let response = app
            .clone()
            .oneshot(upload("u1", "image/jpeg", r#"{"description":"sunset"}"#, vec![7; 1024]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_fixed_headers(&response);
        let body = json(response).await;
        let image_id = body["imageId"].as_str().unwrap().to_string();
        assert_eq!(body["metadata"]["description"], "sunset");
        assert_eq!(body["metadata"]["userId"], "u1");

        let uri = format!("/images/{}", image_id);
        let response = app
            .clone()
            .oneshot(request(Method::GET, &uri, Some("u1")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["imageId"], image_id.as_str());
        assert!(!body["downloadUrl"].as_str().unwrap().is_empty());

        let response = app
            .clone()
            .oneshot(request(Method::DELETE, &uri, Some("u1")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["message"], "Image deleted successfully");
        assert_eq!(body["imageId"], image_id.as_str());

        for method in [Method::GET, Method::DELETE] {
            let response = app
                .clone()
                .oneshot(request(method, &uri, Some("u1")).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_fixed_headers(&response);
            assert_eq!(json(response).await["message"], "Image not found");
        }
    }

    #[tokio::test]
    async fn validation_failures_are_400() {
        let app = app();
        let cases = [
            upload("u1", "text/plain", r#"{"description":"d"}"#, vec![1; 10]),
            upload("u1", "image/png", r#"{"title":"t"}"#, vec![1; 10]),
            upload("u1", "image/png", r#"{"description":"d"}"#, vec![1; 5 * 1024 * 1024 + 1]),
        ];
        for req in cases {
            let response = app.clone().oneshot(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_fixed_headers(&response);
            assert_eq!(json(response).await["status"], 400);
        }

        let response = app
            .oneshot(request(Method::GET, "/images", Some("u1")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json(response).await["count"], 0);
    }

    #[tokio::test]
    async fn body_over_transport_limit_is_400_json() {
        let response = app()
            .oneshot(upload(
                "u1",
                "image/png",
                r#"{"description":"d"}"#,
                vec![1; LIMIT + 1],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_fixed_headers(&response);
        let body = json(response).await;
        assert_eq!(body["message"], "Image size exceeds maximum allowed size");
        assert_eq!(body["status"], 400);
    }

    #[tokio::test]
    async fn malformed_query_is_400_json() {
        let response = app()
            .oneshot(
                request(Method::GET, "/images?title=a&title=b", Some("u1"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_fixed_headers(&response);
        let body = json(response).await;
        assert_eq!(body["status"], 400);
        assert!(body["message"].as_str().unwrap().contains("title"));
    }

    #[tokio::test]
    async fn base64_transfer_encoding_is_decoded() {
        let response = app()
            .oneshot(
                request(Method::POST, "/images", Some("u1"))
                    .header("content-type", "image/gif")
                    .header("content-transfer-encoding", "base64")
                    .header("x-image-metadata", r#"{"description":"tiny"}"#)
                    .body(Body::from("R0lGODlh"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["metadata"]["sizeBytes"], 6);
    }

    #[tokio::test]
    async fn list_is_scoped_and_filtered() {
        let app = app();
        for (user, meta) in [
            ("u1", r#"{"description":"a","title":"Beach day","tags":["sea"]}"#),
            ("u1", r#"{"description":"b","title":"Mountain","tags":["sea"]}"#),
            ("u2", r#"{"description":"c","title":"Beach","tags":["sea"]}"#),
        ] {
            let response = app
                .clone()
                .oneshot(upload(user, "image/png", meta, vec![1; 4]))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/images", Some("u1")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json(response).await;
        assert_eq!(body["count"], 2);

        let response = app
            .oneshot(
                request(Method::GET, "/images?title=Beach&tag=se", Some("u1"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["images"][0]["description"], "a");
    }

    #[tokio::test]
    async fn other_users_cannot_reach_an_image() {
        let app = app();
        let response = app
            .clone()
            .oneshot(upload("u1", "image/png", r#"{"description":"d"}"#, vec![1; 4]))
            .await
            .unwrap();
        let image_id = json(response).await["imageId"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                request(Method::GET, &format!("/images/{}", image_id), Some("u2"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_identity_depends_on_policy() {
        let response = app()
            .oneshot(request(Method::GET, "/images", None).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_fixed_headers(&response);

        let anonymous = app_with(IdentityPolicy::AllowAnonymous {
            fallback_user_id: "default-user-id".into(),
        });
        let response = anonymous
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/images")
                    .header("content-type", "image/png")
                    .header("x-image-metadata", r#"{"description":"d"}"#)
                    .body(Body::from(vec![1u8; 4]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["metadata"]["userId"], "default-user-id");
    }

    #[tokio::test]
    async fn unmatched_routes_are_405() {
        let app = app();
        for (method, uri) in [
            (Method::PUT, "/images"),
            (Method::POST, "/images/abc"),
            (Method::PATCH, "/images/abc"),
            (Method::GET, "/nope"),
        ] {
            let response = app
                .clone()
                .oneshot(request(method, uri, Some("u1")).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED, "{uri}");
            assert_fixed_headers(&response);
            assert_eq!(json(response).await["message"], "Method Not Allowed");
        }
    }

    #[tokio::test]
    async fn panics_become_500_with_fixed_headers() {
        async fn boom() -> &'static str {
            panic!("handler exploded")
        }
        let app: Router = with_response_layers(Router::new().route("/boom", get(boom)));

        let response = app
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
        assert_eq!(json(response).await["message"], "Internal server error");
    }

    #[tokio::test]
    async fn probes_report_ok() {
        let app = app();
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["checks"]["blob_store"]["ok"], true);
        assert_eq!(body["checks"]["record_table"]["ok"], true);
    }
}
