//! API module for sandpool
//!
//! Provides REST API endpoints for:
//! - Script execution with optional file uploads
//! - Health checks
//! - Execution and pool metrics

mod error;
mod handlers;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::UploadLimits;
use crate::AppState;

pub use error::ApiError;

/// Slack on top of the upload caps for form fields and base64 expansion
const BODY_OVERHEAD: u64 = 1024 * 1024;

/// Largest request body accepted, derived from the upload caps
pub fn body_limit(uploads: &UploadLimits) -> usize {
    let encoded = uploads.max_total_size.saturating_mul(4) / 3;
    usize::try_from(encoded.saturating_add(BODY_OVERHEAD)).unwrap_or(usize::MAX)
}

/// Replace the plain-text 413 of the body limit layer with the JSON error body
async fn json_payload_too_large(response: Response) -> Response {
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if response.status() == StatusCode::PAYLOAD_TOO_LARGE && !is_json {
        return ApiError::PayloadTooLarge.into_response();
    }
    response
}

/// Create the application router with its middleware stack
pub fn create_router(state: Arc<AppState>) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");
    let limit = body_limit(&state.config.uploads);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/execute", post(handlers::execute::execute_script))
        .route("/metrics", get(handlers::metrics::get_metrics))
        .route("/metrics/prometheus", get(crate::metrics::prometheus_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(limit))
        .layer(middleware::map_response(json_payload_too_large))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::config::AppConfig;
    use crate::files::FileSessionManager;
    use crate::router::PoolRouter;
    use crate::runtime::ExecOutput;
    use crate::testing::FakeRuntime;

    async fn app(root: &std::path::Path) -> (Router, Arc<AppState>) {
        app_with(root, |_| {}).await
    }

    async fn app_with(
        root: &std::path::Path,
        configure: impl FnOnce(&mut AppConfig),
    ) -> (Router, Arc<AppState>) {
        let mut config = AppConfig::default();
        config.pools.default_pool_size = 1;
        config.pools.maintenance_interval_ms = 50;
        config.container.workspace_root = Some(root.join("workspaces"));
        config.uploads.sessions_dir = Some(root.join("sessions"));
        configure(&mut config);

        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_exec_handler(|workspace, _| {
            let listing = match std::fs::read_dir(workspace.join("files")) {
                Ok(entries) => entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(","),
                Err(_) => String::new(),
            };
            Ok(ExecOutput {
                output: listing.into_bytes(),
                exit_code: Some(0),
            })
        });

        let files = Arc::new(FileSessionManager::new(&config).unwrap());
        let router = PoolRouter::start(runtime, files.clone(), &config).await.unwrap();
        let state = Arc::new(AppState {
            config,
            router,
            files,
            started_at: Instant::now(),
        });
        (create_router(state.clone()), state)
    }

    async fn post_json(app: Router, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let root = tempfile::tempdir().unwrap();
        let (app, state) = app(root.path()).await;

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["pools_active"], 1);

        state.router.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_without_files() {
        let root = tempfile::tempdir().unwrap();
        let (app, state) = app(root.path()).await;

        let (status, body) = post_json(app, json!({ "script": "echo hi" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["exit_code"], 0);
        assert!(body.get("files_attached").is_none());

        state.router.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_stages_files_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let (app, state) = app(root.path()).await;

        let (status, body) = post_json(
            app,
            json!({
                "script": "ls files",
                "files": [{ "filename": "hello.txt", "content": "aGVsbG8=" }]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stdout"], "hello.txt");
        assert_eq!(body["files_attached"], json!(["hello.txt"]));
        assert_eq!(body["total_file_size"], 5);
        assert_eq!(state.files.session_count().await, 0);

        state.router.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_rejections() {
        let root = tempfile::tempdir().unwrap();
        let (app, state) = app(root.path()).await;

        let (status, body) = post_json(app.clone(), json!({ "script": "  " })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = post_json(
            app,
            json!({
                "script": "true",
                "files": [{ "filename": "tool.exe", "content": "TVo=" }]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "FILE_REJECTED");
        assert!(body["message"].as_str().unwrap().contains("tool.exe"));
        assert_eq!(state.files.session_count().await, 0);

        state.router.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_body_gets_json_413() {
        let root = tempfile::tempdir().unwrap();
        let (app, state) = app_with(root.path(), |config| {
            config.uploads.max_file_size = 512;
            config.uploads.max_total_size = 1024;
        })
        .await;

        let limit = body_limit(&state.config.uploads);
        let padding = "a".repeat(limit + 1);
        let body = json!({ "script": "true", "stdin": padding }).to_string();

        // Declared length is refused up front
        let request = Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .header("content-length", body.len())
            .body(Body::from(body.clone()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "PAYLOAD_TOO_LARGE");

        // Without a declared length the limit trips while reading
        let (status, json) = post_json(app, serde_json::from_str(&body).unwrap()).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json["error"], "PAYLOAD_TOO_LARGE");

        state.router.shutdown().await;
    }

    #[test]
    fn test_body_limit_covers_base64_uploads() {
        let uploads = UploadLimits::default();
        assert!(body_limit(&uploads) as u64 > uploads.max_total_size * 4 / 3);
    }
}
