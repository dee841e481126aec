pub mod health;
pub mod manifests;
pub mod operations;

use crate::state::AppState;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/status", get(health::status))
        .nest("/api/manifests", manifests::router(state.clone()))
        .nest("/api", operations::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestApp;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use backup_engine::catalog::Catalog;
    use backup_engine::lock::{OperationKind, OperationLock};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
        let response = create_router(app.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_empty_status() {
        let app = TestApp::new();
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, get("/api/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["health"], "no_backups");
        assert_eq!(body["manifests"], 0);
    }

    #[tokio::test]
    async fn test_backup_then_list_and_get() {
        let app = TestApp::new();
        let (status, run) = send(&app, post("/api/backups", json!({ "category": "manual" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["outcome"], "succeeded");
        assert_eq!(run["kind"], "full");
        let id = run["manifest_id"].as_str().unwrap().to_string();

        let (status, list) = send(&app, get("/api/manifests?category=manual")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["id"], id.as_str());

        let (_, daily) = send(&app, get("/api/manifests?category=daily")).await;
        assert!(daily.as_array().unwrap().is_empty());

        let (status, manifest) = send(&app, get(&format!("/api/manifests/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(manifest["status"], "succeeded");

        let (status, _) = send(&app, get("/api/manifests/manual-20240101T000000Z-00000000")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected() {
        let app = TestApp::new();
        let (status, body) = send(&app, post("/api/backups", json!({ "category": "pre_restore" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation_error");

        let (status, _) = send(&app, post("/api/backups", json!({ "category": "hourly" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            post("/api/restores", json!({ "manifest_id": "daily-20240101T000000Z-00000000" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, get("/api/manifests?category=yearly")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_busy_engine_gives_conflict() {
        let app = TestApp::new();
        let catalog = Catalog::open(&app.backup_dir()).unwrap();
        let other = OperationLock::new(catalog.lock_path());
        let _held = other.try_acquire(OperationKind::Restore).unwrap();

        let (status, body) = send(&app, post("/api/backups", json!({ "category": "daily" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "already_running");
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let app = TestApp::new();
        let (_, run) = send(&app, post("/api/backups", json!({ "category": "daily", "mode": "full" }))).await;
        let id = run["manifest_id"].as_str().unwrap().to_string();
        app.write_asset("logo.png", b"defaced");

        let (status, result) = send(
            &app,
            post("/api/restores", json!({ "manifest_id": id, "components": ["assets"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["phase"], "committed");
        assert_eq!(app.read_asset("logo.png"), b"logo bytes");

        let (status, _) = send(
            &app,
            post("/api/restores", json!({ "manifest_id": id, "components": ["everything"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
