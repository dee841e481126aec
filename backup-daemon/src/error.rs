use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use backup_engine::EngineError;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Engine(EngineError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(m) => AppError::BadRequest(m),
            EngineError::NotFound(m) => AppError::NotFound(m),
            e @ EngineError::AlreadyRunning { .. } => AppError::Conflict(e.to_string()),
            e => AppError::Engine(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, "validation_error", m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, "already_running", m.clone()),
            AppError::Engine(e) => {
                tracing::error!(kind = e.kind(), "Engine error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, e.kind(), e.to_string())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg, "kind": kind }))).into_response()
    }
}
