use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use backup_engine::orchestrator::EngineStatus;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
    }))
}

pub async fn status(State(state): State<Arc<AppState>>) -> Result<Json<EngineStatus>, AppError> {
    let engine = state.engine.clone();
    let status = tokio::task::spawn_blocking(move || engine.status())
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(status))
}
