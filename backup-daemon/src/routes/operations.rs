use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use backup_engine::archiver::BackupMode;
use backup_engine::manifest::{Category, Component};
use backup_engine::restore::RestoreResult;
use backup_engine::RunResult;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/backups", post(run_backup))
        .route("/restores", post(run_restore))
}

#[derive(Deserialize)]
pub struct BackupRequest {
    pub category: String,
    #[serde(default)]
    pub mode: BackupMode,
}

#[derive(Deserialize)]
pub struct RestoreRequest {
    pub manifest_id: String,
    /// All components when empty.
    #[serde(default)]
    pub components: Vec<String>,
}

/// Runs to completion; the response carries the full run result.
async fn run_backup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BackupRequest>,
) -> Result<Json<RunResult>, AppError> {
    let category: Category = req.category.parse()?;
    tracing::info!(category = %category, mode = ?req.mode, "Backup requested");
    let result = state
        .engine
        .run_backup_with(category, req.mode, &CancellationToken::new())
        .await?;
    Ok(Json(result))
}

async fn run_restore(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RestoreRequest>,
) -> Result<Json<RestoreResult>, AppError> {
    let components = req
        .components
        .iter()
        .map(|c| c.parse::<Component>())
        .collect::<Result<Vec<_>, _>>()?;
    tracing::info!(manifest_id = %req.manifest_id, components = ?components, "Restore requested");
    let result = state.engine.run_restore(&req.manifest_id, &components).await?;
    Ok(Json(result))
}
