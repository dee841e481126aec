use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use backup_engine::manifest::{Category, Manifest};
use serde::Deserialize;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_manifests))
        .route("/{id}", get(get_manifest))
}

#[derive(Deserialize)]
pub struct ManifestsQuery {
    pub category: Option<String>,
}

async fn list_manifests(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ManifestsQuery>,
) -> Result<Json<Vec<Manifest>>, AppError> {
    let category = query
        .category
        .map(|c| c.parse::<Category>())
        .transpose()?;
    let engine = state.engine.clone();
    let manifests = tokio::task::spawn_blocking(move || engine.list_manifests(category))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(manifests))
}

async fn get_manifest(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Manifest>, AppError> {
    let engine = state.engine.clone();
    let manifest = tokio::task::spawn_blocking(move || engine.get_manifest(&id))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(manifest))
}
