use axum::extract::State;
use axum::Json;

use super::AppState;
use crate::error::AppError;
use crate::orchestration::{ClearedData, RetentionReport, StorageStatus};

pub async fn get_status(State(state): State<AppState>) -> Result<Json<StorageStatus>, AppError> {
    Ok(Json(state.history.storage_status().await?))
}

pub async fn compress(State(state): State<AppState>) -> Json<RetentionReport> {
    Json(state.history.force_compression().await)
}

pub async fn clear_storage(State(state): State<AppState>) -> Result<Json<ClearedData>, AppError> {
    Ok(Json(state.history.clear_all_data().await?))
}
