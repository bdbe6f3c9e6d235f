use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use super::AppState;
use crate::error::AppError;
use crate::orchestration::BatchProgress;

pub async fn get_progress(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BatchProgress>, AppError> {
    let operation_id = Uuid::parse_str(&id)
        .map_err(|_| AppError::BadRequest(format!("invalid operation id: {}", id)))?;
    state
        .history
        .batch()
        .progress(operation_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("batch operation {}", operation_id)))
}

pub async fn list_operations(State(state): State<AppState>) -> Json<Vec<BatchProgress>> {
    Json(state.history.batch().operations())
}
