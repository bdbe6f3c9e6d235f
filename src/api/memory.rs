use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::engine::CacheStats;
use crate::orchestration::MemoryStats;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryResponse {
    #[serde(flatten)]
    pub stats: MemoryStats,
    pub chart_cache: CacheStats,
}

pub async fn get_memory(State(state): State<AppState>) -> Json<MemoryResponse> {
    Json(MemoryResponse {
        stats: state.history.memory().stats(),
        chart_cache: state.history.charts().stats(),
    })
}
