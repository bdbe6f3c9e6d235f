pub mod batch;
pub mod chart;
pub mod health;
pub mod holdings;
pub mod memory;
pub mod prices;
pub mod storage;

use crate::datasource::InMemoryHoldings;
use crate::orchestration::HistoryService;
use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Debug, Clone)]
pub struct AppState {
    pub history: Arc<HistoryService>,
    pub holdings: Arc<InMemoryHoldings>,
}

impl AppState {
    pub fn new(history: Arc<HistoryService>, holdings: Arc<InMemoryHoldings>) -> Self {
        Self { history, holdings }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/ticks", post(prices::post_tick))
        .route("/v1/prices/import", post(prices::import_csv))
        .route("/v1/chart", get(chart::get_chart))
        .route(
            "/v1/holdings",
            get(holdings::get_holdings).put(holdings::put_holdings),
        )
        .route("/v1/settings/currency", put(holdings::put_display_currency))
        .route(
            "/v1/storage",
            axum::routing::delete(storage::clear_storage),
        )
        .route("/v1/storage/status", get(storage::get_status))
        .route("/v1/storage/compress", post(storage::compress))
        .route("/v1/memory", get(memory::get_memory))
        .route("/v1/batch", get(batch::list_operations))
        .route("/v1/batch/:id", get(batch::get_progress))
        .layer(cors)
        .with_state(state)
}
