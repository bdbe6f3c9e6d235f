use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::domain::{Symbol, TimeMs};
use crate::error::AppError;
use crate::orchestration::{ImportReport, ImportTicket, TickOutcome};

/// Default spacing under which an imported point duplicates a stored one.
const DEFAULT_IMPORT_TOLERANCE_MS: i64 = 60_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickRequest {
    pub symbol: String,
    pub price: f64,
    pub previous_close: f64,
    /// Defaults to the time the request is received.
    pub timestamp: Option<i64>,
    pub volume: Option<f64>,
}

pub async fn post_tick(
    State(state): State<AppState>,
    Json(body): Json<TickRequest>,
) -> Result<Json<TickOutcome>, AppError> {
    let symbol = Symbol::new(&body.symbol);
    if symbol.is_empty() {
        return Err(AppError::BadRequest("symbol is required".into()));
    }
    let timestamp = body.timestamp.map(TimeMs::new).unwrap_or_else(TimeMs::now);

    let outcome = state
        .history
        .record_tick(symbol, body.price, body.previous_close, timestamp, body.volume)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportQuery {
    pub tolerance_ms: Option<i64>,
    pub wait: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportScheduled {
    pub status: &'static str,
    #[serde(flatten)]
    pub ticket: ImportTicket,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ImportResponse {
    Scheduled(ImportScheduled),
    Completed(ImportReport),
}

/// Import a CSV body with a `symbol,timestamp,price,previous_close,volume` header.
///
/// Answers 202 with the batch operation id once the insert is scheduled;
/// `?wait=true` blocks and returns the final report.
pub async fn import_csv(
    Query(params): Query<ImportQuery>,
    State(state): State<AppState>,
    body: String,
) -> Result<(StatusCode, Json<ImportResponse>), AppError> {
    if body.trim().is_empty() {
        return Err(AppError::BadRequest("empty CSV body".into()));
    }
    let tolerance = params.tolerance_ms.unwrap_or(DEFAULT_IMPORT_TOLERANCE_MS);

    if params.wait.unwrap_or(false) {
        let report = state.history.import_csv(body.as_bytes(), tolerance).await?;
        return Ok((StatusCode::OK, Json(ImportResponse::Completed(report))));
    }

    let (ticket, _job) = state
        .history
        .start_import_csv(body.as_bytes(), tolerance)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ImportResponse::Scheduled(ImportScheduled {
            status: "scheduled",
            ticket,
        })),
    ))
}
