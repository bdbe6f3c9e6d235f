use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::domain::{ChartDataPoint, ChartKind, TimeRange};
use crate::error::AppError;

const DEFAULT_MAX_POINTS: usize = 200;
const MAX_POINTS_LIMIT: usize = 5_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartQuery {
    pub kind: String,
    pub symbol: Option<String>,
    pub range: Option<String>,
    pub max_points: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartResponse {
    pub kind: String,
    pub range: String,
    pub points: Vec<ChartDataPoint>,
}

pub async fn get_chart(
    Query(params): Query<ChartQuery>,
    State(state): State<AppState>,
) -> Result<Json<ChartResponse>, AppError> {
    let kind = ChartKind::parse(&params.kind, params.symbol.as_deref())?;
    let range: TimeRange = params.range.as_deref().unwrap_or("1m").parse()?;
    let max_points = params.max_points.unwrap_or(DEFAULT_MAX_POINTS);
    if max_points > MAX_POINTS_LIMIT {
        return Err(AppError::BadRequest(format!(
            "maxPoints must be at most {}",
            MAX_POINTS_LIMIT
        )));
    }

    let points = state
        .history
        .fetch_chart_data(kind.clone(), range, max_points)
        .await;

    Ok(Json(ChartResponse {
        kind: kind.to_string(),
        range: range.to_string(),
        points,
    }))
}
