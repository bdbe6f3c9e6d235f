use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::datasource::HoldingsSource;
use crate::domain::{Holding, Symbol};
use crate::error::AppError;
use crate::orchestration::{CurrencyChange, ValuationOutcome};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldingDto {
    pub symbol: String,
    pub units: f64,
    pub avg_cost: f64,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
pub struct HoldingsQuery {
    pub wait: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldingsResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ValuationOutcome>,
}

pub async fn get_holdings(State(state): State<AppState>) -> Result<Json<Vec<Holding>>, AppError> {
    Ok(Json(state.holdings.holdings().await?))
}

/// Replace the holdings and recalculate history. `?wait=true` blocks until
/// the run finishes.
pub async fn put_holdings(
    Query(params): Query<HoldingsQuery>,
    State(state): State<AppState>,
    Json(body): Json<Vec<HoldingDto>>,
) -> Result<(StatusCode, Json<HoldingsResponse>), AppError> {
    let holdings = body
        .into_iter()
        .map(validate_holding)
        .collect::<Result<Vec<_>, _>>()?;

    state.holdings.set(holdings.clone());
    let job = state.history.trigger_retroactive_recalculation(holdings);

    if params.wait.unwrap_or(false) {
        let outcome = job
            .join()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok((
            StatusCode::OK,
            Json(HoldingsResponse {
                status: "completed",
                outcome: Some(outcome),
            }),
        ))
    } else {
        Ok((
            StatusCode::ACCEPTED,
            Json(HoldingsResponse {
                status: "scheduled",
                outcome: None,
            }),
        ))
    }
}

fn validate_holding(dto: HoldingDto) -> Result<Holding, AppError> {
    let symbol = Symbol::new(&dto.symbol);
    if symbol.is_empty() {
        return Err(AppError::BadRequest("holding symbol is required".into()));
    }
    if !dto.units.is_finite() || !dto.avg_cost.is_finite() || dto.avg_cost < 0.0 {
        return Err(AppError::BadRequest(format!(
            "invalid units or cost for {}",
            symbol
        )));
    }
    if dto.currency.trim().is_empty() {
        return Err(AppError::BadRequest(format!("currency missing for {}", symbol)));
    }
    Ok(Holding::new(symbol, dto.units, dto.avg_cost, &dto.currency))
}

#[derive(Debug, Deserialize)]
pub struct CurrencyRequest {
    pub currency: String,
}

pub async fn put_display_currency(
    State(state): State<AppState>,
    Json(body): Json<CurrencyRequest>,
) -> Result<Json<CurrencyChange>, AppError> {
    let change = state.history.change_display_currency(&body.currency).await?;
    Ok(Json(change))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dto(symbol: &str, units: f64, avg_cost: f64, currency: &str) -> HoldingDto {
        HoldingDto {
            symbol: symbol.to_string(),
            units,
            avg_cost,
            currency: currency.to_string(),
        }
    }

    #[test]
    fn test_validate_holding() {
        let holding = validate_holding(dto("vod.l", 100.0, 70.0, "gbx")).unwrap();
        assert_eq!(holding.symbol, Symbol::new("VOD.L"));
        assert_eq!(holding.currency, "GBX");

        assert!(validate_holding(dto("", 1.0, 1.0, "USD")).is_err());
        assert!(validate_holding(dto("AAPL", f64::NAN, 1.0, "USD")).is_err());
        assert!(validate_holding(dto("AAPL", 1.0, -1.0, "USD")).is_err());
        assert!(validate_holding(dto("AAPL", 1.0, 1.0, " ")).is_err());
    }
}
