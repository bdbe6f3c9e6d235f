//! Historical portfolio valuations.

use crate::domain::{Symbol, TimeMs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value of one position on a given day, before currency conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    pub symbol: Symbol,
    pub units: f64,
    pub price_at_date: f64,
    /// `price_at_date * units`, in `currency`.
    pub value_at_date: f64,
    pub currency: String,
}

impl PositionSnapshot {
    pub fn new(symbol: Symbol, units: f64, price_at_date: f64, currency: &str) -> Self {
        Self {
            symbol,
            units,
            price_at_date,
            value_at_date: price_at_date * units,
            currency: currency.to_string(),
        }
    }
}

/// Portfolio value, cost and gains for one day in the display currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalPortfolioSnapshot {
    /// Start of the UTC day this valuation represents.
    pub date: TimeMs,
    pub total_value: f64,
    pub total_gains: f64,
    pub total_cost: f64,
    pub currency: String,
    pub composition: BTreeMap<Symbol, PositionSnapshot>,
    /// Fingerprint of the holdings this snapshot was computed from.
    pub composition_fingerprint: String,
}

impl HistoricalPortfolioSnapshot {
    pub fn new(
        date: TimeMs,
        total_value: f64,
        total_cost: f64,
        currency: &str,
        composition: BTreeMap<Symbol, PositionSnapshot>,
        composition_fingerprint: &str,
    ) -> Self {
        Self {
            date,
            total_value,
            total_gains: total_value - total_cost,
            total_cost,
            currency: currency.to_string(),
            composition,
            composition_fingerprint: composition_fingerprint.to_string(),
        }
    }

    /// Multiply all money amounts by `factor` and relabel the currency.
    ///
    /// Position values stay in their own quote currency.
    pub fn rescaled(mut self, factor: f64, currency: &str) -> Self {
        self.total_value *= factor;
        self.total_cost *= factor;
        self.total_gains = self.total_value - self.total_cost;
        self.currency = currency.to_string();
        self
    }
}
