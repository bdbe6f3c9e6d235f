//! Day-by-day portfolio valuation from stored price history.
//!
//! Everything here is synchronous and side-effect free. The valuation actor
//! loads price series and rates, then calls `DayValuer::value` for each day.

use crate::domain::currency::{self, INTERMEDIATE_CURRENCY, PENCE_PER_POUND};
use crate::domain::{
    HistoricalPortfolioSnapshot, PortfolioComposition, PositionSnapshot, PriceSnapshot, Symbol,
    TimeMs,
};
use crate::engine::lookup::nearest_snapshot;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Minimum number of priced positions for a day with `positions` holdings.
///
/// Always at least one, so an empty or fully unpriced portfolio never emits.
pub fn required_valid_positions(positions: usize, min_valid_fraction: f64) -> usize {
    let required = (positions as f64 * min_valid_fraction).ceil();
    (required.max(0.0) as usize).max(1)
}

/// USD value of one unit of each currency needed by a run.
///
/// Pence codes are never stored: they resolve through GBP scaled by 100.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversionTable {
    usd_per_unit: HashMap<String, f64>,
}

impl ConversionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rate. Non-positive or non-finite rates are ignored.
    pub fn insert(&mut self, code: &str, usd_per_unit: f64) {
        if usd_per_unit.is_finite() && usd_per_unit > 0.0 {
            self.usd_per_unit
                .insert(currency::settlement_currency(code), usd_per_unit);
        }
    }

    fn usd_rate(&self, code: &str) -> Option<f64> {
        let settled = currency::settlement_currency(code);
        if settled == INTERMEDIATE_CURRENCY {
            Some(1.0)
        } else {
            self.usd_per_unit.get(&settled).copied()
        }
    }

    pub fn supports(&self, code: &str) -> bool {
        self.usd_rate(code).is_some()
    }

    /// Convert `amount` quoted in `code` into USD.
    pub fn to_usd(&self, amount: f64, code: &str) -> Option<f64> {
        let rate = self.usd_rate(code)?;
        let amount = if currency::is_pence(code) {
            amount / PENCE_PER_POUND
        } else {
            amount
        };
        Some(amount * rate)
    }

    /// Convert a USD amount into `code`.
    pub fn from_usd(&self, amount_usd: f64, code: &str) -> Option<f64> {
        let rate = self.usd_rate(code)?;
        let amount = amount_usd / rate;
        Some(if currency::is_pence(code) {
            amount * PENCE_PER_POUND
        } else {
            amount
        })
    }
}

/// Settlement currencies a run has to resolve, USD excluded.
pub fn required_currencies(composition: &PortfolioComposition, display_currency: &str) -> Vec<String> {
    let mut codes: Vec<String> = composition
        .currencies()
        .iter()
        .map(|c| currency::settlement_currency(c))
        .chain(std::iter::once(currency::settlement_currency(display_currency)))
        .filter(|c| c != INTERMEDIATE_CURRENCY)
        .collect();
    codes.sort();
    codes.dedup();
    codes
}

/// Timestamp-sorted price series per symbol.
#[derive(Debug, Clone, Default)]
pub struct PriceIndex {
    series: HashMap<Symbol, Arc<Vec<PriceSnapshot>>>,
}

impl PriceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: Symbol, series: Arc<Vec<PriceSnapshot>>) {
        self.series.insert(symbol, series);
    }

    pub fn get(&self, symbol: &Symbol) -> Option<&Arc<Vec<PriceSnapshot>>> {
        self.series.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Valid price nearest to `day` within `tolerance_days`.
    pub fn price_on(&self, symbol: &Symbol, day: NaiveDate, tolerance_days: i64) -> Option<f64> {
        let series = self.series.get(symbol)?;
        nearest_snapshot(series, day, tolerance_days)
            .map(|s| s.price)
            .filter(|p| crate::domain::is_valid_price(*p))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValuationParams {
    pub min_valid_fraction: f64,
    pub tolerance_days: i64,
}

impl Default for ValuationParams {
    fn default() -> Self {
        Self {
            min_valid_fraction: 0.5,
            tolerance_days: crate::engine::lookup::DEFAULT_TOLERANCE_DAYS,
        }
    }
}

/// Values one composition day after day against a fixed index and rate table.
#[derive(Debug)]
pub struct DayValuer<'a> {
    composition: &'a PortfolioComposition,
    index: &'a PriceIndex,
    rates: &'a ConversionTable,
    params: ValuationParams,
    display_currency: String,
    cost_usd: f64,
    required: usize,
}

impl<'a> DayValuer<'a> {
    /// `display_currency` must be convertible with `rates`; the caller falls
    /// back to USD otherwise.
    pub fn new(
        composition: &'a PortfolioComposition,
        index: &'a PriceIndex,
        rates: &'a ConversionTable,
        params: ValuationParams,
        display_currency: &str,
    ) -> Self {
        Self {
            composition,
            index,
            rates,
            params,
            display_currency: currency::normalize(display_currency),
            cost_usd: total_cost_usd(composition, rates),
            required: required_valid_positions(composition.len(), params.min_valid_fraction),
        }
    }

    pub fn display_currency(&self) -> &str {
        &self.display_currency
    }

    pub fn required_valid(&self) -> usize {
        self.required
    }

    /// Portfolio snapshot for `day`, or `None` when too few positions are priced.
    pub fn value(&self, day: NaiveDate) -> Option<HistoricalPortfolioSnapshot> {
        let mut total_usd = 0.0;
        let mut valid = 0usize;
        let mut positions = BTreeMap::new();

        for holding in self.composition.positions() {
            if !(holding.units.is_finite() && holding.units > 0.0) {
                continue;
            }
            let Some(price) = self
                .index
                .price_on(&holding.symbol, day, self.params.tolerance_days)
            else {
                continue;
            };
            let position =
                PositionSnapshot::new(holding.symbol.clone(), holding.units, price, &holding.currency);
            let Some(value_usd) = self.rates.to_usd(position.value_at_date, &holding.currency) else {
                continue;
            };
            if !value_usd.is_finite() {
                continue;
            }

            total_usd += value_usd;
            valid += 1;
            positions.insert(holding.symbol.clone(), position);
        }

        if valid < self.required {
            return None;
        }

        let total_value = self.rates.from_usd(total_usd, &self.display_currency)?;
        let total_cost = self.rates.from_usd(self.cost_usd, &self.display_currency)?;

        Some(HistoricalPortfolioSnapshot::new(
            TimeMs::start_of_day(day),
            total_value,
            total_cost,
            &self.display_currency,
            positions,
            self.composition.fingerprint(),
        ))
    }
}

/// Σ avg_cost × units over positions with positive units, in USD.
///
/// Positions in currencies the table cannot convert contribute nothing.
pub fn total_cost_usd(composition: &PortfolioComposition, rates: &ConversionTable) -> f64 {
    composition
        .positions()
        .iter()
        .filter(|h| h.units.is_finite() && h.units > 0.0 && h.avg_cost.is_finite())
        .filter_map(|h| rates.to_usd(h.avg_cost * h.units, &h.currency))
        .sum()
}
