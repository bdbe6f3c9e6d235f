//! Approximate fixed FX table used when no live provider answers.

use super::{CurrencyRateProvider, DataSourceError};
use crate::domain::currency::{self, PENCE_PER_POUND};
use async_trait::async_trait;
use std::collections::HashMap;

/// USD value of one unit, rounded. Good enough to keep charts plausible offline.
const APPROX_USD_PER_UNIT: &[(&str, f64)] = &[
    ("USD", 1.0),
    ("EUR", 1.08),
    ("GBP", 1.27),
    ("CHF", 1.12),
    ("JPY", 0.0067),
    ("CAD", 0.74),
    ("AUD", 0.66),
    ("NZD", 0.61),
    ("SEK", 0.095),
    ("NOK", 0.094),
    ("DKK", 0.145),
    ("PLN", 0.25),
    ("HKD", 0.128),
    ("SGD", 0.74),
    ("CNY", 0.14),
    ("INR", 0.012),
];

#[derive(Debug, Clone)]
pub struct StaticRateProvider {
    usd_per_unit: HashMap<String, f64>,
}

impl StaticRateProvider {
    pub fn new() -> Self {
        Self {
            usd_per_unit: APPROX_USD_PER_UNIT
                .iter()
                .map(|(code, rate)| (code.to_string(), *rate))
                .collect(),
        }
    }

    fn usd_value(&self, code: &str) -> Option<f64> {
        let settled = currency::settlement_currency(code);
        let rate = self.usd_per_unit.get(&settled).copied()?;
        Some(if currency::is_pence(code) {
            rate / PENCE_PER_POUND
        } else {
            rate
        })
    }
}

impl Default for StaticRateProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CurrencyRateProvider for StaticRateProvider {
    async fn rate(&self, from: &str, to: &str) -> Result<f64, DataSourceError> {
        if currency::normalize(from) == currency::normalize(to) {
            return Ok(1.0);
        }
        let from_usd = self
            .usd_value(from)
            .ok_or_else(|| DataSourceError::UnsupportedCurrency(from.to_string()))?;
        let to_usd = self
            .usd_value(to)
            .ok_or_else(|| DataSourceError::UnsupportedCurrency(to.to_string()))?;
        Ok(from_usd / to_usd)
    }
}
