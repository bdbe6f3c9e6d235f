//! Mock rate provider for testing without network calls.

use super::{CurrencyRateProvider, DataSourceError};
use crate::domain::currency;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Mock provider returning rates from a USD-per-unit table.
#[derive(Debug, Default)]
pub struct MockRateProvider {
    usd_per_unit: HashMap<String, f64>,
    fail: bool,
    calls: AtomicUsize,
}

impl MockRateProvider {
    /// Create a provider that only knows USD.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the USD value of one unit of `code`.
    pub fn with_rate(mut self, code: &str, usd_per_unit: f64) -> Self {
        self.usd_per_unit
            .insert(currency::normalize(code), usd_per_unit);
        self
    }

    /// Make every lookup fail with a network error.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Number of `rate` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn usd_value(&self, code: &str) -> Option<f64> {
        let code = currency::normalize(code);
        if code == currency::INTERMEDIATE_CURRENCY {
            return Some(1.0);
        }
        self.usd_per_unit.get(&code).copied()
    }
}

#[async_trait]
impl CurrencyRateProvider for MockRateProvider {
    async fn rate(&self, from: &str, to: &str) -> Result<f64, DataSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DataSourceError::NetworkError("mock failure".to_string()));
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
