//! Chain of rate providers tried in order.

use super::{CurrencyRateProvider, DataSourceError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Asks the primary provider first and falls back on any error.
#[derive(Debug, Clone)]
pub struct FallbackRateProvider {
    primary: Arc<dyn CurrencyRateProvider>,
    fallback: Arc<dyn CurrencyRateProvider>,
}

impl FallbackRateProvider {
    pub fn new(
        primary: Arc<dyn CurrencyRateProvider>,
        fallback: Arc<dyn CurrencyRateProvider>,
    ) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl CurrencyRateProvider for FallbackRateProvider {
    async fn rate(&self, from: &str, to: &str) -> Result<f64, DataSourceError> {
        match self.primary.rate(from, to).await {
            Ok(rate) => Ok(rate),
            Err(e) => {
                warn!(from, to, error = %e, "Primary FX provider failed, using fallback");
                self.fallback.rate(from, to).await
            }
        }
    }
}
