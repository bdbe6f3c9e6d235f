//! External collaborators: currency rates, current holdings, CSV price files.

use crate::domain::Holding;
use async_trait::async_trait;
use std::fmt;

pub mod csv_import;
pub mod fallback;
pub mod frankfurter;
pub mod holdings;
pub mod mock;
pub mod static_rates;

pub use csv_import::{parse_price_csv, CsvImport, ImportError};
pub use fallback::FallbackRateProvider;
pub use frankfurter::FrankfurterRateProvider;
pub use holdings::InMemoryHoldings;
pub use mock::MockRateProvider;
pub use static_rates::StaticRateProvider;

/// Currency-rate lookup.
///
/// Implementations must handle retry/backoff themselves; callers treat an
/// error as "rate unknown for this run".
#[async_trait]
pub trait CurrencyRateProvider: Send + Sync + fmt::Debug {
    /// Units of `to` per one unit of `from`.
    async fn rate(&self, from: &str, to: &str) -> Result<f64, DataSourceError>;

    /// Convert `amount` from one currency to another.
    async fn convert(&self, amount: f64, from: &str, to: &str) -> Result<f64, DataSourceError> {
        Ok(amount * self.rate(from, to).await?)
    }
}

/// Read-only view of the user's current holdings.
#[async_trait]
pub trait HoldingsSource: Send + Sync + fmt::Debug {
    async fn holdings(&self) -> Result<Vec<Holding>, DataSourceError>;
}

/// Error type for data source operations.
#[derive(Debug, Clone)]
pub enum DataSourceError {
    /// Network error (e.g., connection timeout, DNS failure)
    NetworkError(String),
    /// HTTP error (e.g., 429 rate limit, 5xx server error)
    HttpError { status: u16, message: String },
    /// Parsing error (invalid JSON or malformed response)
    ParseError(String),
    /// Rate limit exceeded
    RateLimited,
    /// The provider has no rate for this pair
    UnsupportedCurrency(String),
    /// Other error
    Other(String),
}

impl fmt::Display for DataSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSourceError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            DataSourceError::HttpError { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            DataSourceError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            DataSourceError::RateLimited => write!(f, "Rate limited"),
            DataSourceError::UnsupportedCurrency(code) => {
                write!(f, "Unsupported currency: {}", code)
            }
            DataSourceError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for DataSourceError {}

/// Validate a rate returned by a provider.
pub(crate) fn checked_rate(rate: f64, from: &str, to: &str) -> Result<f64, DataSourceError> {
    if rate.is_finite() && rate > 0.0 {
        Ok(rate)
    } else {
        Err(DataSourceError::ParseError(format!(
            "invalid rate {} for {}/{}",
            rate, from, to
        )))
    }
}
