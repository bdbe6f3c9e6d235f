//! Domain types for price history and portfolio valuation.
//!
//! This module provides:
//! - Primitives: TimeMs, Symbol, RecordId
//! - Price and portfolio snapshot records
//! - Holdings and the composition fingerprint
//! - Chart projections and time ranges
//! - Currency code helpers (pence denominations)

pub mod chart;
pub mod composition;
pub mod currency;
pub mod portfolio;
pub mod price;
pub mod primitives;

pub use chart::{ChartDataPoint, ChartKind, ChartParseError, TimeRange};
pub use composition::{Holding, PortfolioComposition};
pub use portfolio::{HistoricalPortfolioSnapshot, PositionSnapshot};
pub use price::{is_valid_price, PriceSnapshot, Stored};
pub use primitives::{RecordId, Symbol, TimeMs, DAY_MS};
