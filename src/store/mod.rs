//! Snapshot store abstraction.
//!
//! The store is the only durable owner of price and portfolio snapshots.
//! Every component reaches it through the narrow contract below: save,
//! filtered fetch with sort/limit/offset, count, and batch delete/update by
//! filter. Results are always returned in timestamp order.

use crate::domain::{
    HistoricalPortfolioSnapshot, PriceSnapshot, RecordId, Stored, Symbol, TimeMs,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::fmt;
use thiserror::Error;

pub mod memory;

pub use memory::MemorySnapshotStore;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Timestamp sort direction (ties broken by record id in the same direction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Predicate over price snapshots. Empty filter matches everything.
///
/// `from` is inclusive, `until` exclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceFilter {
    pub symbol: Option<Symbol>,
    pub from: Option<TimeMs>,
    pub until: Option<TimeMs>,
    pub ids: Option<Vec<RecordId>>,
    /// Restrict to points retention has (or has not) already thinned.
    pub compressed: Option<bool>,
}

impl PriceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_symbol(symbol: &Symbol) -> Self {
        Self {
            symbol: Some(symbol.clone()),
            ..Self::default()
        }
    }

    pub fn with_ids(ids: Vec<RecordId>) -> Self {
        Self {
            ids: Some(ids),
            ..Self::default()
        }
    }

    pub fn from(mut self, from: TimeMs) -> Self {
        self.from = Some(from);
        self
    }

    pub fn until(mut self, until: TimeMs) -> Self {
        self.until = Some(until);
        self
    }

    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = Some(compressed);
        self
    }

    /// Field predicate; the compressed flag is checked with [`Self::matches_flag`].
    pub fn matches(&self, id: RecordId, snapshot: &PriceSnapshot) -> bool {
        self.symbol.as_ref().map_or(true, |s| *s == snapshot.symbol)
            && self.from.map_or(true, |f| snapshot.timestamp >= f)
            && self.until.map_or(true, |u| snapshot.timestamp < u)
            && self.ids.as_ref().map_or(true, |ids| ids.contains(&id))
    }

    pub fn matches_flag(&self, compressed: bool) -> bool {
        self.compressed.map_or(true, |c| c == compressed)
    }
}

/// Predicate over portfolio snapshots, on their `date`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortfolioFilter {
    pub from: Option<TimeMs>,
    pub until: Option<TimeMs>,
    pub currency: Option<String>,
    pub ids: Option<Vec<RecordId>>,
}

impl PortfolioFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_ids(ids: Vec<RecordId>) -> Self {
        Self {
            ids: Some(ids),
            ..Self::default()
        }
    }

    pub fn from(mut self, from: TimeMs) -> Self {
        self.from = Some(from);
        self
    }

    pub fn until(mut self, until: TimeMs) -> Self {
        self.until = Some(until);
        self
    }

    pub fn currency(mut self, currency: &str) -> Self {
        self.currency = Some(currency.to_string());
        self
    }

    pub fn matches(&self, id: RecordId, snapshot: &HistoricalPortfolioSnapshot) -> bool {
        self.from.map_or(true, |f| snapshot.date >= f)
            && self.until.map_or(true, |u| snapshot.date < u)
            && self
                .currency
                .as_ref()
                .map_or(true, |c| *c == snapshot.currency)
            && self.ids.as_ref().map_or(true, |ids| ids.contains(&id))
    }
}

/// Filter plus ordering and paging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query<F> {
    pub filter: F,
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl<F> Query<F> {
    pub fn new(filter: F) -> Self {
        Self {
            filter,
            order: SortOrder::Ascending,
            limit: None,
            offset: 0,
        }
    }

    pub fn descending(mut self) -> Self {
        self.order = SortOrder::Descending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

pub type PriceQuery = Query<PriceFilter>;
pub type PortfolioQuery = Query<PortfolioFilter>;

/// Field changes applied by a price batch update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceUpdate {
    /// Multiply `price` and `previous_close` (split adjustment).
    pub price_scale: Option<f64>,
    pub volume: Option<f64>,
    /// Flag the rows as thinned so later retention runs skip them.
    pub mark_compressed: bool,
}

/// Field changes applied by a portfolio batch update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortfolioUpdate {
    /// Multiply total value/cost/gains.
    pub value_scale: Option<f64>,
    pub currency: Option<String>,
}

impl PriceUpdate {
    pub fn apply(&self, snapshot: &mut PriceSnapshot) {
        if let Some(scale) = self.price_scale {
            snapshot.price *= scale;
            snapshot.previous_close *= scale;
        }
        if let Some(volume) = self.volume {
            snapshot.volume = Some(volume);
        }
    }
}

impl PortfolioUpdate {
    pub fn apply(&self, snapshot: &mut HistoricalPortfolioSnapshot) {
        if let Some(scale) = self.value_scale {
            snapshot.total_value *= scale;
            snapshot.total_cost *= scale;
            snapshot.total_gains = snapshot.total_value - snapshot.total_cost;
        }
        if let Some(currency) = &self.currency {
            snapshot.currency = currency.clone();
        }
    }
}

/// Durable snapshot storage.
///
/// Implementations must make each call atomic on its own (one transaction
/// per call); callers never hold locks across calls.
#[async_trait]
pub trait SnapshotStore: Send + Sync + fmt::Debug {
    /// Persist price snapshots, returning their ids in input order.
    async fn save_prices(&self, snapshots: &[PriceSnapshot]) -> Result<Vec<RecordId>, StoreError>;

    async fn fetch_prices(&self, query: &PriceQuery)
        -> Result<Vec<Stored<PriceSnapshot>>, StoreError>;

    async fn count_prices(&self, filter: &PriceFilter) -> Result<usize, StoreError>;

    async fn delete_prices(&self, filter: &PriceFilter) -> Result<usize, StoreError>;

    async fn update_prices(
        &self,
        filter: &PriceFilter,
        update: &PriceUpdate,
    ) -> Result<usize, StoreError>;

    /// Distinct symbols with at least one stored price, sorted.
    async fn price_symbols(&self) -> Result<Vec<Symbol>, StoreError>;

    /// Distinct UTC days with at least one stored price matching `filter`, ascending.
    async fn price_days(&self, filter: &PriceFilter) -> Result<Vec<NaiveDate>, StoreError>;

    async fn save_portfolio_snapshots(
        &self,
        snapshots: &[HistoricalPortfolioSnapshot],
    ) -> Result<Vec<RecordId>, StoreError>;

    async fn fetch_portfolio_snapshots(
        &self,
        query: &PortfolioQuery,
    ) -> Result<Vec<Stored<HistoricalPortfolioSnapshot>>, StoreError>;

    async fn count_portfolio_snapshots(&self, filter: &PortfolioFilter)
        -> Result<usize, StoreError>;

    async fn delete_portfolio_snapshots(
        &self,
        filter: &PortfolioFilter,
    ) -> Result<usize, StoreError>;

    async fn update_portfolio_snapshots(
        &self,
        filter: &PortfolioFilter,
        update: &PortfolioUpdate,
    ) -> Result<usize, StoreError>;

    /// Small key/value state owned by the engine (watermarks, composition).
    async fn load_state(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn save_state(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn delete_state(&self, key: &str) -> Result<(), StoreError>;

    /// Drop any caches the backend holds in process memory.
    async fn release_resources(&self) {}
}
