pub mod api;
pub mod config;
pub mod datasource;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod orchestration;
pub mod store;

pub use config::Config;
pub use datasource::{CurrencyRateProvider, DataSourceError, HoldingsSource};
pub use db::{init_db, Repository};
pub use domain::{
    ChartDataPoint, ChartKind, HistoricalPortfolioSnapshot, Holding, PriceSnapshot, Symbol,
    TimeMs, TimeRange,
};
pub use error::AppError;
pub use orchestration::{HistoryDeps, HistoryService};
pub use store::{MemorySnapshotStore, SnapshotStore};
