//! Public facade over the history engine.
//!
//! `HistoryService` wires the store, retention, valuation, chart, memory and
//! batch services together and exposes the operations the HTTP layer and
//! the binary use: recording ticks, chart queries, recalculation, imports,
//! storage maintenance and display-currency changes.

use crate::config::Config;
use crate::datasource::{
    parse_price_csv, CurrencyRateProvider, DataSourceError, HoldingsSource, ImportError,
};
use crate::domain::currency::{self, INTERMEDIATE_CURRENCY};
use crate::domain::{
    ChartDataPoint, ChartKind, Holding, PriceSnapshot, RecordId, Symbol, TimeMs, TimeRange,
};
use crate::engine::dedupe::filter_near_duplicates;
use crate::engine::{CacheStats, ConversionTable};
use crate::orchestration::batch::BatchOutcome;
use crate::orchestration::memory::{ManagedCache, MemoryLevel, MemoryProbe};
use crate::orchestration::{
    BatchMutationEngine, ChartQueryService, CompositionTracker, JobError, JobHandle,
    MemoryManager, RetentionEngine, RetentionReport, ValuationEngine, ValuationOutcome,
};
use crate::store::{
    PortfolioFilter, PortfolioQuery, PortfolioUpdate, PriceFilter, PriceQuery, SnapshotStore,
    StoreError,
};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("import error: {0}")]
    Import(#[from] ImportError),
    #[error("data source error: {0}")]
    DataSource(#[from] DataSourceError),
    #[error("background job failed: {0}")]
    Job(#[from] JobError),
    #[error("invalid input: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    Stored { id: RecordId },
    /// Too soon after the last accepted tick of this symbol.
    #[serde(rename_all = "camelCase")]
    RateLimited { last_accepted: TimeMs },
    /// Price was not a positive finite number.
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolStorage {
    pub symbol: Symbol,
    pub count: usize,
    pub first: Option<TimeMs>,
    pub last: Option<TimeMs>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub symbols: Vec<SymbolStorage>,
    pub total_price_points: usize,
    pub portfolio_snapshots: usize,
    pub portfolio_first: Option<TimeMs>,
    pub portfolio_last: Option<TimeMs>,
    pub display_currency: String,
    pub computed_through: Option<NaiveDate>,
    pub memory_level: MemoryLevel,
    pub chart_cache: CacheStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub operation_id: Uuid,
    /// Rows or snapshots handed in.
    pub received: usize,
    /// Dropped as unparseable, invalid or near-duplicate.
    pub skipped: usize,
    pub stored: usize,
    pub failed: usize,
}

/// Handed back as soon as an import is filtered and its insert scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportTicket {
    pub operation_id: Uuid,
    pub received: usize,
    pub skipped: usize,
    /// Snapshots handed to the batch insert.
    pub accepted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearedData {
    pub prices: usize,
    pub portfolio_snapshots: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrencyChange {
    pub from: String,
    pub to: String,
    pub factor: f64,
    pub outcome: Option<BatchOutcome>,
}

/// Collaborators supplied by the caller; everything else is built here.
#[derive(Debug, Clone)]
pub struct HistoryDeps {
    pub store: Arc<dyn SnapshotStore>,
    pub rates: Arc<dyn CurrencyRateProvider>,
    pub holdings: Arc<dyn HoldingsSource>,
    pub probe: Arc<dyn MemoryProbe>,
}

#[derive(Debug)]
pub struct HistoryService {
    store: Arc<dyn SnapshotStore>,
    rates: Arc<dyn CurrencyRateProvider>,
    holdings: Arc<dyn HoldingsSource>,
    retention: Arc<RetentionEngine>,
    memory: Arc<MemoryManager>,
    valuation: Arc<ValuationEngine>,
    charts: Arc<ChartQueryService>,
    batch: Arc<BatchMutationEngine>,
    tick_min_interval: Duration,
    /// Newest accepted tick timestamp per symbol. Held across the save.
    last_ticks: Mutex<HashMap<Symbol, TimeMs>>,
}

impl HistoryService {
    pub async fn build(config: &Config, deps: HistoryDeps) -> Arc<Self> {
        let HistoryDeps {
            store,
            rates,
            holdings,
            probe,
        } = deps;

        let batch = Arc::new(BatchMutationEngine::new(store.clone(), config.batch.clone()));
        let retention = Arc::new(RetentionEngine::new(
            store.clone(),
            config.retention.clone(),
            batch.clone(),
        ));
        let memory = Arc::new(MemoryManager::new(
            config.memory.clone(),
            probe,
            store.clone(),
            retention.clone(),
        ));
        let tracker = Arc::new(CompositionTracker::load(store.clone()).await);
        let valuation = Arc::new(ValuationEngine::new(
            store.clone(),
            tracker,
            rates.clone(),
            memory.clone(),
            batch.clone(),
            config.valuation.clone(),
            config.retention.purge_after_days,
            &config.preferred_currency,
        ));

        let charts = Arc::new(ChartQueryService::new(
            store.clone(),
            memory.clone(),
            &config.chart_cache,
        ));
        let managed: Arc<dyn ManagedCache> = charts.clone();
        memory.register(&managed);
        // Detached: ends when the valuation engine is dropped.
        let _ = charts.spawn_invalidation_listener(valuation.subscribe());

        Arc::new(Self {
            store,
            rates,
            holdings,
            retention,
            memory,
            valuation,
            charts,
            batch,
            tick_min_interval: config.tick_min_interval,
            last_ticks: Mutex::new(HashMap::new()),
        })
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn charts(&self) -> &Arc<ChartQueryService> {
        &self.charts
    }

    pub fn batch(&self) -> &Arc<BatchMutationEngine> {
        &self.batch
    }

    pub fn valuation(&self) -> &Arc<ValuationEngine> {
        &self.valuation
    }

    pub fn retention(&self) -> &Arc<RetentionEngine> {
        &self.retention
    }

    // =========================================================================
    // Ticks and charts
    // =========================================================================

    /// Store one live price observation, subject to the per-symbol interval.
    ///
    /// A tick older than the newest accepted one is checked against its
    /// stored neighbours on both sides.
    pub async fn record_tick(
        &self,
        symbol: Symbol,
        price: f64,
        previous_close: f64,
        timestamp: TimeMs,
        volume: Option<f64>,
    ) -> Result<TickOutcome, HistoryError> {
        if symbol.is_empty() {
            return Err(HistoryError::Invalid("symbol must not be empty".to_string()));
        }
        let mut snapshot = PriceSnapshot::new(symbol.clone(), timestamp, price, previous_close);
        if let Some(volume) = volume {
            snapshot = snapshot.with_volume(volume);
        }
        if !snapshot.is_valid() {
            debug!(symbol = %symbol, price, "Ignoring tick with invalid price");
            return Ok(TickOutcome::Invalid);
        }

        let mut last_ticks = self.last_ticks.lock().await;
        let newest = match last_ticks.get(&symbol) {
            Some(t) => Some(*t),
            None => self.latest_stored_tick(&symbol).await?,
        };
        let min_gap = self.tick_min_interval.as_millis() as i64;
        let conflict = match newest {
            Some(newest) if timestamp >= newest => {
                (timestamp.as_ms() - newest.as_ms() < min_gap).then_some(newest)
            }
            Some(_) => self.nearest_stored_tick(&symbol, timestamp, min_gap).await?,
            None => None,
        };
        if let Some(neighbour) = conflict {
            debug!(symbol = %symbol, %timestamp, %neighbour, "Tick rate limited");
            return Ok(TickOutcome::RateLimited {
                last_accepted: neighbour,
            });
        }

        let ids = self.store.save_prices(std::slice::from_ref(&snapshot)).await?;
        let newest = newest.map_or(timestamp, |n| n.max(timestamp));
        last_ticks.insert(symbol.clone(), newest);
        drop(last_ticks);

        self.memory.invalidate_series(&symbol);
        self.charts.invalidate_symbol(&symbol);
        let id = ids.first().copied().unwrap_or_default();
        debug!(symbol = %symbol, id, price, "Tick stored");
        Ok(TickOutcome::Stored { id })
    }

    async fn latest_stored_tick(&self, symbol: &Symbol) -> Result<Option<TimeMs>, StoreError> {
        let latest = self
            .store
            .fetch_prices(&PriceQuery::new(PriceFilter::for_symbol(symbol)).descending().limit(1))
            .await?;
        Ok(latest.first().map(|s| s.record.timestamp))
    }

    /// Closest stored point less than `min_gap` away from `at`, either side.
    async fn nearest_stored_tick(
        &self,
        symbol: &Symbol,
        at: TimeMs,
        min_gap: i64,
    ) -> Result<Option<TimeMs>, StoreError> {
        let filter = PriceFilter::for_symbol(symbol)
            .from(TimeMs::new(at.as_ms() - min_gap + 1))
            .until(TimeMs::new(at.as_ms() + min_gap));
        let nearby = self.store.fetch_prices(&PriceQuery::new(filter)).await?;
        Ok(nearby
            .into_iter()
            .map(|s| s.record.timestamp)
            .min_by_key(|t| (t.as_ms() - at.as_ms()).abs()))
    }

    pub async fn fetch_chart_data(
        &self,
        kind: ChartKind,
        range: TimeRange,
        max_points: usize,
    ) -> Vec<ChartDataPoint> {
        self.charts.fetch(kind, range, max_points).await
    }

    // =========================================================================
    // Valuation
    // =========================================================================

    pub fn trigger_retroactive_recalculation(
        &self,
        holdings: Vec<Holding>,
    ) -> JobHandle<ValuationOutcome> {
        let valuation = Arc::clone(&self.valuation);
        JobHandle::spawn(async move { valuation.run(holdings).await })
    }

    /// Read the current holdings from the configured source and recalculate.
    pub async fn recalculate_from_source(&self) -> Result<JobHandle<ValuationOutcome>, HistoryError> {
        let holdings = self.holdings.holdings().await?;
        Ok(self.trigger_retroactive_recalculation(holdings))
    }

    /// Rescale stored portfolio history into `new_currency` and use it for
    /// future runs.
    pub async fn change_display_currency(
        &self,
        new_currency: &str,
    ) -> Result<CurrencyChange, HistoryError> {
        let to = currency::normalize(new_currency);
        if to.len() != 3 || !to.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(HistoryError::Invalid(format!("invalid currency code: {}", new_currency)));
        }

        let _paused = self.valuation.pause().await;
        let from = self.valuation.display_currency();
        if from == to {
            return Ok(CurrencyChange {
                from,
                to,
                factor: 1.0,
                outcome: None,
            });
        }

        let mut table = ConversionTable::new();
        for code in [&from, &to] {
            let settlement = currency::settlement_currency(code);
            if settlement != INTERMEDIATE_CURRENCY {
                let rate = self.rates.rate(&settlement, INTERMEDIATE_CURRENCY).await?;
                table.insert(&settlement, rate);
            }
        }
        let factor = table
            .to_usd(1.0, &from)
            .and_then(|usd| table.from_usd(usd, &to))
            .ok_or_else(|| DataSourceError::UnsupportedCurrency(format!("{} -> {}", from, to)))?;

        let ids: Vec<RecordId> = self
            .store
            .fetch_portfolio_snapshots(&PortfolioQuery::new(PortfolioFilter::all()))
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let outcome = self
            .batch
            .update_portfolio_snapshots(
                &ids,
                &PortfolioUpdate {
                    value_scale: Some(factor),
                    currency: Some(to.clone()),
                },
            )
            .await;

        if outcome.failed > 0 {
            warn!(failed = outcome.failed, "Portfolio history partly rescaled, forcing full recompute");
            self.valuation.tracker().reset().await?;
        }
        self.valuation.set_display_currency(&to);
        self.charts.invalidate_portfolio();
        info!(%from, %to, factor, snapshots = ids.len(), "Display currency changed");

        Ok(CurrencyChange {
            from,
            to,
            factor,
            outcome: Some(outcome),
        })
    }

    // =========================================================================
    // Imports
    // =========================================================================

    /// Bulk-insert historical prices, dropping any within `tolerance_ms` of
    /// a stored or another imported point of the same symbol.
    pub async fn import_prices(
        self: &Arc<Self>,
        snapshots: Vec<PriceSnapshot>,
        tolerance_ms: i64,
    ) -> Result<ImportReport, HistoryError> {
        let (_, job) = self.start_import_prices(snapshots, tolerance_ms).await?;
        Ok(job.join().await?)
    }

    /// Filter the snapshots, then insert them in the background.
    ///
    /// The ticket carries the batch operation id, which is pollable through
    /// [`BatchMutationEngine::progress`] while the insert runs.
    pub async fn start_import_prices(
        self: &Arc<Self>,
        snapshots: Vec<PriceSnapshot>,
        tolerance_ms: i64,
    ) -> Result<(ImportTicket, JobHandle<ImportReport>), HistoryError> {
        let received = snapshots.len();
        let tolerance_ms = tolerance_ms.max(0);

        let mut bounds: HashMap<Symbol, (TimeMs, TimeMs)> = HashMap::new();
        for s in &snapshots {
            bounds
                .entry(s.symbol.clone())
                .and_modify(|(lo, hi)| {
                    *lo = (*lo).min(s.timestamp);
                    *hi = (*hi).max(s.timestamp);
                })
                .or_insert((s.timestamp, s.timestamp));
        }

        let mut existing: HashMap<Symbol, Vec<TimeMs>> = HashMap::with_capacity(bounds.len());
        for (symbol, (lo, hi)) in &bounds {
            let filter = PriceFilter::for_symbol(symbol)
                .from(TimeMs::new(lo.as_ms() - tolerance_ms))
                .until(TimeMs::new(hi.as_ms() + tolerance_ms + 1));
            let stamps = self
                .store
                .fetch_prices(&PriceQuery::new(filter))
                .await?
                .into_iter()
                .map(|s| s.record.timestamp)
                .collect();
            existing.insert(symbol.clone(), stamps);
        }

        let accepted = filter_near_duplicates(snapshots, &existing, tolerance_ms);
        let accepted_count = accepted.len();
        let earliest_day = accepted.iter().map(|s| s.timestamp.day()).min();
        let touched: BTreeSet<Symbol> = accepted.iter().map(|s| s.symbol.clone()).collect();

        let (operation_id, insert) = self.batch.start_insert_prices(accepted);
        let ticket = ImportTicket {
            operation_id,
            received,
            skipped: received - accepted_count,
            accepted: accepted_count,
        };

        let service = Arc::clone(self);
        let job = JobHandle::spawn(async move {
            let (stored, failed) = match insert.join().await {
                Ok(outcome) => (outcome.succeeded, outcome.failed),
                Err(e) => {
                    warn!(%operation_id, error = %e, "Price import job did not finish");
                    (0, accepted_count)
                }
            };
            if stored > 0 {
                service.after_import(&touched, earliest_day).await;
            }
            info!(received, accepted = accepted_count, stored, failed, "Price import finished");
            ImportReport {
                operation_id,
                received,
                skipped: received - accepted_count,
                stored,
                failed,
            }
        });
        Ok((ticket, job))
    }

    /// Drop cached series and make the next valuation run cover imported days
    /// that were already valued.
    async fn after_import(&self, touched: &BTreeSet<Symbol>, earliest_day: Option<NaiveDate>) {
        for symbol in touched {
            self.memory.invalidate_series(symbol);
            self.charts.invalidate_symbol(symbol);
        }
        let Some(day) = earliest_day else {
            return;
        };
        let _paused = self.valuation.pause().await;
        match self.valuation.tracker().rewind_to(day).await {
            Ok(true) => info!(%day, "Imported prices predate valued history, revaluing from there"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, %day, "Could not rewind valuation after import"),
        }
    }

    /// Parse `symbol,timestamp,price,previous_close,volume` rows and import them.
    pub async fn import_csv<R: Read>(
        self: &Arc<Self>,
        reader: R,
        tolerance_ms: i64,
    ) -> Result<ImportReport, HistoryError> {
        let (ticket, job) = self.start_import_csv(reader, tolerance_ms).await?;
        let mut report = job.join().await?;
        report.received = ticket.received;
        report.skipped = ticket.skipped;
        Ok(report)
    }

    /// CSV counterpart of [`Self::start_import_prices`]; unparseable rows
    /// count as received and skipped.
    pub async fn start_import_csv<R: Read>(
        self: &Arc<Self>,
        reader: R,
        tolerance_ms: i64,
    ) -> Result<(ImportTicket, JobHandle<ImportReport>), HistoryError> {
        let parsed = parse_price_csv(reader)?;
        let (mut ticket, job) = self.start_import_prices(parsed.snapshots, tolerance_ms).await?;
        ticket.received += parsed.skipped;
        ticket.skipped += parsed.skipped;
        Ok((ticket, job))
    }

    // =========================================================================
    // Storage
    // =========================================================================

    pub async fn storage_status(&self) -> Result<StorageStatus, HistoryError> {
        let mut symbols = Vec::new();
        let mut total_price_points = 0;
        for symbol in self.store.price_symbols().await? {
            let filter = PriceFilter::for_symbol(&symbol);
            let count = self.store.count_prices(&filter).await?;
            let first = self
                .store
                .fetch_prices(&PriceQuery::new(filter.clone()).limit(1))
                .await?;
            let last = self
                .store
                .fetch_prices(&PriceQuery::new(filter).descending().limit(1))
                .await?;
            total_price_points += count;
            symbols.push(SymbolStorage {
                symbol,
                count,
                first: first.first().map(|s| s.record.timestamp),
                last: last.first().map(|s| s.record.timestamp),
            });
        }

        let all = PortfolioFilter::all();
        let portfolio_snapshots = self.store.count_portfolio_snapshots(&all).await?;
        let first = self
            .store
            .fetch_portfolio_snapshots(&PortfolioQuery::new(all.clone()).limit(1))
            .await?;
        let last = self
            .store
            .fetch_portfolio_snapshots(&PortfolioQuery::new(all).descending().limit(1))
            .await?;

        Ok(StorageStatus {
            symbols,
            total_price_points,
            portfolio_snapshots,
            portfolio_first: first.first().map(|s| s.record.date),
            portfolio_last: last.first().map(|s| s.record.date),
            display_currency: self.valuation.display_currency(),
            computed_through: self.valuation.tracker().computed_through().await,
            memory_level: self.memory.level(),
            chart_cache: self.charts.stats(),
        })
    }

    /// Run every retention pass now.
    pub async fn force_compression(&self) -> RetentionReport {
        let report = self.retention.run().await;
        if report.total_removed() > 0 {
            self.memory.clear_series();
            self.charts.invalidate_all();
        }
        report
    }

    /// Delete every snapshot and forget all derived state.
    ///
    /// Waits for an in-flight valuation run and keeps new ones out until done.
    pub async fn clear_all_data(&self) -> Result<ClearedData, HistoryError> {
        let _paused = self.valuation.pause().await;
        let prices = self.store.delete_prices(&PriceFilter::all()).await?;
        let portfolio_snapshots = self
            .store
            .delete_portfolio_snapshots(&PortfolioFilter::all())
            .await?;
        self.valuation.tracker().reset().await?;
        self.last_ticks.lock().await.clear();
        self.memory.clear_series();
        self.charts.invalidate_all();
        info!(prices, portfolio_snapshots, "All history cleared");
        Ok(ClearedData {
            prices,
            portfolio_snapshots,
        })
    }

    /// Periodic retention and cache upkeep, first pass after one interval.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JobHandle<()> {
        let service = Arc::clone(self);
        JobHandle::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let expired = service.charts.purge_expired();
                let report = service.force_compression().await;
                debug!(expired, removed = report.total_removed(), "Maintenance pass finished");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{InMemoryHoldings, MockRateProvider};
    use crate::domain::DAY_MS;
    use crate::orchestration::memory::FixedProbe;
    use crate::store::MemorySnapshotStore;

    async fn service(store: Arc<MemorySnapshotStore>) -> Arc<HistoryService> {
        let config = Config::with_database_path(":memory:");
        let deps = HistoryDeps {
            store,
            rates: Arc::new(MockRateProvider::new().with_rate("GBP", 1.25)),
            holdings: Arc::new(InMemoryHoldings::default()),
            probe: Arc::new(FixedProbe::new(0)),
        };
        HistoryService::build(&config, deps).await
    }

    #[tokio::test]
    async fn test_tick_rate_limit_uses_tick_timestamps() {
        let store = Arc::new(MemorySnapshotStore::new());
        let svc = service(store.clone()).await;
        let aapl = Symbol::new("AAPL");
        let t0 = TimeMs::new(1_700_000_000_000);

        let first = svc.record_tick(aapl.clone(), 100.0, 99.0, t0, None).await.unwrap();
        assert!(matches!(first, TickOutcome::Stored { .. }));

        let soon = TimeMs::new(t0.as_ms() + 60_000);
        let limited = svc.record_tick(aapl.clone(), 101.0, 99.0, soon, None).await.unwrap();
        assert_eq!(limited, TickOutcome::RateLimited { last_accepted: t0 });

        let later = TimeMs::new(t0.as_ms() + 5 * 60_000);
        let stored = svc.record_tick(aapl.clone(), 102.0, 99.0, later, None).await.unwrap();
        assert!(matches!(stored, TickOutcome::Stored { .. }));

        assert_eq!(store.count_prices(&PriceFilter::all()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_survives_restart() {
        let store = Arc::new(MemorySnapshotStore::new());
        let t0 = TimeMs::new(1_700_000_000_000);
        svc_tick(&*service(store.clone()).await, t0).await;

        let restarted = service(store.clone()).await;
        let outcome = restarted
            .record_tick(Symbol::new("AAPL"), 100.0, 99.0, TimeMs::new(t0.as_ms() + 1000), None)
            .await
            .unwrap();
        assert!(matches!(outcome, TickOutcome::RateLimited { .. }));
    }

    async fn svc_tick(svc: &HistoryService, at: TimeMs) {
        svc.record_tick(Symbol::new("AAPL"), 100.0, 99.0, at, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_tick_and_store_failure() {
        let store = Arc::new(MemorySnapshotStore::new());
        let svc = service(store.clone()).await;
        let t0 = TimeMs::new(1_700_000_000_000);

        let invalid = svc.record_tick(Symbol::new("AAPL"), 0.0, 1.0, t0, None).await.unwrap();
        assert_eq!(invalid, TickOutcome::Invalid);

        store.set_unavailable(true);
        let err = svc.record_tick(Symbol::new("AAPL"), 10.0, 1.0, t0, None).await;
        assert!(matches!(err, Err(HistoryError::Store(_))));
    }

    #[tokio::test]
    async fn test_import_skips_near_duplicates() {
        let store = Arc::new(MemorySnapshotStore::new());
        let svc = service(store.clone()).await;
        let aapl = Symbol::new("AAPL");
        store
            .save_prices(&[PriceSnapshot::new(aapl.clone(), TimeMs::new(0), 10.0, 9.0)])
            .await
            .unwrap();

        let incoming = vec![
            PriceSnapshot::new(aapl.clone(), TimeMs::new(500), 10.0, 9.0),
            PriceSnapshot::new(aapl.clone(), TimeMs::new(DAY_MS), 11.0, 10.0),
            PriceSnapshot::new(aapl.clone(), TimeMs::new(DAY_MS + 200), 11.0, 10.0),
            PriceSnapshot::new(aapl.clone(), TimeMs::new(2 * DAY_MS), -1.0, 10.0),
        ];
        let report = svc.import_prices(incoming, 1000).await.unwrap();
        assert_eq!(report.received, 4);
        assert_eq!(report.stored, 1);
        assert_eq!(report.skipped, 3);
        assert_eq!(store.count_prices(&PriceFilter::all()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_import_csv_counts_bad_rows() {
        let store = Arc::new(MemorySnapshotStore::new());
        let svc = service(store.clone()).await;
        let csv = "symbol,timestamp,price,previous_close,volume\n\
                   AAPL,2024-01-02,185.5,184.0,100\n\
                   AAPL,not-a-date,1,1,\n\
                   MSFT,2024-01-02,370.1,368.0,\n";
        let report = svc.import_csv(csv.as_bytes(), 0).await.unwrap();
        assert_eq!(report.received, 3);
        assert_eq!(report.stored, 2);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_out_of_order_tick_checks_both_neighbours() {
        let store = Arc::new(MemorySnapshotStore::new());
        let svc = service(store.clone()).await;
        let at = |minutes: i64| TimeMs::new(1_700_000_000_000 + minutes * 60_000);
        let tick = |minutes: i64| svc.record_tick(Symbol::new("AAPL"), 100.0, 99.0, at(minutes), None);

        assert!(matches!(tick(0).await.unwrap(), TickOutcome::Stored { .. }));
        assert!(matches!(tick(10).await.unwrap(), TickOutcome::Stored { .. }));
        assert_eq!(
            tick(2).await.unwrap(),
            TickOutcome::RateLimited { last_accepted: at(0) }
        );
        assert_eq!(
            tick(11).await.unwrap(),
            TickOutcome::RateLimited { last_accepted: at(10) }
        );
        assert_eq!(
            tick(8).await.unwrap(),
            TickOutcome::RateLimited { last_accepted: at(10) }
        );
        // A full interval from both neighbours.
        assert!(matches!(tick(5).await.unwrap(), TickOutcome::Stored { .. }));

        assert_eq!(store.count_prices(&PriceFilter::all()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_started_import_is_trackable() {
        let store = Arc::new(MemorySnapshotStore::new());
        let svc = service(store.clone()).await;
        let incoming: Vec<PriceSnapshot> = (0..3)
            .map(|d| PriceSnapshot::new(Symbol::new("AAPL"), TimeMs::new(d * DAY_MS), 10.0, 9.0))
            .collect();

        let (ticket, job) = svc.start_import_prices(incoming, 0).await.unwrap();
        assert_eq!(ticket.received, 3);
        assert_eq!(ticket.accepted, 3);
        let progress = svc.batch().progress(ticket.operation_id).unwrap();
        assert_eq!(progress.total, 3);

        let report = job.join().await.unwrap();
        assert_eq!(report.operation_id, ticket.operation_id);
        assert_eq!(report.stored, 3);
        assert!(svc.batch().progress(ticket.operation_id).unwrap().finished);
        assert_eq!(store.count_prices(&PriceFilter::all()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_backfilled_import_is_revalued() {
        let store = Arc::new(MemorySnapshotStore::new());
        let svc = service(store.clone()).await;
        let today = TimeMs::now().day();
        let midnight = TimeMs::start_of_day(today).as_ms();
        let noon = |days_ago: i64| TimeMs::new(midnight - days_ago * DAY_MS + DAY_MS / 2);
        let recent: Vec<PriceSnapshot> = (0..10)
            .map(|d| PriceSnapshot::new(Symbol::new("AAPL"), noon(d), 100.0, 100.0))
            .collect();
        store.save_prices(&recent).await.unwrap();

        let holdings = vec![Holding::new(Symbol::new("AAPL"), 10.0, 90.0, "USD")];
        let first = svc
            .trigger_retroactive_recalculation(holdings.clone())
            .join()
            .await
            .unwrap();
        assert_eq!(first.days_emitted, 10);
        assert_eq!(svc.valuation().tracker().computed_through().await, Some(today));

        let backfill = vec![PriceSnapshot::new(Symbol::new("AAPL"), noon(20), 100.0, 100.0)];
        let report = svc.import_prices(backfill, 0).await.unwrap();
        assert_eq!(report.stored, 1);
        assert_eq!(
            svc.valuation().tracker().computed_through().await,
            Some(noon(20).day())
        );

        let second = svc
            .trigger_retroactive_recalculation(holdings)
            .join()
            .await
            .unwrap();
        assert_eq!(second.mode, crate::orchestration::ValuationMode::Incremental);
        assert_eq!(second.days_emitted, 11);
        assert_eq!(
            store.count_portfolio_snapshots(&PortfolioFilter::all()).await.unwrap(),
            11
        );
    }

    #[tokio::test]
    async fn test_clear_all_data_resets_everything() {
        let store = Arc::new(MemorySnapshotStore::new());
        let svc = service(store.clone()).await;
        svc_tick(&svc, TimeMs::new(1_700_000_000_000)).await;

        let cleared = svc.clear_all_data().await.unwrap();
        assert_eq!(cleared.prices, 1);
        let status = svc.storage_status().await.unwrap();
        assert_eq!(status.total_price_points, 0);
        assert!(status.symbols.is_empty());
        assert_eq!(status.computed_through, None);

        // The tick interval is forgotten along with the data.
        let again = svc
            .record_tick(Symbol::new("AAPL"), 100.0, 99.0, TimeMs::new(1_700_000_000_001), None)
            .await
            .unwrap();
        assert!(matches!(again, TickOutcome::Stored { .. }));
    }

    #[tokio::test]
    async fn test_storage_status_reports_ranges() {
        let store = Arc::new(MemorySnapshotStore::new());
        let svc = service(store.clone()).await;
        let aapl = Symbol::new("AAPL");
        store
            .save_prices(&[
                PriceSnapshot::new(aapl.clone(), TimeMs::new(DAY_MS), 10.0, 9.0),
                PriceSnapshot::new(aapl.clone(), TimeMs::new(3 * DAY_MS), 10.0, 9.0),
            ])
            .await
            .unwrap();

        let status = svc.storage_status().await.unwrap();
        assert_eq!(status.total_price_points, 2);
        assert_eq!(status.symbols[0].first, Some(TimeMs::new(DAY_MS)));
        assert_eq!(status.symbols[0].last, Some(TimeMs::new(3 * DAY_MS)));
        assert_eq!(status.display_currency, "USD");
    }

    #[tokio::test]
    async fn test_change_display_currency_rescales_history() {
        let store = Arc::new(MemorySnapshotStore::new());
        let svc = service(store.clone()).await;
        let snapshot = crate::domain::HistoricalPortfolioSnapshot::new(
            TimeMs::new(DAY_MS),
            1250.0,
            1000.0,
            "USD",
            Default::default(),
            "fp",
        );
        store.save_portfolio_snapshots(&[snapshot]).await.unwrap();

        let change = svc.change_display_currency("gbp").await.unwrap();
        assert_eq!(change.to, "GBP");
        assert!((change.factor - 0.8).abs() < 1e-12);

        let stored = store
            .fetch_portfolio_snapshots(&PortfolioQuery::new(PortfolioFilter::all()))
            .await
            .unwrap();
        assert!((stored[0].record.total_value - 1000.0).abs() < 1e-9);
        assert_eq!(stored[0].record.currency, "GBP");
        assert_eq!(svc.valuation().display_currency(), "GBP");

        assert!(matches!(
            svc.change_display_currency("pounds").await,
            Err(HistoryError::Invalid(_))
        ));
    }
}
