//! Retroactive valuation actor.
//!
//! Given the current holdings, asks the composition tracker whether to
//! recompute everything or only the tail, then walks the stored price days
//! in month-sized windows. Each window is saved, the tracker watermark is
//! advanced and progress is published so chart caches can drop stale
//! portfolio series.

use crate::config::ValuationConfig;
use crate::datasource::CurrencyRateProvider;
use crate::domain::currency::{self, INTERMEDIATE_CURRENCY};
use crate::domain::{Holding, PortfolioComposition, PriceSnapshot, Symbol, TimeMs};
use crate::engine::valuation::required_currencies;
use crate::engine::{ConversionTable, DayValuer, PriceIndex, ValuationParams};
use crate::orchestration::composition::{CompositionTracker, ValuationMode};
use crate::orchestration::{BatchMutationEngine, MemoryManager};
use crate::store::{PortfolioFilter, PriceFilter, PriceQuery, SnapshotStore};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Latest state of valuation work, published after every window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationProgress {
    /// Monotonic run counter; 0 before the first run.
    pub run: u64,
    pub mode: Option<ValuationMode>,
    pub computed_through: Option<NaiveDate>,
    pub windows_done: usize,
    pub snapshots_written: usize,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationOutcome {
    pub mode: ValuationMode,
    /// Inclusive day range that was evaluated, if any.
    pub range: Option<(NaiveDate, NaiveDate)>,
    pub currency: String,
    pub days_considered: usize,
    pub days_emitted: usize,
    pub days_skipped: usize,
    pub windows: usize,
}

impl ValuationOutcome {
    fn empty(mode: ValuationMode, currency: &str) -> Self {
        Self {
            mode,
            range: None,
            currency: currency.to_string(),
            days_considered: 0,
            days_emitted: 0,
            days_skipped: 0,
            windows: 0,
        }
    }
}

#[derive(Debug)]
pub struct ValuationEngine {
    store: Arc<dyn SnapshotStore>,
    tracker: Arc<CompositionTracker>,
    rates: Arc<dyn CurrencyRateProvider>,
    memory: Arc<MemoryManager>,
    batch: Arc<BatchMutationEngine>,
    config: ValuationConfig,
    purge_after_days: i64,
    display_currency: Mutex<String>,
    gate: tokio::sync::Mutex<()>,
    progress: watch::Sender<ValuationProgress>,
    runs: AtomicU64,
}

impl ValuationEngine {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        tracker: Arc<CompositionTracker>,
        rates: Arc<dyn CurrencyRateProvider>,
        memory: Arc<MemoryManager>,
        batch: Arc<BatchMutationEngine>,
        config: ValuationConfig,
        purge_after_days: i64,
        display_currency: &str,
    ) -> Self {
        let (progress, _) = watch::channel(ValuationProgress::default());
        Self {
            store,
            tracker,
            rates,
            memory,
            batch,
            config,
            purge_after_days,
            display_currency: Mutex::new(currency::normalize(display_currency)),
            gate: tokio::sync::Mutex::new(()),
            progress,
            runs: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ValuationProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> ValuationProgress {
        self.progress.borrow().clone()
    }

    pub fn tracker(&self) -> &Arc<CompositionTracker> {
        &self.tracker
    }

    pub fn display_currency(&self) -> String {
        self.display_currency
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    pub fn set_display_currency(&self, code: &str) {
        let code = currency::normalize(code);
        match self.display_currency.lock() {
            Ok(mut guard) => *guard = code,
            Err(poisoned) => *poisoned.into_inner() = code,
        }
    }

    /// Wait for any in-flight run to finish, then hold off new ones while
    /// the returned guard lives.
    pub async fn pause(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    pub async fn run(&self, holdings: Vec<Holding>) -> ValuationOutcome {
        self.run_at(holdings, TimeMs::now().day()).await
    }

    /// Value `holdings` through `today` (inclusive).
    pub async fn run_at(&self, holdings: Vec<Holding>, today: NaiveDate) -> ValuationOutcome {
        let _guard = self.gate.lock().await;
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let composition = PortfolioComposition::from_holdings(holdings);
        let requested_currency = self.display_currency();

        let plan = match self.tracker.plan(composition).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "Could not plan valuation run");
                return ValuationOutcome::empty(ValuationMode::Full, &requested_currency);
            }
        };
        let mode = plan.mode;
        let composition = plan.composition;

        if mode == ValuationMode::Full {
            if let Err(e) = self.store.delete_portfolio_snapshots(&PortfolioFilter::all()).await {
                warn!(error = %e, "Could not discard portfolio history before full recompute");
            }
        }

        let start = match plan.resume_from {
            Some(day) => Some(day),
            None => self.earliest_price_day(&composition, today).await,
        };
        let Some(start) = start.filter(|s| *s <= today) else {
            debug!(?mode, "Nothing to value");
            let outcome = ValuationOutcome::empty(mode, &requested_currency);
            self.publish(run, mode, &outcome, plan.resume_from, true);
            return outcome;
        };

        if mode == ValuationMode::Incremental {
            let stale = PortfolioFilter::all().from(TimeMs::start_of_day(start));
            if let Err(e) = self.store.delete_portfolio_snapshots(&stale).await {
                warn!(error = %e, "Could not clear portfolio snapshots being recomputed");
            }
        }

        let (rates, display_currency) = self.resolve_rates(&composition, &requested_currency).await;
        let index = self.load_index(&composition).await;
        let days = match self
            .store
            .price_days(
                &PriceFilter::all()
                    .from(TimeMs::start_of_day(start))
                    .until(TimeMs::start_of_day(today).plus_days(1)),
            )
            .await
        {
            Ok(days) => days,
            Err(e) => {
                warn!(error = %e, "Could not list price days");
                Vec::new()
            }
        };

        let params = ValuationParams {
            min_valid_fraction: self.config.min_valid_fraction,
            tolerance_days: self.config.lookup_tolerance_days,
        };
        let valuer = DayValuer::new(&composition, &index, &rates, params, &display_currency);

        let mut outcome = ValuationOutcome {
            mode,
            range: Some((start, today)),
            currency: display_currency.clone(),
            days_considered: days.len(),
            days_emitted: 0,
            days_skipped: 0,
            windows: 0,
        };

        let window_days = self.config.window_days.max(1);
        let yield_every = self.config.yield_every_days.max(1);
        let mut processed = 0usize;
        let mut cursor = 0usize;
        let mut through = plan.resume_from;

        while cursor < days.len() {
            let window_start = days[cursor];
            let window_len = days[cursor..]
                .iter()
                .take_while(|d| (**d - window_start).num_days() < window_days)
                .count();
            let window = &days[cursor..cursor + window_len];
            cursor += window_len;

            let mut snapshots = Vec::with_capacity(window.len());
            for day in window {
                processed += 1;
                if processed % yield_every == 0 {
                    tokio::task::yield_now().await;
                }
                match valuer.value(*day) {
                    Some(snapshot) => snapshots.push(snapshot),
                    None => outcome.days_skipped += 1,
                }
            }

            if !snapshots.is_empty() {
                let saved = self.batch.insert_portfolio_snapshots(&snapshots).await;
                if saved.failed > 0 {
                    warn!(
                        operation_id = %saved.operation_id,
                        failed = saved.failed,
                        window_start = %window_start,
                        "Saving valuation window failed, stopping run"
                    );
                    break;
                }
            }
            outcome.days_emitted += snapshots.len();
            outcome.windows += 1;

            if let Some(last) = window.last() {
                if let Err(e) = self.tracker.advance(*last).await {
                    warn!(error = %e, "Could not advance computed-through day");
                }
                through = Some(*last);
            }
            self.publish(run, mode, &outcome, through, false);

            if !self.config.window_pause.is_zero() && cursor < days.len() {
                tokio::time::sleep(self.config.window_pause).await;
            }
        }

        self.publish(run, mode, &outcome, through, true);
        info!(
            ?mode,
            start = %start,
            end = %today,
            currency = %outcome.currency,
            considered = outcome.days_considered,
            emitted = outcome.days_emitted,
            skipped = outcome.days_skipped,
            windows = outcome.windows,
            "Valuation run complete"
        );
        outcome
    }

    fn publish(
        &self,
        run: u64,
        mode: ValuationMode,
        outcome: &ValuationOutcome,
        through: Option<NaiveDate>,
        finished: bool,
    ) {
        self.progress.send_replace(ValuationProgress {
            run,
            mode: Some(mode),
            computed_through: through,
            windows_done: outcome.windows,
            snapshots_written: outcome.days_emitted,
            finished,
        });
    }

    /// Earliest stored day among the composition's symbols, clamped to the purge horizon.
    async fn earliest_price_day(
        &self,
        composition: &PortfolioComposition,
        today: NaiveDate,
    ) -> Option<NaiveDate> {
        let horizon = TimeMs::start_of_day(today).plus_days(-self.purge_after_days).day();
        let mut earliest: Option<NaiveDate> = None;
        for symbol in composition.symbols() {
            match self
                .store
                .fetch_prices(&PriceQuery::new(PriceFilter::for_symbol(&symbol)).limit(1))
                .await
            {
                Ok(first) => {
                    if let Some(stored) = first.first() {
                        let day = stored.record.timestamp.day();
                        earliest = Some(earliest.map_or(day, |e| e.min(day)));
                    }
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "Could not read earliest price"),
            }
        }
        earliest.map(|d| d.max(horizon))
    }

    async fn resolve_rates(
        &self,
        composition: &PortfolioComposition,
        requested: &str,
    ) -> (ConversionTable, String) {
        let mut table = ConversionTable::new();
        for code in required_currencies(composition, requested) {
            match self.rates.rate(&code, INTERMEDIATE_CURRENCY).await {
                Ok(rate) => table.insert(&code, rate),
                Err(e) => warn!(currency = %code, error = %e, "No FX rate, positions in this currency are skipped"),
            }
        }

        if table.supports(requested) {
            (table, requested.to_string())
        } else {
            warn!(requested, "Display currency not convertible, reporting in USD");
            (table, INTERMEDIATE_CURRENCY.to_string())
        }
    }

    async fn load_index(&self, composition: &PortfolioComposition) -> PriceIndex {
        let mut index = PriceIndex::new();
        for symbol in composition.symbols() {
            if let Some(series) = self.memory.cached_series(&symbol) {
                index.insert(symbol, series);
                continue;
            }
            match self.load_series(&symbol).await {
                Some(series) => {
                    self.memory.cache_series(symbol.clone(), series.clone());
                    index.insert(symbol, series);
                }
                None => debug!(symbol = %symbol, "No price history"),
            }
        }
        index
    }

    async fn load_series(&self, symbol: &Symbol) -> Option<Arc<Vec<PriceSnapshot>>> {
        match self
            .store
            .fetch_prices(&PriceQuery::new(PriceFilter::for_symbol(symbol)))
            .await
        {
            Ok(records) if !records.is_empty() => Some(Arc::new(
                records.into_iter().map(|s| s.record).collect(),
            )),
            Ok(_) => None,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Could not load price history");
                None
            }
        }
    }
}
