//! Retention/compression actor.
//!
//! Runs purge, weekly aggregation, stride compression, deduplication and the
//! per-symbol cap in that order. Runs are serialized; store failures inside
//! a pass are logged and the pass moves on. Each pass collects its targets
//! across all symbols and hands them to the batch engine as one operation.

use crate::config::RetentionPolicy;
use crate::domain::{RecordId, Symbol, TimeMs};
use crate::engine::dedupe::{duplicate_portfolio_ids, duplicate_price_ids};
use crate::engine::retention::{
    aggregation_gate, cap_overflow, compression_gate, effective_symbol_cap,
    stride_compression_plan, weekly_aggregation_plan, RetentionHorizons,
};
use crate::orchestration::BatchMutationEngine;
use crate::store::{
    PortfolioFilter, PortfolioQuery, PriceFilter, PriceQuery, PriceUpdate, SnapshotStore,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Records removed by one retention run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub purged: usize,
    pub aggregated: usize,
    pub compressed: usize,
    pub deduplicated: usize,
    pub capped: usize,
    pub portfolio_purged: usize,
    pub portfolio_deduplicated: usize,
}

impl RetentionReport {
    pub fn total_removed(&self) -> usize {
        self.purged
            + self.aggregated
            + self.compressed
            + self.deduplicated
            + self.capped
            + self.portfolio_purged
            + self.portfolio_deduplicated
    }
}

#[derive(Debug)]
pub struct RetentionEngine {
    store: Arc<dyn SnapshotStore>,
    batch: Arc<BatchMutationEngine>,
    policy: RetentionPolicy,
    gate: Mutex<()>,
}

impl RetentionEngine {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        policy: RetentionPolicy,
        batch: Arc<BatchMutationEngine>,
    ) -> Self {
        Self {
            store,
            batch,
            policy,
            gate: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub async fn run(&self) -> RetentionReport {
        self.run_at(TimeMs::now()).await
    }

    /// Run every pass with age boundaries measured from `now`.
    pub async fn run_at(&self, now: TimeMs) -> RetentionReport {
        let _guard = self.gate.lock().await;
        let horizons = RetentionHorizons::resolve(&self.policy, now);
        let mut report = RetentionReport::default();

        self.purge(&horizons, &mut report).await;

        let symbols = match self.store.price_symbols().await {
            Ok(symbols) => symbols,
            Err(e) => {
                warn!(error = %e, "Retention could not list symbols, skipping per-symbol passes");
                Vec::new()
            }
        };

        report.aggregated = self.aggregate(&symbols, &horizons).await;
        report.compressed = self.compress(&symbols, &horizons).await;
        report.deduplicated = self.dedupe_prices(&symbols).await;
        report.portfolio_deduplicated = self.dedupe_portfolio().await;
        report.capped = self.cap(&symbols).await;

        info!(
            purged = report.purged,
            aggregated = report.aggregated,
            compressed = report.compressed,
            deduplicated = report.deduplicated,
            capped = report.capped,
            portfolio_purged = report.portfolio_purged,
            portfolio_deduplicated = report.portfolio_deduplicated,
            "Retention run complete"
        );
        report
    }

    async fn purge(&self, horizons: &RetentionHorizons, report: &mut RetentionReport) {
        let prices = PriceFilter::all().until(horizons.purge_before);
        match self.store.delete_prices(&prices).await {
            Ok(n) => report.purged = n,
            Err(e) => warn!(error = %e, "Price purge failed"),
        }

        let portfolio = PortfolioFilter::all().until(horizons.purge_before);
        match self.store.delete_portfolio_snapshots(&portfolio).await {
            Ok(n) => report.portfolio_purged = n,
            Err(e) => warn!(error = %e, "Portfolio purge failed"),
        }
    }

    async fn aggregate(&self, symbols: &[Symbol], horizons: &RetentionHorizons) -> usize {
        let gate = aggregation_gate(&self.policy);
        let mut doomed = Vec::new();

        for (i, symbol) in symbols.iter().enumerate() {
            self.maybe_yield(i).await;
            let query = PriceQuery::new(
                PriceFilter::for_symbol(symbol)
                    .from(horizons.purge_before)
                    .until(horizons.aggregate_before),
            );
            let records = match self.store.fetch_prices(&query).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Aggregation fetch failed");
                    continue;
                }
            };
            let plan = weekly_aggregation_plan(&records, gate);
            if plan.is_empty() {
                continue;
            }
            debug!(symbol = %symbol, eligible = records.len(), removing = plan.len(), "Aggregating to weekly");
            doomed.extend(plan);
        }
        self.delete_price_ids("aggregate", doomed).await
    }

    /// Thin points in the compression band that no earlier run has thinned,
    /// flagging the survivors.
    async fn compress(&self, symbols: &[Symbol], horizons: &RetentionHorizons) -> usize {
        let gate = compression_gate(&self.policy);
        let mut kept = Vec::new();
        let mut doomed = Vec::new();

        for (i, symbol) in symbols.iter().enumerate() {
            self.maybe_yield(i).await;
            let query = PriceQuery::new(
                PriceFilter::for_symbol(symbol)
                    .from(horizons.aggregate_before)
                    .until(horizons.compress_before)
                    .compressed(false),
            );
            let records = match self.store.fetch_prices(&query).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Compression fetch failed");
                    continue;
                }
            };
            let plan = stride_compression_plan(&records, self.policy.compress_keep_every, gate);
            if plan.is_empty() {
                continue;
            }
            debug!(
                symbol = %symbol,
                eligible = records.len(),
                keeping = plan.kept.len(),
                removing = plan.doomed.len(),
                "Compressing"
            );
            kept.extend(plan.kept);
            doomed.extend(plan.doomed);
        }
        if kept.is_empty() {
            return 0;
        }

        // Survivors must be flagged before anything is deleted.
        let mark = PriceUpdate {
            mark_compressed: true,
            ..PriceUpdate::default()
        };
        let marked = self.batch.update_prices(&kept, &mark).await;
        if marked.failed > 0 {
            warn!(
                operation_id = %marked.operation_id,
                failed = marked.failed,
                "Could not flag compressed survivors, skipping deletes"
            );
            return 0;
        }
        self.delete_price_ids("compress", doomed).await
    }

    async fn dedupe_prices(&self, symbols: &[Symbol]) -> usize {
        let mut doomed = Vec::new();
        for (i, symbol) in symbols.iter().enumerate() {
            self.maybe_yield(i).await;
            let records = match self
                .store
                .fetch_prices(&PriceQuery::new(PriceFilter::for_symbol(symbol)))
                .await
            {
                Ok(records) => records,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Dedup fetch failed");
                    continue;
                }
            };
            doomed.extend(duplicate_price_ids(&records));
        }
        self.delete_price_ids("dedupe", doomed).await
    }

    async fn dedupe_portfolio(&self) -> usize {
        let records = match self
            .store
            .fetch_portfolio_snapshots(&PortfolioQuery::new(PortfolioFilter::all()))
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Portfolio dedup fetch failed");
                return 0;
            }
        };
        let doomed = duplicate_portfolio_ids(&records);
        if doomed.is_empty() {
            return 0;
        }
        let outcome = self.batch.delete_portfolio_snapshots(&doomed).await;
        debug!(operation_id = %outcome.operation_id, removed = outcome.affected, "Portfolio dedup finished");
        outcome.affected
    }

    async fn cap(&self, symbols: &[Symbol]) -> usize {
        let total = match self.store.count_prices(&PriceFilter::all()).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Could not count prices, skipping cap");
                return 0;
            }
        };
        let cap = effective_symbol_cap(&self.policy, total);
        let mut doomed = Vec::new();

        for (i, symbol) in symbols.iter().enumerate() {
            self.maybe_yield(i).await;
            let filter = PriceFilter::for_symbol(symbol);
            let count = match self.store.count_prices(&filter).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Cap count failed");
                    continue;
                }
            };
            let overflow = cap_overflow(count, cap);
            if overflow == 0 {
                continue;
            }
            let oldest = match self
                .store
                .fetch_prices(&PriceQuery::new(filter).limit(overflow))
                .await
            {
                Ok(records) => records,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Cap fetch failed");
                    continue;
                }
            };
            info!(symbol = %symbol, count, cap, removing = oldest.len(), "Symbol over cap");
            doomed.extend(oldest.into_iter().map(|s| s.id));
        }
        self.delete_price_ids("cap", doomed).await
    }

    async fn delete_price_ids(&self, pass: &'static str, ids: Vec<RecordId>) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let outcome = self.batch.delete_prices(&ids).await;
        debug!(pass, operation_id = %outcome.operation_id, removed = outcome.affected, "Retention delete finished");
        outcome.affected
    }

    async fn maybe_yield(&self, i: usize) {
        if i > 0 && i % self.policy.yield_every_symbols.max(1) == 0 {
            tokio::task::yield_now().await;
        }
    }
}
