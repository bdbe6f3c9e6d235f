//! Chart query service.
//!
//! Serves bounded-size point series for the portfolio value, portfolio gains
//! and per-symbol price charts. Results are cached per
//! `(kind, range, max_points)`; a foreground request also warms the
//! neighbouring time ranges in the background.

use crate::config::ChartCacheConfig;
use crate::domain::{
    ChartDataPoint, ChartKind, HistoricalPortfolioSnapshot, PriceSnapshot, Stored, Symbol,
    TimeMs, TimeRange,
};
use crate::engine::{stride_sample, CachePriority, CacheStats, OffsetPlan, PriorityCache, SamplingStrategy};
use crate::orchestration::memory::ManagedCache;
use crate::orchestration::{JobHandle, MemoryManager, ValuationProgress};
use crate::store::{
    PortfolioFilter, PortfolioQuery, PriceFilter, PriceQuery, SnapshotStore, StoreError,
};
use futures::future::join_all;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChartKey {
    pub kind: ChartKind,
    pub range: TimeRange,
    pub max_points: usize,
}

type ChartCache = PriorityCache<ChartKey, Arc<Vec<ChartDataPoint>>>;

fn lock(mutex: &Mutex<ChartCache>) -> MutexGuard<'_, ChartCache> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct ChartQueryService {
    store: Arc<dyn SnapshotStore>,
    memory: Arc<MemoryManager>,
    page_size: usize,
    cache: Mutex<ChartCache>,
}

impl ChartQueryService {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        memory: Arc<MemoryManager>,
        config: &ChartCacheConfig,
    ) -> Self {
        Self {
            store,
            memory,
            page_size: config.page_size.max(1),
            cache: Mutex::new(PriorityCache::new(config.ttl, config.max_entries)),
        }
    }

    /// Foreground chart request. Warms adjacent ranges in the background.
    pub async fn fetch(
        self: &Arc<Self>,
        kind: ChartKind,
        range: TimeRange,
        max_points: usize,
    ) -> Vec<ChartDataPoint> {
        let points = self
            .fetch_with_priority(kind.clone(), range, max_points, CachePriority::High)
            .await;
        if max_points > 0 {
            // Detached; prefetch results only land in the cache.
            let _ = self.spawn_prefetch(kind, range, max_points);
        }
        points
    }

    /// Serve from cache or the store; cache the result if admitted.
    pub async fn fetch_with_priority(
        &self,
        kind: ChartKind,
        range: TimeRange,
        max_points: usize,
        priority: CachePriority,
    ) -> Vec<ChartDataPoint> {
        if max_points == 0 {
            return Vec::new();
        }
        let key = ChartKey {
            kind,
            range,
            max_points,
        };

        {
            let mut cache = lock(&self.cache);
            if let Some(hit) = cache.get(&key) {
                cache.promote(&key, priority);
                return hit.as_ref().clone();
            }
        }

        let points = match self.load(&key, TimeMs::now()).await {
            Ok(points) => points,
            Err(e) => {
                warn!(kind = %key.kind, range = %key.range, error = %e, "Chart query failed");
                return Vec::new();
            }
        };

        if self.memory.admit(priority) {
            let size = points.len() * std::mem::size_of::<ChartDataPoint>();
            lock(&self.cache).insert(key, Arc::new(points.clone()), size, priority);
        }
        points
    }

    /// Warm the ranges next to `range` at `Low` priority.
    pub fn spawn_prefetch(
        self: &Arc<Self>,
        kind: ChartKind,
        range: TimeRange,
        max_points: usize,
    ) -> JobHandle<()> {
        let service = Arc::clone(self);
        JobHandle::spawn(async move {
            let jobs = range.adjacent().into_iter().map(|neighbour| {
                service.fetch_with_priority(kind.clone(), neighbour, max_points, CachePriority::Low)
            });
            let results = join_all(jobs).await;
            debug!(kind = %kind, range = %range, warmed = results.len(), "Prefetch finished");
        })
    }

    async fn load(&self, key: &ChartKey, now: TimeMs) -> Result<Vec<ChartDataPoint>, StoreError> {
        let from = key.range.start(now);
        match &key.kind {
            ChartKind::Price(symbol) => {
                let mut filter = PriceFilter::for_symbol(symbol);
                filter.from = from;
                let count = self.store.count_prices(&filter).await?;
                let records = self
                    .sample(count, key.max_points, |offset, limit| {
                        let mut query = PriceQuery::new(filter.clone()).offset(offset);
                        query.limit = limit;
                        async move { self.store.fetch_prices(&query).await }
                    })
                    .await?;
                Ok(records.iter().map(price_point).collect())
            }
            kind => {
                let mut filter = PortfolioFilter::all();
                filter.from = from;
                let count = self.store.count_portfolio_snapshots(&filter).await?;
                let records = self
                    .sample(count, key.max_points, |offset, limit| {
                        let mut query = PortfolioQuery::new(filter.clone()).offset(offset);
                        query.limit = limit;
                        async move { self.store.fetch_portfolio_snapshots(&query).await }
                    })
                    .await?;
                let gains = *kind == ChartKind::PortfolioGains;
                Ok(records.iter().map(|r| portfolio_point(r, gains)).collect())
            }
        }
    }

    /// Apply the sampling strategy for `count` records. `fetch_page` takes
    /// an offset and an optional limit.
    async fn sample<T, F, Fut>(
        &self,
        count: usize,
        max_points: usize,
        fetch_page: F,
    ) -> Result<Vec<T>, StoreError>
    where
        T: Clone,
        F: Fn(usize, Option<usize>) -> Fut,
        Fut: Future<Output = Result<Vec<T>, StoreError>>,
    {
        match SamplingStrategy::choose(count, max_points) {
            SamplingStrategy::Empty => Ok(Vec::new()),
            SamplingStrategy::All => {
                let mut all = fetch_page(0, None).await?;
                all.truncate(max_points);
                Ok(all)
            }
            SamplingStrategy::Stride => {
                let all = fetch_page(0, None).await?;
                Ok(stride_sample(&all, max_points))
            }
            SamplingStrategy::Offset { keep_every } => {
                let plan = OffsetPlan::new(self.page_size, keep_every, max_points);
                let mut out = Vec::with_capacity(max_points);
                let mut offset = 0;
                while out.len() < max_points {
                    let page = fetch_page(offset, Some(plan.page_size)).await?;
                    let fetched = page.len();
                    if fetched == 0 {
                        break;
                    }
                    let kept = plan.select(offset, page, out.len());
                    out.extend(kept);
                    offset += fetched;
                    tokio::task::yield_now().await;
                }
                Ok(out)
            }
        }
    }

    pub fn invalidate_symbol(&self, symbol: &Symbol) -> usize {
        lock(&self.cache).retain_keys(|k| !matches!(&k.kind, ChartKind::Price(s) if s == symbol))
    }

    pub fn invalidate_portfolio(&self) -> usize {
        lock(&self.cache).retain_keys(|k| !k.kind.is_portfolio())
    }

    pub fn invalidate_all(&self) -> usize {
        lock(&self.cache).clear()
    }

    pub fn purge_expired(&self) -> usize {
        lock(&self.cache).purge_expired()
    }

    pub fn stats(&self) -> CacheStats {
        lock(&self.cache).stats()
    }

    /// Drop portfolio entries whenever valuation publishes progress.
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        mut progress: watch::Receiver<ValuationProgress>,
    ) -> JobHandle<()> {
        let service = Arc::clone(self);
        JobHandle::spawn(async move {
            while progress.changed().await.is_ok() {
                let dropped = service.invalidate_portfolio();
                if dropped > 0 {
                    debug!(dropped, "Portfolio chart entries invalidated");
                }
            }
        })
    }
}

fn price_point(stored: &Stored<PriceSnapshot>) -> ChartDataPoint {
    ChartDataPoint {
        date: stored.record.timestamp,
        value: stored.record.price,
        symbol: Some(stored.record.symbol.clone()),
    }
}

fn portfolio_point(stored: &Stored<HistoricalPortfolioSnapshot>, gains: bool) -> ChartDataPoint {
    let snapshot = &stored.record;
    ChartDataPoint {
        date: snapshot.date,
        value: if gains {
            snapshot.total_gains
        } else {
            snapshot.total_value
        },
        symbol: None,
    }
}

impl ManagedCache for ChartQueryService {
    fn name(&self) -> &str {
        "chart"
    }

    fn estimated_bytes(&self) -> usize {
        lock(&self.cache).estimated_bytes()
    }

    fn evict_low_priority(&self) -> usize {
        let mut cache = lock(&self.cache);
        cache.purge_expired() + cache.evict_below(CachePriority::Normal)
    }

    fn shrink(&self) -> usize {
        lock(&self.cache).shrink()
    }

    fn restore(&self) {
        lock(&self.cache).restore()
    }
}
