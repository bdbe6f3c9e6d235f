//! Memory pressure monitoring and cache remediation.
//!
//! A periodic sampler reads process memory into a fixed-length ring buffer
//! and classifies it against the configured thresholds. Rising pressure
//! evicts low-value cache entries, then shrinks caches, releases store
//! resources and runs retention. The manager also owns the price-series cache
//! used by valuation runs.

use crate::config::MemoryThresholds;
use crate::domain::{PriceSnapshot, Symbol};
use crate::engine::{CachePriority, PriorityCache};
use crate::orchestration::{JobHandle, RetentionEngine};
use crate::store::SnapshotStore;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SERIES_TTL: Duration = Duration::from_secs(600);
const PAGE_SIZE_BYTES: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
    Emergency,
}

/// Source of the process's resident memory.
pub trait MemoryProbe: Send + Sync + fmt::Debug {
    /// Resident bytes, or `None` when the platform gives no answer.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads RSS from `/proc/self/statm` (Linux).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcStatmProbe;

impl MemoryProbe for ProcStatmProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages * PAGE_SIZE_BYTES)
    }
}

/// Probe reporting whatever value it was last given.
#[derive(Debug, Default)]
pub struct FixedProbe {
    bytes: AtomicU64,
}

impl FixedProbe {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
        }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedProbe {
    fn resident_bytes(&self) -> Option<u64> {
        Some(self.bytes.load(Ordering::SeqCst))
    }
}

/// A cache the manager can trim under pressure.
pub trait ManagedCache: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn estimated_bytes(&self) -> usize;
    /// Drop expired and `Low` priority entries.
    fn evict_low_priority(&self) -> usize;
    /// Halve the permitted size.
    fn shrink(&self) -> usize;
    /// Return to the configured size.
    fn restore(&self);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub current_bytes: u64,
    pub level: MemoryLevel,
    pub peak_bytes: u64,
    pub average_bytes: u64,
    pub samples: usize,
    pub own_cache_entries: usize,
    pub own_cache_bytes: usize,
    pub registered_caches: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct MemoryManager {
    thresholds: MemoryThresholds,
    probe: Arc<dyn MemoryProbe>,
    store: Arc<dyn SnapshotStore>,
    retention: Arc<RetentionEngine>,
    caches: Mutex<Vec<Weak<dyn ManagedCache>>>,
    samples: Mutex<VecDeque<u64>>,
    level: Mutex<MemoryLevel>,
    peak: AtomicU64,
    series: Mutex<PriorityCache<Symbol, Arc<Vec<PriceSnapshot>>>>,
    remediation: tokio::sync::Mutex<()>,
}

impl MemoryManager {
    pub fn new(
        thresholds: MemoryThresholds,
        probe: Arc<dyn MemoryProbe>,
        store: Arc<dyn SnapshotStore>,
        retention: Arc<RetentionEngine>,
    ) -> Self {
        let series = PriorityCache::new(SERIES_TTL, thresholds.series_cache_entries);
        let history_len = thresholds.history_len.max(1);
        Self {
            thresholds,
            probe,
            store,
            retention,
            caches: Mutex::new(Vec::new()),
            samples: Mutex::new(VecDeque::with_capacity(history_len)),
            level: Mutex::new(MemoryLevel::Normal),
            peak: AtomicU64::new(0),
            series: Mutex::new(series),
            remediation: tokio::sync::Mutex::new(()),
        }
    }

    /// Put a cache under management. The manager holds it weakly.
    pub fn register(&self, cache: &Arc<dyn ManagedCache>) {
        lock(&self.caches).push(Arc::downgrade(cache));
    }

    pub fn level(&self) -> MemoryLevel {
        *lock(&self.level)
    }

    pub fn classify(&self, bytes: u64) -> MemoryLevel {
        if bytes >= self.thresholds.emergency_bytes {
            MemoryLevel::Emergency
        } else if bytes >= self.thresholds.critical_bytes {
            MemoryLevel::Critical
        } else if bytes >= self.thresholds.warning_bytes {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        }
    }

    /// Whether a new cache entry of `priority` may be stored right now.
    pub fn admit(&self, priority: CachePriority) -> bool {
        priority == CachePriority::High || self.level() < MemoryLevel::Critical
    }

    fn live_caches(&self) -> Vec<Arc<dyn ManagedCache>> {
        let mut caches = lock(&self.caches);
        caches.retain(|w| w.strong_count() > 0);
        caches.iter().filter_map(Weak::upgrade).collect()
    }

    fn estimated_cache_bytes(&self) -> u64 {
        let managed: usize = self.live_caches().iter().map(|c| c.estimated_bytes()).sum();
        (managed + lock(&self.series).estimated_bytes()) as u64
    }

    /// Take one sample, classify it and remediate on level changes.
    pub async fn sample(&self) -> MemoryLevel {
        let bytes = self
            .probe
            .resident_bytes()
            .unwrap_or_else(|| self.estimated_cache_bytes());
        {
            let mut samples = lock(&self.samples);
            if samples.len() >= self.thresholds.history_len.max(1) {
                samples.pop_front();
            }
            samples.push_back(bytes);
        }
        self.peak.fetch_max(bytes, Ordering::SeqCst);

        let level = self.classify(bytes);
        let previous = std::mem::replace(&mut *lock(&self.level), level);
        if level != previous {
            info!(bytes, ?previous, ?level, "Memory level changed");
        }
        self.remediate(previous, level).await;
        level
    }

    async fn remediate(&self, previous: MemoryLevel, level: MemoryLevel) {
        let _guard = self.remediation.lock().await;
        let caches = self.live_caches();

        if level == MemoryLevel::Normal {
            if previous > MemoryLevel::Normal {
                for cache in &caches {
                    cache.restore();
                }
                lock(&self.series).restore();
                debug!("Cache capacities restored");
            }
            return;
        }

        let mut evicted = 0;
        for cache in &caches {
            evicted += cache.evict_low_priority();
        }
        {
            let mut series = lock(&self.series);
            evicted += series.purge_expired() + series.evict_below(CachePriority::Normal);
        }

        if level >= MemoryLevel::Critical {
            for cache in &caches {
                evicted += cache.shrink();
            }
            evicted += lock(&self.series).shrink();

            if previous < MemoryLevel::Critical {
                self.store.release_resources().await;
                let report = self.retention.run().await;
                info!(removed = report.total_removed(), "Retention run under memory pressure");
            }
        }

        if level == MemoryLevel::Emergency {
            error!(evicted, "Memory usage at emergency level");
        } else if level >= MemoryLevel::Warning && evicted > 0 {
            warn!(evicted, ?level, "Evicted cache entries under memory pressure");
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let samples = lock(&self.samples);
        let current = samples.back().copied().unwrap_or(0);
        let average = if samples.is_empty() {
            0
        } else {
            samples.iter().sum::<u64>() / samples.len() as u64
        };
        let series = lock(&self.series);
        MemoryStats {
            current_bytes: current,
            level: self.level(),
            peak_bytes: self.peak.load(Ordering::SeqCst),
            average_bytes: average,
            samples: samples.len(),
            own_cache_entries: series.len(),
            own_cache_bytes: series.estimated_bytes(),
            registered_caches: lock(&self.caches).len(),
        }
    }

    // =========================================================================
    // Price-series cache
    // =========================================================================

    pub fn cached_series(&self, symbol: &Symbol) -> Option<Arc<Vec<PriceSnapshot>>> {
        lock(&self.series).get(symbol)
    }

    pub fn cache_series(&self, symbol: Symbol, series: Arc<Vec<PriceSnapshot>>) {
        if !self.admit(CachePriority::Normal) {
            return;
        }
        let size = series.len() * std::mem::size_of::<PriceSnapshot>();
        lock(&self.series).insert(symbol, series, size, CachePriority::Normal);
    }

    pub fn invalidate_series(&self, symbol: &Symbol) {
        lock(&self.series).remove(symbol);
    }

    pub fn clear_series(&self) {
        lock(&self.series).clear();
    }

    /// Sample on the configured interval until the process exits.
    pub fn spawn_monitor(self: &Arc<Self>) -> JobHandle<()> {
        let manager = Arc::clone(self);
        JobHandle::spawn(async move {
            let mut ticker = tokio::time::interval(manager.thresholds.sample_interval);
            loop {
                ticker.tick().await;
                manager.sample().await;
            }
        })
    }
}
