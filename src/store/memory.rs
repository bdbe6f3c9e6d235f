//! In-memory snapshot store for tests and ephemeral sessions.
//!
//! Prices are indexed by symbol, each series kept sorted by (timestamp, id),
//! so range reads are binary searches rather than scans.

use super::{
    PortfolioFilter, PortfolioQuery, PortfolioUpdate, PriceFilter, PriceQuery, PriceUpdate,
    SnapshotStore, SortOrder, StoreError,
};
use crate::domain::{HistoricalPortfolioSnapshot, PriceSnapshot, RecordId, Stored, Symbol};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryState {
    next_id: RecordId,
    prices: BTreeMap<Symbol, Vec<Stored<PriceSnapshot>>>,
    /// Price ids already thinned by retention.
    compressed: HashSet<RecordId>,
    portfolio: Vec<Stored<HistoricalPortfolioSnapshot>>,
    state: HashMap<String, String>,
    rejected_symbol: Option<Symbol>,
    reject_portfolio: bool,
    unavailable: bool,
}

impl MemoryState {
    fn allocate_id(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory store marked offline".to_string()));
        }
        Ok(())
    }

    /// Candidate series for a filter: one symbol or all of them.
    fn series<'a>(
        &'a self,
        filter: &'a PriceFilter,
    ) -> Box<dyn Iterator<Item = &'a Vec<Stored<PriceSnapshot>>> + 'a> {
        match &filter.symbol {
            Some(symbol) => Box::new(self.prices.get(symbol).into_iter()),
            None => Box::new(self.prices.values()),
        }
    }
}

/// Narrow a sorted series to the `[from, until)` window with binary search.
fn window<'a>(series: &'a [Stored<PriceSnapshot>], filter: &PriceFilter) -> &'a [Stored<PriceSnapshot>] {
    let start = filter
        .from
        .map(|f| series.partition_point(|s| s.record.timestamp < f))
        .unwrap_or(0);
    let end = filter
        .until
        .map(|u| series.partition_point(|s| s.record.timestamp < u))
        .unwrap_or(series.len());
    if start >= end {
        &[]
    } else {
        &series[start..end]
    }
}

fn selected(filter: &PriceFilter, compressed: &HashSet<RecordId>, s: &Stored<PriceSnapshot>) -> bool {
    filter.matches(s.id, &s.record) && filter.matches_flag(compressed.contains(&s.id))
}

fn page<T: Clone>(mut rows: Vec<T>, order: SortOrder, offset: usize, limit: Option<usize>) -> Vec<T> {
    if order == SortOrder::Descending {
        rows.reverse();
    }
    rows.into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

/// Snapshot store backed by process memory.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    inner: RwLock<MemoryState>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save containing `symbol` fail, simulating a broken chunk.
    pub fn reject_symbol(&self, symbol: Option<Symbol>) {
        if let Ok(mut state) = self.inner.write() {
            state.rejected_symbol = symbol;
        }
    }

    /// Make every portfolio snapshot save fail.
    pub fn reject_portfolio_writes(&self, reject: bool) {
        if let Ok(mut state) = self.inner.write() {
            state.reject_portfolio = reject;
        }
    }

    /// Toggle whole-store unavailability.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.inner.write() {
            state.unavailable = unavailable;
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>, StoreError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        guard.check_available()?;
        Ok(guard)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>, StoreError> {
        let guard = self
            .inner
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        guard.check_available()?;
        Ok(guard)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save_prices(&self, snapshots: &[PriceSnapshot]) -> Result<Vec<RecordId>, StoreError> {
        let mut state = self.write()?;
        if let Some(rejected) = &state.rejected_symbol {
            if snapshots.iter().any(|s| &s.symbol == rejected) {
                return Err(StoreError::Unavailable(format!(
                    "write rejected for symbol {}",
                    rejected
                )));
            }
        }

        let mut ids = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let id = state.allocate_id();
            let series = state.prices.entry(snapshot.symbol.clone()).or_default();
            let pos = series.partition_point(|s| {
                (s.record.timestamp, s.id) < (snapshot.timestamp, id)
            });
            series.insert(pos, Stored::new(id, snapshot.clone()));
            ids.push(id);
        }
        Ok(ids)
    }

    async fn fetch_prices(
        &self,
        query: &PriceQuery,
    ) -> Result<Vec<Stored<PriceSnapshot>>, StoreError> {
        let state = self.read()?;
        let mut rows: Vec<Stored<PriceSnapshot>> = state
            .series(&query.filter)
            .flat_map(|series| window(series, &query.filter).iter())
            .filter(|s| selected(&query.filter, &state.compressed, s))
            .cloned()
            .collect();
        if query.filter.symbol.is_none() {
            rows.sort_by_key(|s| (s.record.timestamp, s.id));
        }
        Ok(page(rows, query.order, query.offset, query.limit))
    }

    async fn count_prices(&self, filter: &PriceFilter) -> Result<usize, StoreError> {
        let state = self.read()?;
        Ok(state
            .series(filter)
            .flat_map(|series| window(series, filter).iter())
            .filter(|s| selected(filter, &state.compressed, s))
            .count())
    }

    async fn delete_prices(&self, filter: &PriceFilter) -> Result<usize, StoreError> {
        let mut state = self.write()?;
        let MemoryState {
            prices, compressed, ..
        } = &mut *state;
        let mut removed = Vec::new();
        for (symbol, series) in prices.iter_mut() {
            if filter.symbol.as_ref().is_some_and(|s| s != symbol) {
                continue;
            }
            series.retain(|s| {
                let doomed = selected(filter, compressed, s);
                if doomed {
                    removed.push(s.id);
                }
                !doomed
            });
        }
        prices.retain(|_, series| !series.is_empty());
        for id in &removed {
            compressed.remove(id);
        }
        Ok(removed.len())
    }

    async fn update_prices(
        &self,
        filter: &PriceFilter,
        update: &PriceUpdate,
    ) -> Result<usize, StoreError> {
        let mut state = self.write()?;
        let MemoryState {
            prices, compressed, ..
        } = &mut *state;
        let mut updated = 0;
        for series in prices.values_mut() {
            for stored in series.iter_mut() {
                if !selected(filter, compressed, stored) {
                    continue;
                }
                update.apply(&mut stored.record);
                if update.mark_compressed {
                    compressed.insert(stored.id);
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn price_symbols(&self) -> Result<Vec<Symbol>, StoreError> {
        let state = self.read()?;
        Ok(state.prices.keys().cloned().collect())
    }

    async fn price_days(&self, filter: &PriceFilter) -> Result<Vec<NaiveDate>, StoreError> {
        let state = self.read()?;
        let days: BTreeSet<NaiveDate> = state
            .series(filter)
            .flat_map(|series| window(series, filter).iter())
            .filter(|s| selected(filter, &state.compressed, s))
            .map(|s| s.record.timestamp.day())
            .collect();
        Ok(days.into_iter().collect())
    }

    async fn save_portfolio_snapshots(
        &self,
        snapshots: &[HistoricalPortfolioSnapshot],
    ) -> Result<Vec<RecordId>, StoreError> {
        let mut state = self.write()?;
        if state.reject_portfolio {
            return Err(StoreError::Unavailable("portfolio writes rejected".to_string()));
        }
        let mut ids = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let id = state.allocate_id();
            state.portfolio.push(Stored::new(id, snapshot.clone()));
            ids.push(id);
        }
        state.portfolio.sort_by_key(|s| (s.record.date, s.id));
        Ok(ids)
    }

    async fn fetch_portfolio_snapshots(
        &self,
        query: &PortfolioQuery,
    ) -> Result<Vec<Stored<HistoricalPortfolioSnapshot>>, StoreError> {
        let state = self.read()?;
        let rows: Vec<_> = state
            .portfolio
            .iter()
            .filter(|s| query.filter.matches(s.id, &s.record))
            .cloned()
            .collect();
        Ok(page(rows, query.order, query.offset, query.limit))
    }

    async fn count_portfolio_snapshots(
        &self,
        filter: &PortfolioFilter,
    ) -> Result<usize, StoreError> {
        let state = self.read()?;
        Ok(state
            .portfolio
            .iter()
            .filter(|s| filter.matches(s.id, &s.record))
            .count())
    }

    async fn delete_portfolio_snapshots(
        &self,
        filter: &PortfolioFilter,
    ) -> Result<usize, StoreError> {
        let mut state = self.write()?;
        let before = state.portfolio.len();
        state.portfolio.retain(|s| !filter.matches(s.id, &s.record));
        Ok(before - state.portfolio.len())
    }

    async fn update_portfolio_snapshots(
        &self,
        filter: &PortfolioFilter,
        update: &PortfolioUpdate,
    ) -> Result<usize, StoreError> {
        let mut state = self.write()?;
        let mut updated = 0;
        for stored in state.portfolio.iter_mut() {
            if filter.matches(stored.id, &stored.record) {
                update.apply(&mut stored.record);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn load_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        let state = self.read()?;
        Ok(state.state.get(key).cloned())
    }

    async fn save_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.state.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_state(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.state.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TimeMs;
    use crate::store::Query;

    fn snap(symbol: &str, ts: i64, price: f64) -> PriceSnapshot {
        PriceSnapshot::new(Symbol::new(symbol), TimeMs::new(ts), price, price)
    }

    #[test]
    fn test_save_keeps_series_sorted() {
        tokio_test::block_on(async {
            let store = MemorySnapshotStore::new();
            store
                .save_prices(&[snap("AAPL", 300, 3.0), snap("AAPL", 100, 1.0), snap("AAPL", 200, 2.0)])
                .await
                .unwrap();

            let rows = store
                .fetch_prices(&Query::new(PriceFilter::for_symbol(&Symbol::new("AAPL"))))
                .await
                .unwrap();
            let ts: Vec<i64> = rows.iter().map(|r| r.record.timestamp.as_ms()).collect();
            assert_eq!(ts, vec![100, 200, 300]);
        });
    }

    #[tokio::test]
    async fn test_fetch_with_order_limit_offset() {
        let store = MemorySnapshotStore::new();
        let snaps: Vec<_> = (0..10).map(|i| snap("AAPL", i * 10, 1.0 + i as f64)).collect();
        store.save_prices(&snaps).await.unwrap();

        let rows = store
            .fetch_prices(&Query::new(PriceFilter::all()).descending().offset(2).limit(3))
            .await
            .unwrap();
        let ts: Vec<i64> = rows.iter().map(|r| r.record.timestamp.as_ms()).collect();
        assert_eq!(ts, vec![70, 60, 50]);
    }

    #[tokio::test]
    async fn test_cross_symbol_fetch_is_time_ordered() {
        let store = MemorySnapshotStore::new();
        store
            .save_prices(&[snap("MSFT", 20, 1.0), snap("AAPL", 30, 1.0), snap("AAPL", 10, 1.0)])
            .await
            .unwrap();
        let rows = store.fetch_prices(&Query::new(PriceFilter::all())).await.unwrap();
        let ts: Vec<i64> = rows.iter().map(|r| r.record.timestamp.as_ms()).collect();
        assert_eq!(ts, vec![10, 20, 30]);
        assert_eq!(
            store.price_symbols().await.unwrap(),
            vec![Symbol::new("AAPL"), Symbol::new("MSFT")]
        );
    }

    #[tokio::test]
    async fn test_delete_and_count_by_window() {
        let store = MemorySnapshotStore::new();
        let snaps: Vec<_> = (0..10).map(|i| snap("AAPL", i * 10, 1.0)).collect();
        store.save_prices(&snaps).await.unwrap();

        let filter = PriceFilter::all().until(TimeMs::new(50));
        assert_eq!(store.count_prices(&filter).await.unwrap(), 5);
        assert_eq!(store.delete_prices(&filter).await.unwrap(), 5);
        assert_eq!(store.count_prices(&PriceFilter::all()).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_compressed_flag_filters_reads() {
        let store = MemorySnapshotStore::new();
        let ids = store
            .save_prices(&[snap("AAPL", 10, 1.0), snap("AAPL", 20, 1.0), snap("AAPL", 30, 1.0)])
            .await
            .unwrap();
        let update = PriceUpdate {
            mark_compressed: true,
            ..PriceUpdate::default()
        };
        let marked = store
            .update_prices(&PriceFilter::with_ids(vec![ids[0], ids[2]]), &update)
            .await
            .unwrap();
        assert_eq!(marked, 2);

        let fresh = store
            .fetch_prices(&Query::new(PriceFilter::all().compressed(false)))
            .await
            .unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].id, ids[1]);
        assert_eq!(store.count_prices(&PriceFilter::all().compressed(true)).await.unwrap(), 2);
        assert_eq!(store.count_prices(&PriceFilter::all()).await.unwrap(), 3);

        assert_eq!(store.delete_prices(&PriceFilter::all().compressed(true)).await.unwrap(), 2);
        assert_eq!(store.count_prices(&PriceFilter::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejected_symbol_fails_whole_save() {
        let store = MemorySnapshotStore::new();
        store.reject_symbol(Some(Symbol::new("BAD")));
        let result = store
            .save_prices(&[snap("AAPL", 1, 1.0), snap("BAD", 2, 1.0)])
            .await;
        assert!(result.is_err());
        assert_eq!(store.count_prices(&PriceFilter::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemorySnapshotStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.count_prices(&PriceFilter::all()).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_price_days_are_distinct() {
        let store = MemorySnapshotStore::new();
        let day = crate::domain::DAY_MS;
        store
            .save_prices(&[snap("AAPL", 1, 1.0), snap("MSFT", 2, 1.0), snap("AAPL", day + 5, 1.0)])
            .await
            .unwrap();
        let days = store.price_days(&PriceFilter::all()).await.unwrap();
        assert_eq!(days.len(), 2);
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let store = MemorySnapshotStore::new();
        assert_eq!(store.load_state("k").await.unwrap(), None);
        store.save_state("k", "v").await.unwrap();
        assert_eq!(store.load_state("k").await.unwrap().as_deref(), Some("v"));
        store.delete_state("k").await.unwrap();
        assert_eq!(store.load_state("k").await.unwrap(), None);
    }
}
