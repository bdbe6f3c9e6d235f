use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use tickvault::config::{BatchConfig, RetentionPolicy};
use tickvault::db::init_db;
use tickvault::domain::{
    HistoricalPortfolioSnapshot, PositionSnapshot, PriceSnapshot, Symbol, TimeMs, DAY_MS,
};
use tickvault::orchestration::{BatchMutationEngine, RetentionEngine};
use tickvault::store::{
    PortfolioFilter, PortfolioQuery, PortfolioUpdate, PriceFilter, PriceQuery, PriceUpdate,
};
use tickvault::{MemorySnapshotStore, Repository, SnapshotStore};

async fn sqlite_store() -> (Arc<dyn SnapshotStore>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    (Arc::new(Repository::new(pool)), temp_dir)
}

fn price(symbol: &str, ts: i64, px: f64) -> PriceSnapshot {
    PriceSnapshot::new(Symbol::new(symbol), TimeMs::new(ts), px, px - 1.0)
}

fn portfolio(day: i64, value: f64) -> HistoricalPortfolioSnapshot {
    let mut composition = BTreeMap::new();
    composition.insert(
        Symbol::new("AAPL"),
        PositionSnapshot::new(Symbol::new("AAPL"), 10.0, value / 10.0, "USD"),
    );
    HistoricalPortfolioSnapshot::new(TimeMs::new(day * DAY_MS), value, 900.0, "USD", composition, "fp")
}

/// Runs the same script against a store; both backends must agree.
async fn exercise(store: Arc<dyn SnapshotStore>) {
    let aapl = Symbol::new("AAPL");
    let ids = store
        .save_prices(&[
            price("AAPL", 3 * DAY_MS, 103.0),
            price("AAPL", DAY_MS, 101.0),
            price("MSFT", 2 * DAY_MS, 302.0),
            price("AAPL", 2 * DAY_MS, 102.0),
        ])
        .await
        .unwrap();
    assert_eq!(ids.len(), 4);

    // Ordered by timestamp regardless of insert order.
    let rows = store
        .fetch_prices(&PriceQuery::new(PriceFilter::for_symbol(&aapl)))
        .await
        .unwrap();
    let stamps: Vec<i64> = rows.iter().map(|r| r.record.timestamp.as_ms()).collect();
    assert_eq!(stamps, vec![DAY_MS, 2 * DAY_MS, 3 * DAY_MS]);

    let page = store
        .fetch_prices(&PriceQuery::new(PriceFilter::for_symbol(&aapl)).descending().limit(1).offset(1))
        .await
        .unwrap();
    assert_eq!(page[0].record.price, 102.0);

    let window = PriceFilter::all().from(TimeMs::new(2 * DAY_MS)).until(TimeMs::new(3 * DAY_MS));
    assert_eq!(store.count_prices(&window).await.unwrap(), 2);
    assert_eq!(
        store.price_symbols().await.unwrap(),
        vec![Symbol::new("AAPL"), Symbol::new("MSFT")]
    );
    assert_eq!(store.price_days(&PriceFilter::all()).await.unwrap().len(), 3);

    let updated = store
        .update_prices(
            &PriceFilter::for_symbol(&aapl),
            &PriceUpdate {
                price_scale: Some(0.5),
                volume: Some(7.0),
                mark_compressed: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(updated, 3);
    let first = store
        .fetch_prices(&PriceQuery::new(PriceFilter::for_symbol(&aapl)).limit(1))
        .await
        .unwrap();
    assert_eq!(first[0].record.price, 50.5);
    assert_eq!(first[0].record.previous_close, 50.0);
    assert_eq!(first[0].record.volume, Some(7.0));

    // Thinned points are flagged without touching their values.
    let marked = store
        .update_prices(
            &PriceFilter::with_ids(vec![ids[3]]),
            &PriceUpdate {
                mark_compressed: true,
                ..PriceUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(marked, 1);
    assert_eq!(store.count_prices(&PriceFilter::all().compressed(true)).await.unwrap(), 1);
    let fresh = store
        .fetch_prices(&PriceQuery::new(PriceFilter::for_symbol(&aapl).compressed(false)))
        .await
        .unwrap();
    let fresh_ids: Vec<i64> = fresh.iter().map(|r| r.id).collect();
    assert_eq!(fresh_ids, vec![ids[1], ids[0]]);
    let flagged = store
        .fetch_prices(&PriceQuery::new(PriceFilter::with_ids(vec![ids[3]])))
        .await
        .unwrap();
    assert_eq!(flagged[0].record.price, 51.0);

    assert_eq!(
        store.delete_prices(&PriceFilter::with_ids(vec![ids[0], ids[2]])).await.unwrap(),
        2
    );
    assert_eq!(store.count_prices(&PriceFilter::all()).await.unwrap(), 2);

    // Portfolio snapshots round-trip their composition map.
    store
        .save_portfolio_snapshots(&[portfolio(2, 1000.0), portfolio(1, 950.0)])
        .await
        .unwrap();
    let snaps = store
        .fetch_portfolio_snapshots(&PortfolioQuery::new(PortfolioFilter::all()))
        .await
        .unwrap();
    assert_eq!(snaps.len(), 2);
    assert_eq!(snaps[0].record.total_value, 950.0);
    assert_eq!(snaps[1].record.composition.len(), 1);
    assert_eq!(snaps[1].record.composition_fingerprint, "fp");

    let rescaled = store
        .update_portfolio_snapshots(
            &PortfolioFilter::all(),
            &PortfolioUpdate {
                value_scale: Some(2.0),
                currency: Some("EUR".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(rescaled, 2);
    let eur = store
        .count_portfolio_snapshots(&PortfolioFilter::all().currency("EUR"))
        .await
        .unwrap();
    assert_eq!(eur, 2);
    let last = store
        .fetch_portfolio_snapshots(&PortfolioQuery::new(PortfolioFilter::all()).descending().limit(1))
        .await
        .unwrap();
    assert_eq!(last[0].record.total_value, 2000.0);
    assert_eq!(last[0].record.total_gains, 2000.0 - 1800.0);

    assert_eq!(
        store
            .delete_portfolio_snapshots(&PortfolioFilter::all().from(TimeMs::new(2 * DAY_MS)))
            .await
            .unwrap(),
        1
    );

    // Engine state.
    assert_eq!(store.load_state("k").await.unwrap(), None);
    store.save_state("k", "v1").await.unwrap();
    store.save_state("k", "v2").await.unwrap();
    assert_eq!(store.load_state("k").await.unwrap().as_deref(), Some("v2"));
    store.delete_state("k").await.unwrap();
    assert_eq!(store.load_state("k").await.unwrap(), None);

    store.release_resources().await;
}

#[tokio::test]
async fn test_memory_store_contract() {
    exercise(Arc::new(MemorySnapshotStore::new())).await;
}

#[tokio::test]
async fn test_sqlite_store_contract() {
    let (store, _temp) = sqlite_store().await;
    exercise(store).await;
}

#[tokio::test]
async fn test_sqlite_state_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db").to_string_lossy().to_string();
    {
        let repo = Repository::new(init_db(&db_path).await.unwrap());
        repo.save_prices(&[price("AAPL", DAY_MS, 10.0)]).await.unwrap();
        repo.save_state("composition.current", "{}").await.unwrap();
    }
    let reopened = Repository::new(init_db(&db_path).await.unwrap());
    assert_eq!(reopened.count_prices(&PriceFilter::all()).await.unwrap(), 1);
    assert_eq!(
        reopened.load_state("composition.current").await.unwrap().as_deref(),
        Some("{}")
    );
}

#[tokio::test]
async fn test_retention_is_idempotent_on_sqlite() {
    let (store, _temp) = sqlite_store().await;
    let now = TimeMs::new(3000 * DAY_MS);
    let mut snapshots = Vec::new();
    // Past the purge horizon.
    for d in 0..5 {
        snapshots.push(price("AAPL", now.as_ms() - (2000 + d) * DAY_MS, 10.0));
    }
    // Dense band inside the compression window: four points per day.
    for d in 31..41 {
        for h in 0..4 {
            snapshots.push(price("AAPL", now.as_ms() - d * DAY_MS + h * 3_600_000, 10.0));
        }
    }
    store.save_prices(&snapshots).await.unwrap();

    let batch = Arc::new(BatchMutationEngine::new(store.clone(), BatchConfig::default()));
    let engine = RetentionEngine::new(store.clone(), RetentionPolicy::default(), batch);
    let first = engine.run_at(now).await;
    assert_eq!(first.purged, 5);
    assert_eq!(first.compressed, 30);
    assert_eq!(store.count_prices(&PriceFilter::all().compressed(true)).await.unwrap(), 10);
    let after_first = store.count_prices(&PriceFilter::all()).await.unwrap();

    let second = engine.run_at(now).await;
    assert_eq!(second.total_removed(), 0);
    assert_eq!(store.count_prices(&PriceFilter::all()).await.unwrap(), after_first);
}
