use chrono::NaiveDate;
use std::sync::Arc;
use tickvault::config::Config;
use tickvault::datasource::{InMemoryHoldings, MockRateProvider};
use tickvault::domain::{Holding, PriceSnapshot, Symbol, TimeMs, DAY_MS};
use tickvault::orchestration::{FixedProbe, ValuationMode};
use tickvault::store::{PortfolioFilter, PortfolioQuery};
use tickvault::{ChartKind, HistoryDeps, HistoryService, MemorySnapshotStore, SnapshotStore, TimeRange};

fn today() -> NaiveDate {
    TimeMs::now().day()
}

async fn setup(preferred_currency: &str) -> (Arc<HistoryService>, Arc<MemorySnapshotStore>) {
    let store = Arc::new(MemorySnapshotStore::new());
    let mut config = Config::with_database_path(":memory:");
    config.preferred_currency = preferred_currency.to_string();
    let history = HistoryService::build(
        &config,
        HistoryDeps {
            store: store.clone(),
            rates: Arc::new(MockRateProvider::new().with_rate("GBP", 1.25)),
            holdings: Arc::new(InMemoryHoldings::default()),
            probe: Arc::new(FixedProbe::new(0)),
        },
    )
    .await;
    (history, store)
}

/// One price per day at midday for the `days` days ending `end`.
async fn seed_daily(store: &MemorySnapshotStore, symbol: &str, end: NaiveDate, days: i64, price: f64) {
    let end_ms = TimeMs::start_of_day(end).as_ms();
    let snapshots: Vec<PriceSnapshot> = (0..days)
        .map(|i| {
            let ts = end_ms - (days - 1 - i) * DAY_MS + DAY_MS / 2;
            PriceSnapshot::new(Symbol::new(symbol), TimeMs::new(ts), price, price)
        })
        .collect();
    store.save_prices(&snapshots).await.unwrap();
}

async fn portfolio(store: &MemorySnapshotStore) -> Vec<tickvault::HistoricalPortfolioSnapshot> {
    store
        .fetch_portfolio_snapshots(&PortfolioQuery::new(PortfolioFilter::all()))
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.record)
        .collect()
}

#[tokio::test]
async fn test_aapl_forty_days_end_to_end() {
    let (history, store) = setup("USD").await;
    let today = today();
    seed_daily(&store, "AAPL", today, 40, 100.0).await;
    let holdings = vec![Holding::new(Symbol::new("AAPL"), 10.0, 90.0, "USD")];

    let outcome = history.valuation().run_at(holdings.clone(), today).await;
    assert_eq!(outcome.mode, ValuationMode::Full);
    assert_eq!(outcome.days_considered, 40);
    assert_eq!(outcome.days_emitted, 40);
    assert_eq!(outcome.days_skipped, 0);
    assert_eq!(outcome.windows, 2);

    let snapshots = portfolio(&store).await;
    assert_eq!(snapshots.len(), 40);
    for s in &snapshots {
        assert!((s.total_value - 1000.0).abs() < 1e-9);
        assert!((s.total_cost - 900.0).abs() < 1e-9);
        assert!((s.total_gains - 100.0).abs() < 1e-9);
        assert_eq!(s.currency, "USD");
    }
    assert_eq!(
        history.valuation().tracker().computed_through().await,
        Some(today)
    );

    let progress = history.valuation().progress();
    assert!(progress.finished);
    assert_eq!(progress.snapshots_written, 40);
}

#[tokio::test]
async fn test_unchanged_composition_recomputes_only_the_tail() {
    let (history, store) = setup("USD").await;
    let today = today();
    seed_daily(&store, "AAPL", today, 40, 100.0).await;
    let holdings = vec![Holding::new(Symbol::new("AAPL"), 10.0, 90.0, "USD")];

    history.valuation().run_at(holdings.clone(), today).await;
    let second = history.valuation().run_at(holdings.clone(), today).await;
    assert_eq!(second.mode, ValuationMode::Incremental);
    assert_eq!(second.days_emitted, 1);
    assert_eq!(portfolio(&store).await.len(), 40);

    // A units change invalidates the stored history.
    let changed = vec![Holding::new(Symbol::new("AAPL"), 20.0, 90.0, "USD")];
    let third = history.valuation().run_at(changed, today).await;
    assert_eq!(third.mode, ValuationMode::Full);
    let snapshots = portfolio(&store).await;
    assert_eq!(snapshots.len(), 40);
    assert!(snapshots.iter().all(|s| (s.total_value - 2000.0).abs() < 1e-9));
}

#[tokio::test]
async fn test_gbx_display_currency_scales_by_hundred() {
    let (history, store) = setup("GBX").await;
    let today = today();
    seed_daily(&store, "VOD.L", today, 5, 80.0).await;
    let holdings = vec![Holding::new(Symbol::new("VOD.L"), 100.0, 70.0, "GBX")];

    let outcome = history.valuation().run_at(holdings, today).await;
    assert_eq!(outcome.currency, "GBX");
    assert_eq!(outcome.days_emitted, 5);

    // 8000p = 80 GBP = 100 USD, shown back in pence.
    for s in portfolio(&store).await {
        assert!((s.total_value - 8000.0).abs() < 1e-6);
        assert!((s.total_cost - 7000.0).abs() < 1e-6);
        assert_eq!(s.currency, "GBX");
    }
}

#[tokio::test]
async fn test_too_few_priced_positions_emit_nothing() {
    let (history, store) = setup("USD").await;
    let today = today();
    seed_daily(&store, "AAPL", today, 10, 100.0).await;
    let holdings = vec![
        Holding::new(Symbol::new("AAPL"), 10.0, 90.0, "USD"),
        Holding::new(Symbol::new("MSFT"), 1.0, 300.0, "USD"),
        Holding::new(Symbol::new("NVDA"), 1.0, 400.0, "USD"),
        Holding::new(Symbol::new("AMZN"), 1.0, 120.0, "USD"),
    ];

    let outcome = history.valuation().run_at(holdings, today).await;
    assert_eq!(outcome.days_considered, 10);
    assert_eq!(outcome.days_emitted, 0);
    assert_eq!(outcome.days_skipped, 10);
    assert!(portfolio(&store).await.is_empty());
}

#[tokio::test]
async fn test_triggered_job_and_portfolio_chart() {
    let (history, store) = setup("USD").await;
    seed_daily(&store, "AAPL", today(), 40, 100.0).await;
    let holdings = vec![Holding::new(Symbol::new("AAPL"), 10.0, 90.0, "USD")];

    let outcome = history
        .trigger_retroactive_recalculation(holdings)
        .join()
        .await
        .unwrap();
    assert!(outcome.days_emitted >= 39);

    let points = history
        .fetch_chart_data(ChartKind::PortfolioValue, TimeRange::Month, 10)
        .await;
    assert!(!points.is_empty());
    assert!(points.len() <= 10);
    assert!(points.windows(2).all(|w| w[0].date < w[1].date));
    assert!(points.iter().all(|p| (p.value - 1000.0).abs() < 1e-9));

    let gains = history
        .fetch_chart_data(ChartKind::PortfolioGains, TimeRange::All, 100)
        .await;
    assert_eq!(gains.len(), outcome.days_emitted);
    assert!(gains.iter().all(|p| (p.value - 100.0).abs() < 1e-9));
}

#[tokio::test]
async fn test_empty_holdings_and_no_prices() {
    let (history, _store) = setup("USD").await;
    let outcome = history.valuation().run_at(Vec::new(), today()).await;
    assert_eq!(outcome.days_emitted, 0);
    assert_eq!(outcome.range, None);
}
