use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tickvault::datasource::{
    FallbackRateProvider, FrankfurterRateProvider, InMemoryHoldings, StaticRateProvider,
};
use tickvault::orchestration::ProcStatmProbe;
use tickvault::{
    api, config::Config, db::init_db, CurrencyRateProvider, HistoryDeps, HistoryService,
    Repository, SnapshotStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let port = config.port;

    let pool = init_db(&config.database_path)
        .await
        .with_context(|| format!("initializing database at {}", config.database_path))?;
    let store: Arc<dyn SnapshotStore> = Arc::new(Repository::new(pool));

    let rates: Arc<dyn CurrencyRateProvider> = match &config.fx_api_url {
        Some(url) => Arc::new(FallbackRateProvider::new(
            Arc::new(FrankfurterRateProvider::new(url.clone())),
            Arc::new(StaticRateProvider::new()),
        )),
        None => Arc::new(StaticRateProvider::new()),
    };
    let holdings = Arc::new(InMemoryHoldings::default());

    let history = HistoryService::build(
        &config,
        HistoryDeps {
            store,
            rates,
            holdings: holdings.clone(),
            probe: Arc::new(ProcStatmProbe),
        },
    )
    .await;

    // Background loops run for the life of the process.
    let _monitor = history.memory().spawn_monitor();
    let _maintenance = history.spawn_maintenance(config.maintenance_interval);

    let app = api::create_router(api::AppState::new(history, holdings));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
