use axum::http::StatusCode;
use std::sync::Arc;
use tempfile::TempDir;
use tickvault::api;
use tickvault::config::Config;
use tickvault::datasource::{InMemoryHoldings, MockRateProvider};
use tickvault::db::init_db;
use tickvault::domain::{PriceSnapshot, Symbol, TimeMs, DAY_MS};
use tickvault::orchestration::FixedProbe;
use tickvault::{HistoryDeps, HistoryService, Repository, SnapshotStore};
use tower::util::ServiceExt;

struct TestApp {
    app: axum::Router,
    store: Arc<dyn SnapshotStore>,
    _temp: TempDir,
}

async fn setup_test_app() -> TestApp {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    let store: Arc<dyn SnapshotStore> = Arc::new(Repository::new(pool));

    let config = Config::with_database_path(db_path);
    let holdings = Arc::new(InMemoryHoldings::default());
    let history = HistoryService::build(
        &config,
        HistoryDeps {
            store: store.clone(),
            rates: Arc::new(MockRateProvider::new().with_rate("GBP", 1.25)),
            holdings: holdings.clone(),
            probe: Arc::new(FixedProbe::new(0)),
        },
    )
    .await;

    TestApp {
        app: api::create_router(api::AppState::new(history, holdings)),
        store,
        _temp: temp_dir,
    }
}

async fn request(
    app: axum::Router,
    method: &str,
    uri: &str,
    body: Option<String>,
) -> (StatusCode, serde_json::Value) {
    let builder = axum::http::Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body))
            .unwrap(),
        None => builder.body(axum::body::Body::empty()).unwrap(),
    };

    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn seed_daily(store: &Arc<dyn SnapshotStore>, symbol: &str, days: i64, price: f64) {
    let today = TimeMs::start_of_day(TimeMs::now().day()).as_ms();
    let snapshots: Vec<PriceSnapshot> = (0..days)
        .map(|i| {
            let ts = today - (days - 1 - i) * DAY_MS + DAY_MS / 2;
            PriceSnapshot::new(Symbol::new(symbol), TimeMs::new(ts), price, price)
        })
        .collect();
    store.save_prices(&snapshots).await.unwrap();
}

async fn post_csv(app: axum::Router, uri: &str, csv: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "text/csv")
        .body(axum::body::Body::from(csv.to_string()))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
}

#[tokio::test]
async fn test_health_and_ready() {
    let test_app = setup_test_app().await;
    let (status, body) = request(test_app.app.clone(), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = request(test_app.app, "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["memoryLevel"], "normal");
}

#[tokio::test]
async fn test_tick_then_rate_limited() {
    let test_app = setup_test_app().await;
    let tick = |ts: i64| {
        Some(format!(
            r#"{{"symbol":"aapl","price":190.5,"previousClose":189.0,"timestamp":{}}}"#,
            ts
        ))
    };

    let (status, body) = request(test_app.app.clone(), "POST", "/v1/ticks", tick(1_700_000_000_000)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stored");

    let (status, body) = request(test_app.app.clone(), "POST", "/v1/ticks", tick(1_700_000_030_000)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "rate_limited");
    assert_eq!(body["lastAccepted"], 1_700_000_000_000i64);

    let (_, status_body) = request(test_app.app, "GET", "/v1/storage/status", None).await;
    assert_eq!(status_body["totalPricePoints"], 1);
    assert_eq!(status_body["symbols"][0]["symbol"], "AAPL");
}

#[tokio::test]
async fn test_invalid_tick_price_is_ignored() {
    let test_app = setup_test_app().await;
    let body = r#"{"symbol":"AAPL","price":-1.0,"previousClose":1.0}"#.to_string();
    let (status, json) = request(test_app.app, "POST", "/v1/ticks", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "invalid");
}

#[tokio::test]
async fn test_holdings_wait_then_chart() {
    let test_app = setup_test_app().await;
    seed_daily(&test_app.store, "AAPL", 40, 100.0).await;

    let holdings = r#"[{"symbol":"AAPL","units":10,"avgCost":90,"currency":"USD"}]"#.to_string();
    let (status, body) = request(
        test_app.app.clone(),
        "PUT",
        "/v1/holdings?wait=true",
        Some(holdings),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["outcome"]["mode"], "full");
    assert!(body["outcome"]["daysEmitted"].as_u64().unwrap() >= 39);

    let (status, body) = request(
        test_app.app.clone(),
        "GET",
        "/v1/chart?kind=portfolio_value&range=all&maxPoints=10",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let points = body["points"].as_array().unwrap();
    assert!(!points.is_empty() && points.len() <= 10);
    assert_eq!(points[0]["value"], 1000.0);

    let (_, current) = request(test_app.app, "GET", "/v1/holdings", None).await;
    assert_eq!(current[0]["symbol"], "AAPL");
}

#[tokio::test]
async fn test_holdings_without_wait_are_scheduled() {
    let test_app = setup_test_app().await;
    let (status, body) = request(test_app.app, "PUT", "/v1/holdings", Some("[]".to_string())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "scheduled");
}

#[tokio::test]
async fn test_chart_rejects_bad_parameters() {
    let test_app = setup_test_app().await;
    let (status, _) = request(test_app.app.clone(), "GET", "/v1/chart?kind=price", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(test_app.app.clone(), "GET", "/v1/chart?kind=volume", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(
        test_app.app,
        "GET",
        "/v1/chart?kind=portfolio_value&range=2w",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_csv_import_and_batch_progress() {
    let test_app = setup_test_app().await;
    let csv = "symbol,timestamp,price,previous_close,volume\n\
               AAPL,2024-01-02,185.5,184.0,100\n\
               AAPL,2024-01-03,186.0,185.5,\n\
               AAPL,garbage,1,1,\n";
    let (status, report) = post_csv(test_app.app.clone(), "/v1/prices/import?wait=true", csv).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["stored"], 2);
    assert_eq!(report["skipped"], 1);

    let operation_id = report["operationId"].as_str().unwrap().to_string();
    let (status, progress) = request(
        test_app.app.clone(),
        "GET",
        &format!("/v1/batch/{}", operation_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["completed"], 2);
    assert_eq!(progress["finished"], true);

    let (status, _) = request(
        test_app.app.clone(),
        "GET",
        &format!("/v1/batch/{}", uuid::Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = request(test_app.app, "GET", "/v1/batch/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_csv_import_is_scheduled_and_pollable() {
    let test_app = setup_test_app().await;
    let mut csv = String::from("symbol,timestamp,price,previous_close,volume\n");
    for day in 1..=28 {
        csv.push_str(&format!("AAPL,2024-02-{:02},185.5,184.0,\n", day));
    }

    let (status, ticket) = post_csv(test_app.app.clone(), "/v1/prices/import", &csv).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(ticket["status"], "scheduled");
    assert_eq!(ticket["received"], 28);
    assert_eq!(ticket["accepted"], 28);
    let operation_id = ticket["operationId"].as_str().unwrap().to_string();

    let mut progress = serde_json::Value::Null;
    for _ in 0..100 {
        let (status, body) = request(
            test_app.app.clone(),
            "GET",
            &format!("/v1/batch/{}", operation_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 28);
        progress = body;
        if progress["finished"] == true {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(progress["finished"], true);
    assert_eq!(progress["completed"], 28);

    let (status, listed) = request(test_app.app, "GET", "/v1/batch", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(listed
        .as_array()
        .unwrap()
        .iter()
        .any(|op| op["operationId"] == operation_id.as_str()));
}

#[tokio::test]
async fn test_compress_clear_and_memory() {
    let test_app = setup_test_app().await;
    seed_daily(&test_app.store, "AAPL", 5, 100.0).await;

    let (status, report) = request(test_app.app.clone(), "POST", "/v1/storage/compress", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["purged"], 0);

    let (status, cleared) = request(test_app.app.clone(), "DELETE", "/v1/storage", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["prices"], 5);

    let (status, memory) = request(test_app.app, "GET", "/v1/memory", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(memory["level"], "normal");
    assert!(memory["chartCache"]["maxEntries"].is_u64());
}

#[tokio::test]
async fn test_display_currency_change() {
    let test_app = setup_test_app().await;
    let (status, body) = request(
        test_app.app.clone(),
        "PUT",
        "/v1/settings/currency",
        Some(r#"{"currency":"GBP"}"#.to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["to"], "GBP");

    let (status, _) = request(
        test_app.app,
        "PUT",
        "/v1/settings/currency",
        Some(r#"{"currency":"EUR"}"#.to_string()),
    )
    .await;
    // The mock provider has no EUR rate.
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
