//! Parsing price history from CSV.
//!
//! Expected header: `symbol,timestamp,price,previous_close,volume`. The
//! timestamp may be epoch milliseconds, RFC 3339, or a plain `YYYY-MM-DD`
//! date (start of day UTC). `previous_close` defaults to `price`; `volume`
//! is optional.

use crate::domain::{PriceSnapshot, Symbol, TimeMs};
use chrono::{DateTime, NaiveDate};
use std::io::Read;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("csv parse error: {0}")]
    Csv(#[from] csv::Error),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
}

/// Result of parsing a CSV file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsvImport {
    pub snapshots: Vec<PriceSnapshot>,
    /// Rows dropped for an unusable symbol, timestamp or price.
    pub skipped: usize,
}

#[derive(Debug, serde::Deserialize)]
struct Row {
    symbol: String,
    timestamp: String,
    price: Option<f64>,
    previous_close: Option<f64>,
    volume: Option<f64>,
}

fn parse_timestamp(raw: &str) -> Option<TimeMs> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return Some(TimeMs::new(ms));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(TimeMs::new(dt.timestamp_millis()));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(TimeMs::start_of_day)
}

/// Parse CSV rows into snapshots, skipping rows that cannot be used.
///
/// Structural problems (bad quoting, missing header columns) fail the whole file.
pub fn parse_price_csv<R: Read>(reader: R) -> Result<CsvImport, ImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    for required in ["symbol", "timestamp", "price"] {
        if !headers.iter().any(|h| h.eq_ignore_ascii_case(required)) {
            return Err(ImportError::MissingColumn(required));
        }
    }

    let mut out = CsvImport::default();
    for (line, record) in reader.deserialize::<Row>().enumerate() {
        let row = match record {
            Ok(row) => row,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                debug!(line = line + 2, error = %e, "Skipping malformed CSV row");
                out.skipped += 1;
                continue;
            }
        };

        let symbol = Symbol::new(&row.symbol);
        let timestamp = parse_timestamp(&row.timestamp);
        match (symbol.is_empty(), timestamp, row.price) {
            (false, Some(timestamp), Some(price)) if crate::domain::is_valid_price(price) => {
                let mut snapshot = PriceSnapshot::new(
                    symbol,
                    timestamp,
                    price,
                    row.previous_close.unwrap_or(price),
                );
                snapshot.volume = row.volume;
                out.snapshots.push(snapshot);
            }
            _ => {
                debug!(line = line + 2, symbol = %row.symbol, "Skipping unusable CSV row");
                out.skipped += 1;
            }
        }
    }

    Ok(out)
}
