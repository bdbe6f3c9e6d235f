//! Price observations for a single symbol.

use crate::domain::{Symbol, TimeMs};
use serde::{Deserialize, Serialize};

/// A timestamped price observation for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub symbol: Symbol,
    pub timestamp: TimeMs,
    pub price: f64,
    pub previous_close: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

impl PriceSnapshot {
    pub fn new(symbol: Symbol, timestamp: TimeMs, price: f64, previous_close: f64) -> Self {
        Self {
            symbol,
            timestamp,
            price,
            previous_close,
            volume: None,
        }
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    /// A snapshot is usable only with a finite, strictly positive price.
    pub fn is_valid(&self) -> bool {
        is_valid_price(self.price)
    }
}

/// Finite and strictly positive.
pub fn is_valid_price(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

/// A record as persisted by the store, tagged with its store id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stored<T> {
    pub id: crate::domain::RecordId,
    pub record: T,
}

impl<T> Stored<T> {
    pub fn new(id: crate::domain::RecordId, record: T) -> Self {
        Self { id, record }
    }
}
