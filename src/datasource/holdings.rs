//! In-process holdings source, updated through the HTTP surface.

use super::{DataSourceError, HoldingsSource};
use crate::domain::Holding;
use async_trait::async_trait;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryHoldings {
    holdings: RwLock<Vec<Holding>>,
}

impl InMemoryHoldings {
    pub fn new(holdings: Vec<Holding>) -> Self {
        Self {
            holdings: RwLock::new(holdings),
        }
    }

    /// Replace the current holdings.
    pub fn set(&self, holdings: Vec<Holding>) {
        match self.holdings.write() {
            Ok(mut guard) => *guard = holdings,
            Err(poisoned) => *poisoned.into_inner() = holdings,
        }
    }
}

#[async_trait]
impl HoldingsSource for InMemoryHoldings {
    async fn holdings(&self) -> Result<Vec<Holding>, DataSourceError> {
        self.holdings
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| DataSourceError::Other("holdings lock poisoned".to_string()))
    }
}
