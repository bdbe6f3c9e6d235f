//! Long-lived services built over the store and the pure engine.
//!
//! Each service is an owned instance shared through `Arc`. Mutating work is
//! serialized by a per-service `tokio::sync::Mutex` gate; background work is
//! spawned and handed back as a `JobHandle`.

use std::future::Future;
use thiserror::Error;
use tokio::task::JoinHandle;

pub mod batch;
pub mod chart;
pub mod composition;
pub mod history;
pub mod memory;
pub mod retention;
pub mod valuation;

pub use batch::{BatchMutationEngine, BatchOperation, BatchOutcome, BatchProgress};
pub use chart::ChartQueryService;
pub use composition::{CompositionTracker, RecalculationPlan, ValuationMode};
pub use history::{
    ClearedData, CurrencyChange, HistoryDeps, HistoryError, HistoryService, ImportReport,
    ImportTicket, StorageStatus, SymbolStorage, TickOutcome,
};
pub use memory::{
    FixedProbe, ManagedCache, MemoryLevel, MemoryManager, MemoryProbe, MemoryStats, ProcStatmProbe,
};
pub use retention::{RetentionEngine, RetentionReport};
pub use valuation::{ValuationEngine, ValuationOutcome, ValuationProgress};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("background job panicked: {0}")]
    Panicked(String),
    #[error("background job was cancelled")]
    Cancelled,
}

/// Handle to spawned background work.
///
/// Await it with `join` or drop it to let the job run detached.
#[derive(Debug)]
pub struct JobHandle<T> {
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> JobHandle<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    pub async fn join(self) -> Result<T, JobError> {
        self.handle.await.map_err(|e| {
            if e.is_panic() {
                JobError::Panicked(e.to_string())
            } else {
                JobError::Cancelled
            }
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
