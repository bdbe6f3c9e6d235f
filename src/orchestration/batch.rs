//! Chunked bulk mutations with progress tracking.
//!
//! Large inserts, deletes and updates are split into chunks, each a single
//! store call. Chunks run in groups of `max_concurrent_chunks`; a semaphore
//! shared by every operation bounds the store calls in flight across the
//! whole engine. A failed chunk is logged and counted while the rest of the
//! operation carries on.
//!
//! The `start_*` variants register the operation and hand back its id before
//! any chunk runs, so callers can poll progress while the job is in flight.

use crate::config::BatchConfig;
use crate::domain::{HistoricalPortfolioSnapshot, PriceSnapshot, RecordId};
use crate::orchestration::JobHandle;
use crate::store::{
    PortfolioFilter, PortfolioUpdate, PriceFilter, PriceUpdate, SnapshotStore, StoreError,
};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Finished operations kept around for progress queries.
const MAX_TRACKED_OPERATIONS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOperation {
    InsertPrices,
    InsertPortfolio,
    DeletePrices,
    DeletePortfolio,
    UpdatePrices,
    UpdatePortfolio,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub operation_id: Uuid,
    pub operation: BatchOperation,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Items per second since the operation started.
    pub rate: f64,
    /// Seconds until completion at the current rate.
    pub eta_secs: Option<f64>,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub operation_id: Uuid,
    pub operation: BatchOperation,
    /// Items in chunks that were written.
    pub succeeded: usize,
    /// Items in chunks that failed.
    pub failed: usize,
    /// Rows the store reported as affected.
    pub affected: usize,
    pub failed_chunks: usize,
}

#[derive(Debug)]
struct Tracked {
    operation: BatchOperation,
    total: usize,
    completed: usize,
    failed: usize,
    started: Instant,
    finished: bool,
}

impl Tracked {
    fn snapshot(&self, operation_id: Uuid) -> BatchProgress {
        let elapsed = self.started.elapsed().as_secs_f64();
        let done = self.completed + self.failed;
        let rate = if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 };
        let remaining = self.total.saturating_sub(done);
        let eta_secs = if self.finished || remaining == 0 {
            Some(0.0)
        } else if rate > 0.0 {
            Some(remaining as f64 / rate)
        } else {
            None
        };
        BatchProgress {
            operation_id,
            operation: self.operation,
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            rate,
            eta_secs,
            finished: self.finished,
        }
    }
}

fn lock(mutex: &Mutex<HashMap<Uuid, Tracked>>) -> MutexGuard<'_, HashMap<Uuid, Tracked>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct BatchMutationEngine {
    store: Arc<dyn SnapshotStore>,
    config: BatchConfig,
    permits: Semaphore,
    operations: Mutex<HashMap<Uuid, Tracked>>,
}

impl BatchMutationEngine {
    pub fn new(store: Arc<dyn SnapshotStore>, config: BatchConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrent_chunks.max(1));
        Self {
            store,
            config,
            permits,
            operations: Mutex::new(HashMap::new()),
        }
    }

    pub fn progress(&self, operation_id: Uuid) -> Option<BatchProgress> {
        lock(&self.operations)
            .get(&operation_id)
            .map(|t| t.snapshot(operation_id))
    }

    /// Every tracked operation, oldest first.
    pub fn operations(&self) -> Vec<BatchProgress> {
        let operations = lock(&self.operations);
        let mut tracked: Vec<(&Uuid, &Tracked)> = operations.iter().collect();
        tracked.sort_by_key(|(_, t)| t.started);
        tracked.into_iter().map(|(id, t)| t.snapshot(*id)).collect()
    }

    pub async fn insert_prices(&self, snapshots: &[PriceSnapshot]) -> BatchOutcome {
        let operation_id = self.begin(BatchOperation::InsertPrices, snapshots.len());
        self.insert_prices_as(operation_id, snapshots).await
    }

    /// Register a price insert and run it in the background.
    pub fn start_insert_prices(
        self: &Arc<Self>,
        snapshots: Vec<PriceSnapshot>,
    ) -> (Uuid, JobHandle<BatchOutcome>) {
        let operation_id = self.begin(BatchOperation::InsertPrices, snapshots.len());
        let engine = Arc::clone(self);
        let job = JobHandle::spawn(async move { engine.insert_prices_as(operation_id, &snapshots).await });
        (operation_id, job)
    }

    async fn insert_prices_as(&self, operation_id: Uuid, snapshots: &[PriceSnapshot]) -> BatchOutcome {
        self.run(
            operation_id,
            BatchOperation::InsertPrices,
            snapshots,
            self.config.chunk_size,
            |chunk| async move { self.store.save_prices(chunk).await.map(|ids| ids.len()) },
        )
        .await
    }

    pub async fn insert_portfolio_snapshots(
        &self,
        snapshots: &[HistoricalPortfolioSnapshot],
    ) -> BatchOutcome {
        let operation_id = self.begin(BatchOperation::InsertPortfolio, snapshots.len());
        self.run(
            operation_id,
            BatchOperation::InsertPortfolio,
            snapshots,
            self.config.portfolio_chunk_size,
            |chunk| async move {
                self.store
                    .save_portfolio_snapshots(chunk)
                    .await
                    .map(|ids| ids.len())
            },
        )
        .await
    }

    pub async fn delete_prices(&self, ids: &[RecordId]) -> BatchOutcome {
        let operation_id = self.begin(BatchOperation::DeletePrices, ids.len());
        self.delete_prices_as(operation_id, ids).await
    }

    /// Register a price delete and run it in the background.
    pub fn start_delete_prices(self: &Arc<Self>, ids: Vec<RecordId>) -> (Uuid, JobHandle<BatchOutcome>) {
        let operation_id = self.begin(BatchOperation::DeletePrices, ids.len());
        let engine = Arc::clone(self);
        let job = JobHandle::spawn(async move { engine.delete_prices_as(operation_id, &ids).await });
        (operation_id, job)
    }

    async fn delete_prices_as(&self, operation_id: Uuid, ids: &[RecordId]) -> BatchOutcome {
        self.run(
            operation_id,
            BatchOperation::DeletePrices,
            ids,
            self.config.chunk_size,
            |chunk| async move {
                self.store
                    .delete_prices(&PriceFilter::with_ids(chunk.to_vec()))
                    .await
            },
        )
        .await
    }

    pub async fn delete_portfolio_snapshots(&self, ids: &[RecordId]) -> BatchOutcome {
        let operation_id = self.begin(BatchOperation::DeletePortfolio, ids.len());
        self.run(
            operation_id,
            BatchOperation::DeletePortfolio,
            ids,
            self.config.portfolio_chunk_size,
            |chunk| async move {
                self.store
                    .delete_portfolio_snapshots(&PortfolioFilter::with_ids(chunk.to_vec()))
                    .await
            },
        )
        .await
    }

    pub async fn update_prices(&self, ids: &[RecordId], update: &PriceUpdate) -> BatchOutcome {
        let operation_id = self.begin(BatchOperation::UpdatePrices, ids.len());
        self.run(
            operation_id,
            BatchOperation::UpdatePrices,
            ids,
            self.config.chunk_size,
            |chunk| async move {
                self.store
                    .update_prices(&PriceFilter::with_ids(chunk.to_vec()), update)
                    .await
            },
        )
        .await
    }

    pub async fn update_portfolio_snapshots(
        &self,
        ids: &[RecordId],
        update: &PortfolioUpdate,
    ) -> BatchOutcome {
        let operation_id = self.begin(BatchOperation::UpdatePortfolio, ids.len());
        self.run(
            operation_id,
            BatchOperation::UpdatePortfolio,
            ids,
            self.config.portfolio_chunk_size,
            |chunk| async move {
                self.store
                    .update_portfolio_snapshots(&PortfolioFilter::with_ids(chunk.to_vec()), update)
                    .await
            },
        )
        .await
    }

    fn begin(&self, operation: BatchOperation, total: usize) -> Uuid {
        let operation_id = Uuid::new_v4();
        let mut operations = lock(&self.operations);
        if operations.len() >= MAX_TRACKED_OPERATIONS {
            let oldest = operations
                .iter()
                .filter(|(_, t)| t.finished)
                .min_by_key(|(_, t)| t.started)
                .map(|(id, _)| *id);
            if let Some(id) = oldest {
                operations.remove(&id);
            }
        }
        operations.insert(
            operation_id,
            Tracked {
                operation,
                total,
                completed: 0,
                failed: 0,
                started: Instant::now(),
                finished: false,
            },
        );
        operation_id
    }

    fn record(&self, operation_id: Uuid, completed: usize, failed: usize, finished: bool) {
        if let Some(tracked) = lock(&self.operations).get_mut(&operation_id) {
            tracked.completed += completed;
            tracked.failed += failed;
            tracked.finished |= finished;
        }
    }

    async fn run<'a, T, F, Fut>(
        &'a self,
        operation_id: Uuid,
        operation: BatchOperation,
        items: &'a [T],
        chunk_size: usize,
        apply: F,
    ) -> BatchOutcome
    where
        F: Fn(&'a [T]) -> Fut,
        Fut: Future<Output = Result<usize, StoreError>> + 'a,
    {
        let mut outcome = BatchOutcome {
            operation_id,
            operation,
            succeeded: 0,
            failed: 0,
            affected: 0,
            failed_chunks: 0,
        };

        let chunks: Vec<&'a [T]> = items.chunks(chunk_size.max(1)).collect();
        let group_size = self.config.max_concurrent_chunks.max(1);
        let yield_every = self.config.yield_every_chunks.max(1);
        let mut chunks_done = 0usize;

        for (group_index, group) in chunks.chunks(group_size).enumerate() {
            let futures = group.iter().map(|chunk| {
                let chunk: &'a [T] = chunk;
                let pending = apply(chunk);
                async move {
                    // The semaphore is never closed.
                    let _permit = self.permits.acquire().await.ok();
                    (chunk.len(), pending.await)
                }
            });

            for (offset, (len, result)) in join_all(futures).await.into_iter().enumerate() {
                match result {
                    Ok(affected) => {
                        outcome.succeeded += len;
                        outcome.affected += affected;
                        self.record(operation_id, len, 0, false);
                    }
                    Err(e) => {
                        let chunk_index = group_index * group_size + offset;
                        warn!(%operation_id, ?operation, chunk = chunk_index, items = len, error = %e, "Batch chunk failed");
                        outcome.failed += len;
                        outcome.failed_chunks += 1;
                        self.record(operation_id, 0, len, false);
                    }
                }
                chunks_done += 1;
                if chunks_done % yield_every == 0 {
                    tokio::task::yield_now().await;
                }
            }
            debug!(%operation_id, chunks_done, total_chunks = chunks.len(), "Batch progress");
        }

        self.record(operation_id, 0, 0, true);
        if outcome.failed > 0 {
            warn!(
                %operation_id,
                ?operation,
                succeeded = outcome.succeeded,
                failed = outcome.failed,
                "Batch finished with failures"
            );
        } else {
            info!(%operation_id, ?operation, items = outcome.succeeded, "Batch finished");
        }
        outcome
    }
}
