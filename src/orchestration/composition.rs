//! Composition tracking: decides between full and incremental recomputation.
//!
//! The tracker remembers the last composition it valued and the last day
//! whose snapshot was written. Both live in the store's engine-state table
//! so a holdings change made while the process was down is still detected.

use crate::domain::{PortfolioComposition, TimeMs};
use crate::store::{SnapshotStore, StoreError};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CURRENT_COMPOSITION_KEY: &str = "composition.current";
pub const COMPUTED_THROUGH_KEY: &str = "composition.computed_through_ms";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValuationMode {
    /// Discard stored history and recompute everything.
    Full,
    /// Recompute only from the last computed day onward.
    Incremental,
}

/// What the next valuation run should do.
#[derive(Debug, Clone, PartialEq)]
pub struct RecalculationPlan {
    pub mode: ValuationMode,
    pub composition: PortfolioComposition,
    /// Last day already computed; set only for incremental runs.
    pub resume_from: Option<NaiveDate>,
}

#[derive(Debug, Default)]
struct TrackerState {
    composition: Option<PortfolioComposition>,
    computed_through: Option<NaiveDate>,
}

#[derive(Debug)]
pub struct CompositionTracker {
    store: Arc<dyn SnapshotStore>,
    state: Mutex<TrackerState>,
}

impl CompositionTracker {
    /// Restore tracker state from the store. Unreadable state counts as absent.
    pub async fn load(store: Arc<dyn SnapshotStore>) -> Self {
        let composition = match store.load_state(CURRENT_COMPOSITION_KEY).await {
            Ok(Some(json)) => match serde_json::from_str::<PortfolioComposition>(&json) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(error = %e, "Stored composition unreadable, next run will be full");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Could not load stored composition");
                None
            }
        };

        let computed_through = match store.load_state(COMPUTED_THROUGH_KEY).await {
            Ok(value) => value
                .and_then(|v| v.parse::<i64>().ok())
                .map(|ms| TimeMs::new(ms).day()),
            Err(e) => {
                warn!(error = %e, "Could not load computed-through day");
                None
            }
        };

        Self {
            store,
            state: Mutex::new(TrackerState {
                composition,
                computed_through,
            }),
        }
    }

    pub async fn current(&self) -> Option<PortfolioComposition> {
        self.state.lock().await.composition.clone()
    }

    pub async fn computed_through(&self) -> Option<NaiveDate> {
        self.state.lock().await.computed_through
    }

    /// Compare `composition` with the last one and decide the run mode.
    ///
    /// A full plan commits the new composition immediately and forgets the
    /// computed-through day, so an interrupted full run is resumed as full.
    pub async fn plan(&self, composition: PortfolioComposition) -> Result<RecalculationPlan, StoreError> {
        let mut state = self.state.lock().await;

        let unchanged = state
            .composition
            .as_ref()
            .map_or(false, |c| c.fingerprint() == composition.fingerprint());

        if let (true, Some(day)) = (unchanged, state.computed_through) {
            return Ok(RecalculationPlan {
                mode: ValuationMode::Incremental,
                composition,
                resume_from: Some(day),
            });
        }

        info!(
            previous = state.composition.as_ref().map(|c| c.fingerprint()).unwrap_or("none"),
            current = composition.fingerprint(),
            positions = composition.len(),
            "Composition changed or no history, planning full recompute"
        );

        let json = serde_json::to_string(&composition)?;
        self.store.save_state(CURRENT_COMPOSITION_KEY, &json).await?;
        self.store.delete_state(COMPUTED_THROUGH_KEY).await?;
        state.composition = Some(composition.clone());
        state.computed_through = None;

        Ok(RecalculationPlan {
            mode: ValuationMode::Full,
            composition,
            resume_from: None,
        })
    }

    /// Record that every day up to and including `day` has been computed.
    pub async fn advance(&self, day: NaiveDate) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.computed_through.map_or(false, |d| d >= day) {
            return Ok(());
        }
        let ms = TimeMs::start_of_day(day).as_ms();
        self.store
            .save_state(COMPUTED_THROUGH_KEY, &ms.to_string())
            .await?;
        state.computed_through = Some(day);
        Ok(())
    }

    /// Move the computed-through day back to `day` so the next incremental
    /// run revalues from there. Returns whether anything moved.
    pub async fn rewind_to(&self, day: NaiveDate) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.computed_through.is_some_and(|d| d > day) {
            return Ok(false);
        }
        let ms = TimeMs::start_of_day(day).as_ms();
        self.store
            .save_state(COMPUTED_THROUGH_KEY, &ms.to_string())
            .await?;
        debug!(%day, "Rewound computed-through day");
        state.computed_through = Some(day);
        Ok(true)
    }

    /// Forget everything; the next run is full.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        self.store.delete_state(CURRENT_COMPOSITION_KEY).await?;
        self.store.delete_state(COMPUTED_THROUGH_KEY).await?;
        *state = TrackerState::default();
        Ok(())
    }
}
