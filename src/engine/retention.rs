//! Pure planning for the retention passes.
//!
//! Each function takes one symbol's timestamp-sorted records (already scoped
//! to the pass's age band) and returns what to delete. The actor in
//! `orchestration::retention` does the I/O.

use crate::config::RetentionPolicy;
use crate::domain::{PriceSnapshot, RecordId, Stored, TimeMs};
use chrono::Datelike;
use std::collections::HashSet;

/// Age boundaries of one retention run, resolved against `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionHorizons {
    /// Everything strictly before this is purged.
    pub purge_before: TimeMs,
    /// Aggregation band is `[purge_before, aggregate_before)`.
    pub aggregate_before: TimeMs,
    /// Compression band is `[aggregate_before, compress_before)`.
    pub compress_before: TimeMs,
}

impl RetentionHorizons {
    pub fn resolve(policy: &RetentionPolicy, now: TimeMs) -> Self {
        Self {
            purge_before: now.plus_days(-policy.purge_after_days),
            aggregate_before: now.plus_days(-policy.aggregate_after_days),
            compress_before: now.plus_days(-policy.compress_after_days),
        }
    }
}

/// Outcome of stride compression over a symbol's not-yet-thinned points.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressionPlan {
    /// Survivors, flagged so later runs leave them alone.
    pub kept: Vec<RecordId>,
    pub doomed: Vec<RecordId>,
}

impl CompressionPlan {
    pub fn is_empty(&self) -> bool {
        self.kept.is_empty() && self.doomed.is_empty()
    }
}

/// Minimum eligible points before aggregation runs for a symbol.
pub fn aggregation_gate(policy: &RetentionPolicy) -> usize {
    2 * policy.weekly_ratio
}

/// Minimum eligible points before compression runs for a symbol.
pub fn compression_gate(policy: &RetentionPolicy) -> usize {
    2 * policy.compress_keep_every
}

/// Keep the earliest snapshot of each ISO week, delete the rest.
pub fn weekly_aggregation_plan(records: &[Stored<PriceSnapshot>], gate: usize) -> Vec<RecordId> {
    if records.len() < gate {
        return Vec::new();
    }

    let mut seen_weeks = HashSet::new();
    let mut doomed = Vec::new();
    for stored in records {
        let week = stored.record.timestamp.day().iso_week();
        if !seen_weeks.insert((week.year(), week.week())) {
            doomed.push(stored.id);
        }
    }
    doomed
}

/// Keep every `keep_every`-th snapshot in timestamp order, delete the rest.
///
/// `records` must hold only points no earlier run has thinned.
pub fn stride_compression_plan(
    records: &[Stored<PriceSnapshot>],
    keep_every: usize,
    gate: usize,
) -> CompressionPlan {
    if keep_every <= 1 || records.len() < gate {
        return CompressionPlan::default();
    }
    let mut plan = CompressionPlan::default();
    for (i, stored) in records.iter().enumerate() {
        if i % keep_every == 0 {
            plan.kept.push(stored.id);
        } else {
            plan.doomed.push(stored.id);
        }
    }
    plan
}

/// Per-symbol cap for the given total stored price count.
pub fn effective_symbol_cap(policy: &RetentionPolicy, total_points: usize) -> usize {
    policy
        .cap_tiers
        .iter()
        .filter(|(above, _)| total_points > *above)
        .map(|(_, cap)| *cap)
        .min()
        .unwrap_or(policy.base_symbol_cap)
        .min(policy.base_symbol_cap)
}

/// How many of a symbol's oldest points must go to fit under `cap`.
pub fn cap_overflow(count: usize, cap: usize) -> usize {
    count.saturating_sub(cap)
}
