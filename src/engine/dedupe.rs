//! Duplicate detection for stored and incoming snapshots.

use crate::domain::{HistoricalPortfolioSnapshot, PriceSnapshot, RecordId, Stored, Symbol, TimeMs};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Ids of price snapshots that repeat an earlier `(symbol, timestamp)` key.
///
/// The lowest id of each key survives.
pub fn duplicate_price_ids(records: &[Stored<PriceSnapshot>]) -> Vec<RecordId> {
    let mut keeper: HashMap<(&Symbol, TimeMs), RecordId> = HashMap::new();
    let mut doomed = Vec::new();

    for stored in records {
        let key = (&stored.record.symbol, stored.record.timestamp);
        match keeper.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(stored.id);
            }
            Entry::Occupied(mut slot) if stored.id < *slot.get() => {
                doomed.push(slot.insert(stored.id));
            }
            Entry::Occupied(_) => doomed.push(stored.id),
        }
    }
    doomed
}

/// Ids of portfolio snapshots that repeat a `(date, fingerprint)` key.
///
/// The newest (highest) id of each key survives.
pub fn duplicate_portfolio_ids(records: &[Stored<HistoricalPortfolioSnapshot>]) -> Vec<RecordId> {
    let mut keeper: HashMap<(TimeMs, &str), RecordId> = HashMap::new();
    let mut doomed = Vec::new();

    for stored in records {
        let key = (stored.record.date, stored.record.composition_fingerprint.as_str());
        match keeper.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(stored.id);
            }
            Entry::Occupied(mut slot) if stored.id > *slot.get() => {
                doomed.push(slot.insert(stored.id));
            }
            Entry::Occupied(_) => doomed.push(stored.id),
        }
    }
    doomed
}

/// Drop incoming snapshots that fall within `tolerance_ms` of a stored or an
/// already accepted snapshot of the same symbol. Invalid prices are dropped too.
///
/// `existing` holds each symbol's stored timestamps in ascending order.
/// The result is sorted by symbol, then timestamp.
pub fn filter_near_duplicates(
    mut incoming: Vec<PriceSnapshot>,
    existing: &HashMap<Symbol, Vec<TimeMs>>,
    tolerance_ms: i64,
) -> Vec<PriceSnapshot> {
    incoming.retain(PriceSnapshot::is_valid);
    incoming.sort_by(|a, b| {
        a.symbol
            .cmp(&b.symbol)
            .then(a.timestamp.cmp(&b.timestamp))
    });

    let tolerance_ms = tolerance_ms.max(0);
    let mut last_kept: HashMap<Symbol, TimeMs> = HashMap::new();
    let mut kept = Vec::with_capacity(incoming.len());

    for snapshot in incoming {
        let near_stored = existing
            .get(&snapshot.symbol)
            .map_or(false, |stamps| within(stamps, snapshot.timestamp, tolerance_ms));
        let near_accepted = last_kept
            .get(&snapshot.symbol)
            .map_or(false, |t| (snapshot.timestamp.as_ms() - t.as_ms()).abs() <= tolerance_ms);

        if near_stored || near_accepted {
            continue;
        }
        last_kept.insert(snapshot.symbol.clone(), snapshot.timestamp);
        kept.push(snapshot);
    }
    kept
}

fn within(sorted: &[TimeMs], t: TimeMs, tolerance_ms: i64) -> bool {
    let idx = sorted.partition_point(|s| *s < t);
    let after = sorted.get(idx).map(|s| s.as_ms() - t.as_ms());
    let before = idx.checked_sub(1).map(|i| t.as_ms() - sorted[i].as_ms());
    after.map_or(false, |d| d <= tolerance_ms) || before.map_or(false, |d| d <= tolerance_ms)
}
