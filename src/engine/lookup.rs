//! Nearest-snapshot lookup over a timestamp-sorted price series.

use crate::domain::{PriceSnapshot, TimeMs};
use chrono::NaiveDate;

/// Default maximum distance, in days, between a target day and the price used for it.
pub const DEFAULT_TOLERANCE_DAYS: i64 = 30;

/// Find the snapshot closest to `target` by calendar-day distance.
///
/// `series` must be sorted by timestamp. The latest snapshot on a day stands
/// for that day. On equal distance the earlier side wins, so a valuation
/// never looks ahead when it doesn't have to. Returns `None` when the best
/// candidate is more than `tolerance_days` away.
pub fn nearest_snapshot(
    series: &[PriceSnapshot],
    target: NaiveDate,
    tolerance_days: i64,
) -> Option<&PriceSnapshot> {
    if series.is_empty() {
        return None;
    }

    // First snapshot strictly after the target day.
    let next_day_start = TimeMs::start_of_day(target).plus_days(1);
    let split = series.partition_point(|s| s.timestamp < next_day_start);

    let before = split.checked_sub(1).map(|i| &series[i]);
    let after = series.get(split);

    let distance = |s: &PriceSnapshot| (s.timestamp.day() - target).num_days().abs();

    let best = match (before, after) {
        (Some(b), Some(a)) => {
            if distance(b) <= distance(a) {
                b
            } else {
                a
            }
        }
        (Some(b), None) => b,
        (None, Some(a)) => a,
        (None, None) => return None,
    };

    if distance(best) <= tolerance_days {
        Some(best)
    } else {
        None
    }
}
