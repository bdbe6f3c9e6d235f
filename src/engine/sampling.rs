//! Point-count bounded sampling of ordered series.
//!
//! Two strategies keep chart payloads under `max_points`:
//! - adaptive stride over an in-memory sequence (`stride_indices`)
//! - offset paging straight from the store (`OffsetPlan`) for series so large
//!   that loading them whole would be wasteful

/// Above `max_points * OFFSET_SAMPLING_FACTOR` records, page instead of loading.
pub const OFFSET_SAMPLING_FACTOR: usize = 10;

/// How a `(count, max_points)` request should be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    /// Nothing to return.
    Empty,
    /// Return every record.
    All,
    /// Load everything, then pick `round(i * count / max)` for each i.
    Stride,
    /// Page through the store keeping every `keep_every`-th record.
    Offset { keep_every: usize },
}

impl SamplingStrategy {
    pub fn choose(count: usize, max_points: usize) -> Self {
        if count == 0 || max_points == 0 {
            SamplingStrategy::Empty
        } else if count <= max_points {
            SamplingStrategy::All
        } else if count > max_points.saturating_mul(OFFSET_SAMPLING_FACTOR) {
            SamplingStrategy::Offset {
                keep_every: count.div_ceil(max_points),
            }
        } else {
            SamplingStrategy::Stride
        }
    }
}

/// Evenly spaced indices into a sequence of `count` items, at most `max_points` of them.
///
/// Index `i` maps to `round(i * count / max_points)`. For `count > max_points`
/// the stride exceeds 1, so consecutive picks are strictly increasing.
pub fn stride_indices(count: usize, max_points: usize) -> Vec<usize> {
    if count == 0 || max_points == 0 {
        return Vec::new();
    }
    if count <= max_points {
        return (0..count).collect();
    }

    let stride = count as f64 / max_points as f64;
    let mut out = Vec::with_capacity(max_points);
    for i in 0..max_points {
        let idx = ((i as f64) * stride).round() as usize;
        let idx = idx.min(count - 1);
        if out.last().map_or(true, |&last| idx > last) {
            out.push(idx);
        }
    }
    out
}

/// Pick `items` at the stride indices.
pub fn stride_sample<T: Clone>(items: &[T], max_points: usize) -> Vec<T> {
    stride_indices(items.len(), max_points)
        .into_iter()
        .map(|i| items[i].clone())
        .collect()
}

/// Paging plan for offset sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPlan {
    pub page_size: usize,
    pub keep_every: usize,
    pub max_points: usize,
}

impl OffsetPlan {
    pub fn new(page_size: usize, keep_every: usize, max_points: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            keep_every: keep_every.max(1),
            max_points,
        }
    }

    /// Records from a page starting at global `offset` that the plan keeps.
    ///
    /// Selection uses the global index so the spacing stays even across
    /// page boundaries.
    pub fn select<T>(&self, offset: usize, page: Vec<T>, already: usize) -> Vec<T> {
        let room = self.max_points.saturating_sub(already);
        page.into_iter()
            .enumerate()
            .filter(|(j, _)| (offset + j) % self.keep_every == 0)
            .map(|(_, item)| item)
            .take(room)
            .collect()
    }
}
