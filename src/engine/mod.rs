//! Pure computation for retention, valuation and chart sampling.
//!
//! Nothing here touches the store or the clock; the actors in
//! `orchestration` feed it data and persist what it decides.

pub mod cache;
pub mod dedupe;
pub mod lookup;
pub mod retention;
pub mod sampling;
pub mod valuation;

pub use cache::{CachePriority, CacheStats, PriorityCache};
pub use lookup::{nearest_snapshot, DEFAULT_TOLERANCE_DAYS};
pub use retention::RetentionHorizons;
pub use sampling::{stride_indices, stride_sample, OffsetPlan, SamplingStrategy};
pub use valuation::{
    required_valid_positions, ConversionTable, DayValuer, PriceIndex, ValuationParams,
};
