//! CPU-side spatial aggregation engine.
//!
//! Bins large point datasets into cells, computes per-bin statistics
//! (value domains from percentiles, color/elevation scale functions), and
//! incrementally recomputes only the pipeline stages a props change
//! invalidated.
//!
//! Internal architecture overview:
//! - `bin_sorter`: groups projected points into bins and answers
//!   percentile-range queries over the sorted bin values.
//! - `scale`: resolves domain + range + scale-type into a pure mapping.
//! - `dimension`: per-dimension stage tables, trigger declarations, and
//!   pipeline state.
//! - `aggregator`: the dependency-staged recomputation engine and its
//!   caller-facing accessors.

pub use agg_protocol::{
    AggregationOp, AggregationProps, AggregatorFn, AttributeValue, BinIndex, BinPickInfo,
    BinValueFn, ChangeFlags, Color, DEFAULT_COLOR_RANGE, DimensionKey, PointFilterFn,
    PointWeightFn, ProjectError, ProjectedData, ProjectedPoint, ScaleType, TriggerToken,
    TriggerValue, UpdateTriggerName, Viewport,
};

pub use aggregator::{CpuAggregator, SkipReason, StageSkip, UpdateError, UpdateOutcome};
pub use bin_sorter::{Bin, BinSorter, BinSorterOptions};
pub use dimension::{DimensionScale, DimensionState, StageKind};
pub use scale::{Scale, ScaleError, ScaleOutput, resolve_scale};

mod aggregator;

mod bin_sorter;

mod dimension;

mod scale;

#[cfg(test)]
mod tests;
