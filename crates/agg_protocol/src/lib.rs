//! Shared contract types between the CPU aggregation engine and the
//! consuming layer.
//!
//! The aggregation engine receives immutable props snapshots and change
//! flags, and exposes per-bin attribute values and picking results. Nothing
//! in this crate knows how bins are spatially computed; the external
//! aggregator callback owns that.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Externally computed spatial bin id.
pub type BinIndex = u64;

/// Opaque revision token carried by caller update triggers.
pub type TriggerToken = u64;

pub type Color = [u8; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub origin_x: u32,
    pub origin_y: u32,
    pub width: u32,
    pub height: u32,
}

/// Named visual channel driven by its own three-stage update pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimensionKey {
    FillColor,
    Elevation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregationOp {
    Sum,
    Mean,
    Min,
    Max,
}

/// Scale-type tags the protocol declares. `Ordinal` is declared for layer
/// compatibility but is not implemented by the scale resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScaleType {
    Linear,
    Quantile,
    Quantize,
    Ordinal,
}

/// Per-bin output attribute produced by a dimension's scale function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttributeValue {
    Color(Color),
    Number(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectedPoint<P> {
    pub source: P,
    pub bin_index: BinIndex,
}

/// Output of the external aggregator callback: the raw dataset projected
/// into bin-indexed points for the current viewport.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedData<P> {
    pub points: Vec<ProjectedPoint<P>>,
}

impl<P> Default for ProjectedData<P> {
    fn default() -> Self {
        Self { points: Vec::new() }
    }
}

/// Failure raised by the external aggregator callback. Propagated to the
/// `update` caller unmodified; the engine performs no retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectError {
    pub message: String,
}

impl fmt::Display for ProjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aggregator callback failed: {}", self.message)
    }
}

/// Aggregates one bin's post-filter points into a single value. The
/// aggregation operation (sum, mean, ...) is baked in by the caller.
pub type BinValueFn<P> = Arc<dyn Fn(&[&P]) -> Option<f64>>;

pub type PointWeightFn<P> = Arc<dyn Fn(&P) -> f64>;

pub type PointFilterFn<P> = Arc<dyn Fn(&P) -> bool>;

/// Turns raw input + current view into bin-indexed points.
pub type AggregatorFn<P> =
    Arc<dyn Fn(&AggregationProps<P>, Viewport) -> Result<ProjectedData<P>, ProjectError>>;

/// Named re-render triggers the consuming layer may bump. A stage whose
/// trigger table routes a prop through one of these names re-runs only when
/// the change flags name it; the prop itself is never compared directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateTriggerName {
    GetPosition,
    GetColorValue,
    GetColorWeight,
    GetElevationValue,
    GetElevationWeight,
    FilterData,
}

/// Caller-declared change summary accompanying a props snapshot pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeFlags {
    pub data_changed: bool,
    pub all_triggers_changed: bool,
    pub changed_triggers: Vec<UpdateTriggerName>,
}

impl ChangeFlags {
    pub fn trigger_fired(&self, name: UpdateTriggerName) -> bool {
        self.all_triggers_changed || self.changed_triggers.contains(&name)
    }
}

/// Value slot in the caller-facing update-trigger bag. Map-valued caller
/// overrides are merged key-wise; token-valued overrides replace the single
/// prop key they target.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerValue {
    Token(TriggerToken),
    Map(HashMap<String, TriggerToken>),
    Number(f64),
    Numbers(Vec<f64>),
    Colors(Vec<Color>),
    ScaleType(ScaleType),
    Aggregation(AggregationOp),
    Absent,
}

/// Immutable props snapshot consumed by the aggregation engine. Updates pass
/// an old/new snapshot pair; staleness is decided by explicit equality checks
/// on the pair (closures compare by `Arc` identity).
#[derive(Clone)]
pub struct AggregationProps<P> {
    pub cell_size: f64,
    pub aggregator: AggregatorFn<P>,
    pub filter: Option<PointFilterFn<P>>,

    pub color_value: Option<BinValueFn<P>>,
    pub color_weight: PointWeightFn<P>,
    pub color_aggregation: AggregationOp,
    pub lower_percentile: f64,
    pub upper_percentile: f64,
    pub color_domain: Option<[f64; 2]>,
    pub color_range: Vec<Color>,
    pub color_scale_type: ScaleType,

    pub elevation_value: Option<BinValueFn<P>>,
    pub elevation_weight: PointWeightFn<P>,
    pub elevation_aggregation: AggregationOp,
    pub elevation_lower_percentile: f64,
    pub elevation_upper_percentile: f64,
    pub elevation_domain: Option<[f64; 2]>,
    pub elevation_range: [f64; 2],
    pub elevation_scale_type: ScaleType,

    pub update_triggers: HashMap<UpdateTriggerName, TriggerValue>,
}

/// Default color range used when the caller does not supply one
/// (six-step yellow-to-red ramp).
pub const DEFAULT_COLOR_RANGE: [Color; 6] = [
    [255, 255, 178, 255],
    [254, 217, 118, 255],
    [254, 178, 76, 255],
    [253, 141, 60, 255],
    [240, 59, 32, 255],
    [189, 0, 38, 255],
];

impl<P> AggregationProps<P> {
    /// Snapshot with the same defaults the original layer props carry:
    /// full percentile window, sum aggregation over unit weights, quantize
    /// color scale, linear elevation scale.
    pub fn new(aggregator: AggregatorFn<P>, cell_size: f64) -> Self {
        Self {
            cell_size,
            aggregator,
            filter: None,
            color_value: None,
            color_weight: Arc::new(|_| 1.0),
            color_aggregation: AggregationOp::Sum,
            lower_percentile: 0.0,
            upper_percentile: 100.0,
            color_domain: None,
            color_range: DEFAULT_COLOR_RANGE.to_vec(),
            color_scale_type: ScaleType::Quantize,
            elevation_value: None,
            elevation_weight: Arc::new(|_| 1.0),
            elevation_aggregation: AggregationOp::Sum,
            elevation_lower_percentile: 0.0,
            elevation_upper_percentile: 100.0,
            elevation_domain: None,
            elevation_range: [0.0, 1000.0],
            elevation_scale_type: ScaleType::Linear,
            update_triggers: HashMap::new(),
        }
    }
}

impl<P> fmt::Debug for AggregationProps<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationProps")
            .field("cell_size", &self.cell_size)
            .field("filter", &self.filter.is_some())
            .field("color_value", &self.color_value.is_some())
            .field("color_aggregation", &self.color_aggregation)
            .field("lower_percentile", &self.lower_percentile)
            .field("upper_percentile", &self.upper_percentile)
            .field("color_domain", &self.color_domain)
            .field("color_scale_type", &self.color_scale_type)
            .field("elevation_value", &self.elevation_value.is_some())
            .field("elevation_aggregation", &self.elevation_aggregation)
            .field("elevation_lower_percentile", &self.elevation_lower_percentile)
            .field("elevation_upper_percentile", &self.elevation_upper_percentile)
            .field("elevation_domain", &self.elevation_domain)
            .field("elevation_range", &self.elevation_range)
            .field("elevation_scale_type", &self.elevation_scale_type)
            .finish_non_exhaustive()
    }
}

/// Picking result for one bin: raw per-dimension aggregate values (not the
/// scaled attribute) plus the bin's contributing post-filter point indices.
#[derive(Debug, Clone, PartialEq)]
pub struct BinPickInfo {
    pub picked: bool,
    pub bin_index: Option<BinIndex>,
    pub color_value: Option<f64>,
    pub elevation_value: Option<f64>,
    pub point_indices: Vec<usize>,
}

impl BinPickInfo {
    pub fn unpicked() -> Self {
        Self {
            picked: false,
            bin_index: None,
            color_value: None,
            elevation_value: None,
            point_indices: Vec::new(),
        }
    }
}
