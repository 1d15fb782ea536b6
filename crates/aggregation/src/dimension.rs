//! Per-dimension update-step pipeline: bin, domain, scale.
//!
//! Each dimension carries a fixed table of three ordered stages. Every stage
//! declares the props it depends on, either compared directly across the
//! old/new snapshot pair or routed through a named update trigger. A fired
//! stage invalidates everything after it; staleness never flows backwards.

use std::sync::Arc;

use agg_protocol::{
    AggregationOp, AggregationProps, AttributeValue, BinValueFn, Color, DimensionKey,
    PointWeightFn, ScaleType, UpdateTriggerName,
};

use crate::bin_sorter::BinSorter;
use crate::scale::Scale;

/// Pipeline stages in execution order. A stale stage implies every later
/// stage is stale too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    Bins,
    Domain,
    Scale,
}

impl StageKind {
    pub const ORDERED: [StageKind; 3] = [StageKind::Bins, StageKind::Domain, StageKind::Scale];
}

/// Props a stage trigger may reference. Comparison semantics live in
/// `prop_changed`; closures compare by `Arc` identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PropKey {
    ColorValue,
    ColorWeight,
    ColorAggregation,
    FilterData,
    LowerPercentile,
    UpperPercentile,
    ColorDomain,
    ColorRange,
    ColorScaleType,
    ElevationValue,
    ElevationWeight,
    ElevationAggregation,
    ElevationLowerPercentile,
    ElevationUpperPercentile,
    ElevationDomain,
    ElevationRange,
    ElevationScaleType,
}

impl PropKey {
    pub(crate) fn name(self) -> &'static str {
        match self {
            PropKey::ColorValue => "get_color_value",
            PropKey::ColorWeight => "get_color_weight",
            PropKey::ColorAggregation => "color_aggregation",
            PropKey::FilterData => "filter_data",
            PropKey::LowerPercentile => "lower_percentile",
            PropKey::UpperPercentile => "upper_percentile",
            PropKey::ColorDomain => "color_domain",
            PropKey::ColorRange => "color_range",
            PropKey::ColorScaleType => "color_scale_type",
            PropKey::ElevationValue => "get_elevation_value",
            PropKey::ElevationWeight => "get_elevation_weight",
            PropKey::ElevationAggregation => "elevation_aggregation",
            PropKey::ElevationLowerPercentile => "elevation_lower_percentile",
            PropKey::ElevationUpperPercentile => "elevation_upper_percentile",
            PropKey::ElevationDomain => "elevation_domain",
            PropKey::ElevationRange => "elevation_range",
            PropKey::ElevationScaleType => "elevation_scale_type",
        }
    }
}

/// One declared stage dependency. With `update_trigger` set, only the change
/// flags decide firing; the prop value is never compared directly (the layer
/// owns invalidation for its accessors, exactly like the original).
#[derive(Debug, Clone, Copy)]
pub(crate) struct StageTrigger {
    pub(crate) prop: PropKey,
    pub(crate) update_trigger: Option<UpdateTriggerName>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StageSpec {
    pub(crate) kind: StageKind,
    pub(crate) triggers: &'static [StageTrigger],
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DimensionSpec {
    pub(crate) key: DimensionKey,
    pub(crate) accessor: &'static str,
    pub(crate) null_value: AttributeValue,
    pub(crate) stages: [StageSpec; 3],
}

const FILL_COLOR_BIN_TRIGGERS: [StageTrigger; 4] = [
    StageTrigger {
        prop: PropKey::ColorValue,
        update_trigger: Some(UpdateTriggerName::GetColorValue),
    },
    StageTrigger {
        prop: PropKey::ColorWeight,
        update_trigger: Some(UpdateTriggerName::GetColorWeight),
    },
    StageTrigger {
        prop: PropKey::ColorAggregation,
        update_trigger: None,
    },
    StageTrigger {
        prop: PropKey::FilterData,
        update_trigger: Some(UpdateTriggerName::FilterData),
    },
];

const FILL_COLOR_DOMAIN_TRIGGERS: [StageTrigger; 2] = [
    StageTrigger {
        prop: PropKey::LowerPercentile,
        update_trigger: None,
    },
    StageTrigger {
        prop: PropKey::UpperPercentile,
        update_trigger: None,
    },
];

const FILL_COLOR_SCALE_TRIGGERS: [StageTrigger; 3] = [
    StageTrigger {
        prop: PropKey::ColorDomain,
        update_trigger: None,
    },
    StageTrigger {
        prop: PropKey::ColorRange,
        update_trigger: None,
    },
    StageTrigger {
        prop: PropKey::ColorScaleType,
        update_trigger: None,
    },
];

const ELEVATION_BIN_TRIGGERS: [StageTrigger; 4] = [
    StageTrigger {
        prop: PropKey::ElevationValue,
        update_trigger: Some(UpdateTriggerName::GetElevationValue),
    },
    StageTrigger {
        prop: PropKey::ElevationWeight,
        update_trigger: Some(UpdateTriggerName::GetElevationWeight),
    },
    StageTrigger {
        prop: PropKey::ElevationAggregation,
        update_trigger: None,
    },
    StageTrigger {
        prop: PropKey::FilterData,
        update_trigger: Some(UpdateTriggerName::FilterData),
    },
];

const ELEVATION_DOMAIN_TRIGGERS: [StageTrigger; 2] = [
    StageTrigger {
        prop: PropKey::ElevationLowerPercentile,
        update_trigger: None,
    },
    StageTrigger {
        prop: PropKey::ElevationUpperPercentile,
        update_trigger: None,
    },
];

const ELEVATION_SCALE_TRIGGERS: [StageTrigger; 3] = [
    StageTrigger {
        prop: PropKey::ElevationDomain,
        update_trigger: None,
    },
    StageTrigger {
        prop: PropKey::ElevationRange,
        update_trigger: None,
    },
    StageTrigger {
        prop: PropKey::ElevationScaleType,
        update_trigger: None,
    },
];

pub(crate) static DEFAULT_DIMENSIONS: [DimensionSpec; 2] = [
    DimensionSpec {
        key: DimensionKey::FillColor,
        accessor: "get_fill_color",
        null_value: AttributeValue::Color([0, 0, 0, 0]),
        stages: [
            StageSpec {
                kind: StageKind::Bins,
                triggers: &FILL_COLOR_BIN_TRIGGERS,
            },
            StageSpec {
                kind: StageKind::Domain,
                triggers: &FILL_COLOR_DOMAIN_TRIGGERS,
            },
            StageSpec {
                kind: StageKind::Scale,
                triggers: &FILL_COLOR_SCALE_TRIGGERS,
            },
        ],
    },
    DimensionSpec {
        key: DimensionKey::Elevation,
        accessor: "get_elevation",
        null_value: AttributeValue::Number(-1.0),
        stages: [
            StageSpec {
                kind: StageKind::Bins,
                triggers: &ELEVATION_BIN_TRIGGERS,
            },
            StageSpec {
                kind: StageKind::Domain,
                triggers: &ELEVATION_DOMAIN_TRIGGERS,
            },
            StageSpec {
                kind: StageKind::Scale,
                triggers: &ELEVATION_SCALE_TRIGGERS,
            },
        ],
    },
];

/// Scale function for one dimension's output channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DimensionScale {
    Color(Scale<Color>),
    Number(Scale<f64>),
}

impl DimensionScale {
    pub fn domain(&self) -> &[f64] {
        match self {
            DimensionScale::Color(scale) => scale.domain(),
            DimensionScale::Number(scale) => scale.domain(),
        }
    }

    pub fn map(&self, value: f64) -> AttributeValue {
        match self {
            DimensionScale::Color(scale) => AttributeValue::Color(scale.map(value)),
            DimensionScale::Number(scale) => AttributeValue::Number(scale.map(value)),
        }
    }
}

/// Pipeline outputs for one dimension. Populated stage by stage; an upstream
/// re-run clears everything downstream so the state is never partially valid.
pub struct DimensionState<P> {
    pub get_value: Option<BinValueFn<P>>,
    pub sorted_bins: Option<Arc<BinSorter>>,
    pub value_domain: Option<[f64; 2]>,
    pub scale: Option<DimensionScale>,
}

impl<P> Default for DimensionState<P> {
    fn default() -> Self {
        Self {
            get_value: None,
            sorted_bins: None,
            value_domain: None,
            scale: None,
        }
    }
}

/// Range slot of a dimension; fill color picks discrete colors, elevation
/// maps onto a numeric span.
pub(crate) enum DimensionRange<'a> {
    Color(&'a [Color]),
    Number(&'a [f64; 2]),
}

/// Per-dimension view over the props snapshot.
pub(crate) struct DimensionProps<'a, P> {
    pub(crate) value: Option<&'a BinValueFn<P>>,
    pub(crate) weight: &'a PointWeightFn<P>,
    pub(crate) aggregation: AggregationOp,
    pub(crate) lower_percentile: f64,
    pub(crate) upper_percentile: f64,
    pub(crate) domain: Option<[f64; 2]>,
    pub(crate) range: DimensionRange<'a>,
    pub(crate) scale_type: ScaleType,
}

pub(crate) fn dimension_props<P>(
    key: DimensionKey,
    props: &AggregationProps<P>,
) -> DimensionProps<'_, P> {
    match key {
        DimensionKey::FillColor => DimensionProps {
            value: props.color_value.as_ref(),
            weight: &props.color_weight,
            aggregation: props.color_aggregation,
            lower_percentile: props.lower_percentile,
            upper_percentile: props.upper_percentile,
            domain: props.color_domain,
            range: DimensionRange::Color(&props.color_range),
            scale_type: props.color_scale_type,
        },
        DimensionKey::Elevation => DimensionProps {
            value: props.elevation_value.as_ref(),
            weight: &props.elevation_weight,
            aggregation: props.elevation_aggregation,
            lower_percentile: props.elevation_lower_percentile,
            upper_percentile: props.elevation_upper_percentile,
            domain: props.elevation_domain,
            range: DimensionRange::Number(&props.elevation_range),
            scale_type: props.elevation_scale_type,
        },
    }
}

/// Builds the default bin value function from an aggregation-operation tag
/// and a per-point weight accessor, used when the caller supplies no
/// explicit extractor.
pub(crate) fn build_value_fn<P: 'static>(
    op: AggregationOp,
    weight: &PointWeightFn<P>,
) -> BinValueFn<P> {
    let weight = Arc::clone(weight);
    Arc::new(move |points: &[&P]| {
        if points.is_empty() {
            return None;
        }
        let weights = points.iter().map(|point| weight(point));
        Some(match op {
            AggregationOp::Sum => weights.sum(),
            AggregationOp::Mean => weights.sum::<f64>() / points.len() as f64,
            AggregationOp::Min => weights.fold(f64::INFINITY, f64::min),
            AggregationOp::Max => weights.fold(f64::NEG_INFINITY, f64::max),
        })
    })
}

fn arc_changed<T: ?Sized>(old: &Arc<T>, new: &Arc<T>) -> bool {
    !Arc::ptr_eq(old, new)
}

fn opt_arc_changed<T: ?Sized>(old: Option<&Arc<T>>, new: Option<&Arc<T>>) -> bool {
    match (old, new) {
        (None, None) => false,
        (Some(old), Some(new)) => arc_changed(old, new),
        _ => true,
    }
}

/// Snapshot-pair inequality for one prop. Closures compare by identity,
/// plain values by equality.
pub(crate) fn prop_changed<P>(
    key: PropKey,
    old: &AggregationProps<P>,
    new: &AggregationProps<P>,
) -> bool {
    match key {
        PropKey::ColorValue => opt_arc_changed(old.color_value.as_ref(), new.color_value.as_ref()),
        PropKey::ColorWeight => arc_changed(&old.color_weight, &new.color_weight),
        PropKey::ColorAggregation => old.color_aggregation != new.color_aggregation,
        PropKey::FilterData => opt_arc_changed(old.filter.as_ref(), new.filter.as_ref()),
        PropKey::LowerPercentile => old.lower_percentile != new.lower_percentile,
        PropKey::UpperPercentile => old.upper_percentile != new.upper_percentile,
        PropKey::ColorDomain => old.color_domain != new.color_domain,
        PropKey::ColorRange => old.color_range != new.color_range,
        PropKey::ColorScaleType => old.color_scale_type != new.color_scale_type,
        PropKey::ElevationValue => {
            opt_arc_changed(old.elevation_value.as_ref(), new.elevation_value.as_ref())
        }
        PropKey::ElevationWeight => arc_changed(&old.elevation_weight, &new.elevation_weight),
        PropKey::ElevationAggregation => old.elevation_aggregation != new.elevation_aggregation,
        PropKey::ElevationLowerPercentile => {
            old.elevation_lower_percentile != new.elevation_lower_percentile
        }
        PropKey::ElevationUpperPercentile => {
            old.elevation_upper_percentile != new.elevation_upper_percentile
        }
        PropKey::ElevationDomain => old.elevation_domain != new.elevation_domain,
        PropKey::ElevationRange => old.elevation_range != new.elevation_range,
        PropKey::ElevationScaleType => old.elevation_scale_type != new.elevation_scale_type,
    }
}
