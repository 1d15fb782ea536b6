//! Dependency-staged recomputation engine over the dimension pipelines.
//!
//! `update` diffs an old/new props snapshot pair, snapshots the full run
//! plan (which stages of which dimensions are stale) before any stage
//! executes, then runs the plan in dimension-then-stage order. A bin
//! generation change or a data change forces the full reprojection path;
//! otherwise each dimension re-runs only the suffix starting at its lowest
//! fired stage.
//!
//! The aggregator is single-threaded and not re-entrant: `update` runs to
//! completion before any accessor may be called, and calling `update` from
//! within a props callback is disallowed.

use std::collections::HashMap;
use std::sync::Arc;

use agg_protocol::{
    AggregationProps, AttributeValue, BinIndex, BinPickInfo, ChangeFlags, DimensionKey,
    ProjectError, ProjectedData, TriggerValue, UpdateTriggerName, Viewport,
};

use crate::bin_sorter::{BinSorter, BinSorterOptions};
use crate::dimension::{
    DEFAULT_DIMENSIONS, DimensionRange, DimensionScale, DimensionSpec, DimensionState, PropKey,
    StageKind, StageSpec, build_value_fn, dimension_props, prop_changed,
};
use crate::scale::{ScaleError, resolve_scale};

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateError {
    Projection(ProjectError),
    Scale(ScaleError),
}

impl From<ProjectError> for UpdateError {
    fn from(err: ProjectError) -> Self {
        UpdateError::Projection(err)
    }
}

impl From<ScaleError> for UpdateError {
    fn from(err: ScaleError) -> Self {
        UpdateError::Scale(err)
    }
}

/// Why a planned stage was skipped instead of run. Correct trigger wiring
/// makes these unreachable; they are reported rather than crashed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingBins,
    MissingDomain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSkip {
    pub dimension: DimensionKey,
    pub stage: StageKind,
    pub reason: SkipReason,
}

/// What one `update` call actually did. `computed_domains` replaces the
/// original's one-way domain notification callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub reprojected: bool,
    pub ran: Vec<(DimensionKey, StageKind)>,
    pub computed_domains: Vec<(DimensionKey, [f64; 2])>,
    pub skipped: Vec<StageSkip>,
}

struct DimensionEntry<P> {
    spec: &'static DimensionSpec,
    state: DimensionState<P>,
}

pub struct CpuAggregator<P> {
    dimensions: Vec<DimensionEntry<P>>,
    layer_data: ProjectedData<P>,
}

impl<P: 'static> Default for CpuAggregator<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: 'static> CpuAggregator<P> {
    pub fn new() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS
                .iter()
                .map(|spec| DimensionEntry {
                    spec,
                    state: DimensionState::default(),
                })
                .collect(),
            layer_data: ProjectedData::default(),
        }
    }

    pub fn projected_data(&self) -> &ProjectedData<P> {
        &self.layer_data
    }

    pub fn sorted_bins(&self, key: DimensionKey) -> Option<&Arc<BinSorter>> {
        self.entry(key).state.sorted_bins.as_ref()
    }

    pub fn value_domain(&self, key: DimensionKey) -> Option<[f64; 2]> {
        self.entry(key).state.value_domain
    }

    /// The single entry point. Decides between the full reprojection path
    /// and the incremental path, then executes the snapshotted plan.
    pub fn update(
        &mut self,
        old_props: &AggregationProps<P>,
        new_props: &AggregationProps<P>,
        change_flags: &ChangeFlags,
        viewport: Viewport,
    ) -> Result<UpdateOutcome, UpdateError> {
        self.refresh_value_fns(old_props, new_props, change_flags);

        let mut outcome = UpdateOutcome::default();

        // Staleness is decided for every dimension before any stage runs, so
        // no stage observes a sibling dimension mid-update.
        let plan: Vec<(usize, StageKind)> =
            if needs_reproject(old_props, new_props, change_flags) {
                // The replace only happens after the callback succeeds; on
                // error the prior aggregator state is left untouched.
                let projected = (new_props.aggregator)(new_props, viewport)?;
                self.layer_data = projected;
                outcome.reprojected = true;
                (0..self.dimensions.len())
                    .flat_map(|dim| StageKind::ORDERED.map(|stage| (dim, stage)))
                    .collect()
            } else {
                let mut plan = Vec::new();
                for (dim, entry) in self.dimensions.iter().enumerate() {
                    let first_fired = entry.spec.stages.iter().position(|stage| {
                        stage_fired(stage, old_props, new_props, change_flags)
                    });
                    if let Some(first) = first_fired {
                        for stage in &entry.spec.stages[first..] {
                            plan.push((dim, stage.kind));
                        }
                    }
                }
                plan
            };

        for (dim, stage) in plan {
            self.run_stage(dim, stage, new_props, &mut outcome)?;
        }
        Ok(outcome)
    }

    /// Per-bin attribute function for one dimension. Bins that are missing,
    /// empty after filtering, or whose aggregate falls outside the scale
    /// domain map to the dimension's null value.
    pub fn accessor(&self, key: DimensionKey) -> impl Fn(BinIndex) -> AttributeValue + '_ {
        move |bin_index| self.bin_attribute(key, bin_index)
    }

    pub fn bin_attribute(&self, key: DimensionKey, bin_index: BinIndex) -> AttributeValue {
        let entry = self.entry(key);
        let null_value = entry.spec.null_value;
        let (Some(sorted_bins), Some(scale)) =
            (entry.state.sorted_bins.as_ref(), entry.state.scale.as_ref())
        else {
            return null_value;
        };
        let Some(bin) = sorted_bins.bin(bin_index) else {
            return null_value;
        };
        if bin.filtered_count == 0 {
            return null_value;
        }
        let Some(value) = bin.value else {
            return null_value;
        };
        let domain = scale.domain();
        let inside = value >= domain[0] && value <= domain[domain.len() - 1];
        if inside { scale.map(value) } else { null_value }
    }

    /// Folds each dimension's trigger table into a per-accessor key/value
    /// bag the consuming layer can compare across renders. Caller overrides
    /// merge key-wise when map-valued and replace the single prop key when
    /// token-valued.
    pub fn update_triggers(
        &self,
        props: &AggregationProps<P>,
    ) -> HashMap<&'static str, HashMap<String, TriggerValue>> {
        let mut result = HashMap::new();
        for entry in &self.dimensions {
            let mut bag: HashMap<String, TriggerValue> = HashMap::new();
            for stage in &entry.spec.stages {
                for trigger in stage.triggers {
                    match trigger.update_trigger {
                        Some(name) => match props.update_triggers.get(&name) {
                            Some(TriggerValue::Map(map)) => {
                                for (key, token) in map {
                                    bag.insert(key.clone(), TriggerValue::Token(*token));
                                }
                            }
                            Some(value) => {
                                bag.insert(trigger.prop.name().to_owned(), value.clone());
                            }
                            None => {}
                        },
                        None => {
                            bag.insert(
                                trigger.prop.name().to_owned(),
                                prop_trigger_value(trigger.prop, props),
                            );
                        }
                    }
                }
            }
            result.insert(entry.spec.accessor, bag);
        }
        result
    }

    /// Raw aggregate values and contributing points for a picked bin.
    /// Unknown bins produce an unpicked result rather than an error.
    pub fn pick(&self, bin_index: BinIndex) -> BinPickInfo {
        let mut info = BinPickInfo::unpicked();
        for entry in &self.dimensions {
            let Some(sorted_bins) = entry.state.sorted_bins.as_ref() else {
                continue;
            };
            let Some(bin) = sorted_bins.bin(bin_index) else {
                continue;
            };
            info.picked = true;
            info.bin_index = Some(bin_index);
            match entry.spec.key {
                DimensionKey::FillColor => info.color_value = bin.value,
                DimensionKey::Elevation => info.elevation_value = bin.value,
            }
            if info.point_indices.is_empty() {
                info.point_indices = if bin.filtered_points.is_empty() {
                    bin.points.clone()
                } else {
                    bin.filtered_points.clone()
                };
            }
        }
        info
    }

    fn entry(&self, key: DimensionKey) -> &DimensionEntry<P> {
        self.dimensions
            .iter()
            .find(|entry| entry.spec.key == key)
            .expect("built-in dimension table covers every DimensionKey")
    }

    /// Rebuilds a dimension's bin value function when its bin stage fired or
    /// the function was never set: the explicit extractor prop wins,
    /// otherwise one is built from the aggregation op and weight accessor.
    fn refresh_value_fns(
        &mut self,
        old_props: &AggregationProps<P>,
        new_props: &AggregationProps<P>,
        change_flags: &ChangeFlags,
    ) {
        for entry in &mut self.dimensions {
            let bins_stage = &entry.spec.stages[0];
            let fired = stage_fired(bins_stage, old_props, new_props, change_flags);
            if fired || entry.state.get_value.is_none() {
                let props_view = dimension_props(entry.spec.key, new_props);
                entry.state.get_value = Some(match props_view.value {
                    Some(value_fn) => Arc::clone(value_fn),
                    None => build_value_fn(props_view.aggregation, props_view.weight),
                });
            }
        }
    }

    fn run_stage(
        &mut self,
        dim: usize,
        stage: StageKind,
        props: &AggregationProps<P>,
        outcome: &mut UpdateOutcome,
    ) -> Result<(), UpdateError> {
        match stage {
            StageKind::Bins => self.run_bins_stage(dim, props, outcome),
            StageKind::Domain => self.run_domain_stage(dim, props, outcome),
            StageKind::Scale => self.run_scale_stage(dim, props, outcome)?,
        }
        Ok(())
    }

    fn run_bins_stage(
        &mut self,
        dim: usize,
        props: &AggregationProps<P>,
        outcome: &mut UpdateOutcome,
    ) {
        let entry = &mut self.dimensions[dim];
        let get_value = entry
            .state
            .get_value
            .as_ref()
            .expect("value function is populated before any bin stage runs");
        let sorter = BinSorter::new(
            &self.layer_data,
            BinSorterOptions {
                get_value,
                filter: props.filter.as_ref(),
            },
        );
        entry.state.sorted_bins = Some(Arc::new(sorter));
        entry.state.value_domain = None;
        entry.state.scale = None;
        outcome.ran.push((entry.spec.key, StageKind::Bins));
    }

    fn run_domain_stage(
        &mut self,
        dim: usize,
        props: &AggregationProps<P>,
        outcome: &mut UpdateOutcome,
    ) {
        let entry = &mut self.dimensions[dim];
        let key = entry.spec.key;
        let Some(sorted_bins) = entry.state.sorted_bins.as_ref() else {
            // The bin stage should have run first; report and move on.
            outcome.skipped.push(StageSkip {
                dimension: key,
                stage: StageKind::Domain,
                reason: SkipReason::MissingBins,
            });
            return;
        };
        let props_view = dimension_props(key, props);
        let value_domain = sorted_bins.get_value_range([
            props_view.lower_percentile,
            props_view.upper_percentile,
        ]);
        entry.state.value_domain = Some(value_domain);
        entry.state.scale = None;
        outcome.computed_domains.push((key, value_domain));
        outcome.ran.push((key, StageKind::Domain));
    }

    fn run_scale_stage(
        &mut self,
        dim: usize,
        props: &AggregationProps<P>,
        outcome: &mut UpdateOutcome,
    ) -> Result<(), UpdateError> {
        let entry = &mut self.dimensions[dim];
        let key = entry.spec.key;
        let props_view = dimension_props(key, props);
        // An explicit caller domain takes precedence over the computed one.
        let Some(domain) = props_view.domain.or(entry.state.value_domain) else {
            outcome.skipped.push(StageSkip {
                dimension: key,
                stage: StageKind::Scale,
                reason: SkipReason::MissingDomain,
            });
            return Ok(());
        };
        let scale = match props_view.range {
            DimensionRange::Color(range) => {
                DimensionScale::Color(resolve_scale(&domain, range, props_view.scale_type)?)
            }
            DimensionRange::Number(range) => {
                DimensionScale::Number(resolve_scale(&domain, range, props_view.scale_type)?)
            }
        };
        entry.state.scale = Some(scale);
        outcome.ran.push((key, StageKind::Scale));
        Ok(())
    }
}

/// Bin-generation parameters changed, or the caller flagged a data change:
/// the whole projected dataset is re-derived and every stage re-runs.
fn needs_reproject<P>(
    old_props: &AggregationProps<P>,
    new_props: &AggregationProps<P>,
    change_flags: &ChangeFlags,
) -> bool {
    change_flags.data_changed
        || old_props.cell_size != new_props.cell_size
        || !Arc::ptr_eq(&old_props.aggregator, &new_props.aggregator)
        || change_flags.trigger_fired(UpdateTriggerName::GetPosition)
}

fn stage_fired<P>(
    stage: &StageSpec,
    old_props: &AggregationProps<P>,
    new_props: &AggregationProps<P>,
    change_flags: &ChangeFlags,
) -> bool {
    stage.triggers.iter().any(|trigger| match trigger.update_trigger {
        Some(name) => change_flags.trigger_fired(name),
        None => prop_changed(trigger.prop, old_props, new_props),
    })
}

/// Current value of a directly compared prop, for the caller-facing trigger
/// bag.
fn prop_trigger_value<P>(key: PropKey, props: &AggregationProps<P>) -> TriggerValue {
    match key {
        PropKey::ColorAggregation => TriggerValue::Aggregation(props.color_aggregation),
        PropKey::LowerPercentile => TriggerValue::Number(props.lower_percentile),
        PropKey::UpperPercentile => TriggerValue::Number(props.upper_percentile),
        PropKey::ColorDomain => match props.color_domain {
            Some(domain) => TriggerValue::Numbers(domain.to_vec()),
            None => TriggerValue::Absent,
        },
        PropKey::ColorRange => TriggerValue::Colors(props.color_range.clone()),
        PropKey::ColorScaleType => TriggerValue::ScaleType(props.color_scale_type),
        PropKey::ElevationAggregation => TriggerValue::Aggregation(props.elevation_aggregation),
        PropKey::ElevationLowerPercentile => {
            TriggerValue::Number(props.elevation_lower_percentile)
        }
        PropKey::ElevationUpperPercentile => {
            TriggerValue::Number(props.elevation_upper_percentile)
        }
        PropKey::ElevationDomain => match props.elevation_domain {
            Some(domain) => TriggerValue::Numbers(domain.to_vec()),
            None => TriggerValue::Absent,
        },
        PropKey::ElevationRange => TriggerValue::Numbers(props.elevation_range.to_vec()),
        PropKey::ElevationScaleType => TriggerValue::ScaleType(props.elevation_scale_type),
        // Closure props always route through update triggers.
        PropKey::ColorValue
        | PropKey::ColorWeight
        | PropKey::FilterData
        | PropKey::ElevationValue
        | PropKey::ElevationWeight => TriggerValue::Absent,
    }
}
