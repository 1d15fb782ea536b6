//! Aggregation engine unit tests.
//!
//! This module validates bin sorting and percentile queries, scale
//! resolution, trigger-driven stage invalidation, accessor null-value
//! policy, and picking.

use std::collections::HashMap;
use std::sync::Arc;

use super::*;

#[derive(Debug, Clone, Copy, PartialEq)]
struct TestPoint {
    value: f64,
    keep: bool,
}

fn point(value: f64) -> TestPoint {
    TestPoint { value, keep: true }
}

fn projected(bins: &[(BinIndex, &[f64])]) -> ProjectedData<TestPoint> {
    let mut points = Vec::new();
    for (bin_index, values) in bins {
        for value in *values {
            points.push(ProjectedPoint {
                source: point(*value),
                bin_index: *bin_index,
            });
        }
    }
    ProjectedData { points }
}

fn mean_value_fn() -> BinValueFn<TestPoint> {
    Arc::new(|points: &[&TestPoint]| {
        if points.is_empty() {
            return None;
        }
        Some(points.iter().map(|p| p.value).sum::<f64>() / points.len() as f64)
    })
}

fn sorter(data: &ProjectedData<TestPoint>) -> BinSorter {
    let get_value = mean_value_fn();
    BinSorter::new(
        data,
        BinSorterOptions {
            get_value: &get_value,
            filter: None,
        },
    )
}

fn fixed_aggregator(data: ProjectedData<TestPoint>) -> AggregatorFn<TestPoint> {
    Arc::new(move |_, _| Ok(data.clone()))
}

fn base_props(data: ProjectedData<TestPoint>) -> AggregationProps<TestPoint> {
    let mut props = AggregationProps::new(fixed_aggregator(data), 100.0);
    props.color_value = Some(mean_value_fn());
    props.elevation_value = Some(mean_value_fn());
    props
}

fn viewport() -> Viewport {
    Viewport {
        origin_x: 0,
        origin_y: 0,
        width: 800,
        height: 600,
    }
}

fn data_changed() -> ChangeFlags {
    ChangeFlags {
        data_changed: true,
        ..ChangeFlags::default()
    }
}

fn loaded_aggregator(
    data: ProjectedData<TestPoint>,
) -> (CpuAggregator<TestPoint>, AggregationProps<TestPoint>) {
    let props = base_props(data);
    let mut aggregator = CpuAggregator::new();
    aggregator
        .update(&props, &props, &data_changed(), viewport())
        .expect("initial update succeeds");
    (aggregator, props)
}

// --- BinSorter ---

#[test]
fn full_percentile_range_returns_exact_min_and_max() {
    let data = projected(&[(0, &[4.0]), (1, &[16.0]), (2, &[1.0]), (3, &[9.0])]);
    let bins = sorter(&data);
    assert_eq!(bins.get_value_range([0.0, 100.0]), [1.0, 16.0]);
    assert_eq!(bins.get_value_range([0.0, 0.0]), [1.0, 1.0]);
    assert_eq!(bins.get_value_range([100.0, 100.0]), [16.0, 16.0]);
}

#[test]
fn value_range_bounds_are_ordered_for_any_percentile_pair() {
    let data = projected(&[(0, &[3.0]), (1, &[8.0]), (2, &[5.0]), (3, &[13.0]), (4, &[1.0])]);
    let bins = sorter(&data);
    for (lower, upper) in [(0.0, 100.0), (10.0, 90.0), (25.0, 75.0), (33.0, 34.0), (50.0, 50.0)] {
        let range = bins.get_value_range([lower, upper]);
        assert!(
            range[0] <= range[1],
            "range {range:?} out of order for percentiles [{lower}, {upper}]"
        );
    }
}

#[test]
fn empty_bin_set_returns_zero_sentinel() {
    let bins = sorter(&ProjectedData::default());
    assert_eq!(bins.get_value_range([0.0, 100.0]), [0.0, 0.0]);
    assert_eq!(bins.max_count(), 0);
    assert_eq!(bins.max_value(), None);
}

#[test]
fn single_bin_returns_its_value_for_any_percentile() {
    let data = projected(&[(7, &[42.0, 42.0])]);
    let bins = sorter(&data);
    for percentile in [0.0, 25.0, 50.0, 100.0] {
        assert_eq!(bins.get_value_range([percentile, percentile]), [42.0, 42.0]);
    }
}

#[test]
fn hundred_points_in_ten_bins_interpolates_at_fractional_rank() {
    // Bin k holds values 10k..10k+9; the per-bin mean is 10k + 4.5.
    let mut points = Vec::new();
    for value in 0..100u32 {
        points.push(ProjectedPoint {
            source: point(value as f64),
            bin_index: (value / 10) as BinIndex,
        });
    }
    let bins = sorter(&ProjectedData { points });
    assert_eq!(bins.bin_count(), 10);
    assert_eq!(bins.get_value_range([0.0, 100.0]), [4.5, 94.5]);
    // Rank 50/100 * 9 = 4.5: halfway between the 5th and 6th sorted values.
    assert_eq!(bins.get_value_range([50.0, 50.0]), [49.5, 49.5]);
}

#[test]
fn one_point_per_bin_identity_values_cover_full_span() {
    let mut points = Vec::new();
    for value in 0..100u32 {
        points.push(ProjectedPoint {
            source: point(value as f64),
            bin_index: value as BinIndex,
        });
    }
    let bins = sorter(&ProjectedData { points });
    assert_eq!(bins.get_value_range([0.0, 100.0]), [0.0, 99.0]);
    assert_eq!(bins.get_value_range([50.0, 50.0]), [49.5, 49.5]);
}

#[test]
fn filter_excludes_points_from_filtered_sets_and_value() {
    let mut data = projected(&[(0, &[2.0, 4.0]), (1, &[10.0])]);
    data.points[1].source.keep = false; // bin 0, value 4.0
    data.points[2].source.keep = false; // bin 1 fully filtered

    let get_value = mean_value_fn();
    let filter: PointFilterFn<TestPoint> = Arc::new(|p| p.keep);
    let bins = BinSorter::new(
        &data,
        BinSorterOptions {
            get_value: &get_value,
            filter: Some(&filter),
        },
    );

    let bin0 = bins.bin(0).expect("bin 0 exists");
    assert_eq!(bin0.count, 2);
    assert_eq!(bin0.filtered_count, 1);
    assert_eq!(bin0.value, Some(2.0));

    let bin1 = bins.bin(1).expect("bin 1 exists");
    assert_eq!(bin1.count, 1);
    assert_eq!(bin1.filtered_count, 0);
    assert_eq!(bin1.value, None);

    // The fully filtered bin drops out of the sorted view.
    assert_eq!(bins.get_value_range([0.0, 100.0]), [2.0, 2.0]);
    assert_eq!(bins.max_count(), 1);
    assert_eq!(bins.max_value(), Some(2.0));
}

// --- Scale resolver ---

#[test]
fn linear_scale_maps_and_clamps_numeric_range() {
    let scale = resolve_scale(&[0.0, 10.0], &[0.0, 100.0], ScaleType::Linear).expect("resolves");
    assert_eq!(scale.domain(), &[0.0, 10.0]);
    assert_eq!(scale.map(0.0), 0.0);
    assert_eq!(scale.map(5.0), 50.0);
    assert_eq!(scale.map(10.0), 100.0);
    assert_eq!(scale.map(-3.0), 0.0);
    assert_eq!(scale.map(13.0), 100.0);
}

#[test]
fn linear_scale_interpolates_colors() {
    let range: [Color; 2] = [[0, 0, 0, 255], [200, 100, 50, 255]];
    let scale = resolve_scale(&[0.0, 1.0], &range, ScaleType::Linear).expect("resolves");
    assert_eq!(scale.map(0.5), [100, 50, 25, 255]);
}

#[test]
fn quantize_scale_picks_discrete_range_elements() {
    let range: [Color; 4] = [[1, 0, 0, 255], [2, 0, 0, 255], [3, 0, 0, 255], [4, 0, 0, 255]];
    let scale = resolve_scale(&[0.0, 8.0], &range, ScaleType::Quantize).expect("resolves");
    assert_eq!(scale.map(0.0), range[0]);
    assert_eq!(scale.map(1.9), range[0]);
    assert_eq!(scale.map(2.0), range[1]);
    assert_eq!(scale.map(5.0), range[2]);
    assert_eq!(scale.map(8.0), range[3]);
    // Clamped outside the domain; the aggregator suppresses these anyway.
    assert_eq!(scale.map(-1.0), range[0]);
    assert_eq!(scale.map(9.0), range[3]);
}

#[test]
fn quantile_scale_slots_by_rank_over_domain_values() {
    let domain = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
    let scale = resolve_scale(&domain, &[10.0, 20.0], ScaleType::Quantile).expect("resolves");
    // Single threshold at the median (4.5).
    assert_eq!(scale.map(2.0), 10.0);
    assert_eq!(scale.map(4.4), 10.0);
    assert_eq!(scale.map(4.5), 20.0);
    assert_eq!(scale.map(8.0), 20.0);
}

#[test]
fn unsupported_scale_type_fails_at_resolution_time() {
    let result = resolve_scale(&[0.0, 1.0], &[0.0, 1.0], ScaleType::Ordinal);
    assert_eq!(
        result.unwrap_err(),
        ScaleError::UnsupportedScaleType {
            scale_type: ScaleType::Ordinal
        }
    );
}

#[test]
fn degenerate_scale_inputs_are_rejected() {
    assert_eq!(
        resolve_scale::<f64>(&[], &[0.0], ScaleType::Linear).unwrap_err(),
        ScaleError::EmptyDomain
    );
    assert_eq!(
        resolve_scale::<f64>(&[0.0, 1.0], &[], ScaleType::Linear).unwrap_err(),
        ScaleError::EmptyRange
    );
}

// --- Default value functions ---

#[test]
fn default_value_fn_applies_aggregation_op_over_weights() {
    let weight: PointWeightFn<TestPoint> = Arc::new(|p| p.value);
    let points = [point(2.0), point(6.0), point(4.0)];
    let refs: Vec<&TestPoint> = points.iter().collect();

    let cases = [
        (AggregationOp::Sum, 12.0),
        (AggregationOp::Mean, 4.0),
        (AggregationOp::Min, 2.0),
        (AggregationOp::Max, 6.0),
    ];
    for (op, expected) in cases {
        let get_value = crate::dimension::build_value_fn(op, &weight);
        assert_eq!(get_value(&refs), Some(expected), "op {op:?}");
        assert_eq!(get_value(&[]), None, "op {op:?} on empty bin");
    }
}

// --- CpuAggregator ---

#[test]
fn initial_update_populates_every_dimension_stage() {
    let (aggregator, _props) = loaded_aggregator(projected(&[(0, &[1.0]), (1, &[5.0])]));

    for key in [DimensionKey::FillColor, DimensionKey::Elevation] {
        assert!(aggregator.sorted_bins(key).is_some(), "{key:?} bins");
        assert_eq!(aggregator.value_domain(key), Some([1.0, 5.0]), "{key:?} domain");
    }
    assert!(matches!(
        aggregator.bin_attribute(DimensionKey::FillColor, 0),
        AttributeValue::Color(_)
    ));
    assert!(matches!(
        aggregator.bin_attribute(DimensionKey::Elevation, 1),
        AttributeValue::Number(_)
    ));
}

#[test]
fn noop_update_leaves_state_untouched() {
    let (mut aggregator, props) = loaded_aggregator(projected(&[(0, &[1.0]), (1, &[5.0])]));
    let bins_before = Arc::clone(
        aggregator
            .sorted_bins(DimensionKey::FillColor)
            .expect("bins populated"),
    );

    let outcome = aggregator
        .update(&props, &props, &ChangeFlags::default(), viewport())
        .expect("noop update succeeds");

    assert_eq!(outcome, UpdateOutcome::default());
    let bins_after = aggregator
        .sorted_bins(DimensionKey::FillColor)
        .expect("bins still populated");
    assert!(Arc::ptr_eq(&bins_before, bins_after));
}

#[test]
fn domain_trigger_reruns_suffix_but_keeps_bins() {
    let (mut aggregator, props) = loaded_aggregator(projected(&[
        (0, &[1.0]),
        (1, &[3.0]),
        (2, &[5.0]),
        (3, &[7.0]),
        (4, &[9.0]),
    ]));
    let bins_before = Arc::clone(
        aggregator
            .sorted_bins(DimensionKey::FillColor)
            .expect("bins populated"),
    );

    let mut new_props = props.clone();
    new_props.lower_percentile = 25.0;
    let outcome = aggregator
        .update(&props, &new_props, &ChangeFlags::default(), viewport())
        .expect("incremental update succeeds");

    // Fill color re-ran domain and scale only; elevation percentiles did
    // not change, so that dimension is untouched.
    assert_eq!(
        outcome.ran,
        vec![
            (DimensionKey::FillColor, StageKind::Domain),
            (DimensionKey::FillColor, StageKind::Scale),
        ]
    );
    assert!(!outcome.reprojected);
    let bins_after = aggregator
        .sorted_bins(DimensionKey::FillColor)
        .expect("bins retained");
    assert!(Arc::ptr_eq(&bins_before, bins_after));
    assert_eq!(aggregator.value_domain(DimensionKey::FillColor), Some([3.0, 9.0]));
}

#[test]
fn full_reprojection_supersedes_incremental_changes() {
    let (mut aggregator, props) = loaded_aggregator(projected(&[(0, &[1.0]), (1, &[5.0])]));
    let bins_before = Arc::clone(
        aggregator
            .sorted_bins(DimensionKey::FillColor)
            .expect("bins populated"),
    );

    let mut new_props = props.clone();
    new_props.cell_size = 200.0;
    new_props.lower_percentile = 10.0;
    let outcome = aggregator
        .update(&props, &new_props, &ChangeFlags::default(), viewport())
        .expect("full update succeeds");

    assert!(outcome.reprojected);
    let mut expected = Vec::new();
    for key in [DimensionKey::FillColor, DimensionKey::Elevation] {
        for stage in StageKind::ORDERED {
            expected.push((key, stage));
        }
    }
    assert_eq!(outcome.ran, expected);
    let bins_after = aggregator
        .sorted_bins(DimensionKey::FillColor)
        .expect("bins rebuilt");
    assert!(!Arc::ptr_eq(&bins_before, bins_after));
}

#[test]
fn repeated_identical_update_reproduces_identical_state() {
    let data = projected(&[(0, &[1.0]), (1, &[3.0]), (2, &[9.0])]);
    let old_props = base_props(data.clone());
    let mut new_props = old_props.clone();
    new_props.lower_percentile = 20.0;

    let mut aggregator = CpuAggregator::new();
    aggregator
        .update(&old_props, &old_props, &data_changed(), viewport())
        .expect("initial update");

    let first = aggregator
        .update(&old_props, &new_props, &ChangeFlags::default(), viewport())
        .expect("first diff update");
    let domain_first = aggregator.value_domain(DimensionKey::FillColor);

    let second = aggregator
        .update(&old_props, &new_props, &ChangeFlags::default(), viewport())
        .expect("second diff update");
    let domain_second = aggregator.value_domain(DimensionKey::FillColor);

    assert_eq!(first, second);
    assert_eq!(domain_first, domain_second);

    // Once the snapshots converge, nothing fires at all.
    let settled = aggregator
        .update(&new_props, &new_props, &ChangeFlags::default(), viewport())
        .expect("settled update");
    assert!(settled.ran.is_empty());
}

#[test]
fn projection_error_propagates_and_keeps_prior_state() {
    let (mut aggregator, props) = loaded_aggregator(projected(&[(0, &[1.0])]));
    let bins_before = Arc::clone(
        aggregator
            .sorted_bins(DimensionKey::FillColor)
            .expect("bins populated"),
    );

    let mut failing = props.clone();
    failing.aggregator = Arc::new(|_, _| {
        Err(ProjectError {
            message: "backing store unavailable".to_owned(),
        })
    });
    let result = aggregator.update(&props, &failing, &ChangeFlags::default(), viewport());

    assert!(matches!(result, Err(UpdateError::Projection(_))));
    let bins_after = aggregator
        .sorted_bins(DimensionKey::FillColor)
        .expect("prior bins retained");
    assert!(Arc::ptr_eq(&bins_before, bins_after));
}

#[test]
fn stale_stage_without_precursor_records_skips_instead_of_running() {
    let data = projected(&[(0, &[1.0])]);
    let old_props = base_props(data.clone());
    let mut new_props = old_props.clone();
    new_props.lower_percentile = 25.0;

    // Fresh aggregator: the bin stage has never run, so the fired domain
    // stage (and the scale stage behind it) has no precursor state.
    let mut aggregator = CpuAggregator::new();
    let outcome = aggregator
        .update(&old_props, &new_props, &ChangeFlags::default(), viewport())
        .expect("update succeeds");

    assert!(outcome.ran.is_empty());
    assert_eq!(
        outcome.skipped,
        vec![
            StageSkip {
                dimension: DimensionKey::FillColor,
                stage: StageKind::Domain,
                reason: SkipReason::MissingBins,
            },
            StageSkip {
                dimension: DimensionKey::FillColor,
                stage: StageKind::Scale,
                reason: SkipReason::MissingDomain,
            },
        ]
    );
    assert!(aggregator.value_domain(DimensionKey::FillColor).is_none());
    assert!(aggregator.sorted_bins(DimensionKey::FillColor).is_none());
}

#[test]
fn accessor_returns_null_value_for_empty_and_missing_bins() {
    let mut data = projected(&[(0, &[2.0]), (1, &[6.0])]);
    data.points[0].source.keep = false; // bin 0 empty after filtering

    let mut props = base_props(data);
    props.filter = Some(Arc::new(|p: &TestPoint| p.keep));
    let mut aggregator = CpuAggregator::new();
    aggregator
        .update(&props, &props, &data_changed(), viewport())
        .expect("update succeeds");

    assert_eq!(
        aggregator.bin_attribute(DimensionKey::FillColor, 0),
        AttributeValue::Color([0, 0, 0, 0])
    );
    assert_eq!(
        aggregator.bin_attribute(DimensionKey::Elevation, 0),
        AttributeValue::Number(-1.0)
    );
    // A bin index the projection never produced behaves the same way.
    assert_eq!(
        aggregator.bin_attribute(DimensionKey::FillColor, 99),
        AttributeValue::Color([0, 0, 0, 0])
    );
}

#[test]
fn accessor_suppresses_values_outside_explicit_domain() {
    let data = projected(&[(0, &[1.0]), (1, &[5.0]), (2, &[50.0])]);
    let mut props = base_props(data);
    props.color_domain = Some([0.0, 10.0]);
    let mut aggregator = CpuAggregator::new();
    aggregator
        .update(&props, &props, &data_changed(), viewport())
        .expect("update succeeds");

    assert!(matches!(
        aggregator.bin_attribute(DimensionKey::FillColor, 1),
        AttributeValue::Color(color) if color != [0, 0, 0, 0]
    ));
    assert_eq!(
        aggregator.bin_attribute(DimensionKey::FillColor, 2),
        AttributeValue::Color([0, 0, 0, 0])
    );
}

#[test]
fn explicit_domain_takes_precedence_over_computed_domain() {
    let data = projected(&[(0, &[1.0]), (1, &[5.0])]);
    let mut props = base_props(data);
    props.color_domain = Some([0.0, 100.0]);
    let mut aggregator = CpuAggregator::new();
    let outcome = aggregator
        .update(&props, &props, &data_changed(), viewport())
        .expect("update succeeds");

    // The computed domain is still reported even when the explicit one wins.
    assert!(outcome
        .computed_domains
        .contains(&(DimensionKey::FillColor, [1.0, 5.0])));
    // Values way past the computed domain still map because the explicit
    // domain governs the scale.
    assert!(matches!(
        aggregator.bin_attribute(DimensionKey::FillColor, 1),
        AttributeValue::Color(color) if color != [0, 0, 0, 0]
    ));
}

#[test]
fn unsupported_scale_type_fails_the_update() {
    let data = projected(&[(0, &[1.0])]);
    let mut props = base_props(data);
    props.color_scale_type = ScaleType::Ordinal;
    let mut aggregator = CpuAggregator::new();
    let result = aggregator.update(&props, &props, &data_changed(), viewport());
    assert_eq!(
        result.unwrap_err(),
        UpdateError::Scale(ScaleError::UnsupportedScaleType {
            scale_type: ScaleType::Ordinal
        })
    );
}

#[test]
fn closure_props_only_fire_through_named_triggers() {
    let (mut aggregator, props) = loaded_aggregator(projected(&[(0, &[1.0]), (1, &[5.0])]));
    let bins_before = Arc::clone(
        aggregator
            .sorted_bins(DimensionKey::FillColor)
            .expect("bins populated"),
    );

    // Swapping the filter closure without bumping the FilterData trigger is
    // invisible to the engine.
    let mut new_props = props.clone();
    new_props.filter = Some(Arc::new(|_: &TestPoint| false));
    let outcome = aggregator
        .update(&props, &new_props, &ChangeFlags::default(), viewport())
        .expect("update succeeds");
    assert!(outcome.ran.is_empty());

    // Naming the trigger re-runs both dimensions from the bin stage.
    let flags = ChangeFlags {
        changed_triggers: vec![UpdateTriggerName::FilterData],
        ..ChangeFlags::default()
    };
    let outcome = aggregator
        .update(&props, &new_props, &flags, viewport())
        .expect("update succeeds");
    assert_eq!(outcome.ran.len(), 6);
    let bins_after = aggregator
        .sorted_bins(DimensionKey::FillColor)
        .expect("bins rebuilt");
    assert!(!Arc::ptr_eq(&bins_before, bins_after));
}

#[test]
fn update_trigger_bag_merges_caller_overrides() {
    let data = projected(&[(0, &[1.0])]);
    let mut props = base_props(data);
    props.update_triggers.insert(
        UpdateTriggerName::GetColorValue,
        TriggerValue::Map(HashMap::from([
            ("radius".to_owned(), 3),
            ("coverage".to_owned(), 7),
        ])),
    );
    props
        .update_triggers
        .insert(UpdateTriggerName::GetColorWeight, TriggerValue::Token(11));

    let aggregator = CpuAggregator::<TestPoint>::new();
    let triggers = aggregator.update_triggers(&props);

    let color_bag = &triggers["get_fill_color"];
    // Map-valued override spreads key-wise.
    assert_eq!(color_bag["radius"], TriggerValue::Token(3));
    assert_eq!(color_bag["coverage"], TriggerValue::Token(7));
    // Token-valued override replaces the single prop key.
    assert_eq!(color_bag["get_color_weight"], TriggerValue::Token(11));
    // Directly compared props surface their current values.
    assert_eq!(color_bag["lower_percentile"], TriggerValue::Number(0.0));
    assert_eq!(
        color_bag["color_scale_type"],
        TriggerValue::ScaleType(ScaleType::Quantize)
    );

    let elevation_bag = &triggers["get_elevation"];
    assert_eq!(
        elevation_bag["elevation_range"],
        TriggerValue::Numbers(vec![0.0, 1000.0])
    );
    // No override was supplied for the elevation value trigger.
    assert!(!elevation_bag.contains_key("get_elevation_value"));
}

#[test]
fn pick_returns_raw_values_and_contributing_points() {
    let (aggregator, _props) = loaded_aggregator(projected(&[(0, &[2.0, 4.0]), (1, &[10.0])]));

    let info = aggregator.pick(0);
    assert!(info.picked);
    assert_eq!(info.bin_index, Some(0));
    assert_eq!(info.color_value, Some(3.0));
    assert_eq!(info.elevation_value, Some(3.0));
    assert_eq!(info.point_indices, vec![0, 1]);

    let miss = aggregator.pick(42);
    assert_eq!(miss, BinPickInfo::unpicked());
}
