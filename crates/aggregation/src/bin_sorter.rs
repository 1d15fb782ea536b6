//! Point binning and percentile-ordered bin statistics.
//!
//! `BinSorter` consumes a projected dataset once, groups points by their
//! externally computed bin index, and keeps a value-ascending view of
//! non-empty bins for percentile-range queries. The collection is immutable
//! after construction; a new dataset means a new instance.

use std::collections::HashMap;

use agg_protocol::{BinIndex, BinValueFn, PointFilterFn, ProjectedData};

/// One aggregation bucket. `points` and `filtered_points` hold indices into
/// the projected dataset the sorter was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    pub index: BinIndex,
    /// Points assigned to this bin, pre-filter.
    pub count: usize,
    /// Points remaining after the filter predicate.
    pub filtered_count: usize,
    /// Aggregate over the post-filter points. `None` when the value function
    /// declines (e.g. nothing left after filtering); such bins are excluded
    /// from the sorted view.
    pub value: Option<f64>,
    pub points: Vec<usize>,
    pub filtered_points: Vec<usize>,
}

pub struct BinSorterOptions<'a, P> {
    pub get_value: &'a BinValueFn<P>,
    pub filter: Option<&'a PointFilterFn<P>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinSorter {
    bin_map: HashMap<BinIndex, Bin>,
    /// Values of bins with a defined aggregate, ascending.
    sorted_values: Vec<f64>,
}

impl BinSorter {
    pub fn new<P>(data: &ProjectedData<P>, options: BinSorterOptions<'_, P>) -> Self {
        let mut bin_map: HashMap<BinIndex, Bin> = HashMap::new();

        for (point_index, point) in data.points.iter().enumerate() {
            let bin = bin_map.entry(point.bin_index).or_insert_with(|| Bin {
                index: point.bin_index,
                count: 0,
                filtered_count: 0,
                value: None,
                points: Vec::new(),
                filtered_points: Vec::new(),
            });
            bin.count += 1;
            bin.points.push(point_index);
            let passes = options.filter.is_none_or(|filter| filter(&point.source));
            if passes {
                bin.filtered_count += 1;
                bin.filtered_points.push(point_index);
            }
        }

        for bin in bin_map.values_mut() {
            let filtered: Vec<&P> = bin
                .filtered_points
                .iter()
                .map(|&index| &data.points[index].source)
                .collect();
            bin.value = (options.get_value)(&filtered);
        }

        let mut sorted_values: Vec<f64> = bin_map.values().filter_map(|bin| bin.value).collect();
        sorted_values.sort_by(f64::total_cmp);

        Self {
            bin_map,
            sorted_values,
        }
    }

    pub fn bin(&self, index: BinIndex) -> Option<&Bin> {
        self.bin_map.get(&index)
    }

    pub fn bin_count(&self) -> usize {
        self.bin_map.len()
    }

    /// Largest post-filter point count across all bins.
    pub fn max_count(&self) -> usize {
        self.bin_map
            .values()
            .map(|bin| bin.filtered_count)
            .max()
            .unwrap_or(0)
    }

    /// Largest defined bin value, if any bin has one.
    pub fn max_value(&self) -> Option<f64> {
        self.sorted_values.last().copied()
    }

    /// Value domain covered by `[lower, upper]` percentiles of the sorted
    /// bin values, by linear interpolation at fractional rank
    /// `p/100 * (N-1)`. An empty sorted view returns the fixed sentinel
    /// `[0.0, 0.0]`.
    pub fn get_value_range(&self, percentile_range: [f64; 2]) -> [f64; 2] {
        if self.sorted_values.is_empty() {
            return [0.0, 0.0];
        }
        [
            self.value_at_percentile(percentile_range[0]),
            self.value_at_percentile(percentile_range[1]),
        ]
    }

    fn value_at_percentile(&self, percentile: f64) -> f64 {
        let last = self.sorted_values.len() - 1;
        let rank = (percentile / 100.0).clamp(0.0, 1.0) * last as f64;
        let lower = rank.floor() as usize;
        let upper = (rank.ceil() as usize).min(last);
        let fraction = rank - lower as f64;
        let low = self.sorted_values[lower];
        let high = self.sorted_values[upper];
        low + (high - low) * fraction
    }
}
