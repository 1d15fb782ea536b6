//! Scale resolution: domain + range + scale-type tag to a value mapping.
//!
//! Resolution fails fast on an unsupported tag or degenerate inputs; the
//! resulting `Scale` is a pure function and keeps the exact input domain
//! available for inside/outside-domain tests.

use agg_protocol::{Color, ScaleType};

/// Output seam for scale ranges. Linear scales interpolate between the range
/// endpoints; ordinal scales (quantize/quantile) pick elements.
pub trait ScaleOutput: Clone {
    fn lerp(start: &Self, end: &Self, t: f64) -> Self;
}

impl ScaleOutput for f64 {
    fn lerp(start: &Self, end: &Self, t: f64) -> Self {
        start + (end - start) * t
    }
}

impl ScaleOutput for Color {
    fn lerp(start: &Self, end: &Self, t: f64) -> Self {
        let mut out = [0u8; 4];
        for (channel, slot) in out.iter_mut().enumerate() {
            let a = start[channel] as f64;
            let b = end[channel] as f64;
            *slot = (a + (b - a) * t).round().clamp(0.0, 255.0) as u8;
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleError {
    UnsupportedScaleType { scale_type: ScaleType },
    EmptyDomain,
    EmptyRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScaleKind {
    Linear,
    Quantile,
    Quantize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scale<R: ScaleOutput> {
    kind: ScaleKind,
    domain: Vec<f64>,
    range: Vec<R>,
    /// Quantile slot boundaries, precomputed at resolution time. Empty for
    /// other kinds.
    quantile_thresholds: Vec<f64>,
}

pub fn resolve_scale<R: ScaleOutput>(
    domain: &[f64],
    range: &[R],
    scale_type: ScaleType,
) -> Result<Scale<R>, ScaleError> {
    let kind = match scale_type {
        ScaleType::Linear => ScaleKind::Linear,
        ScaleType::Quantile => ScaleKind::Quantile,
        ScaleType::Quantize => ScaleKind::Quantize,
        other => return Err(ScaleError::UnsupportedScaleType { scale_type: other }),
    };
    if domain.is_empty() {
        return Err(ScaleError::EmptyDomain);
    }
    if range.is_empty() {
        return Err(ScaleError::EmptyRange);
    }

    let quantile_thresholds = if kind == ScaleKind::Quantile {
        quantile_thresholds(domain, range.len())
    } else {
        Vec::new()
    };

    Ok(Scale {
        kind,
        domain: domain.to_vec(),
        range: range.to_vec(),
        quantile_thresholds,
    })
}

impl<R: ScaleOutput> Scale<R> {
    /// The exact domain the scale was resolved with, verbatim.
    pub fn domain(&self) -> &[f64] {
        &self.domain
    }

    pub fn map(&self, value: f64) -> R {
        match self.kind {
            ScaleKind::Linear => {
                let start = self.domain[0];
                let end = self.domain[self.domain.len() - 1];
                let span = end - start;
                let t = if span == 0.0 {
                    0.0
                } else {
                    ((value - start) / span).clamp(0.0, 1.0)
                };
                R::lerp(&self.range[0], &self.range[self.range.len() - 1], t)
            }
            ScaleKind::Quantize => {
                let start = self.domain[0];
                let end = self.domain[self.domain.len() - 1];
                let span = end - start;
                if span <= 0.0 {
                    return self.range[0].clone();
                }
                let slot = ((value - start) / span * self.range.len() as f64).floor();
                let slot = (slot.max(0.0) as usize).min(self.range.len() - 1);
                self.range[slot].clone()
            }
            ScaleKind::Quantile => {
                let slot = self
                    .quantile_thresholds
                    .iter()
                    .take_while(|threshold| **threshold <= value)
                    .count()
                    .min(self.range.len() - 1);
                self.range[slot].clone()
            }
        }
    }
}

/// Slot boundaries at quantiles `k/n` of the sorted domain values, for
/// `k in 1..n`, by linear interpolation.
fn quantile_thresholds(domain: &[f64], slots: usize) -> Vec<f64> {
    let mut sorted = domain.to_vec();
    sorted.sort_by(f64::total_cmp);
    let last = sorted.len() - 1;

    (1..slots)
        .map(|slot| {
            let rank = slot as f64 / slots as f64 * last as f64;
            let lower = rank.floor() as usize;
            let upper = (rank.ceil() as usize).min(last);
            let fraction = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
        })
        .collect()
}
