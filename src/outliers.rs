//! Percentile winsorization
//!
//! Bounds are computed once over the pooled population of every exposed
//! subject (all variants together) and every subject's value is clipped into
//! them before accumulation.
//!
//! Percentiles use linear interpolation between closest ranks: for `n`
//! sorted values the percentile `p` sits at rank `h = (n - 1) * p`.

use crate::error::ComputeError;

/// Clip bounds derived from the pooled value distribution
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PercentileBounds {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl PercentileBounds {
    /// Compute bounds for the given thresholds.
    ///
    /// With no thresholds the bounds are empty and [`clip`](Self::clip)
    /// passes values through.
    pub fn compute(
        values: &[f64],
        lower_percentile: Option<f64>,
        upper_percentile: Option<f64>,
    ) -> Result<Self, ComputeError> {
        for p in [lower_percentile, upper_percentile].into_iter().flatten() {
            if !(p > 0.0 && p < 1.0) {
                return Err(ComputeError::InvalidConfig(format!(
                    "percentile {p} is outside (0, 1)"
                )));
            }
        }
        if let (Some(lo), Some(hi)) = (lower_percentile, upper_percentile) {
            if lo >= hi {
                return Err(ComputeError::InvalidConfig(format!(
                    "lower percentile {lo} is not below upper percentile {hi}"
                )));
            }
        }

        if lower_percentile.is_none() && upper_percentile.is_none() {
            return Ok(Self::default());
        }

        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        sorted.sort_by(f64::total_cmp);

        Ok(Self {
            lower: lower_percentile.and_then(|p| percentile(&sorted, p)),
            upper: upper_percentile.and_then(|p| percentile(&sorted, p)),
        })
    }

    pub fn is_noop(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    pub fn clip(&self, value: f64) -> f64 {
        let value = match self.lower {
            Some(lo) if value < lo => lo,
            _ => value,
        };
        match self.upper {
            Some(hi) if value > hi => hi,
            _ => value,
        }
    }
}

/// Linear-interpolated percentile of already sorted values
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    match sorted.len() {
        0 => None,
        1 => Some(sorted[0]),
        n => {
            let h = (n - 1) as f64 * p.clamp(0.0, 1.0);
            let below = h.floor() as usize;
            let above = (below + 1).min(n - 1);
            let weight = h - below as f64;
            Some(sorted[below] + (sorted[above] - sorted[below]) * weight)
        }
    }
}
