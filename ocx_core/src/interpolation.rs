//! Linear interpolation over time-stamped samples.
//!
//! Queries outside the stamped range clamp to the first/last sample; callers
//! that must treat out-of-range queries as errors check the range themselves.

use nalgebra::{DMatrix, DVector};

/// Types that can be linearly blended between two samples.
pub trait Lerp: Clone {
    fn lerp(a: &Self, b: &Self, alpha: f64) -> Self;
}

impl Lerp for f64 {
    fn lerp(a: &Self, b: &Self, alpha: f64) -> Self {
        a * (1.0 - alpha) + b * alpha
    }
}

impl Lerp for DVector<f64> {
    fn lerp(a: &Self, b: &Self, alpha: f64) -> Self {
        a * (1.0 - alpha) + b * alpha
    }
}

impl Lerp for DMatrix<f64> {
    fn lerp(a: &Self, b: &Self, alpha: f64) -> Self {
        a * (1.0 - alpha) + b * alpha
    }
}

/// Locate `t` in a sorted time array.
///
/// Returns `(k, alpha)` such that the interpolated value is
/// `(1 - alpha) * values[k] + alpha * values[k + 1]`. Out-of-range queries
/// clamp to the boundary sample (`alpha` 0 or 1). `times` must be non-empty
/// and non-decreasing; repeated stamps (event nodes) resolve to the later
/// sample.
pub fn index_alpha(times: &[f64], t: f64) -> (usize, f64) {
    debug_assert!(!times.is_empty(), "interpolation over empty time array");
    let n = times.len();
    if n == 1 || t <= times[0] {
        return (0, 0.0);
    }
    if t >= times[n - 1] {
        return (n - 2, 1.0);
    }
    // First index with times[idx] > t; the bracket is [idx - 1, idx].
    let idx = times.partition_point(|&stamp| stamp <= t);
    let (lo, hi) = (times[idx - 1], times[idx]);
    let span = hi - lo;
    let alpha = if span > 0.0 { (t - lo) / span } else { 1.0 };
    (idx - 1, alpha)
}

/// Interpolate a sampled quantity at time `t`.
pub fn interpolate<T: Lerp>(times: &[f64], values: &[T], t: f64) -> T {
    debug_assert_eq!(times.len(), values.len());
    let (k, alpha) = index_alpha(times, t);
    if alpha <= 0.0 {
        values[k].clone()
    } else if alpha >= 1.0 {
        values[k + 1].clone()
    } else {
        T::lerp(&values[k], &values[k + 1], alpha)
    }
}
