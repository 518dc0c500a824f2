//! Affine, piecewise-linear-in-time feedback law.
//!
//! At each node: gain `K`, feedforward `u_ff`, and a pending feedforward
//! increment `delta_u_ff` produced by the most recent backward pass. The
//! input at time `t` is
//!
//! ```text
//! u(t) = K(t) * x + u_ff(t) + step_size * delta_u_ff(t)
//! ```
//!
//! with all three sampled quantities linearly interpolated between nodes.
//! `step_size` is the line-search step applied to the pending increment;
//! accepting a step folds the increment into `u_ff`.

use nalgebra::{DMatrix, DVector};

use crate::interpolation::interpolate;
use crate::types::{FeedbackMatrix, InputVector, StateVector};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackController {
    pub times: Vec<f64>,
    pub gains: Vec<FeedbackMatrix>,
    pub feedforward: Vec<InputVector>,
    pub feedforward_delta: Vec<InputVector>,
    /// Line-search step applied to `feedforward_delta` when evaluating.
    pub step_size: f64,
}

impl FeedbackController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller with `len` zeroed nodes at the given stamps.
    pub fn zeros(times: Vec<f64>, state_dim: usize, input_dim: usize) -> Self {
        let len = times.len();
        Self {
            times,
            gains: vec![DMatrix::zeros(input_dim, state_dim); len],
            feedforward: vec![DVector::zeros(input_dim); len],
            feedforward_delta: vec![DVector::zeros(input_dim); len],
            step_size: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn clear(&mut self) {
        self.times.clear();
        self.gains.clear();
        self.feedforward.clear();
        self.feedforward_delta.clear();
        self.step_size = 0.0;
    }

    pub fn end_time(&self) -> Option<f64> {
        self.times.last().copied()
    }

    /// Evaluate the control law at `(t, x)`.
    ///
    /// Queries outside the sampled range clamp to the boundary node.
    pub fn compute_input(&self, t: f64, x: &StateVector) -> InputVector {
        debug_assert!(!self.is_empty(), "compute_input on an empty controller");
        let k = interpolate(&self.times, &self.gains, t);
        let mut u = interpolate(&self.times, &self.feedforward, t);
        u += k * x;
        if self.step_size != 0.0 {
            u += interpolate(&self.times, &self.feedforward_delta, t) * self.step_size;
        }
        u
    }

    /// Fold `step * delta_u_ff` into the feedforward and clear the step.
    ///
    /// The increment samples are kept so update norms can still be reported.
    pub fn fold_step(&mut self, step: f64) {
        for (uff, delta) in self.feedforward.iter_mut().zip(&self.feedforward_delta) {
            *uff += delta * step;
        }
        self.step_size = 0.0;
    }

    /// Largest feedforward-increment norm over all nodes.
    pub fn max_delta_norm(&self) -> f64 {
        self.feedforward_delta
            .iter()
            .map(|d| d.norm())
            .fold(0.0, f64::max)
    }
}
