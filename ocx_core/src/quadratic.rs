//! Ready-made quadratic cost and constant operating point.
//!
//! `QuadraticCost` penalizes deviation from a desired state/input pair with
//! per-mode weight matrices; the terminal penalty can be restricted to a
//! subset of modes. Sufficient for LQR-style problems and the test fixtures.

use nalgebra::{DMatrix, DVector};

use crate::interpolation::interpolate;
use crate::model::{
    CostExpansion, OperatingTrajectories, StateCostExpansion, SwitchedCost,
};
use crate::types::{DesiredTrajectory, InputVector, StateVector};

/// Per-mode quadratic weights.
#[derive(Debug, Clone)]
pub struct QuadraticWeights {
    /// State weight `Q` (n x n, symmetric PSD).
    pub q: DMatrix<f64>,
    /// Input weight `R` (m x m, symmetric PD).
    pub r: DMatrix<f64>,
    /// Terminal state weight `Qf`; zero matrix disables the terminal term.
    pub qf: DMatrix<f64>,
}

/// Tracking cost `0.5 (x - x_d)'Q(x - x_d) + 0.5 (u - u_d)'R(u - u_d)` with
/// terminal `0.5 (x - x_d)'Qf(x - x_d)`.
#[derive(Debug, Clone)]
pub struct QuadraticCost {
    weights: Vec<QuadraticWeights>,
    x_desired: DVector<f64>,
    u_desired: DVector<f64>,
    desired: DesiredTrajectory,
}

impl QuadraticCost {
    /// One weight set per subsystem identifier (indexed by mode).
    pub fn new(weights: Vec<QuadraticWeights>, x_desired: DVector<f64>, u_desired: DVector<f64>) -> Self {
        assert!(!weights.is_empty(), "quadratic cost needs at least one weight set");
        Self { weights, x_desired, u_desired, desired: DesiredTrajectory::default() }
    }

    /// Same weights for every mode.
    pub fn uniform(weights: QuadraticWeights, x_desired: DVector<f64>, u_desired: DVector<f64>) -> Self {
        Self::new(vec![weights], x_desired, u_desired)
    }

    fn weights(&self, mode: usize) -> &QuadraticWeights {
        self.weights.get(mode).unwrap_or(&self.weights[0])
    }

    fn x_ref(&self, t: f64) -> DVector<f64> {
        if self.desired.is_empty() {
            self.x_desired.clone()
        } else {
            interpolate(&self.desired.times, &self.desired.states, t)
        }
    }

    fn u_ref(&self, t: f64) -> DVector<f64> {
        if self.desired.is_empty() || self.desired.inputs.is_empty() {
            self.u_desired.clone()
        } else {
            interpolate(&self.desired.times, &self.desired.inputs, t)
        }
    }
}

impl SwitchedCost for QuadraticCost {
    fn stage_cost(&self, mode: usize, t: f64, x: &StateVector, u: &InputVector) -> f64 {
        let w = self.weights(mode);
        let dx = x - self.x_ref(t);
        let du = u - self.u_ref(t);
        0.5 * (dx.dot(&(&w.q * &dx)) + du.dot(&(&w.r * &du)))
    }

    fn stage_expansion(
        &self,
        mode: usize,
        t: f64,
        x: &StateVector,
        u: &InputVector,
    ) -> CostExpansion {
        let w = self.weights(mode);
        let dx = x - self.x_ref(t);
        let du = u - self.u_ref(t);
        CostExpansion {
            q: 0.5 * (dx.dot(&(&w.q * &dx)) + du.dot(&(&w.r * &du))),
            qv: &w.q * &dx,
            qm: w.q.clone(),
            pm: DMatrix::zeros(u.len(), x.len()),
            rv: &w.r * &du,
            rm: w.r.clone(),
        }
    }

    fn terminal_cost(&self, mode: usize, t: f64, x: &StateVector) -> f64 {
        let w = self.weights(mode);
        let dx = x - self.x_ref(t);
        0.5 * dx.dot(&(&w.qf * &dx))
    }

    fn terminal_expansion(&self, mode: usize, t: f64, x: &StateVector) -> StateCostExpansion {
        let w = self.weights(mode);
        let dx = x - self.x_ref(t);
        StateCostExpansion {
            q: 0.5 * dx.dot(&(&w.qf * &dx)),
            qv: &w.qf * &dx,
            qm: w.qf.clone(),
        }
    }

    fn set_desired(&mut self, desired: &DesiredTrajectory) {
        self.desired = desired.clone();
    }

    fn clone_cost(&self) -> Box<dyn SwitchedCost> {
        Box::new(self.clone())
    }
}

/// Constant operating point used to cold-start the optimizer.
#[derive(Debug, Clone)]
pub struct StaticOperatingPoint {
    pub state: StateVector,
    pub input: InputVector,
}

impl StaticOperatingPoint {
    pub fn new(state: StateVector, input: InputVector) -> Self {
        Self { state, input }
    }

    pub fn origin(state_dim: usize, input_dim: usize) -> Self {
        Self { state: DVector::zeros(state_dim), input: DVector::zeros(input_dim) }
    }
}

impl OperatingTrajectories for StaticOperatingPoint {
    fn sample(&self, _t: f64) -> (StateVector, InputVector) {
        (self.state.clone(), self.input.clone())
    }

    fn clone_operating(&self) -> Box<dyn OperatingTrajectories> {
        Box::new(self.clone())
    }
}
