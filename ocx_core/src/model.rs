//! Evaluation traits user models implement.
//!
//! A switched system is a tagged selection keyed by the active subsystem
//! identifier: every trait method receives the `mode` to evaluate under.
//! Worker threads own deep clones of all model objects, so each trait
//! carries a boxed-clone method.

use nalgebra::{DMatrix, DVector};

use crate::types::{
    FeedbackMatrix, InputGainMatrix, InputMatrix, InputVector, StateMatrix, StateVector,
};

/// First-order dynamics expansion at a node: `dx/dt = A x + B u + ...`.
#[derive(Debug, Clone)]
pub struct DynamicsExpansion {
    pub a: StateMatrix,
    pub b: InputGainMatrix,
}

/// Second-order stage-cost expansion around the nominal pair.
///
/// `L = q + qv'dx + rv'du + 0.5 dx'Qm dx + du'Pm dx + 0.5 du'Rm du`.
/// `qm` is symmetric; `rm` symmetric positive definite.
#[derive(Debug, Clone)]
pub struct CostExpansion {
    pub q: f64,
    pub qv: StateVector,
    pub qm: StateMatrix,
    pub pm: FeedbackMatrix,
    pub rv: InputVector,
    pub rm: InputMatrix,
}

/// Quadratic state-only cost expansion (terminal or event).
#[derive(Debug, Clone)]
pub struct StateCostExpansion {
    pub q: f64,
    pub qv: StateVector,
    pub qm: StateMatrix,
}

impl StateCostExpansion {
    pub fn zeros(state_dim: usize) -> Self {
        Self { q: 0.0, qv: DVector::zeros(state_dim), qm: DMatrix::zeros(state_dim, state_dim) }
    }
}

/// Linearized state-input equality constraint `C x + D u + e = 0` at a node.
///
/// `e` is the constraint residual evaluated at the nominal pair. `num_active`
/// rows are populated; zero means the node is unconstrained.
#[derive(Debug, Clone)]
pub struct StateInputConstraint {
    pub num_active: usize,
    pub c: DMatrix<f64>,
    pub d: DMatrix<f64>,
    pub e: DVector<f64>,
}

impl StateInputConstraint {
    pub fn none(state_dim: usize, input_dim: usize) -> Self {
        Self {
            num_active: 0,
            c: DMatrix::zeros(0, state_dim),
            d: DMatrix::zeros(0, input_dim),
            e: DVector::zeros(0),
        }
    }
}

/// Linearized state-only equality constraint `F x + h = 0`.
#[derive(Debug, Clone)]
pub struct StateConstraint {
    pub num_active: usize,
    pub f: DMatrix<f64>,
    pub h: DVector<f64>,
}

impl StateConstraint {
    pub fn none(state_dim: usize) -> Self {
        Self { num_active: 0, f: DMatrix::zeros(0, state_dim), h: DVector::zeros(0) }
    }
}

/// Controlled switched dynamics: flow, Jacobians, and hybrid structure.
pub trait SwitchedDynamics: Send + Sync {
    fn state_dim(&self) -> usize;
    fn input_dim(&self) -> usize;

    /// Continuous flow `dx/dt` under subsystem `mode`.
    fn flow(&self, mode: usize, t: f64, x: &StateVector, u: &InputVector) -> StateVector;

    /// Jacobians `(A, B)` of the flow at `(t, x, u)` under `mode`.
    fn linearize(
        &self,
        mode: usize,
        t: f64,
        x: &StateVector,
        u: &InputVector,
    ) -> DynamicsExpansion;

    /// State jump applied when switching `from` -> `to`. Identity by default.
    fn jump_map(&self, _from: usize, _to: usize, _t: f64, x: &StateVector) -> StateVector {
        x.clone()
    }

    /// Guard surface for state-triggered switching out of `mode`; an event
    /// fires when the value crosses zero from above. The default never fires.
    fn guard(&self, _mode: usize, _t: f64, _x: &StateVector) -> f64 {
        1.0
    }

    fn clone_dynamics(&self) -> Box<dyn SwitchedDynamics>;
}

impl Clone for Box<dyn SwitchedDynamics> {
    fn clone(&self) -> Self {
        self.clone_dynamics()
    }
}

/// Stage, terminal, and event costs with their quadratic expansions.
pub trait SwitchedCost: Send + Sync {
    fn stage_cost(&self, mode: usize, t: f64, x: &StateVector, u: &InputVector) -> f64;

    fn stage_expansion(
        &self,
        mode: usize,
        t: f64,
        x: &StateVector,
        u: &InputVector,
    ) -> CostExpansion;

    fn terminal_cost(&self, mode: usize, t: f64, x: &StateVector) -> f64;

    fn terminal_expansion(&self, mode: usize, t: f64, x: &StateVector) -> StateCostExpansion;

    /// Cost charged when an event fires at `(t, x)`. Zero by default.
    fn event_cost(&self, _mode: usize, _t: f64, x: &StateVector) -> f64 {
        let _ = x;
        0.0
    }

    fn event_expansion(&self, _mode: usize, _t: f64, x: &StateVector) -> StateCostExpansion {
        StateCostExpansion::zeros(x.len())
    }

    /// Install the reference the cost tracks. No-op for regulation costs.
    fn set_desired(&mut self, _desired: &crate::types::DesiredTrajectory) {}

    fn clone_cost(&self) -> Box<dyn SwitchedCost>;
}

impl Clone for Box<dyn SwitchedCost> {
    fn clone(&self) -> Self {
        self.clone_cost()
    }
}

/// Equality constraints: state-input along the trajectory, state-only at
/// events and at the final time. All default to "no constraint".
pub trait SwitchedConstraint: Send + Sync {
    fn state_input(
        &self,
        _mode: usize,
        _t: f64,
        x: &StateVector,
        u: &InputVector,
    ) -> StateInputConstraint {
        StateInputConstraint::none(x.len(), u.len())
    }

    fn state_only(&self, _mode: usize, _t: f64, x: &StateVector) -> StateConstraint {
        StateConstraint::none(x.len())
    }

    fn terminal(&self, _mode: usize, _t: f64, x: &StateVector) -> StateConstraint {
        StateConstraint::none(x.len())
    }

    fn clone_constraint(&self) -> Box<dyn SwitchedConstraint>;
}

impl Clone for Box<dyn SwitchedConstraint> {
    fn clone(&self) -> Self {
        self.clone_constraint()
    }
}

/// Operating trajectories used to cold-start the optimizer.
pub trait OperatingTrajectories: Send + Sync {
    /// Nominal `(x, u)` pair at `t`.
    fn sample(&self, t: f64) -> (StateVector, InputVector);

    fn clone_operating(&self) -> Box<dyn OperatingTrajectories>;
}

impl Clone for Box<dyn OperatingTrajectories> {
    fn clone(&self) -> Self {
        self.clone_operating()
    }
}

/// The full optimal control problem bundle handed to the solver.
///
/// Cloning produces the deep, worker-owned copy required by the parallel
/// scopes: no worker ever shares mutable model state with another.
#[derive(Clone)]
pub struct OcProblem {
    pub dynamics: Box<dyn SwitchedDynamics>,
    pub cost: Box<dyn SwitchedCost>,
    pub constraint: Box<dyn SwitchedConstraint>,
    /// Cold-start nominal trajectories; absent bundles can only warm start.
    pub operating: Option<Box<dyn OperatingTrajectories>>,
}

impl OcProblem {
    pub fn state_dim(&self) -> usize {
        self.dynamics.state_dim()
    }

    pub fn input_dim(&self) -> usize {
        self.dynamics.input_dim()
    }
}

/// Constraint-free placeholder usable by unconstrained problems.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConstraint;

impl SwitchedConstraint for NoConstraint {
    fn clone_constraint(&self) -> Box<dyn SwitchedConstraint> {
        Box::new(*self)
    }
}
