//! Shared switched-linear test fixtures.
#![allow(dead_code)]

use nalgebra::{DMatrix, DVector};

use ocx_core::model::{
    DynamicsExpansion, NoConstraint, OcProblem, SwitchedDynamics,
};
use ocx_core::quadratic::{QuadraticCost, QuadraticWeights, StaticOperatingPoint};
use ocx_core::types::{InputVector, StateVector};

/// Per-mode linear dynamics `dx/dt = A_mode x + B_mode u`.
#[derive(Clone)]
pub struct LinearDynamics {
    pub systems: Vec<(DMatrix<f64>, DMatrix<f64>)>,
}

impl LinearDynamics {
    pub fn new(systems: Vec<(DMatrix<f64>, DMatrix<f64>)>) -> Self {
        assert!(!systems.is_empty());
        Self { systems }
    }

    fn system(&self, mode: usize) -> &(DMatrix<f64>, DMatrix<f64>) {
        self.systems.get(mode).unwrap_or(&self.systems[0])
    }
}

impl SwitchedDynamics for LinearDynamics {
    fn state_dim(&self) -> usize {
        self.systems[0].0.nrows()
    }

    fn input_dim(&self) -> usize {
        self.systems[0].1.ncols()
    }

    fn flow(&self, mode: usize, _t: f64, x: &StateVector, u: &InputVector) -> StateVector {
        let (a, b) = self.system(mode);
        a * x + b * u
    }

    fn linearize(&self, mode: usize, _t: f64, _x: &StateVector, _u: &InputVector) -> DynamicsExpansion {
        let (a, b) = self.system(mode);
        DynamicsExpansion { a: a.clone(), b: b.clone() }
    }

    fn clone_dynamics(&self) -> Box<dyn SwitchedDynamics> {
        Box::new(self.clone())
    }
}

/// Scalar integrator-style problem: `dx/dt = a x + b u` with unit quadratic
/// regulation cost and no terminal weight.
pub fn scalar_problem(a: f64, b: f64, q: f64, r: f64) -> OcProblem {
    OcProblem {
        dynamics: Box::new(LinearDynamics::new(vec![(
            DMatrix::from_element(1, 1, a),
            DMatrix::from_element(1, 1, b),
        )])),
        cost: Box::new(QuadraticCost::uniform(
            QuadraticWeights {
                q: DMatrix::from_element(1, 1, q),
                r: DMatrix::from_element(1, 1, r),
                qf: DMatrix::zeros(1, 1),
            },
            DVector::zeros(1),
            DVector::zeros(1),
        )),
        constraint: Box::new(NoConstraint),
        operating: Some(Box::new(StaticOperatingPoint::origin(1, 1))),
    }
}

/// Dense backward RK4 reference of the scalar Riccati ODE
/// `-dP/dt = q + 2 a P - P² b² / r` with `P(tf) = p_final`, sampled on a
/// uniform grid over `[t0, tf]` (returned in increasing time).
pub fn reference_riccati_gain(
    a: f64,
    b: f64,
    q: f64,
    r: f64,
    t0: f64,
    tf: f64,
    samples: usize,
    p_final: f64,
) -> (Vec<f64>, Vec<f64>) {
    let rhs = |p: f64| q + 2.0 * a * p - p * p * b * b / r;
    let steps_per_sample = 2_000;
    let h = (tf - t0) / ((samples - 1) * steps_per_sample) as f64;
    let mut p = p_final;
    let mut times = vec![tf];
    let mut values = vec![p];
    for s in 1..samples {
        for _ in 0..steps_per_sample {
            let k1 = rhs(p);
            let k2 = rhs(p + 0.5 * h * k1);
            let k3 = rhs(p + 0.5 * h * k2);
            let k4 = rhs(p + h * k3);
            p += h / 6.0 * (k1 + 2.0 * k2 + 2.0 * k3 + k4);
        }
        times.push(tf - (tf - t0) * s as f64 / (samples - 1) as f64);
        values.push(p);
    }
    times.reverse();
    values.reverse();
    (times, values)
}
