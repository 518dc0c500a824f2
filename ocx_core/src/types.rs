//! Dense matrix/vector aliases and trajectory containers.
//!
//! State and input dimensions are runtime values; all algebra uses
//! heap-allocated `nalgebra` dynamic types.

use nalgebra::{DMatrix, DVector};

/// State vector, dimension `n`.
pub type StateVector = DVector<f64>;
/// Input vector, dimension `m`.
pub type InputVector = DVector<f64>;
/// State-space matrix, `n x n` (dynamics `A`, value `Sm`, cost `Qm`).
pub type StateMatrix = DMatrix<f64>;
/// Input-space matrix, `m x m` (cost `Rm`, projector `P`).
pub type InputMatrix = DMatrix<f64>;
/// Input gain on state, `n x m` (dynamics `B`).
pub type InputGainMatrix = DMatrix<f64>;
/// Feedback matrix, `m x n` (gain `K`, cross cost `Pm`).
pub type FeedbackMatrix = DMatrix<f64>;

/// Desired (reference) trajectories consumed by tracking costs and carried
/// inside an MRT policy record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredTrajectory {
    pub times: Vec<f64>,
    pub states: Vec<StateVector>,
    pub inputs: Vec<InputVector>,
}

impl DesiredTrajectory {
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Observation the optimizer planned from: where the plant was when the
/// policy was computed.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub time: f64,
    pub state: StateVector,
    pub input: InputVector,
}
