//! # OCX SLQ
//!
//! Sequential linear-quadratic trajectory optimizer for switched nonlinear
//! systems with state-input equality constraints.
//!
//! One iteration: forward rollout of the controlled dynamics with event
//! handling, linear-quadratic approximation along the rollout with
//! constraint projection, backward Riccati sweep over each time partition
//! with boundary stitching, controller synthesis, and a backtracking line
//! search on the feedforward increment. Partition-level work and line-search
//! candidates run on a dedicated worker pool when configured.

pub mod approx;
pub mod driver;
pub mod evaluation;
pub mod riccati;
pub mod rollout;
pub mod synthesis;

pub use driver::{IterationRecord, Slq, SolveOutcome, TerminationFlags};
pub use rollout::{RolloutEngine, RolloutOutput};
