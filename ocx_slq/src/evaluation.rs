//! Cost and constraint evaluation along a rollout.
//!
//! Stage cost integrates by the trapezoid rule over each event-free leg;
//! event costs are charged at the pre-event sample. Constraint residuals are
//! reduced to integral-square-error (ISE) and max-norm figures, the
//! convergence metrics for constraint satisfaction.

use ocx_core::logic::LogicEngine;
use ocx_core::model::OcProblem;

use crate::approx::node_modes;
use crate::rollout::RolloutOutput;

/// Per-partition evaluation of a rollout.
#[derive(Debug, Clone, Default)]
pub struct PartitionEvaluation {
    /// Stage-cost integral plus event costs.
    pub cost: f64,
    /// Squared type-1 residual norm per node.
    pub c1_sq: Vec<f64>,
    /// Squared type-2 residual norm per node.
    pub c2_sq: Vec<f64>,
    pub c1_max_norm: f64,
    pub c2_max_norm: f64,
}

/// Evaluate cost and constraint residuals over one partition rollout.
pub fn evaluate_partition(
    problem: &OcProblem,
    logic: &LogicEngine,
    partition: usize,
    rollout: &RolloutOutput,
) -> PartitionEvaluation {
    let modes = node_modes(logic, partition, rollout);
    let len = rollout.len();
    let mut eval = PartitionEvaluation {
        c1_sq: Vec::with_capacity(len),
        c2_sq: Vec::with_capacity(len),
        ..Default::default()
    };

    let mut stage = Vec::with_capacity(len);
    for k in 0..len {
        let (t, x, u) = (rollout.times[k], &rollout.states[k], &rollout.inputs[k]);
        stage.push(problem.cost.stage_cost(modes[k], t, x, u));

        let c1 = problem.constraint.state_input(modes[k], t, x, u);
        let sq = if c1.num_active > 0 { c1.e.norm_squared() } else { 0.0 };
        eval.c1_max_norm = eval.c1_max_norm.max(sq.sqrt());
        eval.c1_sq.push(sq);

        let c2 = problem.constraint.state_only(modes[k], t, x);
        let sq = if c2.num_active > 0 { c2.h.norm_squared() } else { 0.0 };
        eval.c2_max_norm = eval.c2_max_norm.max(sq.sqrt());
        eval.c2_sq.push(sq);
    }

    eval.cost = trapezoid(&rollout.times, &stage);
    for &past_end in &rollout.event_past_end {
        let k = past_end - 1;
        eval.cost += problem.cost.event_cost(modes[k], rollout.times[k], &rollout.states[k]);
    }
    eval
}

/// Integral of a sampled non-negative quantity by the trapezoid rule.
/// Zero-length intervals (event stamps) contribute nothing.
pub fn trapezoid(times: &[f64], values: &[f64]) -> f64 {
    debug_assert_eq!(times.len(), values.len());
    times
        .windows(2)
        .zip(values.windows(2))
        .map(|(tw, vw)| 0.5 * (tw[1] - tw[0]) * (vw[0] + vw[1]))
        .sum()
}

/// ISE of a squared-residual trajectory.
pub fn ise(times: &[f64], sq: &[f64]) -> f64 {
    trapezoid(times, sq)
}
