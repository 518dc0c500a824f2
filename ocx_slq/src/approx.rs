//! Linear-quadratic approximation of the optimal control problem along a
//! rollout, with state-input constraint projection.
//!
//! Nodes are processed in increasing time. Each node carries the dynamics
//! expansion, the cost quadratization, the raw constraint triple, the
//! pseudo-inverse projections, and the constrained quantities consumed by
//! the Riccati sweep and the controller update. The projected state cost is
//! pushed onto the PSD cone by eigenvalue flooring.

use nalgebra::{DMatrix, DVector};

use ocx_core::error::{OcxError, OcxResult};
use ocx_core::logic::LogicEngine;
use ocx_core::matrix::{all_finite, project_psd, pseudo_inverse};
use ocx_core::model::{OcProblem, StateCostExpansion};
use ocx_core::settings::SlqSettings;
use ocx_core::types::{
    FeedbackMatrix, InputGainMatrix, InputMatrix, InputVector, StateMatrix, StateVector,
};

use crate::rollout::RolloutOutput;

/// LQ data at one rollout node.
#[derive(Debug, Clone)]
pub struct LqNode {
    pub am: StateMatrix,
    pub bm: InputGainMatrix,

    pub q: f64,
    pub qv: StateVector,
    pub qm: StateMatrix,
    pub pm: FeedbackMatrix,
    pub rv: InputVector,
    pub rm: InputMatrix,
    pub rm_inv: InputMatrix,

    /// Active type-1 constraint rows at this node.
    pub num_constraints: usize,
    /// `D† e`, `D† C`, `D† D` (zero when unconstrained).
    pub ev_projected: InputVector,
    pub cm_projected: FeedbackMatrix,
    pub dm_projected: InputMatrix,

    /// Constrained quantities feeding C4/C5.
    pub am_c: StateMatrix,
    pub qm_c: StateMatrix,
    pub qv_c: StateVector,
    pub bm_c: InputGainMatrix,
    pub pm_c: FeedbackMatrix,
    pub rv_c: InputVector,
}

/// Additive value jump charged when the backward sweep crosses an event.
#[derive(Debug, Clone)]
pub struct EventLq {
    pub q: f64,
    pub qv: StateVector,
    pub qm: StateMatrix,
}

/// LQ tables for one partition.
#[derive(Debug, Clone, Default)]
pub struct PartitionLq {
    pub times: Vec<f64>,
    pub event_past_end: Vec<usize>,
    pub nodes: Vec<LqNode>,
    /// One entry per consumed event, aligned with `event_past_end`.
    pub events: Vec<EventLq>,
}

impl PartitionLq {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Quadratize dynamics, cost, and constraints at every node of a partition
/// rollout and project the state-input constraints onto the input space.
pub fn approximate_partition(
    problem: &OcProblem,
    logic: &LogicEngine,
    partition: usize,
    rollout: &RolloutOutput,
    settings: &SlqSettings,
) -> OcxResult<PartitionLq> {
    let n = problem.state_dim();
    let m = problem.input_dim();
    let mut lq = PartitionLq {
        times: rollout.times.clone(),
        event_past_end: rollout.event_past_end.clone(),
        nodes: Vec::with_capacity(rollout.len()),
        events: Vec::with_capacity(rollout.event_past_end.len()),
    };

    let modes = node_modes(logic, partition, rollout);
    for k in 0..rollout.len() {
        let (t, x, u) = (rollout.times[k], &rollout.states[k], &rollout.inputs[k]);
        let node = approximate_node(problem, modes[k], t, x, u, n, m, settings)?;
        lq.nodes.push(node);
    }

    // Event quadratics are evaluated at the pre-event sample.
    for &past_end in &rollout.event_past_end {
        let k = past_end - 1;
        let (t, x) = (rollout.times[k], &rollout.states[k]);
        let mode = modes[k];
        let mut jump = problem.cost.event_expansion(mode, t, x);
        let sc = problem.constraint.state_only(mode, t, x);
        if sc.num_active > 0 {
            add_penalty(&mut jump, &sc.f, &sc.h, settings.state_constraint_penalty);
        }
        lq.events.push(EventLq { q: jump.q, qv: jump.qv, qm: jump.qm });
    }

    Ok(lq)
}

/// Terminal quadratic at the horizon end: terminal cost plus the quadratic
/// penalty on the terminal state-only constraint.
pub fn terminal_quadratic(
    problem: &OcProblem,
    mode: usize,
    t: f64,
    x: &StateVector,
    settings: &SlqSettings,
) -> StateCostExpansion {
    let mut terminal = problem.cost.terminal_expansion(mode, t, x);
    let tc = problem.constraint.terminal(mode, t, x);
    if tc.num_active > 0 {
        add_penalty(&mut terminal, &tc.f, &tc.h, settings.state_constraint_penalty);
    }
    terminal
}

/// Subsystem per node, constant across each event-free leg. Pre-event nodes
/// keep the pre-event mode even though they share the event's time stamp.
pub fn node_modes(logic: &LogicEngine, partition: usize, rollout: &RolloutOutput) -> Vec<usize> {
    let mut modes = vec![0usize; rollout.len()];
    let mut start = 0usize;
    let mut bounds: Vec<usize> = rollout.event_past_end.clone();
    bounds.push(rollout.len());
    for end in bounds {
        if end > start {
            let (ts, te) = (rollout.times[start], rollout.times[end - 1]);
            let mode = if te > ts {
                logic.active_subsystem_at(partition, 0.5 * (ts + te)).subsystem
            } else {
                // A zero-length leg is a pre-event sample pinned to the
                // event's stamp; probe just below it to stay in the earlier
                // mode.
                logic.schedule().mode_at(ts - 1e-9 * ts.abs().max(1.0))
            };
            modes[start..end].iter_mut().for_each(|m| *m = mode);
        }
        start = end;
    }
    modes
}

#[allow(clippy::too_many_arguments)]
fn approximate_node(
    problem: &OcProblem,
    mode: usize,
    t: f64,
    x: &StateVector,
    u: &InputVector,
    n: usize,
    m: usize,
    settings: &SlqSettings,
) -> OcxResult<LqNode> {
    let dyn_exp = problem.dynamics.linearize(mode, t, x, u);
    let cost_exp = problem.cost.stage_expansion(mode, t, x, u);
    let con = problem.constraint.state_input(mode, t, x, u);

    let rm_inv = cost_exp
        .rm
        .clone()
        .cholesky()
        .map(|chol| chol.inverse())
        .ok_or(OcxError::IllConditionedInputCost { time: t })?;

    let mut node = LqNode {
        am: dyn_exp.a,
        bm: dyn_exp.b,
        q: cost_exp.q,
        qv: cost_exp.qv,
        qm: cost_exp.qm,
        pm: cost_exp.pm,
        rv: cost_exp.rv,
        rm: cost_exp.rm,
        rm_inv,
        num_constraints: con.num_active,
        ev_projected: DVector::zeros(m),
        cm_projected: DMatrix::zeros(m, n),
        dm_projected: DMatrix::zeros(m, m),
        am_c: DMatrix::zeros(n, n),
        qm_c: DMatrix::zeros(n, n),
        qv_c: DVector::zeros(n),
        bm_c: DMatrix::zeros(n, m),
        pm_c: DMatrix::zeros(m, n),
        rv_c: DVector::zeros(m),
    };

    if con.num_active == 0 {
        node.am_c = node.am.clone();
        node.qm_c = node.qm.clone();
        node.qv_c = node.qv.clone();
        node.bm_c = node.bm.clone();
        node.pm_c = node.pm.clone();
        node.rv_c = node.rv.clone();
    } else {
        let pinv = pseudo_inverse(&con.d, settings.rank_tolerance);
        let dm_dagger = pinv.pinv;
        node.ev_projected = &dm_dagger * &con.e;
        node.cm_projected = &dm_dagger * &con.c;
        node.dm_projected = &dm_dagger * &con.d;
        let null_proj = DMatrix::identity(m, m) - &node.dm_projected;

        node.am_c = &node.am - &node.bm * &node.cm_projected;
        let pm_t_cm = node.pm.transpose() * &node.cm_projected;
        node.qm_c = &node.qm - &pm_t_cm - pm_t_cm.transpose()
            + node.cm_projected.transpose() * &node.rm * &node.cm_projected;
        node.qv_c = &node.qv - node.cm_projected.transpose() * &node.rv;
        node.bm_c = &node.bm * &null_proj;
        node.pm_c = null_proj.transpose() * &node.pm;
        node.rv_c = null_proj.transpose() * &node.rv;
    }

    project_psd(&mut node.qm_c, settings.psd_eigenvalue_floor);
    if !all_finite(&node.am_c) || !all_finite(&node.qm_c) {
        return Err(OcxError::NonFinite { what: "LQ approximation", time: t });
    }
    Ok(node)
}

fn add_penalty(exp: &mut StateCostExpansion, f: &DMatrix<f64>, h: &DVector<f64>, weight: f64) {
    exp.q += 0.5 * weight * h.dot(h);
    exp.qv += weight * (f.transpose() * h);
    exp.qm += weight * (f.transpose() * f);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocx_core::model::{
        CostExpansion, DynamicsExpansion, NoConstraint, StateInputConstraint, SwitchedConstraint,
        SwitchedCost, SwitchedDynamics,
    };
    use ocx_core::quadratic::StaticOperatingPoint;

    #[derive(Clone)]
    struct Double;

    impl SwitchedDynamics for Double {
        fn state_dim(&self) -> usize {
            2
        }
        fn input_dim(&self) -> usize {
            1
        }
        fn flow(&self, _m: usize, _t: f64, x: &StateVector, u: &InputVector) -> StateVector {
            DVector::from_vec(vec![x[1], u[0]])
        }
        fn linearize(&self, _m: usize, _t: f64, _x: &StateVector, _u: &InputVector) -> DynamicsExpansion {
            DynamicsExpansion {
                a: DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 0.0]),
                b: DMatrix::from_row_slice(2, 1, &[0.0, 1.0]),
            }
        }
        fn clone_dynamics(&self) -> Box<dyn SwitchedDynamics> {
            Box::new(self.clone())
        }
    }

    #[derive(Clone)]
    struct UnitCost;

    impl SwitchedCost for UnitCost {
        fn stage_cost(&self, _m: usize, _t: f64, x: &StateVector, u: &InputVector) -> f64 {
            0.5 * (x.dot(x) + u.dot(u))
        }
        fn stage_expansion(&self, _m: usize, _t: f64, x: &StateVector, u: &InputVector) -> CostExpansion {
            CostExpansion {
                q: self.stage_cost(0, 0.0, x, u),
                qv: x.clone(),
                qm: DMatrix::identity(2, 2),
                pm: DMatrix::zeros(1, 2),
                rv: u.clone(),
                rm: DMatrix::identity(1, 1),
            }
        }
        fn terminal_cost(&self, _m: usize, _t: f64, _x: &StateVector) -> f64 {
            0.0
        }
        fn terminal_expansion(&self, _m: usize, _t: f64, x: &StateVector) -> StateCostExpansion {
            StateCostExpansion::zeros(x.len())
        }
        fn clone_cost(&self) -> Box<dyn SwitchedCost> {
            Box::new(self.clone())
        }
    }

    /// `u + x_1 = 0` everywhere.
    #[derive(Clone)]
    struct TieInput;

    impl SwitchedConstraint for TieInput {
        fn state_input(&self, _m: usize, _t: f64, x: &StateVector, u: &InputVector) -> StateInputConstraint {
            StateInputConstraint {
                num_active: 1,
                c: DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
                d: DMatrix::from_row_slice(1, 1, &[1.0]),
                e: DVector::from_vec(vec![x[0] + u[0]]),
            }
        }
        fn clone_constraint(&self) -> Box<dyn SwitchedConstraint> {
            Box::new(self.clone())
        }
    }

    fn problem(constrained: bool) -> OcProblem {
        OcProblem {
            dynamics: Box::new(Double),
            cost: Box::new(UnitCost),
            constraint: if constrained { Box::new(TieInput) } else { Box::new(NoConstraint) },
            operating: Some(Box::new(StaticOperatingPoint::origin(2, 1))),
        }
    }

    fn single_node_rollout() -> RolloutOutput {
        RolloutOutput {
            times: vec![0.0],
            event_past_end: vec![],
            states: vec![DVector::from_vec(vec![2.0, 0.5])],
            inputs: vec![DVector::from_vec(vec![-1.0])],
        }
    }

    fn engine() -> LogicEngine {
        let mut e = LogicEngine::new(ocx_core::ModeSchedule::single(0)).unwrap();
        e.rebuild_for_partitions(&[0.0, 1.0]).unwrap();
        e
    }

    #[test]
    fn unconstrained_node_copies_raw_tables() {
        let lq = approximate_partition(
            &problem(false),
            &engine(),
            0,
            &single_node_rollout(),
            &SlqSettings::default(),
        )
        .unwrap();
        let node = &lq.nodes[0];
        assert_eq!(node.num_constraints, 0);
        assert_eq!(node.am_c, node.am);
        assert_eq!(node.qm_c, node.qm);
        assert_eq!(node.bm_c, node.bm);
    }

    #[test]
    fn projection_identities_hold() {
        let lq = approximate_partition(
            &problem(true),
            &engine(),
            0,
            &single_node_rollout(),
            &SlqSettings::default(),
        )
        .unwrap();
        let node = &lq.nodes[0];
        assert_eq!(node.num_constraints, 1);
        // D = [1] makes D†D = I, so the null projector annihilates B and Rv.
        assert!(node.bm_c.iter().all(|v| v.abs() < 1e-12));
        assert!(node.rv_c.iter().all(|v| v.abs() < 1e-12));
        // Projector idempotence: (D†D)(D†D) = D†D.
        let dp = &node.dm_projected;
        assert!((dp * dp - dp).iter().all(|v| v.abs() < 1e-12));
        // e carries the residual at the nominal pair: 2.0 + (-1.0).
        assert!((node.ev_projected[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn terminal_penalty_augments_quadratic() {
        #[derive(Clone)]
        struct PinOrigin;
        impl SwitchedConstraint for PinOrigin {
            fn terminal(&self, _m: usize, _t: f64, x: &StateVector) -> ocx_core::model::StateConstraint {
                ocx_core::model::StateConstraint {
                    num_active: 1,
                    f: DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
                    h: DVector::from_vec(vec![x[0]]),
                }
            }
            fn clone_constraint(&self) -> Box<dyn SwitchedConstraint> {
                Box::new(self.clone())
            }
        }
        let mut p = problem(false);
        p.constraint = Box::new(PinOrigin);
        let settings = SlqSettings { state_constraint_penalty: 10.0, ..Default::default() };
        let x = DVector::from_vec(vec![3.0, 0.0]);
        let term = terminal_quadratic(&p, 0, 1.0, &x, &settings);
        assert!((term.q - 45.0).abs() < 1e-12);
        assert!((term.qv[0] - 30.0).abs() < 1e-12);
        assert!((term.qm[(0, 0)] - 10.0).abs() < 1e-12);
    }
}
