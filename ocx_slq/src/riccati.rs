//! Backward integration of the Riccati-family equations over one
//! partition.
//!
//! Four coupled quantities: the symmetric value Hessian `Sm`, the value
//! gradient `Sv`, the value scalar `s`, and the type-1 error correction
//! `Sve`. In factored form with `Lm = Rm⁻¹(Pmᶜ + BᶜᵀSm)` and
//! `Lv = Rm⁻¹(Rvᶜ + BᶜᵀSv)`:
//!
//! ```text
//! -dSm/dt  = Qᶜ + AᶜᵀSm + SmAᶜ - Lmᵀ Rm Lm
//! -dSv/dt  = Qvᶜ + AᶜᵀSv - Lmᵀ Rm Lv
//! -ds/dt   = q - 0.5 Lvᵀ Rm Lv
//! -dSve/dt = (Aᶜ - BᶜLm)ᵀ Sve + Sm B D†e
//! ```
//!
//! Integration runs node-to-node in decreasing time on a forward variable;
//! with normalized time enabled the variable spans `[0, 1]` per inter-node
//! interval and the right-hand side is scaled by the interval length. At an
//! event the quadratics of the event cost are added to `(Sm, Sv, s)` and
//! `Sve` resets to zero. `Sm` is re-symmetrized at every stored node.

use nalgebra::{DMatrix, DVector};

use ocx_core::cancel::CancelToken;
use ocx_core::error::{OcxError, OcxResult};
use ocx_core::integration::{AdaptiveIntegrator, OdeSystem};
use ocx_core::interpolation::Lerp;
use ocx_core::matrix::{all_finite, symmetrize};
use ocx_core::model::StateCostExpansion;
use ocx_core::settings::SlqSettings;
use ocx_core::types::{StateMatrix, StateVector};

use crate::approx::{LqNode, PartitionLq};

/// Value-function data at one node.
#[derive(Debug, Clone)]
pub struct ValueNode {
    pub sm: StateMatrix,
    pub sv: StateVector,
    pub s: f64,
    pub sve: StateVector,
}

impl ValueNode {
    pub fn zeros(state_dim: usize) -> Self {
        Self {
            sm: DMatrix::zeros(state_dim, state_dim),
            sv: DVector::zeros(state_dim),
            s: 0.0,
            sve: DVector::zeros(state_dim),
        }
    }

    /// Terminal boundary from a state-only quadratic; `Sve` starts at zero.
    pub fn from_quadratic(quad: &StateCostExpansion) -> Self {
        let n = quad.qv.len();
        Self { sm: quad.qm.clone(), sv: quad.qv.clone(), s: quad.q, sve: DVector::zeros(n) }
    }

    pub fn is_finite(&self) -> bool {
        all_finite(&self.sm)
            && self.sv.iter().all(|v| v.is_finite())
            && self.s.is_finite()
            && self.sve.iter().all(|v| v.is_finite())
    }
}

/// Value trajectory over one partition, aligned with the LQ node times.
#[derive(Debug, Clone, Default)]
pub struct PartitionValue {
    pub times: Vec<f64>,
    pub nodes: Vec<ValueNode>,
}

impl PartitionValue {
    /// Value at the partition start: the boundary handed to the preceding
    /// partition by the stitching rule.
    pub fn initial(&self) -> &ValueNode {
        self.nodes.first().expect("empty value trajectory")
    }
}

/// Backward Riccati integrator.
#[derive(Debug, Clone)]
pub struct RiccatiSweep {
    integrator: AdaptiveIntegrator,
    normalized_time: bool,
}

impl RiccatiSweep {
    pub fn new(settings: &SlqSettings) -> Self {
        Self {
            integrator: AdaptiveIntegrator::new(settings.riccati_tol, settings.max_integrator_steps),
            normalized_time: settings.use_normalized_time,
        }
    }

    /// Integrate the value equations backward over one partition from the
    /// given terminal boundary.
    pub fn solve_partition(
        &self,
        lq: &PartitionLq,
        terminal: ValueNode,
        cancel: &CancelToken,
    ) -> OcxResult<PartitionValue> {
        let count = lq.len();
        assert!(count > 0, "Riccati sweep over an empty partition");
        let n = terminal.sv.len();

        let mut current = terminal;
        symmetrize(&mut current.sm);
        let mut nodes = vec![ValueNode::zeros(n); count];
        nodes[count - 1] = current.clone();

        for k in (0..count.saturating_sub(1)).rev() {
            if cancel.is_cancelled() {
                return Err(OcxError::Cancelled);
            }
            let (t_lo, t_hi) = (lq.times[k], lq.times[k + 1]);

            if let Some(event_idx) = lq.event_past_end.iter().position(|&pe| pe == k + 1) {
                // Node k is the pre-event sample: apply the value jump.
                let jump = &lq.events[event_idx];
                current.sm += &jump.qm;
                current.sv += &jump.qv;
                current.s += jump.q;
                current.sve.fill(0.0);
            } else if t_hi > t_lo {
                current = self.integrate_interval(&lq.nodes[k], &lq.nodes[k + 1], t_lo, t_hi, current)?;
            }

            symmetrize(&mut current.sm);
            if !current.is_finite() {
                return Err(OcxError::NonFinite { what: "Riccati state", time: t_lo });
            }
            nodes[k] = current.clone();
        }

        Ok(PartitionValue { times: lq.times.clone(), nodes })
    }

    fn integrate_interval(
        &self,
        lo: &LqNode,
        hi: &LqNode,
        t_lo: f64,
        t_hi: f64,
        start: ValueNode,
    ) -> OcxResult<ValueNode> {
        let n = start.sv.len();
        let span = t_hi - t_lo;
        // Forward variable z with t = t_hi - z * scale; normalized time maps
        // the interval onto [0, 1] and scales the right-hand side instead.
        let (z_end, scale) = if self.normalized_time { (1.0, span) } else { (span, 1.0) };
        let mut ode = RiccatiOde { lo, hi, t_lo, t_hi, scale, n };
        let y0 = flatten(&start, n);
        let y = self.integrator.integrate(&mut ode, 0.0, y0, z_end, |_, _| {})?;
        Ok(unflatten(&y, n))
    }
}

/// Right-hand side on one inter-node interval; LQ data is linearly
/// interpolated between the bracketing nodes.
struct RiccatiOde<'a> {
    lo: &'a LqNode,
    hi: &'a LqNode,
    t_lo: f64,
    t_hi: f64,
    scale: f64,
    n: usize,
}

impl RiccatiOde<'_> {
    fn alpha_at(&self, z: f64) -> f64 {
        let t = self.t_hi - z * self.scale;
        ((t - self.t_lo) / (self.t_hi - self.t_lo)).clamp(0.0, 1.0)
    }
}

impl OdeSystem for RiccatiOde<'_> {
    fn derivative(&mut self, z: f64, y: &DVector<f64>, dydz: &mut DVector<f64>) {
        let alpha = self.alpha_at(z);
        let lerp = |a: &DMatrix<f64>, b: &DMatrix<f64>| DMatrix::lerp(a, b, alpha);
        let lerp_v = |a: &DVector<f64>, b: &DVector<f64>| DVector::lerp(a, b, alpha);

        let am_c = lerp(&self.lo.am_c, &self.hi.am_c);
        let bm_c = lerp(&self.lo.bm_c, &self.hi.bm_c);
        let qm_c = lerp(&self.lo.qm_c, &self.hi.qm_c);
        let qv_c = lerp_v(&self.lo.qv_c, &self.hi.qv_c);
        let pm_c = lerp(&self.lo.pm_c, &self.hi.pm_c);
        let rv_c = lerp_v(&self.lo.rv_c, &self.hi.rv_c);
        let rm = lerp(&self.lo.rm, &self.hi.rm);
        let rm_inv = lerp(&self.lo.rm_inv, &self.hi.rm_inv);
        let q = <f64 as Lerp>::lerp(&self.lo.q, &self.hi.q, alpha);
        let forcing = lerp(&self.lo.bm, &self.hi.bm)
            * lerp_v(&self.lo.ev_projected, &self.hi.ev_projected);

        let value = unflatten(y, self.n);
        let mut sm = value.sm;
        symmetrize(&mut sm);

        let lm = &rm_inv * (&pm_c + bm_c.transpose() * &sm);
        let lv = &rm_inv * (&rv_c + bm_c.transpose() * &value.sv);
        let lm_t_rm = lm.transpose() * &rm;

        // Backward derivatives; the forward variable flips the sign, the
        // (normalized-time) interval length scales the coefficients.
        let dsm = (&qm_c + am_c.transpose() * &sm + &sm * &am_c - &lm_t_rm * &lm) * self.scale;
        let dsv = (&qv_c + am_c.transpose() * &value.sv - &lm_t_rm * &lv) * self.scale;
        let ds = (q - 0.5 * lv.dot(&(&rm * &lv))) * self.scale;
        let closed_loop = &am_c - &bm_c * &lm;
        let dsve = (closed_loop.transpose() * &value.sve + &sm * &forcing) * self.scale;

        pack(dydz, &dsm, &dsv, ds, &dsve, self.n);
    }
}

fn flatten(v: &ValueNode, n: usize) -> DVector<f64> {
    let mut y = DVector::zeros(n * n + 2 * n + 1);
    pack(&mut y, &v.sm, &v.sv, v.s, &v.sve, n);
    y
}

fn pack(y: &mut DVector<f64>, sm: &StateMatrix, sv: &StateVector, s: f64, sve: &StateVector, n: usize) {
    let mut idx = 0;
    for i in 0..n {
        for j in 0..n {
            y[idx] = sm[(i, j)];
            idx += 1;
        }
    }
    for i in 0..n {
        y[idx] = sv[i];
        idx += 1;
    }
    y[idx] = s;
    idx += 1;
    for i in 0..n {
        y[idx] = sve[i];
        idx += 1;
    }
}

fn unflatten(y: &DVector<f64>, n: usize) -> ValueNode {
    let mut v = ValueNode::zeros(n);
    let mut idx = 0;
    for i in 0..n {
        for j in 0..n {
            v.sm[(i, j)] = y[idx];
            idx += 1;
        }
    }
    for i in 0..n {
        v.sv[i] = y[idx];
        idx += 1;
    }
    v.s = y[idx];
    idx += 1;
    for i in 0..n {
        v.sve[i] = y[idx];
        idx += 1;
    }
    v
}
