//! Controller synthesis from the LQ solution and constraint projection.
//!
//! Per node:
//!
//! ```text
//! Lm   = -Rm⁻¹ (Pm + BᵀSm)
//! K    = (I - D†D) Lm - D†C
//! u_ff = u_nom - K x_nom + η (Lve - D†e),   Lve = -Rm⁻¹ BᶜᵀSve
//! Δu_ff = -Rm⁻¹ (Rvᶜ + BᶜᵀSv)
//! ```
//!
//! The null projector multiplies the gain from the left so its range stays
//! inside the admissible input subspace; `D†C` re-injects the particular
//! solution of the constraint.

use nalgebra::DMatrix;

use ocx_core::controller::FeedbackController;
use ocx_core::types::{InputVector, StateVector};

use crate::approx::PartitionLq;
use crate::riccati::PartitionValue;

/// Build the partition's updated controller around the nominal trajectory.
///
/// `eta` is the type-1 constraint step size in `(0, 1]`.
pub fn synthesize_controller(
    lq: &PartitionLq,
    value: &PartitionValue,
    nominal_states: &[StateVector],
    nominal_inputs: &[InputVector],
    eta: f64,
) -> FeedbackController {
    debug_assert_eq!(lq.len(), value.nodes.len());
    debug_assert_eq!(lq.len(), nominal_states.len());
    let count = lq.len();
    let mut controller = FeedbackController::new();
    controller.times = lq.times.clone();
    controller.gains.reserve(count);
    controller.feedforward.reserve(count);
    controller.feedforward_delta.reserve(count);

    for k in 0..count {
        let node = &lq.nodes[k];
        let v = &value.nodes[k];
        let m = node.rm.nrows();

        let lm = -(&node.rm_inv) * (&node.pm + node.bm.transpose() * &v.sm);
        let gain = if node.num_constraints > 0 {
            (DMatrix::identity(m, m) - &node.dm_projected) * lm - &node.cm_projected
        } else {
            lm
        };

        let lv = -(&node.rm_inv) * (&node.rv_c + node.bm_c.transpose() * &v.sv);
        let lve = -(&node.rm_inv) * (node.bm_c.transpose() * &v.sve);

        let mut uff = nominal_inputs[k].clone();
        uff -= &gain * &nominal_states[k];
        uff += (lve - &node.ev_projected) * eta;

        controller.gains.push(gain);
        controller.feedforward.push(uff);
        controller.feedforward_delta.push(lv);
    }
    controller
}
