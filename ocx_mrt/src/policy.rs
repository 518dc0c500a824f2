//! The policy record exchanged between the optimizer and the tracking
//! controller.

use ocx_core::controller::FeedbackController;
use ocx_core::error::{OcxError, OcxResult};
use ocx_core::logic::ModeSchedule;
use ocx_core::types::{DesiredTrajectory, Observation, StateVector};

/// A complete plan: where it was computed from, what it tracks, the optimized
/// state plan and controllers, and the switching structure they assume.
///
/// All fields are swapped into the live buffer side as a group; readers never
/// observe a mixture of two policies.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub observation: Observation,
    pub desired: DesiredTrajectory,
    pub times: Vec<f64>,
    pub states: Vec<StateVector>,
    /// One controller per partition.
    pub controllers: Vec<FeedbackController>,
    pub mode_schedule: ModeSchedule,
    pub partition_times: Vec<f64>,
}

impl Policy {
    pub fn end_time(&self) -> Option<f64> {
        self.times.last().copied()
    }

    /// Structural checks run when the policy is staged, so `commit` cannot
    /// fail mid-swap.
    pub fn validate(&self) -> OcxResult<()> {
        if self.times.is_empty() || self.times.len() != self.states.len() {
            return Err(OcxError::config("policy needs matching time and state trajectories"));
        }
        if self.partition_times.len() < 2 {
            return Err(OcxError::config("policy needs at least one partition"));
        }
        if self.partition_times.windows(2).any(|w| w[0] >= w[1]) {
            return Err(OcxError::config("policy partition times are not strictly increasing"));
        }
        if self.controllers.len() + 1 != self.partition_times.len() {
            return Err(OcxError::config(format!(
                "policy has {} controllers for {} partitions",
                self.controllers.len(),
                self.partition_times.len() - 1
            )));
        }
        if self.controllers.iter().any(FeedbackController::is_empty) {
            return Err(OcxError::config("policy contains an empty controller"));
        }
        self.mode_schedule.validate()
    }
}
