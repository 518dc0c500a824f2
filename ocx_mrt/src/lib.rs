//! # OCX MRT
//!
//! Model-reference-tracking policy buffer: the double-buffered,
//! mutex-guarded hand-off between the optimizer thread (sole writer, via
//! [`MrtBuffer::stage`] / [`MrtBuffer::commit`]) and the real-time
//! controller thread (reader, via [`MrtBuffer::evaluate`] /
//! [`MrtBuffer::reroll`]).
//!
//! `commit` atomically promotes the staged policy to the live side, rebinds
//! the active-subsystem lookup when the switching structure changed, and is
//! the only place live fields mutate. Readers either hold the lock through
//! an entry point or see nothing at all; no field mixing across policies is
//! observable.

pub mod policy;

use std::sync::Mutex;

use tracing::{debug, warn};

use ocx_core::cancel::CancelToken;
use ocx_core::controller::FeedbackController;
use ocx_core::error::{OcxError, OcxResult};
use ocx_core::interpolation::interpolate;
use ocx_core::logic::{LogicEngine, ModeSchedule};
use ocx_core::model::SwitchedDynamics;
use ocx_core::settings::SlqSettings;
use ocx_core::types::{DesiredTrajectory, InputVector, StateVector};
use ocx_slq::rollout::RolloutEngine;

pub use policy::Policy;

/// Reference pair and active subsystem returned by a policy query.
#[derive(Debug, Clone)]
pub struct PolicyEvaluation {
    pub state_ref: StateVector,
    pub input_ref: InputVector,
    pub subsystem: usize,
}

struct RerollContext {
    engine: RolloutEngine,
    dynamics: Box<dyn SwitchedDynamics>,
}

struct Inner {
    live: Option<Policy>,
    staged: Option<Policy>,
    policy_received_ever: bool,
    new_policy_in_buffer: bool,
    policy_updated: bool,
    policy_updated_buffer: bool,
    logic_updated: bool,
    logic: LogicEngine,
    reroll: Option<RerollContext>,
}

/// Double-buffered policy exchange between optimizer and tracker.
pub struct MrtBuffer {
    inner: Mutex<Inner>,
}

impl Default for MrtBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MrtBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                live: None,
                staged: None,
                policy_received_ever: false,
                new_policy_in_buffer: false,
                policy_updated: false,
                policy_updated_buffer: false,
                logic_updated: false,
                logic: LogicEngine::default(),
                reroll: None,
            }),
        }
    }

    /// Forget both buffer sides and all flags. The reroll context survives.
    pub fn reset(&self) {
        let mut g = self.lock();
        g.live = None;
        g.staged = None;
        g.policy_received_ever = false;
        g.new_policy_in_buffer = false;
        g.policy_updated = false;
        g.policy_updated_buffer = false;
        g.logic_updated = false;
        g.logic = LogicEngine::default();
    }

    /// Install the dynamics [`reroll`](Self::reroll) integrates. Without it,
    /// only [`evaluate`](Self::evaluate) queries are available.
    pub fn init_rollout(&self, dynamics: Box<dyn SwitchedDynamics>, settings: &SlqSettings) {
        let mut g = self.lock();
        g.reroll = Some(RerollContext { engine: RolloutEngine::new(settings), dynamics });
    }

    /// Atomically write the staged side. The staged policy becomes visible to
    /// readers only after the next successful [`commit`](Self::commit).
    pub fn stage(&self, policy: Policy) -> OcxResult<()> {
        policy.validate()?;
        let mut g = self.lock();
        g.staged = Some(policy);
        g.new_policy_in_buffer = true;
        g.policy_updated_buffer = true;
        Ok(())
    }

    /// Promote the staged policy to the live side. Returns `false` when there
    /// is nothing new to promote; a second `commit` after a single `stage` is
    /// a no-op.
    pub fn commit(&self) -> bool {
        let mut g = self.lock();
        if !g.new_policy_in_buffer || !g.policy_updated_buffer {
            return false;
        }
        g.new_policy_in_buffer = false;
        g.policy_updated = true;

        let staged = g.staged.take().expect("staged policy present when flagged");
        let logic_updated = match &g.live {
            Some(live) => {
                live.mode_schedule != staged.mode_schedule
                    || live.partition_times != staged.partition_times
            }
            None => true,
        };
        // Group swap: every live field changes together under the lock.
        g.staged = g.live.replace(staged);
        g.policy_received_ever = true;
        g.logic_updated = logic_updated;

        if logic_updated {
            let live = g.live.as_ref().expect("live policy just installed");
            let schedule = live.mode_schedule.clone();
            let partition_times = live.partition_times.clone();
            g.logic
                .set_mode_schedule(schedule)
                .expect("staged policy was validated");
            g.logic
                .rebuild_for_partitions(&partition_times)
                .expect("staged policy was validated");
            debug!("mode schedule changed, active-subsystem lookup rebuilt");
        }
        true
    }

    /// Interpolate the live plan at `(t, x)`: reference state, the live
    /// controller's input, and the active subsystem. Queries past the end of
    /// the plan clamp with a warning.
    pub fn evaluate(&self, t: f64, x: &StateVector) -> OcxResult<PolicyEvaluation> {
        let g = self.lock();
        if !g.policy_received_ever {
            return Err(OcxError::NoPolicy);
        }
        let live = g.live.as_ref().expect("live policy after first commit");
        let end = live.end_time().expect("validated policy has samples");
        if t > end {
            warn!(time = t, plan_end = end, "query past the end of the live plan, clamping");
        }
        let t_query = t.min(end);
        let state_ref = interpolate(&live.times, &live.states, t_query);
        let partition = LogicEngine::partition_of(&live.partition_times, t_query);
        let input_ref = live.controllers[partition].compute_input(t_query, x);
        let subsystem = g.logic.active_subsystem_at(partition, t_query).subsystem;
        Ok(PolicyEvaluation { state_ref, input_ref, subsystem })
    }

    /// Short-horizon re-rollout: integrate the live controller over
    /// `[t, t + dt]` from `x` and return the endpoint. Requires
    /// [`init_rollout`](Self::init_rollout) and at least one committed
    /// policy.
    pub fn reroll(&self, t: f64, x: &StateVector, dt: f64) -> OcxResult<PolicyEvaluation> {
        // Clone what the integration needs and release the lock: a long
        // rollout must not stall `commit`.
        let (controllers, partition_times, logic, engine, dynamics, end) = {
            let g = self.lock();
            if !g.policy_received_ever || !g.policy_updated {
                return Err(OcxError::NoPolicy);
            }
            let ctx = g
                .reroll
                .as_ref()
                .ok_or_else(|| OcxError::config("reroll requires init_rollout"))?;
            let live = g.live.as_ref().expect("live policy after first commit");
            (
                live.controllers.clone(),
                live.partition_times.clone(),
                g.logic.clone(),
                ctx.engine.clone(),
                ctx.dynamics.clone(),
                live.end_time().expect("validated policy has samples"),
            )
        };

        if t + dt > end {
            warn!(time = t + dt, plan_end = end, "reroll past the end of the live plan, clamping");
        }
        let tf = (t + dt).min(end);
        let cancel = CancelToken::new();

        let mut time = t;
        let mut state = x.clone();
        let mut input: Option<InputVector> = None;
        while time < tf {
            // First partition whose end lies ahead of the current time, so a
            // leg that stops exactly on a boundary advances into the next
            // partition instead of spinning on a zero-length interval.
            let partition = partition_times
                .partition_point(|&pt| pt <= time)
                .saturating_sub(1)
                .min(controllers.len() - 1);
            let leg_end = partition_times[partition + 1].min(tf);
            let controller: &FeedbackController = &controllers[partition];
            let out = engine.run_time_triggered(
                dynamics.as_ref(),
                &logic,
                partition,
                time,
                state,
                leg_end,
                controller,
                &cancel,
            )?;
            state = out.final_state().clone();
            input = out.inputs.last().cloned();
            time = leg_end;
        }

        let input_ref = match input {
            Some(u) => u,
            // Zero-length horizon: evaluate the controller in place.
            None => {
                let partition = LogicEngine::partition_of(&partition_times, t)
                    .min(controllers.len() - 1);
                controllers[partition].compute_input(t, &state)
            }
        };
        let partition = LogicEngine::partition_of(&partition_times, tf).min(controllers.len() - 1);
        let subsystem = logic.active_subsystem_at(partition, tf).subsystem;
        Ok(PolicyEvaluation { state_ref: state, input_ref, subsystem })
    }

    /// Mode schedule of the live policy.
    pub fn active_mode_schedule(&self) -> OcxResult<ModeSchedule> {
        let g = self.lock();
        match &g.live {
            Some(live) => Ok(live.mode_schedule.clone()),
            None => Err(OcxError::NoPolicy),
        }
    }

    /// Desired-cost trajectory of the live policy.
    pub fn desired_trajectory(&self) -> OcxResult<DesiredTrajectory> {
        let g = self.lock();
        match &g.live {
            Some(live) => Ok(live.desired.clone()),
            None => Err(OcxError::NoPolicy),
        }
    }

    /// True once any policy has been committed.
    pub fn policy_received(&self) -> bool {
        self.lock().policy_received_ever
    }

    /// True when the latest commit changed the switching structure.
    pub fn logic_updated(&self) -> bool {
        self.lock().logic_updated
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
