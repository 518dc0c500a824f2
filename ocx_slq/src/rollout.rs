//! Forward rollout of the controlled system over one time partition.
//!
//! Time-triggered rollouts take the event times from the logic engine as
//! integration stops; at each stop the jump map is applied and a
//! past-the-end index is recorded, so the trajectory holds a pre-event and a
//! post-event sample sharing the event's time stamp. State-triggered
//! rollouts watch a guard surface and locate its zero crossing by bisection.
//!
//! A rollout whose final time coincides with an event time keeps the
//! terminal sample in the pre-event mode: the event is not consumed.

use nalgebra::DVector;

use ocx_core::cancel::CancelToken;
use ocx_core::controller::FeedbackController;
use ocx_core::error::{OcxError, OcxResult};
use ocx_core::integration::{AdaptiveIntegrator, OdeSystem};
use ocx_core::logic::LogicEngine;
use ocx_core::model::SwitchedDynamics;
use ocx_core::settings::SlqSettings;
use ocx_core::types::{InputVector, StateVector};

/// Relative margin separating an event stop from the rollout's final time.
const EVENT_TIME_MARGIN: f64 = 1e-12;

/// Result of a partition rollout.
#[derive(Debug, Clone, Default)]
pub struct RolloutOutput {
    pub times: Vec<f64>,
    /// For each consumed event, the index of the first post-event sample.
    pub event_past_end: Vec<usize>,
    pub states: Vec<StateVector>,
    pub inputs: Vec<InputVector>,
}

impl RolloutOutput {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn final_state(&self) -> &StateVector {
        self.states.last().expect("rollout produced no samples")
    }
}

/// State-triggered rollout result: the trajectory plus the discovered
/// switching structure.
#[derive(Debug, Clone, Default)]
pub struct StateTriggeredRollout {
    pub output: RolloutOutput,
    pub event_times: Vec<f64>,
    pub subsystems: Vec<usize>,
}

/// Closed-loop right-hand side: `dx/dt = f(mode, t, x, K(t) x + u_ff(t))`.
struct ClosedLoop<'a> {
    dynamics: &'a dyn SwitchedDynamics,
    controller: &'a FeedbackController,
    mode: usize,
}

impl OdeSystem for ClosedLoop<'_> {
    fn derivative(&mut self, t: f64, y: &DVector<f64>, dydt: &mut DVector<f64>) {
        let u = self.controller.compute_input(t, y);
        dydt.copy_from(&self.dynamics.flow(self.mode, t, y, &u));
    }
}

/// Forward integrator of controlled trajectories.
#[derive(Debug, Clone)]
pub struct RolloutEngine {
    integrator: AdaptiveIntegrator,
    /// Absolute tolerance for locating state-triggered crossings.
    event_time_tol: f64,
}

impl RolloutEngine {
    pub fn new(settings: &SlqSettings) -> Self {
        Self {
            integrator: AdaptiveIntegrator::new(settings.integrator_tol, settings.max_integrator_steps),
            event_time_tol: settings.integrator_tol.max(1e-12).sqrt() * 1e-3,
        }
    }

    /// Roll the system out over `[t0, tf]` under `controller`, consuming the
    /// time-triggered events the logic engine reports for `partition`.
    pub fn run_time_triggered(
        &self,
        dynamics: &dyn SwitchedDynamics,
        logic: &LogicEngine,
        partition: usize,
        t0: f64,
        x0: StateVector,
        tf: f64,
        controller: &FeedbackController,
        cancel: &CancelToken,
    ) -> OcxResult<RolloutOutput> {
        assert!(
            !controller.is_empty(),
            "time-triggered rollout requires a controller; cold starts sample operating trajectories instead"
        );
        // Interpolating the controller past its sampled range would silently
        // extrapolate the plan: that is a caller bug, not a numerical one.
        let ctrl_end = controller.end_time().expect("non-empty controller");
        assert!(
            ctrl_end >= tf - EVENT_TIME_MARGIN * tf.abs().max(1.0),
            "controller ends at {ctrl_end} but rollout requested up to {tf}"
        );

        let margin = EVENT_TIME_MARGIN * (tf - t0).abs().max(1.0);
        let mut out = RolloutOutput::default();
        let mut t = t0;
        let mut x = x0;

        // Events already behind t0 were consumed by an earlier partition; an
        // event exactly at the final time stays unconsumed (pre-event mode).
        let stops: Vec<f64> = logic
            .partition_events(partition)
            .iter()
            .copied()
            .filter(|&ev| ev >= t0 && ev < tf - margin)
            .collect();

        for &ev in &stops {
            if cancel.is_cancelled() {
                return Err(OcxError::Cancelled);
            }
            let mode = if ev > t {
                logic.active_subsystem_at(partition, 0.5 * (t + ev)).subsystem
            } else {
                // Event pinned to the leg start: the pre-event mode lives
                // just below the shared stamp.
                logic.schedule().mode_at(t - margin)
            };
            x = self.integrate_leg(dynamics, controller, mode, t, x, ev, &mut out)?;
            // Jump at the stop; the post-event sample opens the next leg.
            out.event_past_end.push(out.times.len());
            let next_mode = logic.active_subsystem_at(partition, ev).subsystem;
            x = dynamics.jump_map(mode, next_mode, ev, &x);
            t = ev;
        }

        if cancel.is_cancelled() {
            return Err(OcxError::Cancelled);
        }
        let mode = logic.active_subsystem_at(partition, 0.5 * (t + tf)).subsystem;
        self.integrate_leg(dynamics, controller, mode, t, x, tf, &mut out)?;
        Ok(out)
    }

    /// Roll out with state-triggered switching: the active subsystem's guard
    /// surface is watched and each zero crossing (positive to non-positive)
    /// is located to tolerance, recorded, and followed by the jump map into
    /// the next subsystem of `mode_sequence`.
    pub fn run_state_triggered(
        &self,
        dynamics: &dyn SwitchedDynamics,
        mode_sequence: &[usize],
        t0: f64,
        x0: StateVector,
        tf: f64,
        controller: &FeedbackController,
        cancel: &CancelToken,
    ) -> OcxResult<StateTriggeredRollout> {
        assert!(!mode_sequence.is_empty(), "state-triggered rollout needs a mode sequence");
        let mut result = StateTriggeredRollout::default();
        let mut mode_idx = 0usize;
        result.subsystems.push(mode_sequence[0]);
        let mut t = t0;
        let mut x = x0;

        while t < tf {
            if cancel.is_cancelled() {
                return Err(OcxError::Cancelled);
            }
            let mode = mode_sequence[mode_idx];
            let mut leg = RolloutOutput::default();
            self.integrate_leg(dynamics, controller, mode, t, x.clone(), tf, &mut leg)?;

            let last_mode = mode_idx + 1 >= mode_sequence.len();
            let crossing = if last_mode { None } else { self.first_crossing(dynamics, mode, &leg, t) };
            match crossing {
                None => {
                    append_leg(&mut result.output, leg);
                    break;
                }
                Some((lo_idx, hi_idx)) => {
                    let (t_event, x_event) = self.locate_crossing(
                        dynamics,
                        controller,
                        mode,
                        leg.times[lo_idx],
                        leg.states[lo_idx].clone(),
                        leg.times[hi_idx],
                    )?;
                    // Keep the samples up to the crossing bracket, then the
                    // located pre-event sample.
                    let mut head = truncate_leg(leg, lo_idx + 1);
                    head.times.push(t_event);
                    head.inputs.push(controller.compute_input(t_event, &x_event));
                    head.states.push(x_event.clone());
                    append_leg(&mut result.output, head);

                    result.output.event_past_end.push(result.output.times.len());
                    result.event_times.push(t_event);
                    let next = mode_sequence[mode_idx + 1];
                    result.subsystems.push(next);
                    x = dynamics.jump_map(mode, next, t_event, &x_event);
                    // Guard against re-triggering inside the location band.
                    t = t_event;
                    mode_idx += 1;
                    if tf - t <= self.event_time_tol {
                        result.output.times.push(t);
                        result.output.inputs.push(controller.compute_input(t, &x));
                        result.output.states.push(x.clone());
                        break;
                    }
                }
            }
        }
        Ok(result)
    }

    /// Integrate one event-free leg, appending samples to `out`.
    fn integrate_leg(
        &self,
        dynamics: &dyn SwitchedDynamics,
        controller: &FeedbackController,
        mode: usize,
        t0: f64,
        x0: StateVector,
        tf: f64,
        out: &mut RolloutOutput,
    ) -> OcxResult<StateVector> {
        let mut sys = ClosedLoop { dynamics, controller, mode };
        let times = &mut out.times;
        let states = &mut out.states;
        let inputs = &mut out.inputs;
        let x_final = self.integrator.integrate(&mut sys, t0, x0, tf, |t, x| {
            times.push(t);
            inputs.push(controller.compute_input(t, x));
            states.push(x.clone());
        })?;
        Ok(x_final)
    }

    /// First sample bracket on which the guard crosses from positive to
    /// non-positive, skipping the leg's initial sample band.
    fn first_crossing(
        &self,
        dynamics: &dyn SwitchedDynamics,
        mode: usize,
        leg: &RolloutOutput,
        leg_start: f64,
    ) -> Option<(usize, usize)> {
        let mut prev: Option<(usize, f64)> = None;
        for k in 0..leg.len() {
            let g = dynamics.guard(mode, leg.times[k], &leg.states[k]);
            if let Some((pk, pg)) = prev {
                if pg > 0.0 && g <= 0.0 && leg.times[k] > leg_start + self.event_time_tol {
                    return Some((pk, k));
                }
            }
            prev = Some((k, g));
        }
        None
    }

    /// Bisect the guard crossing inside `[t_lo, t_hi]`, starting each probe
    /// from the known pre-crossing state.
    fn locate_crossing(
        &self,
        dynamics: &dyn SwitchedDynamics,
        controller: &FeedbackController,
        mode: usize,
        t_lo: f64,
        x_lo: StateVector,
        t_hi: f64,
    ) -> OcxResult<(f64, StateVector)> {
        let mut sys = ClosedLoop { dynamics, controller, mode };
        let (mut lo, mut hi) = (t_lo, t_hi);
        while hi - lo > self.event_time_tol {
            let mid = 0.5 * (lo + hi);
            let x_mid = self.integrator.integrate(&mut sys, t_lo, x_lo.clone(), mid, |_, _| {})?;
            if dynamics.guard(mode, mid, &x_mid) <= 0.0 {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        let x_event = self.integrator.integrate(&mut sys, t_lo, x_lo, hi, |_, _| {})?;
        Ok((hi, x_event))
    }
}

/// Append a leg's samples. A leg that follows an event starts with the
/// post-jump sample, which intentionally shares its stamp with the pre-event
/// sample already in `out`.
fn append_leg(out: &mut RolloutOutput, leg: RolloutOutput) {
    out.times.extend(leg.times);
    out.states.extend(leg.states);
    out.inputs.extend(leg.inputs);
}

fn truncate_leg(mut leg: RolloutOutput, len: usize) -> RolloutOutput {
    leg.times.truncate(len);
    leg.states.truncate(len);
    leg.inputs.truncate(len);
    leg
}
