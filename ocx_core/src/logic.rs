//! Hybrid logic engine: mode sequence, event times, and the per-partition
//! active-subsystem lookup.
//!
//! The engine is an owned object passed by reference to whoever needs it
//! (rollout, LQ approximation, MRT); there is no process-wide logic state.
//! An event time belongs to the mode that starts at it.

use tracing::warn;

use crate::error::{OcxError, OcxResult};

/// Ordered subsystem identifiers and the strictly increasing event times
/// separating them. `event_times.len() == modes.len() - 1`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModeSchedule {
    pub modes: Vec<usize>,
    pub event_times: Vec<f64>,
}

impl ModeSchedule {
    /// Single-mode schedule with no events.
    pub fn single(mode: usize) -> Self {
        Self { modes: vec![mode], event_times: Vec::new() }
    }

    pub fn new(modes: Vec<usize>, event_times: Vec<f64>) -> Self {
        Self { modes, event_times }
    }

    pub fn validate(&self) -> OcxResult<()> {
        if self.modes.is_empty() {
            return Err(OcxError::config("mode schedule has no modes"));
        }
        if self.event_times.len() + 1 != self.modes.len() {
            return Err(OcxError::config(format!(
                "mode schedule needs {} event times for {} modes, got {}",
                self.modes.len() - 1,
                self.modes.len(),
                self.event_times.len()
            )));
        }
        if self.event_times.windows(2).any(|w| w[0] >= w[1]) {
            return Err(OcxError::config("event times are not strictly increasing"));
        }
        Ok(())
    }

    /// Index into `modes` of the mode active at `t`.
    ///
    /// Equality with an event time selects the later mode.
    pub fn mode_index_at(&self, t: f64) -> usize {
        self.event_times.partition_point(|&et| et <= t)
    }

    /// Subsystem identifier active at `t`.
    pub fn mode_at(&self, t: f64) -> usize {
        self.modes[self.mode_index_at(t)]
    }
}

/// Result of an active-subsystem query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsystemQuery {
    pub subsystem: usize,
    /// The query time lay outside the known horizon and was clamped.
    pub clamped: bool,
}

#[derive(Debug, Clone, Default)]
struct PartitionLookup {
    /// Event times inside `[t_i, t_{i+1})`.
    events: Vec<f64>,
    /// Index into `modes` of the mode active at the partition start.
    first_mode_index: usize,
}

/// Per-partition active-subsystem lookup.
///
/// Rebuilt whenever the mode schedule or the partition sequence changes.
#[derive(Debug, Clone, Default)]
pub struct LogicEngine {
    schedule: ModeSchedule,
    partition_times: Vec<f64>,
    partitions: Vec<PartitionLookup>,
}

impl LogicEngine {
    pub fn new(schedule: ModeSchedule) -> OcxResult<Self> {
        schedule.validate()?;
        Ok(Self { schedule, partition_times: Vec::new(), partitions: Vec::new() })
    }

    pub fn schedule(&self) -> &ModeSchedule {
        &self.schedule
    }

    pub fn partition_times(&self) -> &[f64] {
        &self.partition_times
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Replace the mode schedule; the partition lookup must be rebuilt
    /// afterwards with [`LogicEngine::rebuild_for_partitions`].
    pub fn set_mode_schedule(&mut self, schedule: ModeSchedule) -> OcxResult<()> {
        schedule.validate()?;
        self.schedule = schedule;
        if !self.partition_times.is_empty() {
            let times = self.partition_times.clone();
            self.rebuild_for_partitions(&times)?;
        }
        Ok(())
    }

    /// Cache the event lookup for a contiguous partition sequence.
    pub fn rebuild_for_partitions(&mut self, partition_times: &[f64]) -> OcxResult<()> {
        if partition_times.len() < 2 {
            return Err(OcxError::config("partition sequence needs at least two times"));
        }
        if partition_times.windows(2).any(|w| w[0] >= w[1]) {
            return Err(OcxError::config("partition times are not strictly increasing"));
        }
        self.partition_times = partition_times.to_vec();
        self.partitions = partition_times
            .windows(2)
            .map(|w| {
                let (lo, hi) = (w[0], w[1]);
                let events: Vec<f64> = self
                    .schedule
                    .event_times
                    .iter()
                    .copied()
                    .filter(|&et| lo <= et && et < hi)
                    .collect();
                PartitionLookup { events, first_mode_index: self.schedule.mode_index_at(lo) }
            })
            .collect();
        Ok(())
    }

    /// Event times strictly inside partition `i`'s half-open interval.
    pub fn partition_events(&self, partition: usize) -> &[f64] {
        &self.partitions[partition].events
    }

    /// Subsystem active at `t` on the given partition.
    ///
    /// Times outside the known horizon clamp to the nearest boundary and the
    /// result is flagged recoverable.
    pub fn active_subsystem_at(&self, partition: usize, t: f64) -> SubsystemQuery {
        debug_assert!(partition < self.partitions.len(), "unknown partition index");
        let lo = self.partition_times[0];
        let hi = *self.partition_times.last().unwrap_or(&lo);
        let clamped = t < lo || t > hi;
        if clamped {
            warn!(time = t, horizon_start = lo, horizon_end = hi, "subsystem query outside horizon, clamping");
        }
        let t = t.clamp(lo, hi);
        let lookup = &self.partitions[partition];
        let offset = lookup.events.partition_point(|&et| et <= t);
        let index = (lookup.first_mode_index + offset).min(self.schedule.modes.len() - 1);
        SubsystemQuery { subsystem: self.schedule.modes[index], clamped }
    }

    /// Partition index whose half-open interval contains `t`.
    ///
    /// Uses the convention `t_i < t <= t_{i+1}`, with `t == t_0` mapping to
    /// partition 0; out-of-range times clamp to the first/last partition.
    pub fn partition_of(partition_times: &[f64], t: f64) -> usize {
        debug_assert!(partition_times.len() >= 2);
        let last = partition_times.len() - 2;
        if t <= partition_times[0] {
            return 0;
        }
        let idx = partition_times.partition_point(|&pt| pt < t);
        idx.saturating_sub(1).min(last)
    }
}
