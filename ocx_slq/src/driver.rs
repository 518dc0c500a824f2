//! SLQ iteration driver: init / iterate / exit, line search, and the
//! worker pool.
//!
//! One iteration rolls the current controller out (step 0) to fix the new
//! nominal, backtracks over line-search candidates on the feedforward
//! increment, re-approximates the LQ problem along the accepted rollout,
//! sweeps the Riccati equations backward across the partitions, and
//! synthesizes the next controller. Termination: relative cost change below
//! tolerance and both constraint ISE norms below tolerance, or the
//! iteration cap, wall-clock budget, or cancellation token fires first.

use std::time::Instant;

use bitflags::bitflags;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use ocx_core::cancel::CancelToken;
use ocx_core::controller::FeedbackController;
use ocx_core::error::{OcxError, OcxResult};
use ocx_core::logic::{LogicEngine, ModeSchedule};
use ocx_core::model::{OcProblem, OperatingTrajectories};
use ocx_core::settings::SlqSettings;
use ocx_core::types::{DesiredTrajectory, StateVector};

use crate::approx::{approximate_partition, terminal_quadratic, PartitionLq};
use crate::evaluation::{evaluate_partition, ise};
use crate::riccati::{PartitionValue, RiccatiSweep, ValueNode};
use crate::rollout::{RolloutEngine, RolloutOutput};
use crate::synthesis::synthesize_controller;

/// Grid density of the cold-start operating trajectory, per partition.
const OPERATING_NODES_PER_PARTITION: usize = 64;

bitflags! {
    /// Why the solve stopped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TerminationFlags: u8 {
        /// Relative cost change fell below tolerance.
        const CONVERGED_COST        = 0x01;
        /// Both constraint ISE norms fell below tolerance.
        const CONVERGED_CONSTRAINTS = 0x02;
        /// Iteration cap reached without meeting tolerances.
        const ITERATION_LIMIT       = 0x04;
        /// Per-iteration wall-clock budget exceeded.
        const TIME_BUDGET           = 0x08;
        /// Cancellation token fired.
        const CANCELLED             = 0x10;
    }
}

impl TerminationFlags {
    pub fn converged(&self) -> bool {
        self.contains(Self::CONVERGED_COST | Self::CONVERGED_CONSTRAINTS)
    }
}

/// One line of the iteration log.
#[derive(Debug, Clone, Copy)]
pub struct IterationRecord {
    pub cost: f64,
    pub constraint1_ise: f64,
    pub constraint2_ise: f64,
    pub step_size: f64,
}

/// Everything a solve returns.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    /// Optimized controller, one per partition.
    pub controllers: Vec<FeedbackController>,
    /// Nominal trajectories, one rollout per partition.
    pub nominal: Vec<RolloutOutput>,
    pub cost: f64,
    pub constraint1_ise: f64,
    pub constraint2_ise: f64,
    pub iterations: Vec<IterationRecord>,
    pub termination: TerminationFlags,
}

impl SolveOutcome {
    pub fn num_iterations(&self) -> usize {
        self.iterations.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Metrics {
    cost: f64,
    merit: f64,
    ise1: f64,
    ise2: f64,
}

struct Candidate {
    alpha: f64,
    rollouts: Vec<RolloutOutput>,
    metrics: Metrics,
}

/// Sequential linear-quadratic optimizer for switched systems.
pub struct Slq {
    problem: OcProblem,
    settings: SlqSettings,
    logic: LogicEngine,
    rollout: RolloutEngine,
    sweep: RiccatiSweep,
    cancel: CancelToken,
    pool: Option<rayon::ThreadPool>,

    partition_times: Vec<f64>,
    controllers: Vec<FeedbackController>,
    nominal: Vec<RolloutOutput>,
    lq: Vec<PartitionLq>,
    values: Vec<PartitionValue>,
    /// Value at each partition start from the latest sweep; seeds the
    /// parallel Riccati mode.
    boundaries: Vec<ValueNode>,
    metrics: Metrics,
    log: Vec<IterationRecord>,
}

impl Slq {
    pub fn new(
        problem: OcProblem,
        settings: SlqSettings,
        schedule: ModeSchedule,
    ) -> OcxResult<Self> {
        settings.validate()?;
        if problem.state_dim() == 0 || problem.input_dim() == 0 {
            return Err(OcxError::config("state and input dimensions must be non-zero"));
        }
        let logic = LogicEngine::new(schedule)?;
        let pool = if settings.num_workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(settings.num_workers)
                .build()
                .map_err(|e| OcxError::config(format!("worker pool: {e}")))?;
            Some(pool)
        } else {
            None
        };
        let rollout = RolloutEngine::new(&settings);
        let sweep = RiccatiSweep::new(&settings);
        Ok(Self {
            problem,
            settings,
            logic,
            rollout,
            sweep,
            cancel: CancelToken::new(),
            pool,
            partition_times: Vec::new(),
            controllers: Vec::new(),
            nominal: Vec::new(),
            lq: Vec::new(),
            values: Vec::new(),
            boundaries: Vec::new(),
            metrics: Metrics::default(),
            log: Vec::new(),
        })
    }

    /// Handle for cooperative cancellation of a running solve.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &SlqSettings {
        &self.settings
    }

    pub fn logic(&self) -> &LogicEngine {
        &self.logic
    }

    pub fn set_mode_schedule(&mut self, schedule: ModeSchedule) -> OcxResult<()> {
        self.logic.set_mode_schedule(schedule)?;
        // The switching structure changed; retained controllers are stale.
        self.controllers.clear();
        Ok(())
    }

    /// Optimized controller array from the latest solve.
    pub fn controllers(&self) -> &[FeedbackController] {
        &self.controllers
    }

    /// Nominal trajectories from the latest solve.
    pub fn nominal_trajectories(&self) -> &[RolloutOutput] {
        &self.nominal
    }

    pub fn iteration_log(&self) -> &[IterationRecord] {
        &self.log
    }

    /// `(cost, type-1 ISE, type-2 ISE)` of the latest nominal.
    pub fn performance_index(&self) -> (f64, f64, f64) {
        (self.metrics.cost, self.metrics.ise1, self.metrics.ise2)
    }

    pub fn event_times(&self) -> &[f64] {
        &self.logic.schedule().event_times
    }

    pub fn partition_times(&self) -> &[f64] {
        &self.partition_times
    }

    /// Cold- or warm-started solve. Warm starts reuse the controller kept
    /// from the previous call when the partition sequence is unchanged.
    pub fn run(
        &mut self,
        t0: f64,
        x0: &StateVector,
        tf: f64,
        partition_times: &[f64],
        desired: Option<&DesiredTrajectory>,
    ) -> OcxResult<SolveOutcome> {
        self.prepare(t0, tf, partition_times, desired)?;
        self.solve(t0, x0, tf)
    }

    /// Solve starting from an explicitly provided controller array.
    pub fn run_with_controller(
        &mut self,
        t0: f64,
        x0: &StateVector,
        tf: f64,
        partition_times: &[f64],
        controllers: Vec<FeedbackController>,
        desired: Option<&DesiredTrajectory>,
    ) -> OcxResult<SolveOutcome> {
        self.prepare(t0, tf, partition_times, desired)?;
        if controllers.len() != self.num_partitions() {
            return Err(OcxError::config(format!(
                "expected {} controllers, got {}",
                self.num_partitions(),
                controllers.len()
            )));
        }
        self.controllers = controllers;
        self.solve(t0, x0, tf)
    }

    fn num_partitions(&self) -> usize {
        self.partition_times.len().saturating_sub(1)
    }

    fn prepare(
        &mut self,
        t0: f64,
        tf: f64,
        partition_times: &[f64],
        desired: Option<&DesiredTrajectory>,
    ) -> OcxResult<()> {
        if partition_times.len() < 2 {
            return Err(OcxError::config("empty partition sequence"));
        }
        if !(tf > t0) {
            return Err(OcxError::config("final time must exceed initial time"));
        }
        let span = (tf - t0).abs().max(1.0);
        if (partition_times[0] - t0).abs() > 1e-9 * span
            || (partition_times[partition_times.len() - 1] - tf).abs() > 1e-9 * span
        {
            return Err(OcxError::config("partition times must cover exactly [t0, tf]"));
        }
        self.logic.rebuild_for_partitions(partition_times)?;
        if self.partition_times != partition_times {
            // Partition sequence changed: resize per-partition storage and
            // drop stale warm-start data.
            self.partition_times = partition_times.to_vec();
            self.controllers.clear();
            self.boundaries.clear();
        }
        self.nominal.clear();
        self.lq.clear();
        self.values.clear();
        self.log.clear();
        self.cancel.reset();
        if let Some(desired) = desired {
            self.problem.cost.set_desired(desired);
        }
        Ok(())
    }

    fn solve(&mut self, t0: f64, x0: &StateVector, tf: f64) -> OcxResult<SolveOutcome> {
        self.run_init(t0, x0, tf)?;
        let mut termination = TerminationFlags::empty();

        for iteration in 1..=self.settings.max_iterations {
            let started = Instant::now();
            if self.cancel.is_cancelled() {
                termination |= TerminationFlags::CANCELLED;
                break;
            }

            let previous_cost = self.metrics.cost;
            match self.run_iteration(t0, x0, tf) {
                Ok(step) => {
                    self.log.push(IterationRecord {
                        cost: self.metrics.cost,
                        constraint1_ise: self.metrics.ise1,
                        constraint2_ise: self.metrics.ise2,
                        step_size: step,
                    });
                    info!(
                        iteration,
                        cost = self.metrics.cost,
                        ise1 = self.metrics.ise1,
                        ise2 = self.metrics.ise2,
                        step,
                        "SLQ iteration"
                    );
                }
                Err(OcxError::Cancelled) => {
                    termination |= TerminationFlags::CANCELLED;
                    break;
                }
                Err(e) => return Err(e),
            }

            let rel_change = (previous_cost - self.metrics.cost).abs()
                / previous_cost.abs().max(1.0);
            let constraints_met = self.metrics.ise1 < self.settings.constraint_ise_tolerance
                && self.metrics.ise2 < self.settings.constraint_ise_tolerance;
            if rel_change < self.settings.min_rel_cost_improvement && constraints_met {
                termination |=
                    TerminationFlags::CONVERGED_COST | TerminationFlags::CONVERGED_CONSTRAINTS;
                break;
            }
            if iteration == self.settings.max_iterations {
                termination |= TerminationFlags::ITERATION_LIMIT;
            }
            if let Some(budget) = self.settings.iteration_time_budget {
                if started.elapsed().as_secs_f64() > budget {
                    warn!(iteration, budget, "iteration wall-clock budget exceeded");
                    termination |= TerminationFlags::TIME_BUDGET;
                    break;
                }
            }
        }

        if self.settings.max_iterations == 0 {
            termination |= TerminationFlags::ITERATION_LIMIT;
        }

        Ok(SolveOutcome {
            controllers: self.controllers.clone(),
            nominal: self.nominal.clone(),
            cost: self.metrics.cost,
            constraint1_ise: self.metrics.ise1,
            constraint2_ise: self.metrics.ise2,
            iterations: self.log.clone(),
            termination,
        })
    }

    /// Fix the initial nominal (operating trajectories on cold start, a
    /// zero-step rollout on warm start), then build the first controller.
    fn run_init(&mut self, t0: f64, x0: &StateVector, tf: f64) -> OcxResult<()> {
        let partitions = self.num_partitions();
        if self.controllers.len() == partitions
            && self.controllers.iter().all(|c| !c.is_empty())
        {
            self.nominal = rollout_all(
                &self.problem,
                &self.logic,
                &self.rollout,
                t0,
                x0,
                tf,
                &self.controllers,
                0.0,
                &self.cancel,
            )?;
        } else {
            let operating = self
                .problem
                .operating
                .as_deref()
                .ok_or_else(|| OcxError::config("missing operating trajectory for cold start"))?;
            self.nominal = (0..partitions)
                .map(|i| {
                    let lo = self.partition_times[i].max(t0);
                    let hi = self.partition_times[i + 1].min(tf);
                    operating_rollout(operating, &self.logic, i, lo, hi, x0)
                })
                .collect();
        }

        self.metrics = evaluate_rollouts(&self.problem, &self.logic, &self.settings, &self.nominal, tf);
        debug!(cost = self.metrics.cost, "initial nominal fixed");
        self.approximate()?;
        self.solve_riccati(tf)?;
        self.synthesize();
        Ok(())
    }

    /// One SLQ iteration; returns the accepted line-search step.
    fn run_iteration(&mut self, t0: f64, x0: &StateVector, tf: f64) -> OcxResult<f64> {
        let step = self.line_search(t0, x0, tf)?;
        self.approximate()?;
        self.solve_riccati(tf)?;
        self.synthesize();
        let max_delta = self
            .controllers
            .iter()
            .map(FeedbackController::max_delta_norm)
            .fold(0.0, f64::max);
        debug!(max_delta, "controller updated");
        Ok(step)
    }

    fn approximate(&mut self) -> OcxResult<()> {
        let problem = &self.problem;
        let logic = &self.logic;
        let settings = &self.settings;
        let nominal = &self.nominal;
        self.lq = match &self.pool {
            Some(pool) => pool.install(|| {
                nominal
                    .par_iter()
                    .enumerate()
                    .map_init(
                        || problem.clone(),
                        |worker, (i, ro)| approximate_partition(worker, logic, i, ro, settings),
                    )
                    .collect::<OcxResult<Vec<_>>>()
            })?,
            None => nominal
                .iter()
                .enumerate()
                .map(|(i, ro)| approximate_partition(problem, logic, i, ro, settings))
                .collect::<OcxResult<Vec<_>>>()?,
        };
        Ok(())
    }

    fn solve_riccati(&mut self, tf: f64) -> OcxResult<()> {
        let partitions = self.num_partitions();
        let terminal = self.fresh_terminal(tf);

        let parallel_ready = self.settings.use_parallel_riccati
            && self.pool.is_some()
            && self.boundaries.len() == partitions + 1;
        if parallel_ready {
            let sweep = &self.sweep;
            let lq = &self.lq;
            let cancel = &self.cancel;
            let boundaries = &self.boundaries;
            let pool = self.pool.as_ref().expect("parallel mode checked");
            self.values = pool.install(|| {
                (0..partitions)
                    .into_par_iter()
                    .map(|i| {
                        // Previous iteration's stitched boundary seeds every
                        // partition but the last, which gets the fresh
                        // terminal quadratic.
                        let seed = if i + 1 == partitions {
                            terminal.clone()
                        } else {
                            boundaries[i + 1].clone()
                        };
                        sweep.solve_partition(&lq[i], seed, cancel)
                    })
                    .collect::<OcxResult<Vec<_>>>()
            })?;
        } else {
            let mut values: Vec<Option<PartitionValue>> = (0..partitions).map(|_| None).collect();
            let mut boundary = terminal;
            for i in (0..partitions).rev() {
                let v = self.sweep.solve_partition(&self.lq[i], boundary, &self.cancel)?;
                boundary = v.initial().clone();
                values[i] = Some(v);
            }
            self.values = values.into_iter().map(|v| v.expect("all partitions solved")).collect();
        }

        // Stitched boundaries: value at the start of each partition, plus the
        // horizon terminus. Seeds the next parallel sweep.
        self.boundaries = self.values.iter().map(|v| v.initial().clone()).collect();
        self.boundaries.push(self.fresh_terminal(tf));
        debug_assert_eq!(self.boundaries.len(), partitions + 1);
        Ok(())
    }

    fn fresh_terminal(&self, tf: f64) -> ValueNode {
        let last = self.num_partitions() - 1;
        let xf = self.nominal[last].final_state();
        let mode = self.logic.active_subsystem_at(last, tf).subsystem;
        ValueNode::from_quadratic(&terminal_quadratic(&self.problem, mode, tf, xf, &self.settings))
    }

    fn synthesize(&mut self) {
        self.controllers = (0..self.num_partitions())
            .map(|i| {
                synthesize_controller(
                    &self.lq[i],
                    &self.values[i],
                    &self.nominal[i].states,
                    &self.nominal[i].inputs,
                    self.settings.constraint_step_size,
                )
            })
            .collect();
    }

    /// Backtracking line search on the feedforward increment. Fixes the new
    /// nominal at the accepted step and folds the step into the controller.
    fn line_search(&mut self, t0: f64, x0: &StateVector, tf: f64) -> OcxResult<f64> {
        let predicted = predicted_decrease(&self.controllers, &self.lq);

        // Step 0 applies the constraint correction alone and anchors the
        // sufficient-decrease test.
        let base_rollouts = rollout_all(
            &self.problem,
            &self.logic,
            &self.rollout,
            t0,
            x0,
            tf,
            &self.controllers,
            0.0,
            &self.cancel,
        )?;
        let base_metrics =
            evaluate_rollouts(&self.problem, &self.logic, &self.settings, &base_rollouts, tf);

        let mut alphas = Vec::new();
        let mut alpha = self.settings.max_step_size;
        while alpha >= self.settings.min_step_size * (1.0 - 1e-12) {
            alphas.push(alpha);
            alpha *= self.settings.line_search_contraction;
        }

        let chosen = if self.pool.is_some() && alphas.len() > 1 {
            self.search_parallel(&alphas, base_metrics.merit, predicted, t0, x0, tf)?
        } else {
            self.search_sequential(&alphas, base_metrics.merit, predicted, t0, x0, tf)?
        };

        let (step, rollouts, metrics) = match chosen {
            Some(c) => (c.alpha, c.rollouts, c.metrics),
            None => {
                debug!("no admissible line-search step, keeping constraint correction only");
                (0.0, base_rollouts, base_metrics)
            }
        };
        for c in &mut self.controllers {
            c.fold_step(step);
        }
        self.nominal = rollouts;
        self.metrics = metrics;
        Ok(step)
    }

    fn search_sequential(
        &self,
        alphas: &[f64],
        baseline_merit: f64,
        predicted: f64,
        t0: f64,
        x0: &StateVector,
        tf: f64,
    ) -> OcxResult<Option<Candidate>> {
        let mut smallest: Option<Candidate> = None;
        for &alpha in alphas {
            match self.try_candidate(&self.problem, alpha, t0, x0, tf) {
                Ok(candidate) => {
                    if admissible(&candidate, baseline_merit, predicted, &self.settings) {
                        return Ok(Some(candidate));
                    }
                    smallest = Some(candidate);
                }
                Err(OcxError::Cancelled) => return Err(OcxError::Cancelled),
                Err(e) => {
                    debug!(alpha, error = %e, "line-search candidate rejected");
                }
            }
        }
        self.report_exhausted(&smallest, baseline_merit);
        Ok(smallest.filter(|c| c.metrics.merit <= baseline_merit))
    }

    fn search_parallel(
        &self,
        alphas: &[f64],
        baseline_merit: f64,
        predicted: f64,
        t0: f64,
        x0: &StateVector,
        tf: f64,
    ) -> OcxResult<Option<Candidate>> {
        let pool = self.pool.as_ref().expect("parallel search requires a pool");
        let results: Vec<OcxResult<Candidate>> = pool.install(|| {
            alphas
                .par_iter()
                .map_init(
                    || self.problem.clone(),
                    |worker, &alpha| self.try_candidate(worker, alpha, t0, x0, tf),
                )
                .collect()
        });
        if results.iter().any(|r| matches!(r, Err(OcxError::Cancelled))) {
            return Err(OcxError::Cancelled);
        }
        let mut candidates: Vec<Candidate> = results.into_iter().filter_map(Result::ok).collect();
        // Best admissible candidate wins; ties go to the larger step.
        candidates.sort_by(|a, b| a.metrics.merit.total_cmp(&b.metrics.merit));
        let best = candidates
            .iter()
            .position(|c| admissible(c, baseline_merit, predicted, &self.settings));
        match best {
            Some(idx) => Ok(Some(candidates.swap_remove(idx))),
            None => {
                let smallest = candidates
                    .into_iter()
                    .min_by(|a, b| a.alpha.total_cmp(&b.alpha));
                self.report_exhausted(&smallest, baseline_merit);
                Ok(smallest.filter(|c| c.metrics.merit <= baseline_merit))
            }
        }
    }

    /// Roll out and evaluate one step candidate on the given (possibly
    /// worker-owned) problem instance.
    fn try_candidate(
        &self,
        problem: &OcProblem,
        alpha: f64,
        t0: f64,
        x0: &StateVector,
        tf: f64,
    ) -> OcxResult<Candidate> {
        let rollouts = rollout_all(
            problem,
            &self.logic,
            &self.rollout,
            t0,
            x0,
            tf,
            &self.controllers,
            alpha,
            &self.cancel,
        )?;
        let metrics = evaluate_rollouts(problem, &self.logic, &self.settings, &rollouts, tf);
        Ok(Candidate { alpha, rollouts, metrics })
    }

    fn report_exhausted(&self, smallest: &Option<Candidate>, baseline_merit: f64) {
        if let Some(c) = smallest {
            warn!(
                alpha = c.alpha,
                merit = c.metrics.merit,
                baseline = baseline_merit,
                "no line-search step met the sufficient-decrease test; falling back to the smallest tested step"
            );
        } else {
            warn!("every line-search rollout failed, keeping step 0");
        }
    }
}

fn admissible(c: &Candidate, baseline_merit: f64, predicted: f64, settings: &SlqSettings) -> bool {
    baseline_merit - c.metrics.merit >= settings.armijo_coefficient * c.alpha * predicted
}

/// Expected merit decrease per unit step: `Σ Δt Δuffᵀ Rm Δuff` over all
/// partitions and nodes.
fn predicted_decrease(controllers: &[FeedbackController], lq: &[PartitionLq]) -> f64 {
    controllers
        .iter()
        .zip(lq)
        .map(|(c, plq)| {
            let quad: Vec<f64> = c
                .feedforward_delta
                .iter()
                .zip(&plq.nodes)
                .map(|(delta, node)| delta.dot(&(&node.rm * delta)))
                .collect();
            ise(&plq.times, &quad)
        })
        .sum()
}

/// Chain partition rollouts across the horizon, carrying the end state of
/// each partition into the next.
fn rollout_all(
    problem: &OcProblem,
    logic: &LogicEngine,
    engine: &RolloutEngine,
    t0: f64,
    x0: &StateVector,
    tf: f64,
    controllers: &[FeedbackController],
    alpha: f64,
    cancel: &CancelToken,
) -> OcxResult<Vec<RolloutOutput>> {
    let partition_times = logic.partition_times();
    let mut x = x0.clone();
    let mut out = Vec::with_capacity(controllers.len());
    for (i, controller) in controllers.iter().enumerate() {
        let lo = partition_times[i].max(t0);
        let hi = partition_times[i + 1].min(tf);
        let mut stepped = controller.clone();
        stepped.step_size = alpha;
        let ro = engine.run_time_triggered(
            problem.dynamics.as_ref(),
            logic,
            i,
            lo,
            x,
            hi,
            &stepped,
            cancel,
        )?;
        x = ro.final_state().clone();
        out.push(ro);
    }
    Ok(out)
}

/// Cost, merit, and constraint ISE figures of a full-horizon rollout.
fn evaluate_rollouts(
    problem: &OcProblem,
    logic: &LogicEngine,
    settings: &SlqSettings,
    rollouts: &[RolloutOutput],
    tf: f64,
) -> Metrics {
    let mut cost = 0.0;
    let mut ise1 = 0.0;
    let mut ise2 = 0.0;
    for (i, ro) in rollouts.iter().enumerate() {
        let eval = evaluate_partition(problem, logic, i, ro);
        cost += eval.cost;
        ise1 += ise(&ro.times, &eval.c1_sq);
        ise2 += ise(&ro.times, &eval.c2_sq);
    }

    let last = rollouts.len() - 1;
    let xf = rollouts[last].final_state();
    let mode = logic.active_subsystem_at(last, tf).subsystem;
    cost += problem.cost.terminal_cost(mode, tf, xf);
    let terminal_con = problem.constraint.terminal(mode, tf, xf);
    let terminal_sq = if terminal_con.num_active > 0 { terminal_con.h.norm_squared() } else { 0.0 };

    let merit = cost + 0.5 * settings.state_constraint_penalty * (ise1 + ise2 + terminal_sq);
    Metrics { cost, merit, ise1, ise2 }
}

/// Cold-start nominal built by sampling the operating trajectories on a
/// uniform grid, with event stamps duplicated like a real rollout.
fn operating_rollout(
    operating: &dyn OperatingTrajectories,
    logic: &LogicEngine,
    partition: usize,
    lo: f64,
    hi: f64,
    x0: &StateVector,
) -> RolloutOutput {
    let margin = 1e-12 * (hi - lo).abs().max(1.0);
    let mut bounds = vec![lo];
    bounds.extend(
        logic
            .partition_events(partition)
            .iter()
            .copied()
            .filter(|&ev| ev >= lo && ev < hi - margin),
    );
    bounds.push(hi);

    let span = hi - lo;
    let mut out = RolloutOutput::default();
    for (leg, w) in bounds.windows(2).enumerate() {
        if leg > 0 {
            out.event_past_end.push(out.times.len());
        }
        let (a, b) = (w[0], w[1]);
        let count = if b > a {
            ((OPERATING_NODES_PER_PARTITION as f64) * (b - a) / span).ceil().max(2.0) as usize
        } else {
            1
        };
        for j in 0..count {
            let t = if count > 1 { a + (b - a) * j as f64 / (count - 1) as f64 } else { a };
            let (x, u) = operating.sample(t);
            out.times.push(t);
            out.states.push(x);
            out.inputs.push(u);
        }
    }
    // The very first node anchors to the actual initial state so the first
    // LQ expansion is taken where the rollout will start.
    if partition == 0 {
        if let Some(first) = out.states.first_mut() {
            *first = x0.clone();
        }
    }
    out
}
