//! Reference LQR scenarios: analytic gain comparison, multi-partition
//! stitching, rollout round-trip, warm start, and init-only runs.

mod common;

use approx::assert_relative_eq;
use nalgebra::DVector;

use common::{reference_riccati_gain, scalar_problem};
use ocx_core::interpolation::interpolate;
use ocx_core::logic::ModeSchedule;
use ocx_core::settings::SlqSettings;
use ocx_slq::{RolloutEngine, Slq, TerminationFlags};

fn settings() -> SlqSettings {
    SlqSettings { max_iterations: 10, ..Default::default() }
}

#[test]
fn scalar_lqr_matches_analytic_riccati() {
    let mut slq = Slq::new(scalar_problem(1.0, 1.0, 1.0, 1.0), settings(), ModeSchedule::single(0))
        .unwrap();
    let x0 = DVector::from_vec(vec![1.0]);
    let outcome = slq.run(0.0, &x0, 2.0, &[0.0, 2.0], None).unwrap();

    assert!(outcome.termination.converged(), "termination: {:?}", outcome.termination);
    assert!(outcome.num_iterations() <= 5);

    let (ref_times, ref_p) = reference_riccati_gain(1.0, 1.0, 1.0, 1.0, 0.0, 2.0, 201, 0.0);
    let controller = &outcome.controllers[0];
    for (k, &t) in controller.times.iter().enumerate() {
        let p = interpolate(&ref_times, &ref_p, t);
        // K = -R⁻¹ B P = -P for unit coefficients.
        assert_relative_eq!(controller.gains[k][(0, 0)], -p, epsilon = 1e-3);
    }

    // Optimal cost is 0.5 x0' P(0) x0.
    let p0 = ref_p[0];
    assert_relative_eq!(outcome.cost, 0.5 * p0, epsilon = 1e-2);
}

#[test]
fn multi_partition_stitching_matches_single_partition() {
    let x0 = DVector::from_vec(vec![1.0]);

    let mut single = Slq::new(scalar_problem(1.0, 1.0, 1.0, 1.0), settings(), ModeSchedule::single(0))
        .unwrap();
    let single_out = single.run(0.0, &x0, 2.0, &[0.0, 2.0], None).unwrap();

    let mut split = Slq::new(scalar_problem(1.0, 1.0, 1.0, 1.0), settings(), ModeSchedule::single(0))
        .unwrap();
    let split_out = split.run(0.0, &x0, 2.0, &[0.0, 1.0, 2.0], None).unwrap();

    assert_eq!(split_out.controllers.len(), 2);
    assert_relative_eq!(single_out.cost, split_out.cost, epsilon = 1e-4);

    // Gains agree across the stitch, including at the interior boundary.
    let reference = &single_out.controllers[0];
    for controller in &split_out.controllers {
        for (k, &t) in controller.times.iter().enumerate() {
            let expected = interpolate(&reference.times, &reference.gains, t);
            assert_relative_eq!(
                controller.gains[k][(0, 0)],
                expected[(0, 0)],
                epsilon = 1e-3
            );
        }
    }
}

#[test]
fn returned_controller_reproduces_nominal_trajectory() {
    let mut slq = Slq::new(scalar_problem(1.0, 1.0, 1.0, 1.0), settings(), ModeSchedule::single(0))
        .unwrap();
    let x0 = DVector::from_vec(vec![1.0]);
    let outcome = slq.run(0.0, &x0, 2.0, &[0.0, 2.0], None).unwrap();

    let dynamics = common::LinearDynamics::new(vec![(
        nalgebra::DMatrix::from_element(1, 1, 1.0),
        nalgebra::DMatrix::from_element(1, 1, 1.0),
    )]);
    let engine = RolloutEngine::new(slq.settings());
    let replay = engine
        .run_time_triggered(
            &dynamics,
            slq.logic(),
            0,
            0.0,
            x0.clone(),
            2.0,
            &outcome.controllers[0],
            &ocx_core::CancelToken::new(),
        )
        .unwrap();

    let nominal = &outcome.nominal[0];
    for (k, &t) in nominal.times.iter().enumerate() {
        let x = interpolate(&replay.times, &replay.states, t);
        assert_relative_eq!(x[0], nominal.states[k][0], epsilon = 1e-5);
    }
}

#[test]
fn accepted_iterations_descend_monotonically() {
    let mut slq = Slq::new(scalar_problem(1.0, 1.0, 1.0, 1.0), settings(), ModeSchedule::single(0))
        .unwrap();
    let x0 = DVector::from_vec(vec![1.0]);
    let outcome = slq.run(0.0, &x0, 2.0, &[0.0, 2.0], None).unwrap();

    // Records start at the first true rollout; each accepted step must not
    // increase the cost beyond integration noise.
    for w in outcome.iterations.windows(2) {
        assert!(w[1].cost <= w[0].cost + 1e-7, "cost increased: {w:?}");
    }
}

#[test]
fn warm_start_converges_in_half_the_iterations() {
    let mut slq = Slq::new(scalar_problem(1.0, 1.0, 1.0, 1.0), settings(), ModeSchedule::single(0))
        .unwrap();
    let x0 = DVector::from_vec(vec![1.0]);

    let first = slq.run(0.0, &x0, 2.0, &[0.0, 2.0], None).unwrap();
    let second = slq.run(0.0, &x0, 2.0, &[0.0, 2.0], None).unwrap();

    assert!(first.termination.converged());
    assert!(second.termination.converged());
    assert!(
        2 * second.num_iterations() <= first.num_iterations(),
        "warm start took {} iterations after a cold run of {}",
        second.num_iterations(),
        first.num_iterations()
    );
    assert_relative_eq!(first.cost, second.cost, epsilon = 1e-6);
}

#[test]
fn zero_iteration_cap_returns_init_controller() {
    let settings = SlqSettings { max_iterations: 0, ..Default::default() };
    let mut slq =
        Slq::new(scalar_problem(1.0, 1.0, 1.0, 1.0), settings, ModeSchedule::single(0)).unwrap();
    let x0 = DVector::from_vec(vec![1.0]);
    let outcome = slq.run(0.0, &x0, 2.0, &[0.0, 2.0], None).unwrap();

    assert!(outcome.termination.contains(TerminationFlags::ITERATION_LIMIT));
    assert!(!outcome.controllers.is_empty());
    assert!(!outcome.controllers[0].is_empty());
    assert!(outcome.cost.is_finite());
    assert!(outcome.iterations.is_empty());
}

#[test]
fn explicit_controller_start_converges_immediately() {
    let mut slq = Slq::new(scalar_problem(1.0, 1.0, 1.0, 1.0), settings(), ModeSchedule::single(0))
        .unwrap();
    let x0 = DVector::from_vec(vec![1.0]);
    let cold = slq.run(0.0, &x0, 2.0, &[0.0, 2.0], None).unwrap();

    let mut fresh = Slq::new(scalar_problem(1.0, 1.0, 1.0, 1.0), settings(), ModeSchedule::single(0))
        .unwrap();
    let warm = fresh
        .run_with_controller(0.0, &x0, 2.0, &[0.0, 2.0], cold.controllers.clone(), None)
        .unwrap();

    assert!(warm.termination.converged());
    assert!(warm.num_iterations() <= 1 + cold.num_iterations() / 2);
    assert_relative_eq!(warm.cost, cold.cost, epsilon = 1e-6);
}

#[test]
fn mid_run_cancellation_returns_best_so_far() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use ocx_core::model::{DynamicsExpansion, SwitchedDynamics};
    use ocx_core::types::{InputVector, StateVector};
    use ocx_core::CancelToken;

    /// Scalar plant that trips the solver's cancellation token after a fixed
    /// number of flow evaluations. The token slot is filled once the solver
    /// exists; clones of the dynamics share it.
    #[derive(Clone)]
    struct TrippingDynamics {
        calls: Arc<AtomicUsize>,
        trip_after: usize,
        token: Arc<Mutex<Option<CancelToken>>>,
    }

    impl SwitchedDynamics for TrippingDynamics {
        fn state_dim(&self) -> usize {
            1
        }
        fn input_dim(&self) -> usize {
            1
        }
        fn flow(&self, _m: usize, _t: f64, x: &StateVector, u: &InputVector) -> StateVector {
            if self.calls.fetch_add(1, Ordering::Relaxed) + 1 == self.trip_after {
                if let Some(token) = self.token.lock().unwrap().as_ref() {
                    token.cancel();
                }
            }
            DVector::from_vec(vec![x[0] + u[0]])
        }
        fn linearize(&self, _m: usize, _t: f64, _x: &StateVector, _u: &InputVector) -> DynamicsExpansion {
            DynamicsExpansion {
                a: nalgebra::DMatrix::from_element(1, 1, 1.0),
                b: nalgebra::DMatrix::from_element(1, 1, 1.0),
            }
        }
        fn clone_dynamics(&self) -> Box<dyn SwitchedDynamics> {
            Box::new(self.clone())
        }
    }

    let slot: Arc<Mutex<Option<CancelToken>>> = Arc::new(Mutex::new(None));
    let mut problem = scalar_problem(1.0, 1.0, 1.0, 1.0);
    problem.dynamics = Box::new(TrippingDynamics {
        calls: Arc::new(AtomicUsize::new(0)),
        trip_after: 50,
        token: Arc::clone(&slot),
    });

    let mut slq = Slq::new(problem, settings(), ModeSchedule::single(0)).unwrap();
    *slot.lock().unwrap() = Some(slq.cancel_token());

    // Initialization samples the operating trajectories without evaluating
    // the flow, so the token fires during the first line-search rollout and
    // the solve returns the init controller with the cancellation flag set.
    let x0 = DVector::from_vec(vec![1.0]);
    let outcome = slq.run(0.0, &x0, 2.0, &[0.0, 2.0], None).unwrap();
    assert!(outcome.termination.contains(TerminationFlags::CANCELLED));
    assert!(!outcome.controllers[0].is_empty());
    assert!(outcome.cost.is_finite());
}

#[test]
fn configuration_errors_are_reported_before_iterating() {
    let mut slq = Slq::new(scalar_problem(1.0, 1.0, 1.0, 1.0), settings(), ModeSchedule::single(0))
        .unwrap();
    let x0 = DVector::from_vec(vec![1.0]);

    // Empty partition sequence.
    assert!(slq.run(0.0, &x0, 2.0, &[], None).is_err());
    // Partition times not covering the horizon.
    assert!(slq.run(0.0, &x0, 2.0, &[0.0, 1.0], None).is_err());
    // Inverted horizon.
    assert!(slq.run(2.0, &x0, 0.0, &[2.0, 0.0], None).is_err());

    // Missing operating trajectory on a cold start.
    let mut bundle = scalar_problem(1.0, 1.0, 1.0, 1.0);
    bundle.operating = None;
    let mut cold = Slq::new(bundle, settings(), ModeSchedule::single(0)).unwrap();
    let err = cold.run(0.0, &x0, 2.0, &[0.0, 2.0], None).unwrap_err();
    assert!(matches!(err, ocx_core::OcxError::Config(_)));
}

#[test]
fn parallel_workers_match_sequential_result() {
    let x0 = DVector::from_vec(vec![1.0]);

    let mut sequential = Slq::new(scalar_problem(1.0, 1.0, 1.0, 1.0), settings(), ModeSchedule::single(0))
        .unwrap();
    let seq_out = sequential.run(0.0, &x0, 2.0, &[0.0, 1.0, 2.0], None).unwrap();

    let par_settings = SlqSettings {
        max_iterations: 10,
        num_workers: 4,
        use_parallel_riccati: true,
        ..Default::default()
    };
    let mut parallel = Slq::new(scalar_problem(1.0, 1.0, 1.0, 1.0), par_settings, ModeSchedule::single(0))
        .unwrap();
    let par_out = parallel.run(0.0, &x0, 2.0, &[0.0, 1.0, 2.0], None).unwrap();

    // Both execution modes converge to the same fixed point.
    assert_relative_eq!(seq_out.cost, par_out.cost, epsilon = 1e-5);
    let k_seq = seq_out.controllers[0].gains[0][(0, 0)];
    let k_par = par_out.controllers[0].gains[0][(0, 0)];
    assert_relative_eq!(k_seq, k_par, epsilon = 1e-4);
}
