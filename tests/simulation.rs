use std::collections::HashSet;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;

use particle_life::{
    ClassBuffer, ClassPair, InteractionMatrix, ParticleField, Physics, SimulationParams,
    SimulationState, SimulationStep, SubmissionOrder, replay, run_serial_generation,
};

/// Small but dense world so classes actually interact.
fn small_params(classes: usize, particles: usize, threads: usize) -> SimulationParams {
    SimulationParams {
        num_classes: classes,
        particles_per_class: particles,
        width: 400.0,
        height: 300.0,
        worker_threads: Some(threads),
        ..Default::default()
    }
}

/// Two identical states built from the same seed.
fn twin_states(params: &SimulationParams, seed: u64) -> (SimulationState, SimulationState) {
    let a = SimulationState::from_params(params, &mut StdRng::seed_from_u64(seed)).unwrap();
    let b = SimulationState::from_params(params, &mut StdRng::seed_from_u64(seed)).unwrap();
    (a, b)
}

fn snapshots(state: &SimulationState) -> Vec<ClassBuffer> {
    (0..state.num_classes())
        .map(|class| state.field().snapshot(class).unwrap())
        .collect()
}

// ==================================================================================
// Invariants
// ==================================================================================

#[test]
fn counts_and_bounds_hold_after_every_generation() {
    let params = SimulationParams {
        seed: Some(1),
        ..small_params(4, 150, 4)
    };
    let mut step = SimulationStep::new(&params).unwrap();

    for _ in 0..40 {
        step.run_generation().unwrap();
        for buffer in snapshots(step.state()) {
            assert_eq!(buffer.len(), 150);
            for (x, y) in buffer.positions() {
                assert!((0.0..=400.0).contains(&x), "x = {x}");
                assert!((0.0..=300.0).contains(&y), "y = {y}");
            }
        }
    }
}

#[test]
fn every_pair_runs_exactly_once_per_generation() {
    let params = SimulationParams {
        seed: Some(2),
        submission_order: SubmissionOrder::Shuffled,
        ..small_params(5, 20, 4)
    };
    let mut step = SimulationStep::new(&params).unwrap();

    for generation in 1..=10 {
        let report = step.run_generation().unwrap();
        assert_eq!(report.generation, generation);
        assert_eq!(report.jobs_completed, 25);
        assert_eq!(report.order.len(), 25);
        let distinct: HashSet<ClassPair> = report.order.iter().copied().collect();
        assert_eq!(distinct.len(), 25);
    }
}

#[test]
fn class_locks_are_never_shared() {
    for threads in [1, 2, 8] {
        let params = SimulationParams {
            seed: Some(3),
            submission_order: SubmissionOrder::Shuffled,
            ..small_params(6, 30, threads)
        };
        let mut step = SimulationStep::new(&params).unwrap();
        let generations = 50;
        for _ in 0..generations {
            step.run_generation().unwrap();
        }

        let field = step.state().field();
        assert_eq!(field.exclusion_violations(), 0, "{threads} threads");
        // K self jobs take one lock, K(K-1) cross jobs take two.
        let per_generation = 6 + 2 * 6 * 5;
        assert_eq!(field.acquisitions(), generations * per_generation);
    }
}

// ==================================================================================
// Serial equivalence
// ==================================================================================

#[test]
fn single_worker_matches_the_canonical_serial_run() {
    let params = small_params(4, 60, 1);
    let (concurrent, serial) = twin_states(&params, 10);

    let mut step = SimulationStep::from_state(concurrent, 1).unwrap();
    for _ in 0..15 {
        step.run_generation().unwrap();
        run_serial_generation(&serial).unwrap();
        assert_eq!(snapshots(step.state()), snapshots(&serial));
    }
}

#[test]
fn multi_worker_run_matches_a_serial_replay_of_its_order() {
    let params = small_params(5, 60, 4);
    let (concurrent, serial) = twin_states(&params, 20);

    let mut step = SimulationStep::from_state(concurrent, 4)
        .unwrap()
        .with_submission_order(SubmissionOrder::Shuffled, 99);
    for _ in 0..15 {
        let report = step.run_generation().unwrap();
        replay(&serial, &report.order).unwrap();
        assert_eq!(snapshots(step.state()), snapshots(&serial));
    }
}

#[test]
fn replay_rejects_unknown_classes() {
    let params = small_params(2, 5, 1);
    let (state, _) = twin_states(&params, 0);
    assert!(replay(&state, &[ClassPair::new(0, 2)]).is_err());
}

// ==================================================================================
// Worked example
// ==================================================================================

#[test]
fn two_single_particles_forty_apart() {
    let physics = Physics {
        cutoff_radius: 80.0,
        damping: 0.05,
        width: 1920.0,
        height: 1080.0,
    };
    let matrix = InteractionMatrix::from_rows(vec![vec![0.0, 10.0], vec![10.0, 0.0]]).unwrap();
    let field = ParticleField::from_buffers(vec![
        ClassBuffer::at_rest(&[(500.0, 300.0)]),
        ClassBuffer::at_rest(&[(524.0, 332.0)]),
    ])
    .unwrap();
    let state = SimulationState::new(physics, matrix, field).unwrap();

    // Only the 0<-1 job, so class 0 sees class 1 exactly where it started.
    replay(&state, &[ClassPair::new(0, 1)]).unwrap();
    let moved = state.field().snapshot(0).unwrap();

    let (dx, dy) = (500.0_f32 - 524.0, 300.0_f32 - 332.0);
    let d = (dx * dx + dy * dy).sqrt();
    assert!((d - 40.0).abs() < 1e-6);
    let force = 10.0 / d;
    assert!((force - 0.25).abs() < 1e-6);

    let expected_vx = (0.0 + force * dx) * 0.05;
    let expected_vy = (0.0 + force * dy) * 0.05;
    assert!((moved.vx[0] - expected_vx).abs() < 1e-4, "vx = {}", moved.vx[0]);
    assert!((moved.vy[0] - expected_vy).abs() < 1e-4, "vy = {}", moved.vy[0]);
    assert!((moved.vx[0] - -0.3).abs() < 1e-4);
    assert!((moved.vy[0] - -0.4).abs() < 1e-4);
}

// ==================================================================================
// Stress
// ==================================================================================

#[test]
fn thousand_shuffled_generations_do_not_deadlock() {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let params = SimulationParams {
            seed: Some(4),
            submission_order: SubmissionOrder::Shuffled,
            ..small_params(7, 6, 4)
        };
        let mut step = SimulationStep::new(&params).unwrap();
        for _ in 0..1000 {
            step.run_generation().unwrap();
        }
        let _ = tx.send((step.generation(), step.state().field().exclusion_violations()));
    });

    let (generations, violations) = rx
        .recv_timeout(Duration::from_secs(120))
        .expect("generations did not complete in time");
    assert_eq!(generations, 1000);
    assert_eq!(violations, 0);
}
