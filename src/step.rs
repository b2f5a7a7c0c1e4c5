//! Per-frame driver: one job per ordered class pair, then the barrier.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::{SimulationParams, SubmissionOrder};
use crate::error::{Result, SimError};
use crate::field::{ParticleField, Physics};
use crate::matrix::InteractionMatrix;
use crate::pool::WorkerPool;

/// An ordered (target ← source) pair of classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassPair {
    pub target: usize,
    pub source: usize,
}

impl ClassPair {
    pub fn new(target: usize, source: usize) -> Self {
        Self { target, source }
    }
}

impl fmt::Display for ClassPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<-{}", self.target, self.source)
    }
}

/// Order in which critical sections ran during a generation.
type Trace = Mutex<Vec<ClassPair>>;

// ===================================================================================
// Simulation State
// ===================================================================================

/// Everything a generation reads or writes. Shared with jobs through an
/// `Arc`; the matrix and physics are immutable, the field locks per class.
pub struct SimulationState {
    physics: Physics,
    matrix: InteractionMatrix,
    field: ParticleField,
}

impl SimulationState {
    pub fn new(physics: Physics, matrix: InteractionMatrix, field: ParticleField) -> Result<Self> {
        if matrix.size() != field.num_classes() {
            return Err(SimError::MalformedMatrix(format!(
                "matrix is {0}x{0} but the field has {1} classes",
                matrix.size(),
                field.num_classes()
            )));
        }
        Ok(Self {
            physics,
            matrix,
            field,
        })
    }

    /// Random world and random coefficients, drawn from `rng` in that order.
    pub fn from_params<R: Rng + ?Sized>(params: &SimulationParams, rng: &mut R) -> Result<Self> {
        params.validate()?;
        let field = ParticleField::random(
            params.num_classes,
            params.particles_per_class,
            params.width,
            params.height,
            rng,
        )?;
        let matrix = InteractionMatrix::normal(
            params.num_classes,
            params.coefficient_mean,
            params.coefficient_std_dev,
            rng,
        )?;
        let physics = Physics {
            cutoff_radius: params.cutoff_radius,
            damping: params.damping,
            width: params.width,
            height: params.height,
        };
        Self::new(physics, matrix, field)
    }

    pub fn physics(&self) -> &Physics {
        &self.physics
    }

    pub fn matrix(&self) -> &InteractionMatrix {
        &self.matrix
    }

    pub fn field(&self) -> &ParticleField {
        &self.field
    }

    pub fn num_classes(&self) -> usize {
        self.field.num_classes()
    }

    /// Every ordered pair, row-major.
    pub fn pairs(&self) -> impl Iterator<Item = ClassPair> + use<> {
        let k = self.num_classes();
        (0..k).flat_map(move |target| (0..k).map(move |source| ClassPair::new(target, source)))
    }

    /// Runs one pair's critical section on the calling thread. The pair is
    /// appended to `trace` while both class locks are still held.
    fn interact(&self, pair: ClassPair, coefficient: f32, trace: Option<&Trace>) -> Result<()> {
        let mut guard = self.field.lock_pair(pair.target, pair.source)?;
        guard.apply_forces(coefficient, &self.physics);
        if let Some(trace) = trace {
            trace.lock().unwrap_or_else(PoisonError::into_inner).push(pair);
        }
        Ok(())
    }
}

/// Applies every pair of one generation on the calling thread, row-major.
pub fn run_serial_generation(state: &SimulationState) -> Result<()> {
    replay(state, &state.pairs().collect::<Vec<_>>())
}

/// Applies the given pairs on the calling thread, in order.
pub fn replay(state: &SimulationState, order: &[ClassPair]) -> Result<()> {
    order.iter().try_for_each(|&pair| {
        state.field.check_class(pair.target)?;
        state.field.check_class(pair.source)?;
        state.interact(pair, state.matrix.get(pair.target, pair.source), None)
    })
}

// ===================================================================================
// Jobs
// ===================================================================================

/// One pair's work, ready to hand to the pool.
pub struct InteractionJob {
    state: Arc<SimulationState>,
    pair: ClassPair,
    coefficient: f32,
}

impl InteractionJob {
    /// Rejects class ids the field does not have.
    pub fn new(state: Arc<SimulationState>, pair: ClassPair) -> Result<Self> {
        state.field.check_class(pair.target)?;
        state.field.check_class(pair.source)?;
        let coefficient = state.matrix.get(pair.target, pair.source);
        Ok(Self {
            state,
            pair,
            coefficient,
        })
    }

    pub fn pair(&self) -> ClassPair {
        self.pair
    }

    pub fn coefficient(&self) -> f32 {
        self.coefficient
    }

    fn run(self, trace: &Trace) {
        if let Err(err) = self.state.interact(self.pair, self.coefficient, Some(trace)) {
            log::error!("job {} did not run: {err}", self.pair);
        }
    }
}

// ===================================================================================
// Step Driver
// ===================================================================================

/// Outcome of one completed generation.
#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub generation: u64,
    pub jobs_completed: usize,
    /// Pairs in the order their critical sections ran. Replaying this order
    /// serially reproduces the generation exactly.
    pub order: Vec<ClassPair>,
    pub elapsed: Duration,
}

pub struct SimulationStep {
    state: Arc<SimulationState>,
    pool: WorkerPool,
    order: SubmissionOrder,
    rng: StdRng,
    trace: Arc<Trace>,
    generation: u64,
}

impl SimulationStep {
    /// Builds the world, the matrix and the pool from validated parameters.
    /// The same seed always yields the same world and matrix.
    pub fn new(params: &SimulationParams) -> Result<Self> {
        params.validate()?;
        let mut rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let state = SimulationState::from_params(params, &mut rng)?;
        let workers = params.resolved_worker_threads();
        log::info!(
            "simulation ready: {} classes x {} particles, {} workers, {:?} submission",
            params.num_classes,
            params.particles_per_class,
            workers,
            params.submission_order
        );

        let mut step = Self::from_state(state, workers)?;
        step.order = params.submission_order;
        step.rng = rng;
        Ok(step)
    }

    /// Wraps an explicit state, submitting in canonical order.
    pub fn from_state(state: SimulationState, num_workers: usize) -> Result<Self> {
        let pool = WorkerPool::new(num_workers)?;
        let capacity = state.num_classes() * state.num_classes();
        Ok(Self {
            state: Arc::new(state),
            pool,
            order: SubmissionOrder::Canonical,
            rng: StdRng::seed_from_u64(0),
            trace: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            generation: 0,
        })
    }

    /// Switches submission order; `seed` drives the shuffles.
    pub fn with_submission_order(mut self, order: SubmissionOrder, seed: u64) -> Self {
        self.order = order;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn num_workers(&self) -> usize {
        self.pool.num_workers()
    }

    /// Submits all K² pair jobs and blocks until every one has finished.
    ///
    /// Positions are only consistent after this returns; holding
    /// `&mut self` for the whole call keeps readers of [`Self::state`] out.
    pub fn run_generation(&mut self) -> Result<GenerationReport> {
        let started = Instant::now();
        self.generation += 1;

        let mut pairs: Vec<ClassPair> = self.state.pairs().collect();
        if self.order == SubmissionOrder::Shuffled {
            pairs.shuffle(&mut self.rng);
        }
        let expected = pairs.len();
        let jobs = pairs
            .into_iter()
            .map(|pair| InteractionJob::new(Arc::clone(&self.state), pair))
            .collect::<Result<Vec<_>>>()?;

        self.trace.lock().unwrap_or_else(PoisonError::into_inner).clear();
        for job in jobs {
            let trace = Arc::clone(&self.trace);
            self.pool.submit(move || job.run(&trace))?;
        }

        let completion = self.pool.join();
        let order = std::mem::take(&mut *self.trace.lock().unwrap_or_else(PoisonError::into_inner));

        if !completion.faults.is_empty() {
            return Err(SimError::JobFaults {
                generation: self.generation,
                faults: completion.faults,
            });
        }
        if completion.completed != expected || order.len() != expected {
            return Err(SimError::IncompleteGeneration {
                generation: self.generation,
                completed: completion.completed.min(order.len()),
                expected,
            });
        }

        let elapsed = started.elapsed();
        log::trace!("generation {} took {:?}", self.generation, elapsed);
        Ok(GenerationReport {
            generation: self.generation,
            jobs_completed: completion.completed,
            order,
            elapsed,
        })
    }
}
