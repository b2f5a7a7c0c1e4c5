//! Particle life: colored particle classes pulling and pushing on each other,
//! stepped once per frame by a fixed worker pool.
//!
//! [`SimulationStep::run_generation`] submits one job per ordered class pair
//! to a [`WorkerPool`] and waits for all of them. Each job holds the locks of
//! the classes it touches, taken in ascending class order.

pub mod app;
pub mod config;
pub mod error;
pub mod field;
pub mod matrix;
pub mod pool;
pub mod step;

pub use config::{SimulationParams, SubmissionOrder};
pub use error::{JobFault, SimError};
pub use field::{ClassBuffer, ParticleField, Physics, Source, apply_forces};
pub use matrix::{InteractionMatrix, MAX_COEFFICIENT};
pub use pool::{Completion, WorkerPool};
pub use step::{
    ClassPair, GenerationReport, InteractionJob, SimulationState, SimulationStep, replay,
    run_serial_generation,
};
