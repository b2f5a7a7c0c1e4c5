//! Simulation parameters and their validation.
//!
//! Parameters can be built in code, loaded from a YAML file, or edited in
//! the Display's side panel while the simulation is stopped. Any field left
//! out of a YAML file takes its reference value:
//!
//! ```yaml
//! num_classes: 7
//! particles_per_class: 1500
//! width: 1920.0
//! height: 1080.0
//! cutoff_radius: 80.0
//! damping: 0.05
//! coefficient_mean: -15.0
//! coefficient_std_dev: 15.0
//! worker_threads: 8        # omit for host parallelism
//! seed: 42                 # omit for a fresh random world
//! submission_order: shuffled
//! ```

use serde::Deserialize;

use crate::error::{Result, SimError};

// ===================================================================================
// Default Constants (reference configuration)
// ===================================================================================

pub const DEFAULT_NUM_CLASSES: usize = 7;
pub const DEFAULT_PARTICLES_PER_CLASS: usize = 1500;
pub const DEFAULT_WIDTH: f32 = 1920.0;
pub const DEFAULT_HEIGHT: f32 = 1080.0;
pub const DEFAULT_CUTOFF_RADIUS: f32 = 80.0;
pub const DEFAULT_DAMPING: f32 = 0.05;
pub const DEFAULT_COEFFICIENT_MEAN: f32 = -15.0;
pub const DEFAULT_COEFFICIENT_STD_DEV: f32 = 15.0;

/// Order in which a generation's jobs are handed to the pool.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionOrder {
    /// Row-major over (target, source).
    #[default]
    Canonical,
    /// A fresh permutation every generation.
    Shuffled,
}

/// Configuration chosen before the simulation starts.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationParams {
    pub num_classes: usize,
    pub particles_per_class: usize,
    pub width: f32,
    pub height: f32,
    pub cutoff_radius: f32,
    pub damping: f32,
    pub coefficient_mean: f32,
    pub coefficient_std_dev: f32,
    /// `None` means host parallelism.
    pub worker_threads: Option<usize>,
    pub seed: Option<u64>,
    pub submission_order: SubmissionOrder,
}

impl Default for SimulationParams {
    fn default() -> Self {
        SimulationParams {
            num_classes: DEFAULT_NUM_CLASSES,
            particles_per_class: DEFAULT_PARTICLES_PER_CLASS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            cutoff_radius: DEFAULT_CUTOFF_RADIUS,
            damping: DEFAULT_DAMPING,
            coefficient_mean: DEFAULT_COEFFICIENT_MEAN,
            coefficient_std_dev: DEFAULT_COEFFICIENT_STD_DEV,
            worker_threads: None,
            seed: None,
            submission_order: SubmissionOrder::Canonical,
        }
    }
}

impl SimulationParams {
    /// Worker count after resolving the host-parallelism default.
    pub fn resolved_worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get)
    }

    /// Rejects values the simulation cannot run with. Nothing is clamped.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(invalid("num_classes must be at least 1"));
        }
        if self.particles_per_class == 0 {
            return Err(invalid("particles_per_class must be at least 1"));
        }
        positive("width", self.width)?;
        positive("height", self.height)?;
        positive("cutoff_radius", self.cutoff_radius)?;
        if !(0.0..=1.0).contains(&self.damping) {
            return Err(invalid(format!(
                "damping must be in [0, 1], got {}",
                self.damping
            )));
        }
        if !self.coefficient_mean.is_finite() {
            return Err(invalid("coefficient_mean must be finite"));
        }
        if !self.coefficient_std_dev.is_finite() || self.coefficient_std_dev < 0.0 {
            return Err(invalid(format!(
                "coefficient_std_dev must be finite and non-negative, got {}",
                self.coefficient_std_dev
            )));
        }
        if self.worker_threads == Some(0) {
            return Err(invalid("worker_threads must be at least 1"));
        }
        Ok(())
    }
}

fn positive(name: &str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be finite and positive, got {value}")))
    }
}

fn invalid(message: impl Into<String>) -> SimError {
    SimError::InvalidConfig(message.into())
}
