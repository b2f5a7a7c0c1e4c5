use std::fmt;

use thiserror::Error;

/// A panic captured at the job boundary by a pool worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFault {
    /// Name of the worker thread that ran the job.
    pub worker: String,
    /// Panic payload, if it was a string.
    pub message: String,
}

impl fmt::Display for JobFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.worker, self.message)
    }
}

/// Everything that can go wrong while building or stepping the simulation.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("malformed interaction matrix: {0}")]
    MalformedMatrix(String),

    #[error("class id {class} out of range for {num_classes} classes")]
    ClassOutOfRange { class: usize, num_classes: usize },

    #[error("failed to spawn worker thread {index}")]
    SpawnWorker {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("worker pool has been shut down")]
    PoolShutDown,

    #[error(
        "{count} job(s) faulted in generation {generation}, first: {first}",
        count = .faults.len(),
        first = first_fault(.faults)
    )]
    JobFaults { generation: u64, faults: Vec<JobFault> },

    #[error("generation {generation} completed {completed} of {expected} jobs")]
    IncompleteGeneration {
        generation: u64,
        completed: usize,
        expected: usize,
    },

    #[error("invalid distribution: {0}")]
    Distribution(String),
}

fn first_fault(faults: &[JobFault]) -> String {
    faults
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_owned())
}

pub type Result<T, E = SimError> = std::result::Result<T, E>;
