//! Fixed-size worker pool with a completion barrier.
//!
//! Workers drain a shared FIFO queue. Completion is tracked with an explicit
//! in-flight count that is incremented on [`WorkerPool::submit`] and
//! decremented only after a job's body has returned, so [`WorkerPool::join`]
//! never mistakes an empty queue for finished work.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::{JobFault, Result, SimError};

/// A unit of work accepted by the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// What happened between two barriers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Jobs whose bodies finished, faulted ones included.
    pub completed: usize,
    pub faults: Vec<JobFault>,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    in_flight: usize,
    completed: usize,
    faults: Vec<JobFault>,
    should_terminate: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    jobs_available: Condvar,
    jobs_done: Condvar,
}

impl Shared {
    // Job bodies never run under this lock, so poisoning can only come from
    // a panic in the pool's own bookkeeping; the state is still consistent.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `num_workers` threads. Fails if the count is zero or a thread
    /// cannot be created; already-spawned workers are shut down first.
    pub fn new(num_workers: usize) -> Result<Self> {
        if num_workers == 0 {
            return Err(SimError::InvalidConfig(
                "worker pool needs at least one thread".to_owned(),
            ));
        }

        let mut pool = WorkerPool {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState::default()),
                jobs_available: Condvar::new(),
                jobs_done: Condvar::new(),
            }),
            workers: Vec::with_capacity(num_workers),
        };

        for index in 0..num_workers {
            let shared = Arc::clone(&pool.shared);
            let spawned = thread::Builder::new()
                .name(format!("particle-worker-{index}"))
                .spawn(move || worker_loop(&shared));
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(source) => {
                    pool.shutdown();
                    return Err(SimError::SpawnWorker { index, source });
                }
            }
        }

        log::debug!("worker pool started with {num_workers} threads");
        Ok(pool)
    }

    /// One worker per logical CPU.
    pub fn with_default_parallelism() -> Result<Self> {
        Self::new(num_cpus::get())
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues a job and wakes one idle worker. Never waits for execution.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            if state.should_terminate {
                return Err(SimError::PoolShutDown);
            }
            state.jobs.push_back(Box::new(job));
            state.in_flight += 1;
        }
        self.shared.jobs_available.notify_one();
        Ok(())
    }

    /// Blocks until every job submitted since the last barrier has finished
    /// executing, then reports and resets the completion counters.
    pub fn join(&self) -> Completion {
        let guard = self.shared.lock();
        let mut state = self
            .shared
            .jobs_done
            .wait_while(guard, |state| state.in_flight > 0)
            .unwrap_or_else(PoisonError::into_inner);
        Completion {
            completed: std::mem::take(&mut state.completed),
            faults: std::mem::take(&mut state.faults),
        }
    }

    /// Stops and joins every worker. Only call between barriers; jobs still
    /// queued are dropped unexecuted. Calling it again is a no-op.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        {
            let mut state = self.shared.lock();
            state.should_terminate = true;
        }
        self.shared.jobs_available.notify_all();

        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_owned();
            if handle.join().is_err() {
                log::error!("{name} exited abnormally");
            }
        }

        let mut state = self.shared.lock();
        let dropped = state.jobs.len();
        state.in_flight -= dropped;
        state.jobs.clear();
        drop(state);
        self.shared.jobs_done.notify_all();
        if dropped > 0 {
            log::warn!("worker pool shut down with {dropped} queued job(s) unexecuted");
        }
        log::debug!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.join();
        }
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    let worker = thread::current().name().unwrap_or("worker").to_owned();
    loop {
        let job = {
            let guard = shared.lock();
            let mut state = shared
                .jobs_available
                .wait_while(guard, |state| state.jobs.is_empty() && !state.should_terminate)
                .unwrap_or_else(PoisonError::into_inner);
            if state.should_terminate {
                return;
            }
            match state.jobs.pop_front() {
                Some(job) => job,
                None => continue,
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(job));

        let mut state = shared.lock();
        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            log::error!("job panicked on {worker}: {message}");
            state.faults.push(JobFault {
                worker: worker.clone(),
                message,
            });
        }
        state.completed += 1;
        state.in_flight -= 1;
        if state.in_flight == 0 {
            shared.jobs_done.notify_all();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
