//! Task queues for engine work.
//!
//! State transitions that must never interleave (key rotation, scan-cycle
//! begin/end, wipes) go through a [`SequentialQueue`]; independent work goes
//! through a bounded [`WorkerPool`]. Both run jobs on tokio's blocking pool,
//! since every job touches storage synchronously.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};

/// Default number of concurrent pool workers.
pub const DEFAULT_WORKERS: usize = 16;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Errors from task submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The queue no longer accepts work.
    #[error("task queue is closed")]
    Closed,

    /// The job panicked or its result was dropped.
    #[error("task did not complete: {0}")]
    Join(String),
}

/// Runs jobs one at a time, in submission order.
#[derive(Debug, Clone)]
pub struct SequentialQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl SequentialQueue {
    /// Start the queue's drain task. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                if let Err(e) = tokio::task::spawn_blocking(job).await {
                    warn!(error = %e, "sequential job failed");
                }
            }
            debug!("sequential queue closed");
        });
        Self { sender }
    }

    /// Enqueue a job without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Closed`] once the drain task has stopped.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), TaskError> {
        self.sender
            .send(Box::new(job))
            .map_err(|_| TaskError::Closed)
    }

    /// Enqueue a job and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns a [`TaskError`] if the queue is closed or the job panicked.
    pub async fn run<T, F>(&self, f: F) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(move || {
            // The caller may have gone away.
            let _ = tx.send(f());
        })?;
        rx.await
            .map_err(|_| TaskError::Join("sequential job dropped its result".into()))
    }
}

/// Runs up to `size` jobs concurrently.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl WorkerPool {
    /// A pool with `size` workers (at least one).
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Configured worker count.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Workers currently idle.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `f` once a worker is free.
    ///
    /// # Errors
    ///
    /// Returns a [`TaskError`] if the pool is closed or the job panicked.
    pub async fn run<T, F>(&self, f: F) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TaskError::Closed)?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| TaskError::Join(e.to_string()))
    }
}

/// The pair of queues used by the runtime.
#[derive(Debug, Clone)]
pub struct TaskQueues {
    /// Ordered state transitions.
    pub sequential: SequentialQueue,
    /// Independent background work.
    pub pool: WorkerPool,
}

impl TaskQueues {
    /// Start both queues. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(workers: usize) -> Self {
        Self {
            sequential: SequentialQueue::spawn(),
            pool: WorkerPool::new(workers),
        }
    }
}
