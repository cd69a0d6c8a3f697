//! Worker pool error types.

use thiserror::Error;

/// Errors surfaced by [`WorkerPool::assign`](crate::WorkerPool::assign)
#[derive(Error, Debug)]
pub enum WorkerPoolError {
    /// No idle worker and the pool is at its maximum size
    #[error("too many workers (max {0})")]
    TooManyWorkers(usize),

    /// The pool has been stopped; stop is terminal
    #[error("worker pool stopped")]
    Stopped,

    /// An acquired worker refused the task; the task was dropped
    #[error("worker unavailable")]
    WorkerUnavailable,
}
