//! Self-scaling worker pool for gate.
//!
//! The pool owns a bounded set of workers, each a spawned task with a
//! single-slot private queue. Work is assigned to the most-recently-idle
//! worker; a new worker is created on demand up to the maximum, and a
//! periodic sweep reclaims workers idle past the window, down to the
//! minimum. Assignment never blocks the caller: the pool reports capacity
//! exhaustion synchronously and lets the caller decide whether to retry or
//! drop.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod pool;
pub mod task;

pub use error::WorkerPoolError;
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use task::{RecvTask, Task};
