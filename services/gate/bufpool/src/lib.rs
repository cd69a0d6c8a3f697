//! Reusable byte buffers for the gate receive path.
//!
//! This crate provides a small pool of growable buffers so that the hot
//! receive path does not allocate per message. Ownership is strict: a
//! [`Buffer`] is moved out of the pool by [`BufferPool::get`] and moved back
//! by [`BufferPool::put`]; holding any view of it after `put` is impossible
//! by construction, since the same storage may immediately back another
//! reader.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod pool;

pub use buffer::{Buffer, DEFAULT_BUFFER_CAPACITY};
pub use pool::{BufferPool, BufferPoolStats};
