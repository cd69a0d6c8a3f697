//! Session runtime for gate: per-connection pipelines, lifecycle hooks, and
//! the process-wide session registry.
//!
//! This crate provides the two session variants and the registry that tracks
//! them:
//!
//! - **Stream sessions**: raw byte-stream connections with three cooperating
//!   pumps (read, parse/dispatch, write), bounded queues with explicit
//!   backpressure, and length-prefixed framing from `gate-wire`
//! - **Framed sessions**: message-oriented transports that deliver one
//!   complete frame per read, with heartbeat tracking and registry-driven
//!   authentication state
//! - **Session registry**: connected/online tables mutated only through a
//!   serialized command loop, with periodic heartbeat-timeout sweeps
//! - **Lifecycle hooks**: one `SessionHooks` implementation bound per
//!   session at construction, invoked by the runtime
//!
//! Teardown is idempotent in both variants: whichever pipeline detects a
//! failure first triggers cancellation, and the close sequence runs exactly
//! once.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod error;
pub mod framed;
pub mod hooks;
pub mod registry;
pub mod stream;

mod pump;

// Re-export main types
pub use cancel::CancelToken;
pub use error::SessionError;
pub use framed::{
    FrameSink, FrameSource, FramedConfig, FramedSession, HEARTBEAT_TIMEOUT, SEND_RETRY_ATTEMPTS,
};
pub use hooks::SessionHooks;
pub use registry::{ManagedSession, RegistryConfig, SessionRegistry};
pub use stream::{SessionStats, StreamConfig, StreamSession};

/// Capacity of a session's inbound frame queue
pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Capacity of a session's outbound frame queue
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Hand out the next process-unique connection serial.
///
/// The serial identifies a session for its whole life, independent of the
/// logical id assigned at authentication (which is 0 until login).
pub(crate) fn next_sid() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT_SID: AtomicU64 = AtomicU64::new(1);
    NEXT_SID.fetch_add(1, Ordering::Relaxed)
}
