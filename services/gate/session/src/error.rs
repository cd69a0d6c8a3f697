//! Session error types.

use thiserror::Error;

/// Errors surfaced by session operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// The outbound queue stayed full for every enqueue attempt
    #[error("send timed out: outbound queue full")]
    SendTimeout,

    /// The session is closed; no further sends are accepted
    #[error("session closed")]
    Closed,

    /// The caller-supplied encoder failed; nothing was enqueued
    #[error("message encode failed")]
    Encode(#[source] anyhow::Error),
}
