//! Lifecycle hooks bound to a session.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// Lifecycle callbacks for a session of type `S`.
///
/// Exactly one implementation is bound per session, at construction. The
/// runtime invokes `on_start` when the pipelines come up, `on_recv` once per
/// complete inbound frame, and `on_stop` exactly once during teardown.
/// Implementations must not block indefinitely; a stalled hook stalls the
/// pipeline that invoked it.
#[async_trait]
pub trait SessionHooks<S: Send + Sync>: Send + Sync {
    /// Invoked once when the session's pipelines start
    async fn on_start(&self, _session: &Arc<S>) {}

    /// Invoked with each complete inbound frame body
    async fn on_recv(&self, _session: &Arc<S>, _data: Bytes) {}

    /// Invoked exactly once during session teardown
    async fn on_stop(&self, _session: &Arc<S>) {}
}
