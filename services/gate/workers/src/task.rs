//! Units of deferred work executed by the pool.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use gate_session::SessionHooks;

use crate::{WorkerPool, WorkerPoolError};

/// A unit of deferred work: immutable once constructed, consumed exactly
/// once by a worker.
///
/// Errors are the task's own business: handle them inside `run` (log, or
/// surface through the owning session); the pool neither observes nor
/// retries failures.
#[async_trait]
pub trait Task: Send + 'static {
    /// Execute the task; the worker awaits completion before taking the
    /// next one.
    async fn run(self: Box<Self>);
}

/// A task that dispatches one inbound frame to a session's `on_recv` hook.
pub struct RecvTask<S: Send + Sync> {
    hooks: Arc<dyn SessionHooks<S>>,
    session: Arc<S>,
    data: Bytes,
}

impl<S: Send + Sync> RecvTask<S> {
    /// Bundle a hook set, the originating session, and the frame payload
    pub fn new(hooks: Arc<dyn SessionHooks<S>>, session: Arc<S>, data: Bytes) -> Self {
        Self {
            hooks,
            session,
            data,
        }
    }
}

#[async_trait]
impl<S: Send + Sync + 'static> Task for RecvTask<S> {
    async fn run(self: Box<Self>) {
        self.hooks.on_recv(&self.session, self.data).await;
    }
}

impl WorkerPool {
    /// Offload one `on_recv` dispatch to the pool.
    pub fn assign_recv<S: Send + Sync + 'static>(
        &self,
        hooks: Arc<dyn SessionHooks<S>>,
        session: Arc<S>,
        data: Bytes,
    ) -> Result<(), WorkerPoolError> {
        self.assign(Box::new(RecvTask::new(hooks, session, data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkerPoolConfig;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Stands in for a session; `RecvTask` is generic over the session type.
    struct FakeSession {
        name: &'static str,
    }

    struct CollectingHooks {
        received: Mutex<Vec<(&'static str, Bytes)>>,
    }

    #[async_trait]
    impl SessionHooks<FakeSession> for CollectingHooks {
        async fn on_recv(&self, session: &Arc<FakeSession>, data: Bytes) {
            self.received.lock().unwrap().push((session.name, data));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_assign_recv_invokes_bound_hook() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        let hooks = Arc::new(CollectingHooks {
            received: Mutex::new(Vec::new()),
        });
        let session = Arc::new(FakeSession { name: "alpha" });

        pool.assign_recv(
            Arc::clone(&hooks) as Arc<dyn SessionHooks<FakeSession>>,
            Arc::clone(&session),
            Bytes::from_static(b"payload"),
        )
        .unwrap();

        timeout(Duration::from_secs(2), async {
            loop {
                if !hooks.received.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("hook not invoked in time");

        let received = hooks.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "alpha");
        assert_eq!(received[0].1.as_ref(), b"payload");
    }
}
