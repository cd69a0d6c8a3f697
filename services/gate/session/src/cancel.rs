//! Cooperative cancellation shared by a session's pipelines.

use std::sync::Arc;

use tokio::sync::watch;

/// A clonable cancellation token.
///
/// Cancellation is cooperative: pumps observe the token at their next
/// suspension point, nothing is preempted mid-operation. `cancel` is
/// idempotent and may be called from any pipeline or from outside the
/// session.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create a token in the not-cancelled state
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger cancellation; later calls are no-ops
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation has been triggered
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once cancellation is triggered; resolves immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        token.cancel();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_after_cancel() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel(); // idempotent

        timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("already-cancelled token must resolve at once");
    }
}
