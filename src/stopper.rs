//! One-shot cooperative cancellation signal shared by a task and everything
//! working on its behalf (executor, readers, timer, dispatcher finalizers).

use tokio_util::sync::CancellationToken;

/// Cheaply cloneable; every clone observes the same stop.
#[derive(Debug, Clone, Default)]
pub struct Stopper {
    token: CancellationToken,
}

impl Stopper {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Fire the stop. Idempotent — later calls are no-ops.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once `stop()` has been called (possibly already has been).
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }

    /// A child token that is cancelled whenever this one is, but can also be
    /// cancelled independently without affecting siblings.
    pub fn child(&self) -> CancellationToken {
        self.token.child_token()
    }
}
