use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reason recorded when a run outlives its overall deadline.
pub const TIMEOUT_REASON: &str = "timeout";

/// Cancellation for one run.
///
/// The first caller to cancel decides the reason; later calls are no-ops.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::from_token(CancellationToken::new())
    }

    /// Wrap an existing token, e.g. a child of the orchestrator's shutdown
    /// token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Request cancellation. Returns true if this call set the reason.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let won = self.reason.set(reason.into()).is_ok();
        self.token.cancel();
        won
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why the run was cancelled. A parent token cancelled without a reason
    /// reports `shutdown`.
    pub fn reason(&self) -> Option<String> {
        match self.reason.get() {
            Some(reason) => Some(reason.clone()),
            None if self.token.is_cancelled() => Some("shutdown".to_string()),
            None => None,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Cancel with [`TIMEOUT_REASON`] once `after` elapses. Dropping the
    /// returned guard disarms the timer.
    pub fn cancel_after(&self, after: Duration) -> DeadlineGuard {
        let signal = self.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    if signal.cancel(TIMEOUT_REASON) {
                        debug!(after_ms = after.as_millis() as u64, "Run deadline reached");
                    }
                }
                _ = signal.cancelled() => {}
            }
        });
        DeadlineGuard { handle }
    }
}

pub struct DeadlineGuard {
    handle: JoinHandle<()>,
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let signal = CancelSignal::new();
        assert_eq!(signal.reason(), None);
        assert!(signal.cancel("user"));
        assert!(!signal.cancel(TIMEOUT_REASON));
        assert!(signal.is_cancelled());
        assert_eq!(signal.reason().as_deref(), Some("user"));
    }

    #[test]
    fn test_parent_cancellation_reads_as_shutdown() {
        let parent = CancellationToken::new();
        let signal = CancelSignal::from_token(parent.child_token());
        parent.cancel();
        assert!(signal.is_cancelled());
        assert_eq!(signal.reason().as_deref(), Some("shutdown"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_with_timeout() {
        let signal = CancelSignal::new();
        let _deadline = signal.cancel_after(Duration::from_secs(5));
        signal.cancelled().await;
        assert_eq!(signal.reason().as_deref(), Some(TIMEOUT_REASON));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_deadline_never_fires() {
        let signal = CancelSignal::new();
        drop(signal.cancel_after(Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!signal.is_cancelled());
    }
}
