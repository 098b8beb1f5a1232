//! Cooperative cancellation.
//!
//! A `CancelSignal` is a request, not an interruption: firing it never stops
//! running code. Handlers that want to stop early poll `is_cancelled` or
//! await `cancelled`; handlers that ignore it simply run to completion and
//! their result is discarded by whoever stopped waiting.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared, idempotent cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    /// Create a signal that has not fired.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn cancel(&self) -> bool {
        !self.tx.send_replace(true)
    }

    /// Check whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal fires.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as `self`, so this only returns on fire
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_idempotent() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        assert!(signal.cancel());
        assert!(!signal.cancel());
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_clones_observe_the_same_signal() {
        let signal = CancelSignal::new();
        let observer = signal.clone();

        let waiter = tokio::spawn(async move {
            observer.cancelled().await;
            observer.is_cancelled()
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        signal.cancel();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_after_fire() {
        let signal = CancelSignal::new();
        signal.cancel();
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .expect("already-fired signal should resolve immediately");
    }
}
