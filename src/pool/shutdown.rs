//! Cooperative shutdown signal threaded through every suspension point.

use crate::models::{EngineError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cloneable cancellation flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of self, so this only
        // returns once the flag flips.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Sleep unless shutdown arrives first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return self.check();
        }
        tokio::select! {
            _ = self.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Run `fut` unless shutdown arrives first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(EngineError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// `Err(Cancelled)` if shutdown was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_interrupted_by_trigger() {
        let signal = ShutdownSignal::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });

        let result = signal.sleep(Duration::from_secs(30)).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_run_completes_without_trigger() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.run(async { 7 }).await.unwrap(), 7);
        assert!(signal.check().is_ok());
    }

    #[tokio::test]
    async fn test_run_after_trigger_is_cancelled() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let result = signal.run(std::future::pending::<()>()).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
