//! Graceful Shutdown Handling
//!
//! A shutdown signal is level-set: once triggered it stays triggered, and any
//! number of tasks can wait on it. Triggering stops the accept loop only;
//! live connections end through their own close paths.

use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::Result;

/// Clonable, level-set shutdown flag
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Raise the signal. Raising it again has no further effect.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal has been raised
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close underneath us.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns process signals into a shutdown trigger
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    signal: ShutdownSignal,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for components that need to observe shutdown
    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn trigger(&self) {
        self.signal.trigger();
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C, then trigger shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
                _ = self.signal.wait() => {
                    info!("Shutdown triggered internally");
                }
            }
        }

        #[cfg(windows)]
        {
            tokio::select! {
                result = signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
                _ = self.signal.wait() => {
                    info!("Shutdown triggered internally");
                }
            }
        }

        self.signal.trigger();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_signal_starts_untriggered() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(timeout(Duration::from_millis(20), signal.wait()).await.is_err());
    }

    #[tokio::test]
    async fn test_trigger_is_seen_by_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();

        let waiter = tokio::spawn(async move { clone.wait().await });
        sleep(Duration::from_millis(20)).await;
        signal.trigger();

        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.trigger();
        timeout(Duration::from_millis(100), signal.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn test_coordinator_returns_on_internal_trigger() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();

        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            signal.trigger();
        });

        timeout(Duration::from_secs(1), coordinator.listen_for_signals())
            .await
            .unwrap()
            .unwrap();
        assert!(coordinator.signal().is_triggered());
    }
}
