//! Single-use readiness signal.
//!
//! The gate starts closed and opens exactly once. Opening it again is a
//! no-op. Every waiter, past and future, observes the open state.
//!
//! ```text
//! NOT_READY ──open()──► READY   (terminal)
//!                         │
//!                  wait() returns immediately
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{ExchangeError, ExchangeResult};

/// A one-shot broadcast "ready" flag.
///
/// Cheap to clone; clones share the same state.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    /// Creates a closed gate.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Opens the gate.
    ///
    /// Returns `true` if this call performed the transition, `false` if the
    /// gate was already open.
    pub fn open(&self) -> bool {
        self.tx.send_if_modified(|open| {
            if *open {
                false
            } else {
                *open = true;
                true
            }
        })
    }

    /// Returns true once the gate has been opened.
    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Suspends until the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Suspends until the gate is open or `deadline` elapses.
    ///
    /// `None` waits indefinitely.
    pub async fn wait_for(&self, deadline: Option<Duration>) -> ExchangeResult<()> {
        match deadline {
            None => {
                self.wait().await;
                Ok(())
            }
            Some(after) => tokio::time::timeout(after, self.wait())
                .await
                .map_err(|_| ExchangeError::DeadlineExceeded {
                    stage: "readiness",
                    after,
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_gate_is_closed() {
        assert!(!ReadinessGate::new().is_open());
    }

    #[test]
    fn test_open_is_idempotent() {
        let gate = ReadinessGate::new();
        assert!(gate.open());
        assert!(!gate.open());
        assert!(!gate.open());
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_open() {
        let gate = ReadinessGate::new();
        gate.open();
        tokio::time::timeout(Duration::from_millis(100), gate.wait())
            .await
            .expect("open gate must not block");
    }

    #[tokio::test]
    async fn test_all_waiters_unblock() {
        let gate = ReadinessGate::new();
        let mut waiters = Vec::new();
        for _ in 0..8 {
            let g = gate.clone();
            waiters.push(tokio::spawn(async move { g.wait().await }));
        }

        tokio::task::yield_now().await;
        gate.open();

        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .expect("waiter stuck")
                .expect("waiter panicked");
        }
    }

    #[tokio::test]
    async fn test_wait_for_deadline_expires() {
        let gate = ReadinessGate::new();
        let err = gate
            .wait_for(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::DeadlineExceeded {
                stage: "readiness",
                ..
            }
        ));
        assert!(!gate.is_open());
    }

    #[tokio::test]
    async fn test_wait_for_without_deadline_waits_for_open() {
        let gate = ReadinessGate::new();
        let opener = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            opener.open();
        });
        gate.wait_for(None).await.unwrap();
        assert!(gate.is_open());
    }
}
