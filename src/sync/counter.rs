//! Outstanding-delivery counter.
//!
//! Tracks messages that were sent but not yet observed by the subscriber.
//! The publisher side only adds, the subscriber side only subtracts, and the
//! coordinator waits for the count to reach zero.
//!
//! ## Reservations
//! A real broker can hand a message to the consumer before the producer has
//! seen its acknowledgement. [`DeliveryCounter::reserve`] counts the message
//! as pending before the send, so an early observation never underflows:
//!
//! ```text
//! reserve()  ──► pending += 1
//!   send ok  ──► confirm()   (stays pending until observed)
//!   send err ──► withdraw()  pending -= 1
//! ```
//!
//! ## Rules
//! - `pending` never goes below zero; an over-report returns
//!   [`CounterError::Underflow`] and leaves the counter untouched.
//! - Totals (`sent`, `observed`) are monotonic.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{CounterError, ExchangeError, ExchangeResult};

#[derive(Debug)]
struct Inner {
    pending: watch::Sender<u64>,
    sent: AtomicU64,
    observed: AtomicU64,
}

/// Concurrency-safe counter of sent-but-unobserved messages.
///
/// Cheap to clone; clones share the same state.
#[derive(Debug, Clone)]
pub struct DeliveryCounter {
    inner: Arc<Inner>,
}

impl Default for DeliveryCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryCounter {
    /// Creates a counter at zero.
    pub fn new() -> Self {
        let (pending, _rx) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner {
                pending,
                sent: AtomicU64::new(0),
                observed: AtomicU64::new(0),
            }),
        }
    }

    /// Registers `n` successfully sent messages. Returns the new pending count.
    pub fn register_sent(&self, n: u64) -> u64 {
        let pending = self.add_pending(n);
        self.inner.sent.fetch_add(n, Ordering::AcqRel);
        pending
    }

    /// Registers `n` observed messages. Returns the new pending count.
    ///
    /// Fails without modifying the counter if fewer than `n` messages are
    /// pending.
    pub fn register_observed(&self, n: u64) -> Result<u64, CounterError> {
        let pending = self.sub_pending(n)?;
        self.inner.observed.fetch_add(n, Ordering::AcqRel);
        Ok(pending)
    }

    /// Counts one message as pending ahead of its send.
    pub fn reserve(&self) -> SendReservation<'_> {
        self.add_pending(1);
        SendReservation {
            counter: self,
            settled: false,
        }
    }

    pub fn pending(&self) -> u64 {
        *self.inner.pending.borrow()
    }

    /// Total messages registered as sent.
    pub fn sent(&self) -> u64 {
        self.inner.sent.load(Ordering::Acquire)
    }

    /// Total messages registered as observed.
    pub fn observed(&self) -> u64 {
        self.inner.observed.load(Ordering::Acquire)
    }

    pub fn is_drained(&self) -> bool {
        self.pending() == 0
    }

    /// Suspends until pending reaches zero.
    pub async fn wait_drained(&self) {
        let mut rx = self.inner.pending.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }

    /// Suspends until drained or `deadline` elapses. `None` waits indefinitely.
    pub async fn wait_drained_for(&self, deadline: Option<Duration>) -> ExchangeResult<()> {
        match deadline {
            None => {
                self.wait_drained().await;
                Ok(())
            }
            Some(after) => tokio::time::timeout(after, self.wait_drained())
                .await
                .map_err(|_| ExchangeError::DeadlineExceeded {
                    stage: "drain",
                    after,
                }),
        }
    }

    fn add_pending(&self, n: u64) -> u64 {
        let mut current = 0;
        self.inner.pending.send_modify(|pending| {
            *pending = pending.saturating_add(n);
            current = *pending;
        });
        current
    }

    fn sub_pending(&self, n: u64) -> Result<u64, CounterError> {
        let mut outcome = Ok(0);
        self.inner.pending.send_if_modified(|pending| {
            if *pending < n {
                outcome = Err(CounterError::Underflow {
                    pending: *pending,
                    requested: n,
                });
                false
            } else {
                *pending -= n;
                outcome = Ok(*pending);
                true
            }
        });
        outcome
    }
}

/// One message counted as pending before its send completed.
///
/// Dropping an unsettled reservation withdraws it.
#[must_use = "a reservation is withdrawn when dropped unconfirmed"]
#[derive(Debug)]
pub struct SendReservation<'a> {
    counter: &'a DeliveryCounter,
    settled: bool,
}

impl SendReservation<'_> {
    /// The send succeeded; the message stays pending until observed.
    pub fn confirm(mut self) {
        self.settled = true;
        self.counter.inner.sent.fetch_add(1, Ordering::AcqRel);
    }

    /// The send failed; the message no longer counts toward the target.
    pub fn withdraw(self) {}
}

impl Drop for SendReservation<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Err(e) = self.counter.sub_pending(1) {
            // Only reachable if the broker delivered a message whose send failed.
            tracing::error!(error = %e, "Withdrawn reservation was already observed");
        }
    }
}
