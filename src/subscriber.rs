//! Background subscriber loop.
//!
//! # State Machine
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//! STARTING ──join ok──► JOINED ──► CONSUMING ──error/end──► REJOINING
//!    │                                 │
//!    │ shutdown or closed              │ shutdown or closed
//!    ▼                                 ▼
//! STOPPED ◄────────────────────── STOPPING
//! ```
//!
//! The first successful join opens the [`ReadinessGate`]; later joins leave
//! it untouched. Each delivered message is reported to the
//! [`DeliveryCounter`]. A message already received is always processed; the
//! shutdown signal is only observed while awaiting a join or a delivery, or
//! right after a consumption call returns.
//!
//! A closed client or group ends the loop without a rejoin, whether or not
//! shutdown was signalled. Counter underflow and an exhausted rejoin policy
//! are fatal and returned from [`Subscriber::run`]. Everything else is a
//! rejoin.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::broker::{GroupConsumer, GroupSession};
use crate::error::{ConsumeError, ExchangeError, ExchangeResult};
use crate::retry::{RejoinPolicy, RejoinSchedule};
use crate::sync::{DeliveryCounter, ReadinessGate};

/// Observable lifecycle of the subscriber loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Starting,
    Joined,
    Consuming,
    Rejoining,
    Stopping,
    Stopped,
}

/// Totals returned when the loop stops cleanly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberReport {
    /// Messages reported to the delivery counter.
    pub observed: u64,
    /// Successful group joins, including rejoins.
    pub joins: u32,
}

/// Why a consumption session stopped.
enum SessionEnd {
    Shutdown,
    Failed(ConsumeError),
    Closed(ConsumeError),
    Ended,
    Fatal(ExchangeError),
}

/// Group subscriber driving the readiness gate and the delivery counter.
pub struct Subscriber<C: ?Sized> {
    client: Arc<C>,
    group_id: String,
    topics: Vec<String>,
    gate: ReadinessGate,
    counter: DeliveryCounter,
    rejoin: RejoinPolicy,
    state: watch::Sender<SubscriberState>,
}

impl<C> Subscriber<C>
where
    C: GroupConsumer + ?Sized + 'static,
{
    pub fn new(
        client: Arc<C>,
        group_id: impl Into<String>,
        topic: impl Into<String>,
        gate: ReadinessGate,
        counter: DeliveryCounter,
    ) -> Self {
        let (state, _rx) = watch::channel(SubscriberState::Starting);
        Self {
            client,
            group_id: group_id.into(),
            topics: vec![topic.into()],
            gate,
            counter,
            rejoin: RejoinPolicy::default(),
            state,
        }
    }

    pub fn with_rejoin_policy(mut self, policy: RejoinPolicy) -> Self {
        self.rejoin = policy;
        self
    }

    /// Receiver for lifecycle transitions. Stays readable after the loop
    /// exits, holding [`SubscriberState::Stopped`].
    pub fn state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    /// Runs the loop on a new task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<ExchangeResult<SubscriberReport>> {
        let span = tracing::info_span!("subscriber", group = %self.group_id);
        tokio::spawn(self.run(shutdown).instrument(span))
    }

    /// Runs the loop until shutdown or a fatal error.
    pub async fn run(self, shutdown: CancellationToken) -> ExchangeResult<SubscriberReport> {
        if !self.rejoin.is_bounded() {
            tracing::debug!("Rejoin policy is unbounded; transient failures retry forever");
        }

        let mut report = SubscriberReport::default();
        let mut schedule = self.rejoin.schedule();

        let result = loop {
            self.set_state(SubscriberState::Starting);

            let joined = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                r = self.client.join(&self.group_id, &self.topics) => Some(r),
            };

            let mut session = match joined {
                None => break Ok(()),
                Some(Ok(session)) => session,
                Some(Err(e)) if shutdown.is_cancelled() => {
                    tracing::debug!(error = %e, "Join failed during shutdown");
                    break Ok(());
                }
                Some(Err(e)) if e.is_closed() => {
                    tracing::info!(error = %e, "Client closed; not rejoining");
                    break Ok(());
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Failed to join consumption group");
                    match self.pause_before_rejoin(&mut schedule, &shutdown, e).await {
                        Ok(true) => continue,
                        Ok(false) => break Ok(()),
                        Err(fatal) => break Err(fatal),
                    }
                }
            };

            report.joins += 1;
            schedule = self.rejoin.schedule();
            self.on_join(&*session, report.joins);

            self.set_state(SubscriberState::Consuming);
            let end = self
                .consume(&mut *session, &shutdown, &mut report)
                .await;

            let cause = match end {
                SessionEnd::Shutdown => {
                    self.set_state(SubscriberState::Stopping);
                    self.on_leave(session).await;
                    break Ok(());
                }
                SessionEnd::Closed(e) => {
                    tracing::info!(error = %e, "Client closed; not rejoining");
                    self.set_state(SubscriberState::Stopping);
                    self.on_leave(session).await;
                    break Ok(());
                }
                SessionEnd::Fatal(e) => {
                    self.set_state(SubscriberState::Stopping);
                    self.on_leave(session).await;
                    break Err(e);
                }
                SessionEnd::Failed(e) => {
                    tracing::warn!(error = %e, "Consumption session failed");
                    e
                }
                SessionEnd::Ended => {
                    tracing::info!("Consumption session ended");
                    ConsumeError::SessionInterrupted("session ended".to_string())
                }
            };

            session.leave().await;
            match self.pause_before_rejoin(&mut schedule, &shutdown, cause).await {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(fatal) => break Err(fatal),
            }
        };

        self.set_state(SubscriberState::Stopped);
        match result {
            Ok(()) => {
                tracing::info!(
                    observed = report.observed,
                    joins = report.joins,
                    "Subscriber stopped"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(error = %e, error_kind = e.as_label(), "Subscriber failed");
                Err(e)
            }
        }
    }

    async fn consume(
        &self,
        session: &mut dyn GroupSession,
        shutdown: &CancellationToken,
        report: &mut SubscriberReport,
    ) -> SessionEnd {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                d = session.next_message() => d,
            };

            let message = match delivery {
                Some(Ok(message)) => message,
                _ if shutdown.is_cancelled() => return SessionEnd::Shutdown,
                Some(Err(e)) if e.is_closed() => return SessionEnd::Closed(e),
                Some(Err(e)) => return SessionEnd::Failed(e),
                None => return SessionEnd::Ended,
            };

            tracing::info!(
                topic = %message.topic(),
                value = %message.value_lossy(),
                "Received message"
            );

            match self.counter.register_observed(1) {
                Ok(pending) => {
                    report.observed += 1;
                    tracing::debug!(pending, "Observation registered");
                }
                Err(e) => return SessionEnd::Fatal(e.into()),
            }
        }
    }

    fn on_join(&self, session: &dyn GroupSession, joins: u32) {
        self.set_state(SubscriberState::Joined);
        tracing::info!(
            member_id = %session.member_id(),
            joins,
            "Joined consumption group"
        );
        if self.gate.open() {
            tracing::info!("Subscriber ready");
        }
    }

    async fn on_leave(&self, session: Box<dyn GroupSession>) {
        let member_id = session.member_id().to_string();
        session.leave().await;
        tracing::info!(member_id = %member_id, "Left consumption group");
    }

    /// Returns `Ok(false)` if shutdown arrived while waiting.
    async fn pause_before_rejoin(
        &self,
        schedule: &mut RejoinSchedule,
        shutdown: &CancellationToken,
        cause: ConsumeError,
    ) -> ExchangeResult<bool> {
        self.set_state(SubscriberState::Rejoining);

        let Some(delay) = schedule.next_delay() else {
            return Err(ExchangeError::RejoinExhausted {
                attempts: schedule.attempts(),
                last_error: cause,
            });
        };

        if delay.is_zero() {
            tracing::warn!(error = %cause, "Rejoining consumption group immediately");
            // Keeps an immediate retry loop from starving other tasks.
            tokio::task::yield_now().await;
            return Ok(!shutdown.is_cancelled());
        }

        tracing::warn!(
            error = %cause,
            attempt = schedule.attempts(),
            delay_ms = delay.as_millis() as u64,
            "Rejoining consumption group after backoff"
        );
        tokio::select! {
            _ = shutdown.cancelled() => Ok(false),
            _ = tokio::time::sleep(delay) => Ok(true),
        }
    }

    fn set_state(&self, state: SubscriberState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::trace!(from = ?previous, to = ?state, "Subscriber state changed");
        }
    }
}
