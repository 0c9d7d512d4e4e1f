//! Exchange orchestration.
//!
//! ```text
//! provision ─► spawn subscriber ─► wait(gate) ─► publish ─► wait(drained)
//!                                                               │
//!                         close client ◄─ join subscriber ◄─ shutdown
//! ```
//!
//! Once the subscriber is spawned, every exit path (success, deadline,
//! subscriber failure) still runs shutdown, join and close, in that order.
//! The client is closed exactly once per run.
//!
//! The gate and drain waits race against the subscriber task: if the loop
//! exits first, the run fails with the loop's error (or
//! [`ExchangeError::SubscriberStopped`]) instead of waiting forever.

use std::future::Future;
use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerClient, create_topic_if_absent};
use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, ExchangeResult};
use crate::publisher::Publisher;
use crate::subscriber::{Subscriber, SubscriberReport};
use crate::sync::{DeliveryCounter, ReadinessGate};
use crate::types::Provisioned;

type SubscriberHandle = JoinHandle<ExchangeResult<SubscriberReport>>;

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeReport {
    pub provisioned: Provisioned,
    /// Batch size requested from the publisher.
    pub requested: usize,
    /// Messages the broker accepted.
    pub sent: usize,
    /// Messages the subscriber observed.
    pub observed: u64,
    /// Successful group joins, including rejoins.
    pub joins: u32,
}

/// Runs one exchange against a broker client.
pub struct Coordinator<C: ?Sized> {
    config: ExchangeConfig,
    client: Arc<C>,
}

impl<C> Coordinator<C>
where
    C: BrokerClient + ?Sized + 'static,
{
    pub fn new(config: ExchangeConfig, client: Arc<C>) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    #[tracing::instrument(
        skip(self),
        fields(topic = %self.config.topic.name, group = %self.config.group_id)
    )]
    pub async fn run(&self) -> ExchangeResult<ExchangeReport> {
        let provisioned = match create_topic_if_absent(self.client.as_ref(), &self.config.topic).await
        {
            Ok(provisioned) => provisioned,
            Err(e) => {
                let err = ExchangeError::from(e);
                tracing::error!(error = %err, error_kind = err.as_label(), "Startup failed");
                self.client.close().await;
                return Err(err);
            }
        };

        let gate = ReadinessGate::new();
        let counter = DeliveryCounter::new();
        let shutdown = CancellationToken::new();

        let subscriber = Subscriber::new(
            Arc::clone(&self.client),
            self.config.group_id.clone(),
            self.config.topic.name.clone(),
            gate.clone(),
            counter.clone(),
        )
        .with_rejoin_policy(self.config.rejoin);
        let mut handle = Some(subscriber.spawn(shutdown.clone()));

        let outcome = self.exchange(&gate, &counter, &mut handle).await;

        tracing::info!("Signalling subscriber shutdown");
        shutdown.cancel();
        let stopped = match handle.take() {
            Some(h) => Some(settle(h.await)),
            None => None,
        };
        self.client.close().await;
        tracing::info!("Broker client closed");

        let sent = match outcome {
            Ok(sent) => sent,
            Err(e) => {
                if let Some(Err(sub_err)) = &stopped {
                    tracing::warn!(error = %sub_err, "Subscriber also failed during shutdown");
                }
                tracing::error!(error = %e, error_kind = e.as_label(), "Exchange failed");
                return Err(e);
            }
        };

        let sub_report = match stopped {
            Some(result) => result?,
            None => {
                return Err(ExchangeError::SubscriberStopped(
                    "subscriber result already consumed".to_string(),
                ));
            }
        };

        let report = ExchangeReport {
            provisioned,
            requested: self.config.batch_size,
            sent,
            observed: sub_report.observed,
            joins: sub_report.joins,
        };
        tracing::info!(
            requested = report.requested,
            sent = report.sent,
            observed = report.observed,
            joins = report.joins,
            "Exchange complete"
        );
        Ok(report)
    }

    async fn exchange(
        &self,
        gate: &ReadinessGate,
        counter: &DeliveryCounter,
        handle: &mut Option<SubscriberHandle>,
    ) -> ExchangeResult<usize> {
        guarded(gate.wait_for(self.config.readiness_timeout), handle).await?;
        tracing::info!("Subscriber ready, publishing batch");

        let publisher = Publisher::new(Arc::clone(&self.client), counter.clone())
            .with_prefix(self.config.message_prefix.clone());
        let sent = publisher
            .publish_batch(&self.config.topic.name, self.config.batch_size)
            .await;

        tracing::info!(pending = counter.pending(), "Waiting for deliveries");
        guarded(counter.wait_drained_for(self.config.drain_timeout), handle).await?;
        Ok(sent)
    }
}

/// Awaits `wait`, failing early if the subscriber task exits first.
///
/// Clears `handle` when the task's result was consumed here.
async fn guarded<F>(wait: F, handle: &mut Option<SubscriberHandle>) -> ExchangeResult<()>
where
    F: Future<Output = ExchangeResult<()>>,
{
    let Some(task) = handle.as_mut() else {
        return Err(ExchangeError::SubscriberStopped(
            "subscriber is not running".to_string(),
        ));
    };

    let joined = tokio::select! {
        biased;
        result = wait => return result,
        joined = task => joined,
    };
    *handle = None;

    Err(match settle(joined) {
        Ok(report) => ExchangeError::SubscriberStopped(format!(
            "loop exited after {} observations",
            report.observed
        )),
        Err(e) => e,
    })
}

fn settle(
    joined: Result<ExchangeResult<SubscriberReport>, JoinError>,
) -> ExchangeResult<SubscriberReport> {
    joined.map_err(|e| ExchangeError::SubscriberStopped(format!("subscriber task failed: {e}")))?
}
