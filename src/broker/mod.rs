//! Broker client contract.
//!
//! The harness talks to the message broker only through these traits, so
//! the coordinator can run against a real cluster or an in-memory double.
//!
//! # Trait Hierarchy
//!
//! - [`TopicAdmin`]: topic provisioning
//! - [`MessagePublisher`]: single-message publish
//! - [`GroupConsumer`]: consumption-group join, yielding a [`GroupSession`]
//! - [`BrokerClient`]: all of the above plus `close()`
//!
//! # Available Implementations
//!
//! - [`InMemoryBroker`]: deterministic single-partition broker for tests
//! - [`KafkaBroker`](kafka::KafkaBroker): `rdkafka` backend (feature `kafka`)

use async_trait::async_trait;

use crate::error::{AdminError, ConsumeError, PublishError};
use crate::types::{Ack, Message, Provisioned, TopicSpec};

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

pub use memory::{BrokerEvent, FaultPlan, InMemoryBroker, MemoryOptions};

/// Topic administration.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// Creates a topic.
    ///
    /// Returns [`AdminError::AlreadyExists`] if the topic is present.
    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), AdminError>;
}

/// Single-message publish.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Sends one message, waiting for the broker acknowledgement.
    async fn publish(&self, message: Message) -> Result<Ack, PublishError>;
}

/// Consumption-group membership.
#[async_trait]
pub trait GroupConsumer: Send + Sync {
    /// Joins `group_id` subscribed to `topics`.
    ///
    /// Resolves once the member has an assignment and delivery can begin.
    async fn join(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Box<dyn GroupSession>, ConsumeError>;
}

/// One membership in a consumption group, from join until the session ends.
#[async_trait]
pub trait GroupSession: Send {
    /// Broker-assigned member identifier.
    fn member_id(&self) -> &str;

    /// Awaits the next delivery.
    ///
    /// `None` means the session ended (e.g. rebalance) and the caller should
    /// rejoin. The future is cancel-safe: dropping it never loses a message.
    async fn next_message(&mut self) -> Option<Result<Message, ConsumeError>>;

    /// Ends the session and leaves the group.
    async fn leave(self: Box<Self>);
}

/// Full broker client used by the coordinator.
#[async_trait]
pub trait BrokerClient: TopicAdmin + MessagePublisher + GroupConsumer {
    /// Releases the client. Safe to call more than once.
    async fn close(&self);
}

/// Creates `spec`, treating "already exists" as success.
pub async fn create_topic_if_absent<A>(
    admin: &A,
    spec: &TopicSpec,
) -> Result<Provisioned, AdminError>
where
    A: TopicAdmin + ?Sized,
{
    spec.validate()?;

    match admin.create_topic(spec).await {
        Ok(()) => {
            tracing::info!(
                topic = %spec.name,
                partitions = spec.partitions,
                replication_factor = spec.replication_factor,
                "Created topic"
            );
            Ok(Provisioned::Created)
        }
        Err(AdminError::AlreadyExists(_)) => {
            tracing::info!(
                topic = %spec.name,
                "Skip creating topic because it already exists"
            );
            Ok(Provisioned::AlreadyExists)
        }
        Err(e) => Err(e),
    }
}
