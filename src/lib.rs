//! # kafka-exchange
//! Bounded at-least-once message exchange harness for Kafka-compatible brokers.
//!
//! A run provisions a topic, starts a background group subscriber, waits
//! until that subscriber has joined its group, publishes a fixed batch of
//! tagged messages, and returns once every accepted message has been
//! observed. The subscriber is then shut down and the broker client closed.
//!
//! Two primitives enforce the ordering, independent of message order within
//! the topic:
//! - [`ReadinessGate`](sync::ReadinessGate): nothing is published before the
//!   subscriber's first join
//! - [`DeliveryCounter`](sync::DeliveryCounter): the run does not finish
//!   before every accepted message was observed
//!
//! ## Getting started
//! ```rust
//! use std::sync::Arc;
//! use kafka_exchange::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ExchangeError> {
//!     let broker = Arc::new(InMemoryBroker::new());
//!     let report = Coordinator::new(ExchangeConfig::default(), broker).run().await?;
//!     assert_eq!(report.sent, 5);
//!     assert_eq!(report.observed, 5);
//!     Ok(())
//! }
//! ```
//!
//! Enable the `kafka` feature for [`KafkaBroker`](broker::kafka::KafkaBroker),
//! which talks to a real cluster through librdkafka.

#![forbid(unsafe_code)]

pub mod broker;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod publisher;
pub mod retry;
pub mod subscriber;
pub mod sync;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Main exports for running an exchange.
    pub use crate::broker::{
        BrokerClient, GroupConsumer, GroupSession, InMemoryBroker, MessagePublisher, TopicAdmin,
        create_topic_if_absent,
    };
    pub use crate::config::{ExchangeConfig, OffsetReset, RebalanceStrategy};
    pub use crate::coordinator::{Coordinator, ExchangeReport};
    pub use crate::error::{
        AdminError, ConsumeError, CounterError, ExchangeError, ExchangeResult, PublishError,
    };
    pub use crate::retry::{RejoinPolicy, hardened_policy};
    pub use crate::subscriber::{Subscriber, SubscriberReport, SubscriberState};
    pub use crate::sync::{DeliveryCounter, ReadinessGate};
    pub use crate::types::{Ack, Message, Provisioned, TopicSpec};

    pub use bytes;
}
