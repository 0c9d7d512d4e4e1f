//! Default values for the exchange harness.
//!
//! Every value here can be overridden through
//! [`ExchangeConfig`](crate::config::ExchangeConfig) or its environment
//! variables.

use std::time::Duration;

// =============================================================================
// Broker Defaults
// =============================================================================

/// Bootstrap broker address list.
pub const DEFAULT_BROKERS: &str = "localhost:9092";

/// Client identifier reported to the broker.
pub const DEFAULT_CLIENT_ID: &str = "kafka-exchange";

// =============================================================================
// Topic Defaults
// =============================================================================

/// Topic provisioned and used for the exchange.
pub const DEFAULT_TOPIC: &str = "sample-message";

/// Partition count for a newly created topic.
pub const DEFAULT_PARTITIONS: i32 = 1;

/// Replication factor for a newly created topic.
pub const DEFAULT_REPLICATION_FACTOR: i16 = 1;

// =============================================================================
// Exchange Defaults
// =============================================================================

/// Consumption group joined by the subscriber loop.
pub const DEFAULT_GROUP_ID: &str = "group1";

/// Number of messages published per run.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Payload prefix; payloads are `"<prefix>-<ordinal>"`.
pub const DEFAULT_MESSAGE_PREFIX: &str = "message";

/// Upper bound on a single publish call before it counts as failed.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest batch accepted by config validation.
///
/// The harness is a bounded demonstration, not a load generator.
pub const MAX_BATCH_SIZE: usize = 10_000;

// =============================================================================
// Rejoin Defaults (hardened policy)
// =============================================================================

/// First delay before a rejoin attempt.
pub const DEFAULT_REJOIN_MIN_DELAY: Duration = Duration::from_millis(100);

/// Delay cap between rejoin attempts.
pub const DEFAULT_REJOIN_MAX_DELAY: Duration = Duration::from_secs(5);

/// Interval at which the Kafka backend checks for a partition assignment
/// while joining a group.
#[cfg(feature = "kafka")]
pub const ASSIGNMENT_POLL_INTERVAL: Duration = Duration::from_millis(100);
