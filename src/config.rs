//! Configuration for an exchange run.
//!
//! [`ExchangeConfig`] is read once at startup and handed to the
//! [`Coordinator`](crate::coordinator::Coordinator) by value. Nothing reads
//! configuration after that point.
//!
//! ```rust,no_run
//! use kafka_exchange::config::ExchangeConfig;
//!
//! let config = ExchangeConfig::from_env().expect("invalid configuration");
//! assert!(config.validate().is_ok());
//! ```

use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_BROKERS, DEFAULT_CLIENT_ID, DEFAULT_GROUP_ID,
    DEFAULT_MESSAGE_PREFIX, DEFAULT_PARTITIONS, DEFAULT_PUBLISH_TIMEOUT,
    DEFAULT_REJOIN_MAX_DELAY, DEFAULT_REJOIN_MIN_DELAY, DEFAULT_REPLICATION_FACTOR,
    DEFAULT_TOPIC, MAX_BATCH_SIZE,
};
use crate::error::ExchangeError;
use crate::retry::RejoinPolicy;
use crate::types::TopicSpec;

/// Where a group with no committed offset starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    /// Only messages produced after the group joined.
    #[default]
    Latest,
    /// Everything retained in the topic.
    Earliest,
}

impl OffsetReset {
    /// Value for the Kafka `auto.offset.reset` property.
    pub fn as_kafka_value(&self) -> &'static str {
        match self {
            OffsetReset::Latest => "latest",
            OffsetReset::Earliest => "earliest",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "latest" | "newest" => Ok(OffsetReset::Latest),
            "earliest" | "oldest" => Ok(OffsetReset::Earliest),
            other => Err(format!("unknown offset reset '{other}'")),
        }
    }
}

/// Partition assignment strategy requested when joining a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebalanceStrategy {
    #[default]
    RoundRobin,
    Range,
}

impl RebalanceStrategy {
    /// Value for the Kafka `partition.assignment.strategy` property.
    pub fn as_kafka_value(&self) -> &'static str {
        match self {
            RebalanceStrategy::RoundRobin => "roundrobin",
            RebalanceStrategy::Range => "range",
        }
    }
}

impl FromStr for RebalanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "roundrobin" => Ok(RebalanceStrategy::RoundRobin),
            "range" => Ok(RebalanceStrategy::Range),
            other => Err(format!("unknown rebalance strategy '{other}'")),
        }
    }
}

/// Immutable settings for one exchange run.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Bootstrap broker addresses.
    pub brokers: Vec<String>,

    /// Client identifier reported to the broker.
    pub client_id: String,

    /// Topic to provision and exchange messages on.
    pub topic: TopicSpec,

    /// Consumption group joined by the subscriber.
    pub group_id: String,

    /// Messages to publish.
    pub batch_size: usize,

    /// Payload prefix; payloads are `"<prefix>-<ordinal>"`.
    pub message_prefix: String,

    /// Start position for a group without committed offsets.
    pub offset_reset: OffsetReset,

    /// Partition assignment strategy.
    pub rebalance: RebalanceStrategy,

    /// Pacing and limit for subscriber rejoins.
    pub rejoin: RejoinPolicy,

    /// Bound on the wait for the subscriber's first join (`None` = forever).
    pub readiness_timeout: Option<Duration>,

    /// Bound on the wait for every sent message to be observed
    /// (`None` = forever).
    pub drain_timeout: Option<Duration>,

    /// Bound on a single publish call.
    pub publish_timeout: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            brokers: vec![DEFAULT_BROKERS.to_string()],
            client_id: DEFAULT_CLIENT_ID.to_string(),
            topic: TopicSpec {
                name: DEFAULT_TOPIC.to_string(),
                partitions: DEFAULT_PARTITIONS,
                replication_factor: DEFAULT_REPLICATION_FACTOR,
            },
            group_id: DEFAULT_GROUP_ID.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            message_prefix: DEFAULT_MESSAGE_PREFIX.to_string(),
            offset_reset: OffsetReset::default(),
            rebalance: RebalanceStrategy::default(),
            rejoin: RejoinPolicy::default(),
            readiness_timeout: None,
            drain_timeout: None,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

impl ExchangeConfig {
    /// Broker list joined for the Kafka `bootstrap.servers` property.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Validates the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.brokers.is_empty() || self.brokers.iter().any(|b| b.trim().is_empty()) {
            errors.push("brokers must be a non-empty list of addresses".to_string());
        }

        if let Err(e) = self.topic.validate() {
            errors.push(e.to_string());
        }

        if self.group_id.trim().is_empty() {
            errors.push("group_id must not be empty".to_string());
        }

        if self.batch_size > MAX_BATCH_SIZE {
            errors.push(format!(
                "batch_size ({}) must not exceed {}",
                self.batch_size, MAX_BATCH_SIZE
            ));
        }

        if self.message_prefix.is_empty() {
            errors.push("message_prefix must not be empty".to_string());
        }

        if self.publish_timeout.is_zero() {
            errors.push("publish_timeout must be greater than zero".to_string());
        }

        if let RejoinPolicy::Backoff {
            min_delay,
            max_delay,
            ..
        } = self.rejoin
        {
            if min_delay > max_delay {
                errors.push(format!(
                    "rejoin min_delay ({min_delay:?}) must not exceed max_delay ({max_delay:?})"
                ));
            }
        }

        for (name, timeout) in [
            ("readiness_timeout", self.readiness_timeout),
            ("drain_timeout", self.drain_timeout),
        ] {
            if timeout.is_some_and(|t| t.is_zero()) {
                errors.push(format!("{name} must be greater than zero when set"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// Environment variables:
    /// - `KAFKA_BROKERS`: Comma-separated broker list (default: localhost:9092)
    /// - `CLIENT_ID`: Client identifier (default: kafka-exchange)
    /// - `TOPIC`: Topic name (default: sample-message)
    /// - `TOPIC_PARTITIONS`: Partitions for a new topic (default: 1)
    /// - `TOPIC_REPLICATION_FACTOR`: Replication for a new topic (default: 1)
    /// - `GROUP_ID`: Consumption group (default: group1)
    /// - `BATCH_SIZE`: Messages to publish (default: 5)
    /// - `MESSAGE_PREFIX`: Payload prefix (default: message)
    /// - `OFFSET_RESET`: "latest" or "earliest" (default: latest)
    /// - `REBALANCE_STRATEGY`: "roundrobin" or "range" (default: roundrobin)
    /// - `PUBLISH_TIMEOUT_MS`: Per-publish bound (default: 5000)
    /// - `READINESS_TIMEOUT_MS`: Readiness bound (default: unset, wait forever)
    /// - `DRAIN_TIMEOUT_MS`: Drain bound (default: unset, wait forever)
    ///
    /// Rejoin pacing:
    /// - `REJOIN_MAX_RETRIES`: Enables exponential backoff with this retry cap
    ///   (default: unset, unbounded immediate rejoin)
    /// - `REJOIN_MIN_DELAY_MS`: First backoff delay (default: 100)
    /// - `REJOIN_MAX_DELAY_MS`: Backoff cap (default: 5000)
    pub fn from_env() -> Result<Self, ExchangeError> {
        let defaults = Self::default();

        let brokers = match std::env::var("KAFKA_BROKERS") {
            Ok(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => defaults.brokers,
        };

        let client_id = std::env::var("CLIENT_ID").unwrap_or(defaults.client_id);
        let group_id = std::env::var("GROUP_ID").unwrap_or(defaults.group_id);
        let message_prefix = std::env::var("MESSAGE_PREFIX").unwrap_or(defaults.message_prefix);

        let topic = TopicSpec {
            name: std::env::var("TOPIC").unwrap_or(defaults.topic.name),
            partitions: parse_env("TOPIC_PARTITIONS")?.unwrap_or(defaults.topic.partitions),
            replication_factor: parse_env("TOPIC_REPLICATION_FACTOR")?
                .unwrap_or(defaults.topic.replication_factor),
        };

        let batch_size = parse_env("BATCH_SIZE")?.unwrap_or(defaults.batch_size);
        let offset_reset = parse_env("OFFSET_RESET")?.unwrap_or(defaults.offset_reset);
        let rebalance = parse_env("REBALANCE_STRATEGY")?.unwrap_or(defaults.rebalance);

        let publish_timeout = parse_env::<u64>("PUBLISH_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.publish_timeout);
        let readiness_timeout =
            parse_env::<u64>("READINESS_TIMEOUT_MS")?.map(Duration::from_millis);
        let drain_timeout = parse_env::<u64>("DRAIN_TIMEOUT_MS")?.map(Duration::from_millis);

        let rejoin = match parse_env::<u32>("REJOIN_MAX_RETRIES")? {
            None => RejoinPolicy::Unbounded,
            Some(max_retries) => RejoinPolicy::Backoff {
                min_delay: parse_env::<u64>("REJOIN_MIN_DELAY_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_REJOIN_MIN_DELAY),
                max_delay: parse_env::<u64>("REJOIN_MAX_DELAY_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_REJOIN_MAX_DELAY),
                max_retries,
                jitter: true,
            },
        };

        let config = Self {
            brokers,
            client_id,
            topic,
            group_id,
            batch_size,
            message_prefix,
            offset_reset,
            rebalance,
            rejoin,
            readiness_timeout,
            drain_timeout,
            publish_timeout,
        };

        config
            .validate()
            .map_err(|errors| ExchangeError::Config(errors.join("; ")))?;

        Ok(config)
    }
}

/// Parses an optional environment variable, failing on malformed values.
fn parse_env<T>(key: &str) -> Result<Option<T>, ExchangeError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ExchangeError::Config(format!("{key}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
