//! Error types for the exchange harness.
//!
//! # Error Hierarchy
//!
//! Broker collaborator errors are split by operation so callers can match on
//! exactly the outcomes each call can produce:
//!
//! - [`AdminError`]: topic provisioning
//! - [`PublishError`]: message publish
//! - [`ConsumeError`]: group join and message delivery
//!
//! Synchronization contract violations surface as [`CounterError`].
//!
//! [`ExchangeError`] is the run-level error returned by the
//! [`Coordinator`](crate::coordinator::Coordinator). Broker errors convert
//! into it via `From` so they propagate with `?`.
//!
//! # Handling Policy
//!
//! | Error | Where | Handling |
//! |-------|-------|----------|
//! | [`AdminError::AlreadyExists`] | provisioning | treated as success |
//! | other [`AdminError`] | provisioning | fatal, run aborts |
//! | [`PublishError`] | publisher | logged, message skipped |
//! | [`ConsumeError`] (shutdown active, closed) | subscriber | loop stops |
//! | [`ConsumeError`] (otherwise) | subscriber | logged, rejoin |
//! | [`CounterError`] | subscriber | fatal for the loop |

use std::time::Duration;

use thiserror::Error;

/// Result type for run-level operations.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Errors returned by topic administration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminError {
    /// The topic already exists on the broker.
    #[error("Topic '{0}' already exists")]
    AlreadyExists(String),

    /// The requested topic layout was rejected.
    #[error("Invalid topic spec: {0}")]
    InvalidSpec(String),

    /// The client was closed before the call.
    #[error("Admin client closed")]
    ClientClosed,

    /// Any other broker-reported failure.
    #[error("Broker admin error: {0}")]
    Broker(String),
}

/// Errors returned by a publish call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The client was closed before the call.
    #[error("Producer client closed")]
    ClientClosed,

    /// The target topic does not exist.
    #[error("Unknown topic '{0}'")]
    UnknownTopic(String),

    /// Any other broker-reported failure.
    #[error("Broker publish error: {0}")]
    Broker(String),
}

/// Errors returned while joining a group or awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumeError {
    /// The underlying client was closed.
    #[error("Consumer client closed")]
    ClientClosed,

    /// The consumption group was closed.
    #[error("Consumer group closed")]
    GroupClosed,

    /// The session was interrupted (rebalance, network blip).
    #[error("Session interrupted: {0}")]
    SessionInterrupted(String),

    /// Any other broker-reported failure.
    #[error("Broker consume error: {0}")]
    Broker(String),
}

impl ConsumeError {
    /// Returns true for the "client closed" and "group closed" conditions.
    ///
    /// These terminate the subscriber loop when shutdown has been requested.
    pub fn is_closed(&self) -> bool {
        matches!(self, ConsumeError::ClientClosed | ConsumeError::GroupClosed)
    }

    /// Returns true if a rejoin may succeed.
    pub fn is_retriable(&self) -> bool {
        !self.is_closed()
    }
}

/// Delivery counter contract violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CounterError {
    /// More observations were reported than sends were registered.
    #[error("Delivery counter underflow: {requested} observed with only {pending} pending")]
    Underflow { pending: u64, requested: u64 },
}

/// Run-level errors surfaced by the coordinator.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The broker client could not be constructed.
    #[error("Client initialization failed: {0}")]
    ClientInit(String),

    /// Topic provisioning failed for a reason other than "already exists".
    #[error("Topic provisioning failed: {0}")]
    Provision(#[from] AdminError),

    /// A bounded wait expired.
    #[error("Deadline exceeded waiting for {stage} after {after:?}")]
    DeadlineExceeded { stage: &'static str, after: Duration },

    /// The subscriber loop exited before the coordinator finished waiting.
    #[error("Subscriber stopped unexpectedly: {0}")]
    SubscriberStopped(String),

    /// The hardened rejoin policy ran out of attempts.
    #[error("Rejoin attempts exhausted after {attempts} attempts: {last_error}")]
    RejoinExhausted {
        attempts: u32,
        last_error: ConsumeError,
    },

    /// A delivery counter contract violation.
    #[error(transparent)]
    Counter(#[from] CounterError),
}

impl ExchangeError {
    /// Returns a short stable label (snake_case) for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ExchangeError::Config(_) => "config",
            ExchangeError::ClientInit(_) => "client_init",
            ExchangeError::Provision(_) => "provision",
            ExchangeError::DeadlineExceeded { .. } => "deadline_exceeded",
            ExchangeError::SubscriberStopped(_) => "subscriber_stopped",
            ExchangeError::RejoinExhausted { .. } => "rejoin_exhausted",
            ExchangeError::Counter(_) => "counter_underflow",
        }
    }

    /// Returns true for errors raised before any message was exchanged.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            ExchangeError::Config(_) | ExchangeError::ClientInit(_) | ExchangeError::Provision(_)
        )
    }
}
