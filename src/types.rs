//! Value types exchanged with the broker client.

use bytes::Bytes;

use crate::error::AdminError;

/// Layout of a topic to provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i16,
}

impl TopicSpec {
    /// Creates a validated topic spec.
    pub fn new(
        name: impl Into<String>,
        partitions: i32,
        replication_factor: i16,
    ) -> Result<Self, AdminError> {
        let spec = Self {
            name: name.into(),
            partitions,
            replication_factor,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Checks that the name is non-empty and both counts are positive.
    pub fn validate(&self) -> Result<(), AdminError> {
        if self.name.trim().is_empty() {
            return Err(AdminError::InvalidSpec("topic name is empty".to_string()));
        }
        if self.partitions < 1 {
            return Err(AdminError::InvalidSpec(format!(
                "partitions ({}) must be positive",
                self.partitions
            )));
        }
        if self.replication_factor < 1 {
            return Err(AdminError::InvalidSpec(format!(
                "replication_factor ({}) must be positive",
                self.replication_factor
            )));
        }
        Ok(())
    }
}

/// Outcome of an idempotent topic creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// The topic was created by this call.
    Created,
    /// The topic was already present; nothing changed.
    AlreadyExists,
}

/// An immutable message.
///
/// The key only influences partition routing. Messages carry no identity
/// beyond their value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    key: Option<Bytes>,
    value: Bytes,
}

impl Message {
    /// Creates an unkeyed message.
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: value.into(),
        }
    }

    /// Returns a copy of this message routed by `key`.
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Value rendered as UTF-8 for logs, lossy on invalid bytes.
    pub fn value_lossy(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Broker acknowledgement for a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub partition: i32,
    pub offset: i64,
}

/// Formats the tagged payload for `ordinal` (1-based).
pub fn tagged_payload(prefix: &str, ordinal: usize) -> String {
    format!("{prefix}-{ordinal}")
}
