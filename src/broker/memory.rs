//! In-memory broker for tests and offline runs.
//!
//! Each topic is a single append-only log regardless of its declared
//! partition count. Consumption groups keep a committed offset per topic,
//! advanced as each message is handed to a session, so a rejoining member
//! resumes exactly where the previous session stopped.
//!
//! Every externally visible action is appended to an event journal
//! ([`BrokerEvent`]) so tests can assert on ordering, e.g. that no message
//! was published before the first join.
//!
//! Faults are injected up front with a [`FaultPlan`]:
//!
//! ```rust
//! use kafka_exchange::broker::{FaultPlan, InMemoryBroker};
//!
//! let broker = InMemoryBroker::with_faults(
//!     FaultPlan::default()
//!         .fail_publish(2)
//!         .fail_first_joins(1)
//!         .interrupt_after(3),
//! );
//! # drop(broker);
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use super::{BrokerClient, GroupConsumer, GroupSession, MessagePublisher, TopicAdmin};
use crate::config::OffsetReset;
use crate::constants::DEFAULT_CLIENT_ID;
use crate::error::{AdminError, ConsumeError, PublishError};
use crate::types::{Ack, Message, TopicSpec};

/// Journal entry recorded by [`InMemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    TopicCreated { topic: String },
    JoinRejected { group: String },
    Joined { group: String, member: String },
    Published { topic: String, value: String, offset: i64 },
    PublishRejected { value: String },
    Delivered { member: String, value: String },
    Interrupted { member: String },
    Left { member: String },
    Closed,
}

/// Faults injected into an [`InMemoryBroker`].
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Publish attempts (1-based, counted across the broker) that fail.
    pub failing_publishes: BTreeSet<u64>,

    /// Number of initial join attempts that fail.
    pub failing_joins: u32,

    /// When set, every join attempt fails.
    pub reject_all_joins: bool,

    /// Ends the first session with an interruption after this many
    /// deliveries.
    pub interrupt_after: Option<u64>,
}

impl FaultPlan {
    /// Fails the publish attempt with this 1-based ordinal.
    pub fn fail_publish(mut self, attempt: u64) -> Self {
        self.failing_publishes.insert(attempt);
        self
    }

    pub fn fail_first_joins(mut self, n: u32) -> Self {
        self.failing_joins = n;
        self
    }

    pub fn reject_all_joins(mut self) -> Self {
        self.reject_all_joins = true;
        self
    }

    pub fn interrupt_after(mut self, deliveries: u64) -> Self {
        self.interrupt_after = Some(deliveries);
        self
    }
}

/// Construction options for [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    pub client_id: String,
    pub offset_reset: OffsetReset,
    pub faults: FaultPlan,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            offset_reset: OffsetReset::Latest,
            faults: FaultPlan::default(),
        }
    }
}

#[derive(Debug, Default)]
struct TopicLog {
    partitions: i32,
    messages: Vec<Message>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, TopicLog>,
    // (group, topic) -> next offset to deliver
    offsets: HashMap<(String, String), usize>,
    events: Vec<BrokerEvent>,
    publish_attempts: u64,
    join_attempts: u32,
    sessions: u32,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    options: MemoryOptions,
    state: Mutex<State>,
    appended: watch::Sender<u64>,
    closed: CancellationToken,
}

/// Deterministic broker double. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_options(MemoryOptions::default())
    }

    pub fn with_faults(faults: FaultPlan) -> Self {
        Self::with_options(MemoryOptions {
            faults,
            ..Default::default()
        })
    }

    pub fn with_options(options: MemoryOptions) -> Self {
        let (appended, _rx) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                options,
                state: Mutex::new(State::default()),
                appended,
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Snapshot of the event journal.
    pub async fn events(&self) -> Vec<BrokerEvent> {
        self.shared.state.lock().await.events.clone()
    }

    /// Values currently stored in `topic`, in log order.
    pub async fn log_values(&self, topic: &str) -> Vec<String> {
        let state = self.shared.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|log| log.messages.iter().map(Message::value_lossy).collect())
            .unwrap_or_default()
    }

    /// Declared partition count of `topic`, if it exists.
    pub async fn partitions(&self, topic: &str) -> Option<i32> {
        let state = self.shared.state.lock().await;
        state.topics.get(topic).map(|log| log.partitions)
    }

    /// Next offset `group` will receive from `topic`, once it has joined.
    pub async fn committed_offset(&self, group: &str, topic: &str) -> Option<usize> {
        let state = self.shared.state.lock().await;
        state
            .offsets
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }

    pub async fn join_attempts(&self) -> u32 {
        self.shared.state.lock().await.join_attempts
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

#[async_trait]
impl TopicAdmin for InMemoryBroker {
    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), AdminError> {
        spec.validate()?;
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(AdminError::ClientClosed);
        }
        if state.topics.contains_key(&spec.name) {
            return Err(AdminError::AlreadyExists(spec.name.clone()));
        }
        state.topics.insert(
            spec.name.clone(),
            TopicLog {
                partitions: spec.partitions,
                messages: Vec::new(),
            },
        );
        state.events.push(BrokerEvent::TopicCreated {
            topic: spec.name.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn publish(&self, message: Message) -> Result<Ack, PublishError> {
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(PublishError::ClientClosed);
        }

        state.publish_attempts += 1;
        let attempt = state.publish_attempts;
        if self.shared.options.faults.failing_publishes.contains(&attempt) {
            state.events.push(BrokerEvent::PublishRejected {
                value: message.value_lossy(),
            });
            return Err(PublishError::Broker(format!(
                "injected failure on publish #{attempt}"
            )));
        }

        let value = message.value_lossy();
        let topic = message.topic().to_string();
        let log = state
            .topics
            .get_mut(&topic)
            .ok_or_else(|| PublishError::UnknownTopic(topic.clone()))?;
        let offset = log.messages.len() as i64;
        log.messages.push(message);
        state.events.push(BrokerEvent::Published {
            topic,
            value,
            offset,
        });

        // Bumped under the lock so a session that checked the log while
        // holding it cannot miss the wakeup.
        self.shared.appended.send_modify(|n| *n += 1);

        Ok(Ack {
            partition: 0,
            offset,
        })
    }
}

#[async_trait]
impl GroupConsumer for InMemoryBroker {
    async fn join(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Box<dyn GroupSession>, ConsumeError> {
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(ConsumeError::ClientClosed);
        }

        state.join_attempts += 1;
        let faults = &self.shared.options.faults;
        if faults.reject_all_joins || state.join_attempts <= faults.failing_joins {
            state.events.push(BrokerEvent::JoinRejected {
                group: group_id.to_string(),
            });
            return Err(ConsumeError::Broker(format!(
                "group coordinator unavailable (attempt {})",
                state.join_attempts
            )));
        }

        let topic = match topics {
            [topic] => topic.clone(),
            _ => {
                return Err(ConsumeError::Broker(format!(
                    "expected exactly one topic, got {}",
                    topics.len()
                )));
            }
        };
        let log_end = state
            .topics
            .get(&topic)
            .map(|log| log.messages.len())
            .ok_or_else(|| ConsumeError::Broker(format!("unknown topic '{topic}'")))?;

        let start = match self.shared.options.offset_reset {
            OffsetReset::Latest => log_end,
            OffsetReset::Earliest => 0,
        };
        state
            .offsets
            .entry((group_id.to_string(), topic.clone()))
            .or_insert(start);

        state.sessions += 1;
        let member_id = format!("{}-{}", self.shared.options.client_id, state.sessions);
        let interrupt_after = faults.interrupt_after.filter(|_| state.sessions == 1);

        state.events.push(BrokerEvent::Joined {
            group: group_id.to_string(),
            member: member_id.clone(),
        });

        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            appended: self.shared.appended.subscribe(),
            group: group_id.to_string(),
            topic,
            member_id,
            delivered: 0,
            interrupt_after,
            ended: false,
        }))
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn close(&self) {
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        state.events.push(BrokerEvent::Closed);
        self.shared.closed.cancel();
    }
}

struct MemorySession {
    shared: Arc<Shared>,
    appended: watch::Receiver<u64>,
    group: String,
    topic: String,
    member_id: String,
    delivered: u64,
    interrupt_after: Option<u64>,
    ended: bool,
}

#[async_trait]
impl GroupSession for MemorySession {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    async fn next_message(&mut self) -> Option<Result<Message, ConsumeError>> {
        loop {
            if self.ended {
                return None;
            }

            {
                let mut state = self.shared.state.lock().await;
                if state.closed {
                    return Some(Err(ConsumeError::ClientClosed));
                }

                if self.interrupt_after.is_some_and(|n| self.delivered >= n) {
                    self.ended = true;
                    state.events.push(BrokerEvent::Interrupted {
                        member: self.member_id.clone(),
                    });
                    return Some(Err(ConsumeError::SessionInterrupted(
                        "group rebalance in progress".to_string(),
                    )));
                }

                let _ = self.appended.borrow_and_update();

                let key = (self.group.clone(), self.topic.clone());
                let offset = state.offsets.get(&key).copied().unwrap_or_default();
                let next = state
                    .topics
                    .get(&self.topic)
                    .and_then(|log| log.messages.get(offset))
                    .cloned();

                if let Some(message) = next {
                    state.offsets.insert(key, offset + 1);
                    state.events.push(BrokerEvent::Delivered {
                        member: self.member_id.clone(),
                        value: message.value_lossy(),
                    });
                    self.delivered += 1;
                    return Some(Ok(message));
                }
            }

            tokio::select! {
                _ = self.shared.closed.cancelled() => {}
                changed = self.appended.changed() => {
                    if changed.is_err() {
                        return Some(Err(ConsumeError::ClientClosed));
                    }
                }
            }
        }
    }

    async fn leave(self: Box<Self>) {
        let mut state = self.shared.state.lock().await;
        state.events.push(BrokerEvent::Left {
            member: self.member_id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn broker_with_topic(options: MemoryOptions) -> InMemoryBroker {
        let broker = InMemoryBroker::with_options(options);
        broker
            .create_topic(&TopicSpec::new("t", 1, 1).unwrap())
            .await
            .unwrap();
        broker
    }

    fn topics() -> Vec<String> {
        vec!["t".to_string()]
    }

    #[tokio::test]
    async fn test_create_existing_topic_reports_already_exists() {
        let broker = broker_with_topic(MemoryOptions::default()).await;
        let err = broker
            .create_topic(&TopicSpec::new("t", 3, 1).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, AdminError::AlreadyExists("t".into()));
        assert_eq!(broker.partitions("t").await, Some(1));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_topic() {
        let broker = InMemoryBroker::new();
        let err = broker
            .publish(Message::new("missing", "x"))
            .await
            .unwrap_err();
        assert_eq!(err, PublishError::UnknownTopic("missing".into()));
    }

    #[tokio::test]
    async fn test_latest_reset_skips_earlier_messages() {
        let broker = broker_with_topic(MemoryOptions::default()).await;
        broker.publish(Message::new("t", "before")).await.unwrap();

        let mut session = broker.join("g", &topics()).await.unwrap();
        let ack = broker.publish(Message::new("t", "after")).await.unwrap();
        assert_eq!(ack.offset, 1);

        let msg = session.next_message().await.unwrap().unwrap();
        assert_eq!(msg.value_lossy(), "after");
    }

    #[tokio::test]
    async fn test_earliest_reset_replays_log() {
        let broker = broker_with_topic(MemoryOptions {
            offset_reset: OffsetReset::Earliest,
            ..Default::default()
        })
        .await;
        broker.publish(Message::new("t", "before")).await.unwrap();

        let mut session = broker.join("g", &topics()).await.unwrap();
        let msg = session.next_message().await.unwrap().unwrap();
        assert_eq!(msg.value_lossy(), "before");
    }

    #[tokio::test]
    async fn test_waiting_session_wakes_on_publish() {
        let broker = broker_with_topic(MemoryOptions::default()).await;
        let mut session = broker.join("g", &topics()).await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(Message::new("t", "late")).await.unwrap();
        });

        let msg = tokio::time::timeout(Duration::from_secs(1), session.next_message())
            .await
            .expect("session never woke")
            .unwrap()
            .unwrap();
        assert_eq!(msg.value_lossy(), "late");
    }

    #[tokio::test]
    async fn test_rejoin_resumes_from_committed_offset() {
        let broker = broker_with_topic(MemoryOptions {
            faults: FaultPlan::default().interrupt_after(2),
            ..Default::default()
        })
        .await;
        let mut first = broker.join("g", &topics()).await.unwrap();
        for i in 1..=4 {
            broker
                .publish(Message::new("t", format!("m-{i}")))
                .await
                .unwrap();
        }

        assert_eq!(first.next_message().await.unwrap().unwrap().value_lossy(), "m-1");
        assert_eq!(first.next_message().await.unwrap().unwrap().value_lossy(), "m-2");
        assert!(matches!(
            first.next_message().await,
            Some(Err(ConsumeError::SessionInterrupted(_)))
        ));
        assert!(first.next_message().await.is_none());
        first.leave().await;

        let mut second = broker.join("g", &topics()).await.unwrap();
        assert_eq!(second.next_message().await.unwrap().unwrap().value_lossy(), "m-3");
        assert_eq!(second.next_message().await.unwrap().unwrap().value_lossy(), "m-4");
        assert_eq!(broker.committed_offset("g", "t").await, Some(4));
    }

    #[tokio::test]
    async fn test_failing_joins_then_success() {
        let broker = broker_with_topic(MemoryOptions {
            faults: FaultPlan::default().fail_first_joins(2),
            ..Default::default()
        })
        .await;

        assert!(broker.join("g", &topics()).await.is_err());
        assert!(broker.join("g", &topics()).await.is_err());
        let session = broker.join("g", &topics()).await.unwrap();
        assert_eq!(session.member_id(), "kafka-exchange-1");
        assert_eq!(broker.join_attempts().await, 3);
    }

    #[tokio::test]
    async fn test_injected_publish_failure_is_not_stored() {
        let broker = broker_with_topic(MemoryOptions {
            faults: FaultPlan::default().fail_publish(2),
            ..Default::default()
        })
        .await;

        assert!(broker.publish(Message::new("t", "a")).await.is_ok());
        assert!(broker.publish(Message::new("t", "b")).await.is_err());
        assert!(broker.publish(Message::new("t", "c")).await.is_ok());
        assert_eq!(broker.log_values("t").await, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_session_and_is_idempotent() {
        let broker = broker_with_topic(MemoryOptions::default()).await;
        let mut session = broker.join("g", &topics()).await.unwrap();

        let closer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close().await;
            closer.close().await;
        });

        let result = tokio::time::timeout(Duration::from_secs(1), session.next_message())
            .await
            .expect("session never woke");
        assert!(matches!(result, Some(Err(ConsumeError::ClientClosed))));

        let closes = broker
            .events()
            .await
            .into_iter()
            .filter(|e| *e == BrokerEvent::Closed)
            .count();
        assert_eq!(closes, 1);
        assert!(broker.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_wait_loses_nothing() {
        let broker = broker_with_topic(MemoryOptions::default()).await;
        let mut session = broker.join("g", &topics()).await.unwrap();

        // Abandon a pending wait, then publish.
        let _ = tokio::time::timeout(Duration::from_millis(5), session.next_message()).await;
        broker.publish(Message::new("t", "kept")).await.unwrap();

        let msg = session.next_message().await.unwrap().unwrap();
        assert_eq!(msg.value_lossy(), "kept");
    }
}
