//! Kafka backend built on `rdkafka`.
//!
//! - Topic provisioning: [`AdminClient::create_topics`]
//! - Publish: [`FutureProducer`] with idempotence enabled, so a retried
//!   send never produces a duplicate observation
//! - Consumption: one [`StreamConsumer`] per group session
//!
//! A join resolves once the consumer holds a partition assignment, checked
//! every [`ASSIGNMENT_POLL_INTERVAL`] while the consumer is polled. A
//! message that arrives during that wait counts as proof of assignment and
//! is handed out first by the session. A consumer error during that wait
//! fails the join instead.
//!
//! librdkafka does not expose the group member id through the safe API, so
//! sessions are labelled `"<client_id>-<join number>"`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::Message as _;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio_util::sync::CancellationToken;

use super::{BrokerClient, GroupConsumer, GroupSession, MessagePublisher, TopicAdmin};
use crate::config::ExchangeConfig;
use crate::constants::ASSIGNMENT_POLL_INTERVAL;
use crate::error::{AdminError, ConsumeError, ExchangeError, PublishError};
use crate::types::{Ack, Message, TopicSpec};

const ADMIN_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Broker client backed by librdkafka.
pub struct KafkaBroker {
    admin: AdminClient<DefaultClientContext>,
    producer: FutureProducer,
    consumer_config: ClientConfig,
    client_id: String,
    publish_timeout: Duration,
    joins: AtomicU32,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl KafkaBroker {
    /// Builds the admin, producer and consumer configurations.
    ///
    /// No connection is made until the first call.
    pub fn new(config: &ExchangeConfig) -> Result<Self, ExchangeError> {
        let mut base = ClientConfig::new();
        base.set("bootstrap.servers", config.bootstrap_servers())
            .set("client.id", &config.client_id);

        let admin: AdminClient<DefaultClientContext> = base
            .create()
            .map_err(|e| ExchangeError::ClientInit(format!("admin client: {e}")))?;

        let producer: FutureProducer = base
            .clone()
            .set(
                "message.timeout.ms",
                config.publish_timeout.as_millis().to_string(),
            )
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .create()
            .map_err(|e| ExchangeError::ClientInit(format!("producer: {e}")))?;

        let mut consumer_config = base;
        consumer_config
            .set("auto.offset.reset", config.offset_reset.as_kafka_value())
            .set(
                "partition.assignment.strategy",
                config.rebalance.as_kafka_value(),
            )
            .set("enable.auto.commit", "true")
            .set("session.timeout.ms", "6000");

        tracing::info!(
            brokers = %config.bootstrap_servers(),
            client_id = %config.client_id,
            "Kafka client configured"
        );

        Ok(Self {
            admin,
            producer,
            consumer_config,
            client_id: config.client_id.clone(),
            publish_timeout: config.publish_timeout,
            joins: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        })
    }

    fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

#[async_trait]
impl TopicAdmin for KafkaBroker {
    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), AdminError> {
        if self.is_closed() {
            return Err(AdminError::ClientClosed);
        }

        let topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(i32::from(spec.replication_factor)),
        );
        let options = AdminOptions::new().operation_timeout(Some(ADMIN_OPERATION_TIMEOUT));

        let results = self
            .admin
            .create_topics(&[topic], &options)
            .await
            .map_err(|e| AdminError::Broker(e.to_string()))?;

        for result in results {
            match result {
                Ok(_) => {}
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    return Err(AdminError::AlreadyExists(name));
                }
                Err((name, RDKafkaErrorCode::InvalidPartitions))
                | Err((name, RDKafkaErrorCode::InvalidReplicationFactor)) => {
                    return Err(AdminError::InvalidSpec(name));
                }
                Err((name, code)) => {
                    return Err(AdminError::Broker(format!("{name}: {code}")));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for KafkaBroker {
    async fn publish(&self, message: Message) -> Result<Ack, PublishError> {
        if self.is_closed() {
            return Err(PublishError::ClientClosed);
        }

        let mut record = FutureRecord::to(message.topic()).payload(message.value().as_ref());
        if let Some(key) = message.key() {
            record = record.key(key.as_ref());
        }

        match self.producer.send(record, self.publish_timeout).await {
            Ok((partition, offset)) => Ok(Ack { partition, offset }),
            Err((e, _)) => Err(map_publish_error(message.topic(), e)),
        }
    }
}

#[async_trait]
impl GroupConsumer for KafkaBroker {
    async fn join(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Box<dyn GroupSession>, ConsumeError> {
        if self.is_closed() {
            return Err(ConsumeError::ClientClosed);
        }

        let consumer: StreamConsumer = self
            .consumer_config
            .clone()
            .set("group.id", group_id)
            .create()
            .map_err(|e| ConsumeError::Broker(e.to_string()))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        if let Err(e) = consumer.subscribe(&topic_refs) {
            release(consumer).await;
            return Err(ConsumeError::Broker(e.to_string()));
        }

        let early = match self.await_assignment(&consumer).await {
            Ok(early) => early,
            Err(e) => {
                release(consumer).await;
                return Err(e);
            }
        };

        let n = self.joins.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(Box::new(KafkaSession {
            consumer,
            member_id: format!("{}-{}", self.client_id, n),
            early,
            closed: self.closed.clone(),
        }))
    }
}

impl KafkaBroker {
    /// Polls until the consumer holds partitions or hands over a message.
    async fn await_assignment(
        &self,
        consumer: &StreamConsumer,
    ) -> Result<Option<Message>, ConsumeError> {
        let mut ticker = tokio::time::interval(ASSIGNMENT_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return Err(ConsumeError::ClientClosed),
                received = consumer.recv() => {
                    return early_delivery(received.map(|m| to_message(&m))).map(Some);
                }
                _ = ticker.tick() => {
                    let assigned = consumer
                        .assignment()
                        .map(|tpl| tpl.count() > 0)
                        .unwrap_or(false);
                    if assigned {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();

        let producer = self.producer.clone();
        let flushed =
            tokio::task::spawn_blocking(move || producer.flush(CLOSE_FLUSH_TIMEOUT)).await;
        match flushed {
            Ok(Ok(())) => tracing::debug!("Producer flushed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Producer flush failed"),
            Err(e) => tracing::warn!(error = %e, "Producer flush task failed"),
        }
    }
}

struct KafkaSession {
    consumer: StreamConsumer,
    member_id: String,
    early: Option<Message>,
    closed: CancellationToken,
}

#[async_trait]
impl GroupSession for KafkaSession {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    async fn next_message(&mut self) -> Option<Result<Message, ConsumeError>> {
        if let Some(early) = self.early.take() {
            return Some(Ok(early));
        }
        tokio::select! {
            _ = self.closed.cancelled() => Some(Err(ConsumeError::ClientClosed)),
            received = self.consumer.recv() => {
                Some(received.map(|m| to_message(&m)).map_err(map_consume_error))
            }
        }
    }

    async fn leave(self: Box<Self>) {
        self.consumer.unsubscribe();
        release(self.consumer).await;
    }
}

/// Drops a consumer off the async workers; the drop blocks until the
/// consumer has left its group.
async fn release(consumer: StreamConsumer) {
    if let Err(e) = tokio::task::spawn_blocking(move || drop(consumer)).await {
        tracing::warn!(error = %e, "Consumer close task failed");
    }
}

/// A delivery error before any assignment fails the join, so no session is
/// reported until the consumer is able to read.
fn early_delivery(received: Result<Message, KafkaError>) -> Result<Message, ConsumeError> {
    received.map_err(|e| {
        tracing::warn!(error = %e, "Consumer error while waiting for assignment");
        map_consume_error(e)
    })
}

fn to_message(m: &BorrowedMessage<'_>) -> Message {
    let value = Bytes::copy_from_slice(m.payload().unwrap_or_default());
    let message = Message::new(m.topic(), value);
    match m.key() {
        Some(key) => message.with_key(Bytes::copy_from_slice(key)),
        None => message,
    }
}

fn map_publish_error(topic: &str, e: KafkaError) -> PublishError {
    match e.rdkafka_error_code() {
        Some(RDKafkaErrorCode::UnknownTopicOrPartition) | Some(RDKafkaErrorCode::UnknownTopic) => {
            PublishError::UnknownTopic(topic.to_string())
        }
        _ => PublishError::Broker(e.to_string()),
    }
}

fn map_consume_error(e: KafkaError) -> ConsumeError {
    match e {
        KafkaError::MessageConsumption(code) => ConsumeError::SessionInterrupted(code.to_string()),
        other => ConsumeError::Broker(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_construction_does_not_connect() {
        let config = ExchangeConfig {
            brokers: vec!["127.0.0.1:1".to_string()],
            ..Default::default()
        };
        assert!(KafkaBroker::new(&config).is_ok());
    }

    #[tokio::test]
    async fn test_calls_after_close_fail_fast() {
        let config = ExchangeConfig {
            brokers: vec!["127.0.0.1:1".to_string()],
            ..Default::default()
        };
        let broker = KafkaBroker::new(&config).unwrap();
        broker.close().await;
        broker.close().await;

        assert_eq!(
            broker.publish(Message::new("t", "x")).await.unwrap_err(),
            PublishError::ClientClosed
        );
        assert!(matches!(
            broker.join("g", &["t".to_string()]).await,
            Err(ConsumeError::ClientClosed)
        ));
    }

    #[test]
    fn test_consumption_errors_map_to_interrupted_session() {
        let err = map_consume_error(KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownMemberId,
        ));
        assert!(matches!(err, ConsumeError::SessionInterrupted(_)));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_error_before_assignment_fails_the_join() {
        let received = Err(KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition,
        ));
        let err = early_delivery(received).unwrap_err();
        assert!(matches!(err, ConsumeError::SessionInterrupted(_)));
    }

    #[test]
    fn test_message_before_assignment_is_kept() {
        let message = early_delivery(Ok(Message::new("t", "m-1"))).unwrap();
        assert_eq!(message.topic(), "t");
        assert_eq!(message.value_lossy(), "m-1");
    }
}
