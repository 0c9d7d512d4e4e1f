//! Batch publisher.
//!
//! Sends `n` messages tagged `"<prefix>-1" .. "<prefix>-n"`. Each message
//! is counted as pending before its send through a
//! [`SendReservation`](crate::sync::SendReservation); a failed send
//! withdraws it, so once the batch returns the counter target equals the
//! number of messages the broker accepted. Failed sends are logged and
//! skipped, never retried.

use std::sync::Arc;

use crate::broker::MessagePublisher;
use crate::constants::DEFAULT_MESSAGE_PREFIX;
use crate::sync::DeliveryCounter;
use crate::types::{Message, tagged_payload};

pub struct Publisher<P: ?Sized> {
    client: Arc<P>,
    counter: DeliveryCounter,
    prefix: String,
}

impl<P> Publisher<P>
where
    P: MessagePublisher + ?Sized,
{
    pub fn new(client: Arc<P>, counter: DeliveryCounter) -> Self {
        Self {
            client,
            counter,
            prefix: DEFAULT_MESSAGE_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Publishes `n` tagged messages to `topic` and returns how many the
    /// broker accepted.
    pub async fn publish_batch(&self, topic: &str, n: usize) -> usize {
        let mut sent = 0;

        for ordinal in 1..=n {
            let payload = tagged_payload(&self.prefix, ordinal);
            let reservation = self.counter.reserve();

            match self.client.publish(Message::new(topic, payload.clone())).await {
                Ok(ack) => {
                    reservation.confirm();
                    sent += 1;
                    tracing::info!(
                        topic,
                        value = %payload,
                        partition = ack.partition,
                        offset = ack.offset,
                        "Sent message"
                    );
                }
                Err(e) => {
                    reservation.withdraw();
                    tracing::warn!(topic, value = %payload, error = %e, "Failed to send message");
                }
            }
        }

        tracing::info!(topic, requested = n, sent, "Batch published");
        sent
    }
}
