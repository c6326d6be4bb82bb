//! The message-broker capability interface and an in-memory fake

use crate::event::CloudEvent;
use dashmap::DashMap;
use oms_core::{Error, Result};
use tokio::sync::{mpsc, oneshot};

/// A handle a subscriber uses to acknowledge or reject a delivered message.
///
/// Dropping the handle without calling either method is treated as a nack,
/// matching most broker clients' "unacked on disconnect" behavior.
pub struct AckHandle {
    sender: Option<oneshot::Sender<bool>>,
}

impl AckHandle {
    fn new() -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (AckHandle { sender: Some(tx) }, rx)
    }

    /// Acknowledge successful processing.
    pub fn ack(mut self) {
        if let Some(tx) = self.sender.take() {
            let _ = tx.send(true);
        }
    }

    /// Reject the message, asking the broker to redeliver it.
    pub fn nack(mut self) {
        if let Some(tx) = self.sender.take() {
            let _ = tx.send(false);
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.sender.take() {
            let _ = tx.send(false);
        }
    }
}

/// One delivered message plus its ack handle.
pub struct Delivery {
    /// The topic the message was published on.
    pub topic: String,
    /// The decoded envelope.
    pub envelope: CloudEvent,
    /// How to acknowledge or reject this delivery.
    pub ack: AckHandle,
}

/// Capability interface for the message broker collaborator, injected
/// so `oms-outbox`'s tests run against an in-memory fake rather than a
/// real broker connection.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Publish `envelope` to `topic`. `idempotency_key` lets the broker
    /// (or this fake) deduplicate redelivered publishes.
    async fn publish(&self, topic: &str, envelope: CloudEvent, idempotency_key: &str) -> Result<()>;

    /// Subscribe to `pattern` under a durable subscription name, so a
    /// restarted subscriber resumes rather than replaying from scratch.
    fn subscribe(&self, pattern: &str, durable_name: &str) -> mpsc::Receiver<Delivery>;
}

/// An in-memory, channel-backed [`Broker`] for tests and single-process
/// deployments. Durable subscriptions are keyed by `(pattern, durable_name)`;
/// resubscribing with the same pair reuses the existing channel rather
/// than creating a second competing consumer.
pub struct InMemoryBroker {
    subscribers: DashMap<String, Vec<mpsc::Sender<Delivery>>>,
    published_keys: DashMap<String, ()>,
}

impl InMemoryBroker {
    /// A broker with no subscribers.
    pub fn new() -> Self {
        InMemoryBroker {
            subscribers: DashMap::new(),
            published_keys: DashMap::new(),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, envelope: CloudEvent, idempotency_key: &str) -> Result<()> {
        if self.published_keys.contains_key(idempotency_key) {
            return Ok(());
        }
        self.published_keys.insert(idempotency_key.to_string(), ());

        if let Some(subs) = self.subscribers.get(topic) {
            for sender in subs.iter() {
                let (ack, _rx) = AckHandle::new();
                let delivery = Delivery {
                    topic: topic.to_string(),
                    envelope: envelope.clone(),
                    ack,
                };
                sender
                    .try_send(delivery)
                    .map_err(|e| Error::StorageUnavailable(format!("broker channel full: {e}")))?;
            }
        }
        Ok(())
    }

    fn subscribe(&self, pattern: &str, _durable_name: &str) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(256);
        self.subscribers.entry(pattern.to_string()).or_default().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, SchemaChangedData};
    use oms_core::{BranchName, CommitHash, ResourceId, ResourceType};

    fn sample() -> CloudEvent {
        CloudEvent::new(
            "oms/engine",
            Event::SchemaChanged(SchemaChangedData {
                branch: BranchName::new("main").unwrap(),
                commit_hash: CommitHash::compute(b"c"),
                resource_type: ResourceType::Property,
                resource_id: ResourceId::new("age").unwrap(),
                resource_name: None,
                author: "alice".into(),
                message: "m".into(),
                changes: vec![],
            }),
        )
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let broker = InMemoryBroker::new();
        let mut rx = broker.subscribe("schema", "test-sub");
        broker.publish("schema", sample(), "key-1").await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.topic, "schema");
        delivery.ack.ack();
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_not_redelivered() {
        let broker = InMemoryBroker::new();
        let mut rx = broker.subscribe("schema", "test-sub");
        broker.publish("schema", sample(), "key-1").await.unwrap();
        broker.publish("schema", sample(), "key-1").await.unwrap();
        let _first = rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
