//! Topic-based publish/subscribe
//!
//! [`PubSub`] is the seam between protocol handlers and the transport:
//! [`LocalPubSub`] is an in-process hub (tests, single-host deployments) and
//! [`GossipPubSub`](crate::gossip::GossipPubSub) fans messages out over
//! libp2p gossipsub.

use async_trait::async_trait;
use bytes::Bytes;
use defs_core::error::{DefsError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered messages per topic before slow subscribers start lagging
pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

/// A message delivered on a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub topic: String,
    /// Publishing peer, when the transport knows it
    pub source: Option<String>,
    pub data: Bytes,
}

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<PubSubMessage>>;
}

/// Per-topic broadcast channels
#[derive(Debug)]
pub struct TopicHub {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<PubSubMessage>>>,
}

impl TopicHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<PubSubMessage> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Deliver to local subscribers; returns how many received it
    pub fn deliver(&self, message: PubSubMessage) -> usize {
        let sender = self.topics.lock().get(&message.topic).cloned();
        match sender {
            Some(sender) => sender.send(message).unwrap_or(0),
            None => 0,
        }
    }

    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.topics
            .lock()
            .get(topic)
            .is_some_and(|s| s.receiver_count() > 0)
    }
}

/// In-process pubsub: every subscriber of a topic sees every publish
#[derive(Debug)]
pub struct LocalPubSub {
    local_id: Option<String>,
    hub: TopicHub,
}

impl Default for LocalPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPubSub {
    pub fn new() -> Self {
        Self {
            local_id: None,
            hub: TopicHub::new(DEFAULT_TOPIC_CAPACITY),
        }
    }

    /// Stamp published messages with `source`
    pub fn with_source(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }
}

#[async_trait]
impl PubSub for LocalPubSub {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        if topic.is_empty() {
            return Err(DefsError::Network("empty topic".to_string()));
        }
        let delivered = self.hub.deliver(PubSubMessage {
            topic: topic.to_string(),
            source: self.local_id.clone(),
            data: Bytes::from(data),
        });
        debug!(topic, delivered, "Published locally");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<PubSubMessage>> {
        Ok(self.hub.subscribe(topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_fanout() {
        let pubsub = LocalPubSub::new().with_source("node-a");
        let mut first = pubsub.subscribe("t").await.unwrap();
        let mut second = pubsub.subscribe("t").await.unwrap();
        let mut other = pubsub.subscribe("u").await.unwrap();

        pubsub.publish("t", b"hello".to_vec()).await.unwrap();

        let message = first.recv().await.unwrap();
        assert_eq!(message.data, Bytes::from_static(b"hello"));
        assert_eq!(message.source.as_deref(), Some("node-a"));
        assert_eq!(second.recv().await.unwrap().topic, "t");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let pubsub = LocalPubSub::new();
        pubsub.publish("nobody", b"x".to_vec()).await.unwrap();
        assert!(pubsub.publish("", b"x".to_vec()).await.is_err());
    }

    #[test]
    fn test_hub_subscriber_tracking() {
        let hub = TopicHub::new(4);
        assert!(!hub.has_subscribers("t"));
        let rx = hub.subscribe("t");
        assert!(hub.has_subscribers("t"));
        drop(rx);
        assert!(!hub.has_subscribers("t"));
    }
}
