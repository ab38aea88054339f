//! Channel-keyed fan-out of pipeline messages.
//!
//! Subscribers register against a channel key (a run id, or the reserved
//! [`CLAIMS_STREAM`] key) and receive every message published on it. A
//! subscriber whose delivery fails is dropped from the channel; publishing
//! never fails and one bad subscriber never holds up the others.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{LogLevel, Message};

/// Reserved channel for synthetic claim and drift messages
pub const CLAIMS_STREAM: &str = "claims_stream";

/// Identity of a subscriber, stable across subscribe calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a message could not be handed to a subscriber
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("subscriber disconnected")]
    Disconnected,

    #[error("delivery failed: {0}")]
    Failed(String),
}

/// A live consumer of messages
#[async_trait]
pub trait Subscriber: Send + Sync {
    fn id(&self) -> SubscriberId;

    async fn deliver(&self, message: &Message) -> Result<(), DeliveryError>;
}

/// Subscriber backed by an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    id: SubscriberId,
    sender: mpsc::UnboundedSender<Message>,
}

impl ChannelSubscriber {
    /// Create a subscriber and the receiving half its messages arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscriber = Self {
            id: SubscriberId::new(),
            sender,
        };
        (subscriber, receiver)
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    fn id(&self) -> SubscriberId {
        self.id
    }

    async fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        self.sender
            .send(message.clone())
            .map_err(|_| DeliveryError::Disconnected)
    }
}

type Registry = HashMap<SubscriberId, Arc<dyn Subscriber>>;

/// Per-channel subscriber registry
#[derive(Default)]
pub struct Broadcaster {
    channels: DashMap<String, Registry>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber on a channel; subscribing twice is a no-op
    pub fn subscribe(&self, channel: &str, subscriber: Arc<dyn Subscriber>) {
        let id = subscriber.id();
        self.channels
            .entry(channel.to_string())
            .or_default()
            .entry(id)
            .or_insert(subscriber);
        debug!(channel, subscriber = %id, "Subscribed");
    }

    /// Remove a subscriber; the channel entry goes away with its last subscriber
    pub fn unsubscribe(&self, channel: &str, id: SubscriberId) {
        if let Some(mut subscribers) = self.channels.get_mut(channel) {
            subscribers.remove(&id);
        }
        self.channels
            .remove_if(channel, |_, subscribers| subscribers.is_empty());
        debug!(channel, subscriber = %id, "Unsubscribed");
    }

    /// Deliver a message to every current subscriber of a channel
    pub async fn publish(&self, channel: &str, message: &Message) {
        // Snapshot so no map shard is held across an await
        let subscribers: Vec<Arc<dyn Subscriber>> = match self.channels.get(channel) {
            Some(entry) => entry.values().cloned().collect(),
            None => return,
        };

        let mut dead = Vec::new();
        for subscriber in subscribers {
            if let Err(e) = subscriber.deliver(message).await {
                warn!(
                    channel,
                    subscriber = %subscriber.id(),
                    kind = message.kind(),
                    error = %e,
                    "Dropping subscriber after failed delivery"
                );
                dead.push(subscriber.id());
            }
        }

        for id in dead {
            self.unsubscribe(channel, id);
        }
    }

    /// Deliver a message to every channel
    pub async fn publish_global(&self, message: &Message) {
        let channels: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for channel in channels {
            self.publish(&channel, message).await;
        }
    }

    pub async fn send_log(&self, channel: &str, level: LogLevel, text: impl Into<String>) {
        self.publish(channel, &Message::log(level, text)).await;
    }

    pub async fn send_status(&self, channel: &str, message: Message) {
        self.publish(channel, &message).await;
    }

    pub async fn send_metrics(&self, channel: &str, metrics: Map<String, Value>) {
        self.publish(channel, &Message::metrics(metrics)).await;
    }

    pub async fn send_artifact(
        &self,
        channel: &str,
        name: impl Into<String>,
        artifact_type: impl Into<String>,
        url: Option<String>,
    ) {
        self.publish(channel, &Message::artifact(name, artifact_type, url))
            .await;
    }

    /// Claims always go to the reserved stream
    pub async fn send_claim(&self, data: Value) {
        self.publish(CLAIMS_STREAM, &Message::claim(data)).await;
    }

    /// Drift updates always go to the reserved stream
    pub async fn send_drift(&self, data: Value) {
        self.publish(CLAIMS_STREAM, &Message::drift(data)).await;
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|e| e.len()).unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let broadcaster = Broadcaster::new();
        let (subscriber, mut rx) = ChannelSubscriber::new();
        let subscriber: Arc<dyn Subscriber> = Arc::new(subscriber);

        broadcaster.subscribe("run_a", subscriber.clone());
        broadcaster.subscribe("run_a", subscriber);
        assert_eq!(broadcaster.subscriber_count("run_a"), 1);

        broadcaster.send_log("run_a", LogLevel::Info, "hello").await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_last_unsubscribe_drops_channel() {
        let broadcaster = Broadcaster::new();
        let (subscriber, _rx) = ChannelSubscriber::new();
        let id = subscriber.id();

        broadcaster.subscribe("run_a", Arc::new(subscriber));
        assert_eq!(broadcaster.channel_count(), 1);

        broadcaster.unsubscribe("run_a", id);
        assert_eq!(broadcaster.channel_count(), 0);

        // Unknown channel and subscriber are fine
        broadcaster.unsubscribe("run_b", id);
    }

    #[tokio::test]
    async fn test_closed_receiver_is_pruned() {
        let broadcaster = Broadcaster::new();
        let (gone, gone_rx) = ChannelSubscriber::new();
        let (live, mut live_rx) = ChannelSubscriber::new();
        drop(gone_rx);

        broadcaster.subscribe("run_a", Arc::new(gone));
        broadcaster.subscribe("run_a", Arc::new(live));

        broadcaster
            .send_metrics("run_a", Map::from_iter([("f1".to_string(), json!(0.9))]))
            .await;

        assert_eq!(broadcaster.subscriber_count("run_a"), 1);
        match live_rx.try_recv().unwrap() {
            Message::Metrics { metrics, .. } => assert_eq!(metrics["f1"], json!(0.9)),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drift_goes_to_claims_stream() {
        let broadcaster = Broadcaster::new();
        let (run_sub, mut run_rx) = ChannelSubscriber::new();
        let (stream_sub, mut stream_rx) = ChannelSubscriber::new();

        broadcaster.subscribe("run_a", Arc::new(run_sub));
        broadcaster.subscribe(CLAIMS_STREAM, Arc::new(stream_sub));

        broadcaster.send_drift(json!({"batch": 0})).await;

        assert!(run_rx.try_recv().is_err());
        assert_eq!(stream_rx.try_recv().unwrap().kind(), "drift");
    }

    #[tokio::test]
    async fn test_publish_global_reaches_every_channel() {
        let broadcaster = Broadcaster::new();
        let (a, mut a_rx) = ChannelSubscriber::new();
        let (b, mut b_rx) = ChannelSubscriber::new();

        broadcaster.subscribe("run_a", Arc::new(a));
        broadcaster.subscribe("run_b", Arc::new(b));

        broadcaster
            .publish_global(&Message::rollback(
                crate::domain::Environment::Production,
                "v2",
                "v1",
            ))
            .await;

        assert_eq!(a_rx.try_recv().unwrap().kind(), "rollback");
        assert_eq!(b_rx.try_recv().unwrap().kind(), "rollback");
    }
}
