//! In-process topic-addressed publish/subscribe channel.
//!
//! The bus delivers a published envelope to every current subscriber whose
//! filter matches the topic. Delivery is FIFO per subscriber; no ordering is
//! guaranteed across topics. Subscribers that dropped their receiver are
//! pruned on the next publish.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

/// A message in flight: the topic it was published on plus its JSON payload.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub payload: String,
}

/// Subscription filter: exact topic match or prefix-style match
/// (the equivalent of an MQTT `bids/+` wildcard for this topic layout).
#[derive(Debug, Clone)]
pub enum TopicFilter {
    Exact(String),
    Prefix(String),
}

impl TopicFilter {
    pub fn exact(topic: impl Into<String>) -> Self {
        TopicFilter::Exact(topic.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        TopicFilter::Prefix(prefix.into())
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::Exact(exact) => exact == topic,
            TopicFilter::Prefix(prefix) => topic.starts_with(prefix.as_str()),
        }
    }
}

#[derive(Debug)]
struct Subscription {
    filters: Vec<TopicFilter>,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Cheaply cloneable handle to the shared bus.
#[derive(Debug, Clone, Default)]
pub struct Bus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for the given filters. All matching envelopes
    /// are funneled into the single returned receiver.
    pub async fn subscribe(
        &self,
        filters: Vec<TopicFilter>,
    ) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .write()
            .await
            .push(Subscription { filters, tx });
        rx
    }

    /// Deliver a payload to every subscriber matching `topic`.
    pub async fn publish(&self, topic: &str, payload: String) {
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.retain(|subscription| {
            if subscription.filters.iter().any(|f| f.matches(topic)) {
                subscription
                    .tx
                    .send(Envelope {
                        topic: topic.to_string(),
                        payload: payload.clone(),
                    })
                    .is_ok()
            } else {
                !subscription.tx.is_closed()
            }
        });
        tracing::trace!(topic, subscribers = subscriptions.len(), "Published message");
    }

    /// Number of live subscriptions, as of the last prune.
    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}
