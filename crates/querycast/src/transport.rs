//! Realtime transport abstraction.
//!
//! The cache layer only needs "subscribe to a topic, receive frames" plus
//! "publish a frame". Connection setup, reconnection and authentication
//! belong to the transport implementation.

use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

/// Callback receiving one inbound frame.
pub type MessageHandler = std::rc::Rc<dyn Fn(&Value)>;

/// Handle for one transport-level subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicSubscription {
    /// Subscribed topic
    pub topic: String,
    /// Transport-assigned id
    pub id: u64,
}

/// Topic-based publish/subscribe channel.
pub trait RealtimeTransport {
    /// Register `handler` for frames on `topic`.
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> TopicSubscription;

    /// Remove exactly the handler installed by `subscription`.
    fn unsubscribe(&self, subscription: &TopicSubscription);

    /// Send a frame to `topic`.
    fn publish(&self, topic: &str, frame: &Value);
}

/// In-process broker delivering frames synchronously.
///
/// Used natively and in tests; `publish` loops frames back to local
/// subscribers.
#[derive(Default)]
pub struct LocalTransport {
    topics: RefCell<HashMap<String, Vec<(u64, MessageHandler)>>>,
    next_id: Cell<u64>,
    published: RefCell<Vec<(String, Value)>>,
}

impl LocalTransport {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an inbound frame to the handlers on `topic`.
    ///
    /// Returns the number of handlers invoked.
    pub fn deliver(&self, topic: &str, frame: &Value) -> usize {
        let handlers: Vec<MessageHandler> = self
            .topics
            .borrow()
            .get(topic)
            .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::trace!(topic, "frame for topic without subscribers");
        }
        for handler in &handlers {
            handler(frame);
        }
        handlers.len()
    }

    /// Number of handlers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.borrow().get(topic).map_or(0, Vec::len)
    }

    /// Frames passed to [`publish`](RealtimeTransport::publish), oldest first.
    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.borrow().clone()
    }
}

impl RealtimeTransport for LocalTransport {
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> TopicSubscription {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.topics
            .borrow_mut()
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        tracing::debug!(topic, id, "transport subscribe");
        TopicSubscription {
            topic: topic.to_string(),
            id,
        }
    }

    fn unsubscribe(&self, subscription: &TopicSubscription) {
        let mut topics = self.topics.borrow_mut();
        if let Some(handlers) = topics.get_mut(&subscription.topic) {
            handlers.retain(|(id, _)| *id != subscription.id);
            if handlers.is_empty() {
                topics.remove(&subscription.topic);
            }
        }
        tracing::debug!(topic = %subscription.topic, id = subscription.id, "transport unsubscribe");
    }

    fn publish(&self, topic: &str, frame: &Value) {
        self.published
            .borrow_mut()
            .push((topic.to_string(), frame.clone()));
        self.deliver(topic, frame);
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("topics", &self.topics.borrow().len())
            .field("published", &self.published.borrow().len())
            .finish()
    }
}
