//! Pub/sub channel abstraction between call front ends and the relay.
//!
//! The consumer only talks to `MessageBus` / `Subscription`. `RedisBus` is the
//! broker-backed implementation, `InMemoryBus` the in-process one, and
//! `EventPublisher` is the producer side.

pub mod memory;
pub mod publisher;
pub mod redis_bus;

use async_trait::async_trait;

use crate::error::SubscriptionError;
use crate::events::EventType;

pub use memory::InMemoryBus;
pub use publisher::{EventPublisher, PublishReceipt};
pub use redis_bus::RedisBus;

/// One message taken off a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Bus-assigned sequence number.
    pub id: u64,
    pub topic: String,
    pub body: Vec<u8>,
}

/// Broker connection able to open subscriptions and publish.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<Box<dyn Subscription>, SubscriptionError>;

    /// Publish a body; returns how many subscribers listen on `topic`.
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<usize, SubscriptionError>;
}

/// A live subscription, owned by a single consumer.
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, or `None` once the subscription is closed.
    async fn next(&mut self) -> Option<Delivery>;

    /// Mark a delivery as fully processed.
    async fn ack(&mut self, delivery: &Delivery);

    async fn close(&mut self);
}

// ── Topic map ───────────────────────────────────────────────────────

/// Topic naming for each event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMap {
    pub customer_data: String,
    pub invalid_data: String,
    pub meeting: String,
    pub high_priority: String,
    /// Topic for event types the map does not know.
    pub fallback: String,
}

impl Default for TopicMap {
    fn default() -> Self {
        Self {
            customer_data: "customer:data:new".into(),
            invalid_data: "customer:data:invalid".into(),
            meeting: "customer:meeting:scheduled".into(),
            high_priority: "customer:priority:high".into(),
            fallback: "customer:general".into(),
        }
    }
}

impl TopicMap {
    pub fn topic_for(&self, event_type: &EventType) -> &str {
        match event_type {
            EventType::CustomerData => &self.customer_data,
            EventType::InvalidCustomerData => &self.invalid_data,
            EventType::MeetingScheduled => &self.meeting,
            EventType::HighPriorityContact => &self.high_priority,
            EventType::Unknown(_) => &self.fallback,
        }
    }

    /// Every topic, fallback included, in a stable order.
    pub fn all(&self) -> Vec<String> {
        vec![
            self.customer_data.clone(),
            self.invalid_data.clone(),
            self.meeting.clone(),
            self.high_priority.clone(),
            self.fallback.clone(),
        ]
    }
}
