//! Producer side: wraps a payload in the wire envelope and publishes it on
//! the topic for its event type.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::{MessageBus, TopicMap};
use crate::error::SubscriptionError;
use crate::events::{EventType, Payload};

#[derive(Serialize)]
struct Envelope<'a> {
    event_id: &'a str,
    event_type: &'a str,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_id: Option<&'a str>,
    payload: &'a Payload,
}

/// What a publish did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub event_id: String,
    /// Type actually published, after urgency escalation.
    pub event_type: EventType,
    pub topic: String,
    pub receivers: usize,
}

pub struct EventPublisher {
    bus: Arc<dyn MessageBus>,
    topics: TopicMap,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, topics: TopicMap) -> Self {
        Self { bus, topics }
    }

    pub async fn publish(
        &self,
        event_type: EventType,
        payload: Payload,
        stream_id: Option<&str>,
    ) -> Result<PublishReceipt, SubscriptionError> {
        let event_type = escalate(event_type, &payload);
        let topic = self.topics.topic_for(&event_type).to_string();
        let event_id = Uuid::new_v4().to_string();

        let envelope = Envelope {
            event_id: &event_id,
            event_type: event_type.as_str(),
            timestamp: Utc::now(),
            stream_id,
            payload: &payload,
        };
        let body = serde_json::to_vec(&envelope).map_err(|e| SubscriptionError::Publish {
            topic: topic.clone(),
            reason: e.to_string(),
        })?;

        let receivers = self.bus.publish(&topic, body).await?;
        if receivers == 0 {
            debug!(%topic, %event_id, "Published with no active subscribers");
        } else {
            info!(%topic, %event_id, %event_type, receivers, "Event published");
        }

        Ok(PublishReceipt {
            event_id,
            event_type,
            topic,
            receivers,
        })
    }
}

/// A `customer_data` record marked high or urgent goes out as a
/// high-priority contact instead.
fn escalate(event_type: EventType, payload: &Payload) -> EventType {
    let urgent = payload
        .get("urgency")
        .and_then(|v| v.as_str())
        .map(|u| u.trim().to_ascii_lowercase())
        .is_some_and(|u| u == "high" || u == "urgent");
    match event_type {
        EventType::CustomerData if urgent => EventType::HighPriorityContact,
        other => other,
    }
}
