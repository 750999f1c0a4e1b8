//! Redis pub/sub bus, the transport external call front ends publish on.
//!
//! Channel names are the `TopicMap` topics. Redis pub/sub keeps nothing for
//! absent subscribers and has no acknowledgement, so `ack` only advances a
//! local counter. A dropped connection ends the message stream; the consumer
//! sees a closed subscription and re-subscribes with backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Delivery, MessageBus, Subscription};
use crate::error::SubscriptionError;

pub struct RedisBus {
    client: redis::Client,
    /// Shared publish connection, opened on first publish.
    publisher: Mutex<Option<MultiplexedConnection>>,
    next_id: Arc<AtomicU64>,
    acked: Arc<AtomicU64>,
}

impl RedisBus {
    /// Parse `url`. No connection is made until the first subscribe or publish.
    pub fn new(url: &str) -> Result<Self, SubscriptionError> {
        let client = redis::Client::open(url).map_err(|e| SubscriptionError::Connect {
            topics: Vec::new(),
            reason: format!("invalid redis url: {e}"),
        })?;
        Ok(Self {
            client,
            publisher: Mutex::new(None),
            next_id: Arc::new(AtomicU64::new(1)),
            acked: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Deliveries acknowledged across all subscriptions.
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    async fn publish_connection(&self) -> redis::RedisResult<MultiplexedConnection> {
        let mut guard = self.publisher.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn subscribe(&self, topics: &[String]) -> Result<Box<dyn Subscription>, SubscriptionError> {
        if topics.is_empty() {
            return Err(SubscriptionError::Connect {
                topics: Vec::new(),
                reason: "no topics requested".into(),
            });
        }
        let connect_err = |e: redis::RedisError| SubscriptionError::Connect {
            topics: topics.to_vec(),
            reason: e.to_string(),
        };

        let mut pubsub = self.client.get_async_pubsub().await.map_err(connect_err)?;
        for topic in topics {
            pubsub.subscribe(topic.as_str()).await.map_err(connect_err)?;
        }
        info!(?topics, "Redis subscription opened");

        Ok(Box::new(RedisSubscription {
            messages: Some(pubsub.into_on_message().boxed()),
            next_id: self.next_id.clone(),
            acked: self.acked.clone(),
        }))
    }

    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<usize, SubscriptionError> {
        let publish_err = |e: redis::RedisError| SubscriptionError::Publish {
            topic: topic.to_string(),
            reason: e.to_string(),
        };

        let mut conn = self.publish_connection().await.map_err(publish_err)?;
        let published: redis::RedisResult<usize> = conn.publish(topic, body).await;
        match published {
            Ok(receivers) => Ok(receivers),
            Err(e) => {
                // Reconnect on the next publish.
                self.publisher.lock().await.take();
                Err(publish_err(e))
            }
        }
    }
}

struct RedisSubscription {
    messages: Option<BoxStream<'static, redis::Msg>>,
    next_id: Arc<AtomicU64>,
    acked: Arc<AtomicU64>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        let messages = self.messages.as_mut()?;
        match messages.next().await {
            Some(msg) => Some(Delivery {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                topic: msg.get_channel_name().to_string(),
                body: msg.get_payload_bytes().to_vec(),
            }),
            None => {
                warn!("Redis connection lost; subscription closed");
                self.messages = None;
                None
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) {
        self.acked.fetch_add(1, Ordering::SeqCst);
        debug!(id = delivery.id, topic = %delivery.topic, "Delivery acknowledged");
    }

    async fn close(&mut self) {
        // Dropping the stream closes the pub/sub connection.
        self.messages = None;
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    /// URL for a local port with nothing listening.
    async fn dead_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("redis://{addr}")
    }

    #[test]
    fn bad_url_is_a_connect_error() {
        let err = RedisBus::new("not a redis url").err().unwrap();
        assert!(matches!(err, SubscriptionError::Connect { .. }));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_subscribe_with_topics() {
        let bus = RedisBus::new(&dead_url().await).unwrap();
        let topics = vec!["customer:data:new".to_string()];

        let err = bus.subscribe(&topics).await.err().unwrap();
        match err {
            SubscriptionError::Connect { topics: failed, .. } => assert_eq!(failed, topics),
            other => panic!("expected Connect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_broker_fails_publish() {
        let bus = RedisBus::new(&dead_url().await).unwrap();
        let err = bus
            .publish("customer:data:new", b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::Publish { ref topic, .. } if topic == "customer:data:new"));
    }

    #[tokio::test]
    async fn empty_topic_list_is_rejected() {
        let bus = RedisBus::new("redis://127.0.0.1:6379").unwrap();
        assert!(bus.subscribe(&[]).await.is_err());
    }
}
