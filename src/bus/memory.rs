//! In-process bus on a single `tokio::sync::broadcast` channel.
//!
//! Every subscriber sees every publish and filters by its topic set. Open
//! subscriptions register their topic sets so `publish` can report how many
//! of them actually want a topic. Dropping
//! the sender (`disconnect`) ends all open subscriptions, which is how broker
//! loss shows up to the consumer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{Delivery, MessageBus, Subscription};
use crate::error::SubscriptionError;

const DEFAULT_CAPACITY: usize = 256;

/// Topic sets of open subscriptions, keyed by subscription id.
type Registry = Arc<Mutex<HashMap<u64, Arc<HashSet<String>>>>>;

pub struct InMemoryBus {
    tx: Mutex<Option<broadcast::Sender<Delivery>>>,
    capacity: usize,
    next_id: AtomicU64,
    next_sub: AtomicU64,
    subscribers: Registry,
    acked: Arc<AtomicU64>,
    refuse_subscribes: AtomicU32,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: Mutex::new(None),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            next_sub: AtomicU64::new(1),
            subscribers: Registry::default(),
            acked: Arc::new(AtomicU64::new(0)),
            refuse_subscribes: AtomicU32::new(0),
        }
    }

    fn sender(&self) -> broadcast::Sender<Delivery> {
        let mut guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .get_or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Drop the channel. Open subscriptions drain what is buffered and then
    /// end; the next `subscribe` opens a fresh channel.
    pub fn disconnect(&self) {
        let dropped = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if dropped.is_some() {
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            debug!("In-memory bus disconnected");
        }
    }

    /// Fail the next `n` subscribe calls as if the broker were unreachable.
    pub fn refuse_next_subscribes(&self, n: u32) {
        self.refuse_subscribes.store(n, Ordering::SeqCst);
    }

    /// Deliveries acknowledged across all subscriptions.
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    /// Open subscriptions whose topic set includes `topic`.
    fn interested(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|topics| topics.contains(topic))
            .count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn subscribe(&self, topics: &[String]) -> Result<Box<dyn Subscription>, SubscriptionError> {
        if topics.is_empty() {
            return Err(SubscriptionError::Connect {
                topics: Vec::new(),
                reason: "no topics requested".into(),
            });
        }
        let refused = self
            .refuse_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SubscriptionError::Connect {
                topics: topics.to_vec(),
                reason: "broker unavailable".into(),
            });
        }

        let rx = self.sender().subscribe();
        let id = self.next_sub.fetch_add(1, Ordering::SeqCst);
        let topic_set: Arc<HashSet<String>> = Arc::new(topics.iter().cloned().collect());
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, topic_set.clone());
        debug!(id, ?topics, "In-memory subscription opened");
        Ok(Box::new(MemorySubscription {
            id,
            rx: Some(rx),
            topics: topic_set,
            registry: self.subscribers.clone(),
            acked: self.acked.clone(),
        }))
    }

    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<usize, SubscriptionError> {
        let delivery = Delivery {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            topic: topic.to_string(),
            body,
        };
        // Like pub/sub brokers, a publish with nobody listening is dropped.
        match self.sender().send(delivery) {
            Ok(_) => Ok(self.interested(topic)),
            Err(_) => Ok(0),
        }
    }
}

struct MemorySubscription {
    id: u64,
    rx: Option<broadcast::Receiver<Delivery>>,
    topics: Arc<HashSet<String>>,
    registry: Registry,
    acked: Arc<AtomicU64>,
}

impl MemorySubscription {
    fn deregister(&self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.deregister();
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(delivery) if self.topics.contains(&delivery.topic) => return Some(delivery),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Subscriber lagged behind bus; messages skipped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Bus channel closed");
                    self.rx = None;
                    self.deregister();
                    return None;
                }
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) {
        self.acked.fetch_add(1, Ordering::SeqCst);
        debug!(id = delivery.id, topic = %delivery.topic, "Delivery acknowledged");
    }

    async fn close(&mut self) {
        self.rx = None;
        self.deregister();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn delivers_only_subscribed_topics() {
        let bus = InMemoryBus::default();
        let mut sub = bus.subscribe(&topics(&["a"])).await.unwrap();

        bus.publish("b", b"skip".to_vec()).await.unwrap();
        bus.publish("a", b"keep".to_vec()).await.unwrap();

        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.topic, "a");
        assert_eq!(delivery.body, b"keep");
    }

    #[tokio::test]
    async fn publish_without_subscribers_reaches_nobody() {
        let bus = InMemoryBus::default();
        assert_eq!(bus.publish("a", b"x".to_vec()).await.unwrap(), 0);

        let _sub = bus.subscribe(&topics(&["a"])).await.unwrap();
        assert_eq!(bus.publish("a", b"x".to_vec()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn publish_counts_only_interested_subscribers() {
        let bus = InMemoryBus::default();
        let _a = bus.subscribe(&topics(&["a"])).await.unwrap();
        let ab = bus.subscribe(&topics(&["a", "b"])).await.unwrap();
        let mut c = bus.subscribe(&topics(&["c"])).await.unwrap();

        assert_eq!(bus.publish("a", b"x".to_vec()).await.unwrap(), 2);
        assert_eq!(bus.publish("b", b"x".to_vec()).await.unwrap(), 1);
        assert_eq!(bus.publish("c", b"x".to_vec()).await.unwrap(), 1);
        assert_eq!(bus.publish("d", b"x".to_vec()).await.unwrap(), 0);

        c.close().await;
        assert_eq!(bus.publish("c", b"x".to_vec()).await.unwrap(), 0);
        drop(ab);
        assert_eq!(bus.publish("b", b"x".to_vec()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disconnect_ends_subscription_after_buffered_messages() {
        let bus = InMemoryBus::default();
        let mut sub = bus.subscribe(&topics(&["a"])).await.unwrap();
        bus.publish("a", b"last".to_vec()).await.unwrap();
        bus.disconnect();

        assert_eq!(sub.next().await.unwrap().body, b"last");
        let end = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn refused_subscribes_then_recovers() {
        let bus = InMemoryBus::default();
        bus.refuse_next_subscribes(2);
        assert!(bus.subscribe(&topics(&["a"])).await.is_err());
        assert!(bus.subscribe(&topics(&["a"])).await.is_err());
        assert!(bus.subscribe(&topics(&["a"])).await.is_ok());
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_ahead() {
        let bus = InMemoryBus::new(2);
        let mut sub = bus.subscribe(&topics(&["a"])).await.unwrap();
        for i in 0..5u8 {
            bus.publish("a", vec![i]).await.unwrap();
        }
        // Oldest entries were overwritten; the newest two survive.
        assert_eq!(sub.next().await.unwrap().body, vec![3]);
        assert_eq!(sub.next().await.unwrap().body, vec![4]);
    }

    #[tokio::test]
    async fn ack_is_counted() {
        let bus = InMemoryBus::default();
        let mut sub = bus.subscribe(&topics(&["a"])).await.unwrap();
        bus.publish("a", b"x".to_vec()).await.unwrap();
        let delivery = sub.next().await.unwrap();
        sub.ack(&delivery).await;
        assert_eq!(bus.acked(), 1);
    }
}
