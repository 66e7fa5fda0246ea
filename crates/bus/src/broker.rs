//! In-process topic broker with replay cache and backpressure.
//!
//! Delivery contract:
//! - messages published after a subscription exists arrive in publish order;
//! - messages published before it are replayed from a bounded per-topic
//!   cache (FIFO, up to the cache limit) so late-arriving consumers still
//!   see recent traffic;
//! - subscriber queues are bounded and sends block, so a slow consumer
//!   applies backpressure to publishers instead of losing messages.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::message::BusMessage;

pub const DEFAULT_CACHE_SIZE: usize = 20;
pub const DEFAULT_CONSUMER_BUF: usize = 30;

struct TopicInner {
    cache: VecDeque<BusMessage>,
    subscribers: IndexMap<String, mpsc::Sender<BusMessage>>,
}

struct TopicState {
    // Held across subscriber sends so one topic's messages never interleave.
    inner: tokio::sync::Mutex<TopicInner>,
}

/// Process-local broker. Cloneable handle via `Arc`.
pub struct Broker {
    topics: parking_lot::RwLock<HashMap<String, Arc<TopicState>>>,
    cache_size: AtomicUsize,
    consumer_buf: AtomicUsize,
    closed: AtomicBool,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            topics: parking_lot::RwLock::new(HashMap::new()),
            cache_size: AtomicUsize::new(DEFAULT_CACHE_SIZE),
            consumer_buf: AtomicUsize::new(DEFAULT_CONSUMER_BUF),
            closed: AtomicBool::new(false),
        }
    }

    /// Replay-cache depth for messages published before a subscriber exists.
    /// Applies to subsequent publishes.
    pub fn set_cache_size(&self, n: usize) {
        self.cache_size.store(n, Ordering::Relaxed);
    }

    /// Queue depth for subscriptions created after this call.
    pub fn set_consumer_buf(&self, n: usize) {
        self.consumer_buf.store(n.max(1), Ordering::Relaxed);
    }

    fn topic_state(&self, topic: &str) -> Arc<TopicState> {
        if let Some(state) = self.topics.read().get(topic) {
            return state.clone();
        }
        let mut topics = self.topics.write();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                Arc::new(TopicState {
                    inner: tokio::sync::Mutex::new(TopicInner {
                        cache: VecDeque::new(),
                        subscribers: IndexMap::new(),
                    }),
                })
            })
            .clone()
    }

    /// Publish to a topic: append to the replay cache, then deliver to every
    /// live subscriber with a blocking send.
    pub async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let state = self.topic_state(topic);
        let mut inner = state.inner.lock().await;

        let cache_size = self.cache_size.load(Ordering::Relaxed);
        inner.cache.push_back(message.clone());
        while inner.cache.len() > cache_size {
            inner.cache.pop_front();
        }

        // Deliver in subscriber registration order; drop peers whose receiver
        // side is gone.
        let mut dead = Vec::new();
        for (id, tx) in inner.subscribers.iter() {
            if tx.send(message.clone()).await.is_err() {
                dead.push(id.clone());
            }
        }
        for id in &dead {
            inner.subscribers.shift_remove(id);
            debug!(topic, subscriber = %id, "dropped dead subscriber");
        }

        debug!(topic, done = message.done, "published");
        Ok(())
    }

    /// Subscribe and immediately receive the topic's cached messages in FIFO
    /// order, then live traffic. An existing subscription with the same id is
    /// replaced (its queue closes).
    pub async fn subscribe(&self, topic: &str, subscriber_id: &str) -> Result<Subscription, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let state = self.topic_state(topic);
        let mut inner = state.inner.lock().await;

        // Queue must hold the full replay plus headroom for live traffic, so
        // replay never blocks while the topic lock is held.
        let capacity = self
            .consumer_buf
            .load(Ordering::Relaxed)
            .max(inner.cache.len() + 1);
        let (tx, rx) = mpsc::channel(capacity);

        for cached in inner.cache.iter() {
            if tx.try_send(cached.clone()).is_err() {
                warn!(topic, subscriber = subscriber_id, "replay overflow");
                break;
            }
        }

        if inner
            .subscribers
            .insert(subscriber_id.to_string(), tx)
            .is_some()
        {
            debug!(topic, subscriber = subscriber_id, "replaced existing subscription");
        }

        Ok(Subscription {
            topic: topic.to_string(),
            subscriber_id: subscriber_id.to_string(),
            rx,
        })
    }

    pub async fn unsubscribe(&self, topic: &str, subscriber_id: &str) -> Result<(), BusError> {
        let state = match self.topics.read().get(topic) {
            Some(s) => s.clone(),
            None => {
                return Err(BusError::NotSubscribed {
                    topic: topic.to_string(),
                    subscriber: subscriber_id.to_string(),
                })
            }
        };
        let mut inner = state.inner.lock().await;
        match inner.subscribers.shift_remove(subscriber_id) {
            Some(_) => Ok(()),
            None => Err(BusError::NotSubscribed {
                topic: topic.to_string(),
                subscriber: subscriber_id.to_string(),
            }),
        }
    }

    pub async fn is_subscribed(&self, topic: &str, subscriber_id: &str) -> bool {
        let state = match self.topics.read().get(topic) {
            Some(s) => s.clone(),
            None => return false,
        };
        let inner = state.inner.lock().await;
        inner.subscribers.contains_key(subscriber_id)
    }

    /// Close the broker: all subscriber queues end after draining, further
    /// publishes fail. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let states: Vec<Arc<TopicState>> = self.topics.write().drain().map(|(_, s)| s).collect();
        for state in states {
            let mut inner = state.inner.lock().await;
            inner.subscribers.clear();
            inner.cache.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription: a bounded FIFO queue of bus messages.
pub struct Subscription {
    pub topic: String,
    pub subscriber_id: String,
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    /// Next message in FIFO order; `None` once the broker side is gone and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn late_subscriber_replays_cache_in_order() {
        let broker = Broker::new();
        for i in 0..10 {
            broker
                .publish("role=gen", BusMessage::new(json!(i)))
                .await
                .unwrap();
        }
        broker.publish("role=gen", BusMessage::done()).await.unwrap();

        let mut sub = broker.subscribe("role=gen", "late").await.unwrap();
        for i in 0..10 {
            let msg = sub.recv().await.unwrap();
            assert_eq!(msg.payload, json!(i));
            assert!(!msg.done);
        }
        assert!(sub.recv().await.unwrap().done);
    }

    #[tokio::test]
    async fn replay_bounded_by_cache_size() {
        let broker = Broker::new();
        broker.set_cache_size(3);
        for i in 0..10 {
            broker
                .publish("t", BusMessage::new(json!(i)))
                .await
                .unwrap();
        }
        let mut sub = broker.subscribe("t", "s").await.unwrap();
        // only the last 3 survive
        for expect in 7..10 {
            assert_eq!(sub.recv().await.unwrap().payload, json!(expect));
        }
    }

    #[tokio::test]
    async fn fanout_to_all_subscribers() {
        let broker = Broker::new();
        let mut a = broker.subscribe("t", "a").await.unwrap();
        let mut b = broker.subscribe("t", "b").await.unwrap();
        broker
            .publish("t", BusMessage::new(json!("x")))
            .await
            .unwrap();

        assert_eq!(a.recv().await.unwrap().payload, json!("x"));
        assert_eq!(b.recv().await.unwrap().payload, json!("x"));
    }

    #[tokio::test]
    async fn per_topic_fifo_for_single_subscriber() {
        let broker = Broker::new();
        let mut sub = broker.subscribe("t", "s").await.unwrap();
        for i in 0..20 {
            broker
                .publish("t", BusMessage::new(json!(i)))
                .await
                .unwrap();
        }
        for i in 0..20 {
            assert_eq!(sub.recv().await.unwrap().payload, json!(i));
        }
    }

    #[tokio::test]
    async fn bounded_queue_applies_backpressure() {
        let broker = Arc::new(Broker::new());
        broker.set_consumer_buf(2);
        let mut sub = broker.subscribe("t", "slow").await.unwrap();

        let publisher = {
            let broker = broker.clone();
            tokio::spawn(async move {
                for i in 0..5 {
                    broker
                        .publish("t", BusMessage::new(json!(i)))
                        .await
                        .unwrap();
                }
            })
        };

        // Queue holds 2; the publisher cannot be done yet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished());

        // Draining releases it; nothing was dropped.
        for i in 0..5 {
            let msg = timeout(Duration::from_secs(1), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg.payload, json!(i));
        }
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = Broker::new();
        let mut sub = broker.subscribe("t", "s").await.unwrap();
        assert!(broker.is_subscribed("t", "s").await);

        broker.unsubscribe("t", "s").await.unwrap();
        assert!(!broker.is_subscribed("t", "s").await);

        broker
            .publish("t", BusMessage::new(json!(1)))
            .await
            .unwrap();
        // queue closed without delivering the post-unsubscribe message
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let broker = Broker::new();
        let mut sub = broker.subscribe("t", "s").await.unwrap();
        broker.close().await;
        assert!(matches!(
            broker.publish("t", BusMessage::new(json!(1))).await,
            Err(BusError::Closed)
        ));
        assert!(sub.recv().await.is_none());
    }
}
