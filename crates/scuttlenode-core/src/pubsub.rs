//! In-process broker for newly accepted messages
//!
//! Used to tail feeds live (EBT streamers and `createHistoryStream` with
//! `live: true`). Delivery is best effort: every subscriber has a bounded
//! queue and is dropped as soon as it falls behind, so a slow reader never
//! stalls ingestion. Durable state is always in storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::feed::Message;
use crate::identity::FeedRef;

/// Default per-subscriber queue length.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

struct Subscriber {
    feed: Option<FeedRef>,
    tx: mpsc::Sender<Message>,
}

struct BrokerInner {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Process-wide message broker. Cheap to clone.
#[derive(Clone)]
pub struct MessageBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MessageBroker {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl MessageBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Receive every message accepted from now on.
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(None)
    }

    /// Receive messages of one feed accepted from now on.
    pub fn subscribe_feed(&self, feed: FeedRef) -> Subscription {
        self.subscribe(Some(feed))
    }

    fn subscribe(&self, feed: Option<FeedRef>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().insert(id, Subscriber { feed, tx });
        Subscription {
            id,
            rx,
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Fan out accepted messages. Never blocks.
    pub fn publish(&self, messages: &[Message]) {
        if messages.is_empty() {
            return;
        }
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|id, sub| {
            for msg in messages {
                if sub.feed.is_some_and(|feed| feed != msg.feed) {
                    continue;
                }
                match sub.tx.try_send(msg.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(subscriber = id, "Dropping slow subscriber");
                        return false;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// Receiving end of a broker subscription; unsubscribes on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Message>,
    broker: std::sync::Weak<BrokerInner>,
}

impl Subscription {
    /// Next message, `None` once this subscriber was dropped for falling
    /// behind (after draining what was queued).
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.broker.upgrade() {
            inner.subscribers.lock().remove(&self.id);
        }
    }
}
