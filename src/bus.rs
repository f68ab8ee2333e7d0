//! Event Bus: bounded fan-out with drop-oldest backpressure
//!
//! Each subscriber owns a bounded queue. `publish` never blocks: when a
//! subscriber's queue is full its oldest event is discarded to admit the new
//! one. The subscriber set is snapshotted under the lock and delivery happens
//! after the lock is released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::types::EventEnvelope;

/// Default per-subscriber queue capacity.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("max_queue_size must be >= 1")]
    InvalidCapacity,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// One subscriber's bounded queue.
#[derive(Debug)]
struct SubscriberQueue {
    id: u64,
    capacity: usize,
    events: Mutex<VecDeque<Arc<EventEnvelope>>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn push(&self, event: Arc<EventEnvelope>) {
        {
            let mut events = lock(&self.events);
            if events.len() >= self.capacity {
                events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// Receiving side of a bus subscription.
#[derive(Debug)]
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.queue.id
    }

    /// Wait for the next event in publish order.
    pub async fn recv(&self) -> Arc<EventEnvelope> {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&self) -> Option<Arc<EventEnvelope>> {
        lock(&self.queue.events).pop_front()
    }

    /// Take every queued event, oldest first.
    pub fn drain(&self) -> Vec<Arc<EventEnvelope>> {
        lock(&self.queue.events).drain(..).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.queue.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events discarded by drop-oldest since subscribing.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

/// Multi-subscriber fan-out of normalized events.
#[derive(Debug)]
pub struct EventBus {
    max_queue_size: usize,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
}

impl EventBus {
    pub fn new(max_queue_size: usize) -> Result<Self, BusError> {
        if max_queue_size < 1 {
            return Err(BusError::InvalidCapacity);
        }
        Ok(Self {
            max_queue_size,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Register a new bounded queue for delivery.
    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            capacity: self.max_queue_size,
            events: Mutex::new(VecDeque::with_capacity(self.max_queue_size.min(64))),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        lock(&self.subscribers).push(Arc::clone(&queue));
        debug!(subscriber = queue.id, "Bus subscriber registered");
        Subscription { queue }
    }

    /// Deregister a subscription. Unknown subscriptions are ignored.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        lock(&self.subscribers).retain(|q| q.id != subscription.queue.id);
        debug!(subscriber = subscription.queue.id, "Bus subscriber removed");
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Deliver `event` to every registered subscriber.
    pub fn publish(&self, event: EventEnvelope) {
        let subscribers: Vec<Arc<SubscriberQueue>> = lock(&self.subscribers).clone();
        trace!(
            event_type = %event.event_type,
            subscribers = subscribers.len(),
            "Publishing event"
        );
        let event = Arc::new(event);
        for queue in &subscribers {
            queue.push(Arc::clone(&event));
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}
