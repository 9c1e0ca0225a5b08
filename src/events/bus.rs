//! Event bus: ordered fan-out of state-change events with backlog replay.
//!
//! Every published event gets the next sequence number and is appended to a
//! bounded ring buffer and to each subscriber's bounded queue under one lock,
//! so all subscribers observe the same total order. A slow subscriber loses
//! its oldest queued events instead of blocking the publisher; the loss is
//! reported to it as a single [`Delivery::Resync`] before the next event.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::model::{Delivery, Event, EventKind, EventPayload};
use crate::config::BusConfig;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared publish/subscribe hub. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

struct Shared {
    config: BusConfig,
    inner: Mutex<Inner>,
}

struct Inner {
    next_seq: u64,
    backlog: VecDeque<Event>,
    subscribers: HashMap<u64, Arc<SubscriberQueue>>,
    next_subscriber_id: u64,
    closed: bool,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

struct QueueState {
    items: VecDeque<Event>,
    /// Events dropped since the last delivered resync.
    missed: u64,
    closed: bool,
}

impl QueueState {
    fn push(&mut self, event: Event, capacity: usize) {
        if self.items.len() >= capacity.max(1) {
            self.items.pop_front();
            self.missed += 1;
        }
        self.items.push_back(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(Inner {
                    next_seq: 1,
                    backlog: VecDeque::new(),
                    subscribers: HashMap::new(),
                    next_subscriber_id: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// Publish an event to every subscriber. Never blocks on slow subscribers.
    pub fn publish(&self, kind: EventKind, payload: EventPayload) -> Event {
        let mut inner = lock(&self.shared.inner);
        let event = Event {
            seq: inner.next_seq,
            kind,
            payload,
            timestamp: Utc::now(),
        };
        inner.next_seq += 1;

        if inner.backlog.len() >= self.shared.config.backlog_capacity.max(1) {
            inner.backlog.pop_front();
        }
        inner.backlog.push_back(event.clone());

        for (id, queue) in inner.subscribers.iter() {
            let mut state = lock(&queue.state);
            let before = state.missed;
            state.push(event.clone(), self.shared.config.subscriber_queue);
            if state.missed > before && before == 0 {
                warn!(subscriber = id, seq = event.seq, "Subscriber queue full, dropping oldest events");
            }
            drop(state);
            queue.notify.notify_one();
        }

        debug!(seq = event.seq, kind = %event.kind, lead_id = ?event.lead_id(), "Event published");
        event
    }

    /// Subscribe with a replay of the buffered backlog followed by the live stream.
    pub fn subscribe(&self) -> Subscription {
        let mut inner = lock(&self.shared.inner);
        let mut state = QueueState {
            items: VecDeque::new(),
            missed: 0,
            closed: inner.closed,
        };
        for event in inner.backlog.iter() {
            state.push(event.clone(), self.shared.config.subscriber_queue);
        }
        // A backlog larger than the queue is not a gap for a fresh subscriber.
        state.missed = 0;
        self.register(&mut inner, state)
    }

    /// Subscribe to events after sequence number `after`.
    ///
    /// `None` starts from the live stream only. If events after `after` have
    /// already been evicted from the backlog the first delivery is a resync.
    pub fn subscribe_from(&self, after: Option<u64>) -> Subscription {
        let mut inner = lock(&self.shared.inner);
        let capacity = self.shared.config.subscriber_queue;
        let mut state = QueueState {
            items: VecDeque::new(),
            missed: 0,
            closed: inner.closed,
        };

        if let Some(after) = after {
            let last_seq = inner.next_seq - 1;
            let oldest = inner.backlog.front().map(|e| e.seq).unwrap_or(inner.next_seq);
            if after > last_seq {
                // Sequence from a previous bus lifetime.
                state.missed = 1;
            } else if after < last_seq && oldest > after + 1 {
                state.missed = oldest - after - 1;
            }
            for event in inner.backlog.iter().filter(|e| e.seq > after) {
                state.push(event.clone(), capacity);
            }
        }

        self.register(&mut inner, state)
    }

    /// Subscribe to the live stream and return the last sequence number
    /// published before the subscription took effect.
    pub fn subscribe_live(&self) -> (u64, Subscription) {
        let mut inner = lock(&self.shared.inner);
        let seq = inner.next_seq - 1;
        let state = QueueState {
            items: VecDeque::new(),
            missed: 0,
            closed: inner.closed,
        };
        (seq, self.register(&mut inner, state))
    }

    fn register(&self, inner: &mut Inner, state: QueueState) -> Subscription {
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        let queue = Arc::new(SubscriberQueue {
            state: Mutex::new(state),
            notify: Notify::new(),
        });
        inner.subscribers.insert(id, queue.clone());
        debug!(subscriber = id, total = inner.subscribers.len(), "Subscriber added");
        Subscription {
            id,
            queue,
            bus: self.clone(),
        }
    }

    /// Stop delivering to `subscription`. Equivalent to dropping it.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    fn remove(&self, id: u64) {
        let mut inner = lock(&self.shared.inner);
        if inner.subscribers.remove(&id).is_some() {
            debug!(subscriber = id, total = inner.subscribers.len(), "Subscriber removed");
        }
    }

    /// Sequence number of the most recently published event (0 if none).
    pub fn last_seq(&self) -> u64 {
        lock(&self.shared.inner).next_seq - 1
    }

    /// Up to `limit` most recent buffered events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let inner = lock(&self.shared.inner);
        let skip = inner.backlog.len().saturating_sub(limit);
        inner.backlog.iter().skip(skip).cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.inner).subscribers.len()
    }

    /// Close every subscription. Subscribers drain what is queued, then see `None`.
    pub fn shutdown(&self) {
        let mut inner = lock(&self.shared.inner);
        inner.closed = true;
        for queue in inner.subscribers.values() {
            lock(&queue.state).closed = true;
            queue.notify.notify_one();
        }
        info!(subscribers = inner.subscribers.len(), "Event bus shut down");
    }
}

/// A subscriber's handle on the bus. Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    bus: EventBus,
}

impl Subscription {
    /// Next delivery in sequence order, or `None` once the bus is shut down
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            {
                let mut state = lock(&self.queue.state);
                if state.missed > 0 {
                    let missed = std::mem::take(&mut state.missed);
                    return Some(Delivery::Resync { missed });
                }
                if let Some(event) = state.items.pop_front() {
                    return Some(Delivery::Event(event));
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Delivery> {
        let mut state = lock(&self.queue.state);
        if state.missed > 0 {
            let missed = std::mem::take(&mut state.missed);
            return Some(Delivery::Resync { missed });
        }
        state.items.pop_front().map(Delivery::Event)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.remove(self.id);
    }
}
