//! Topic-keyed publish/subscribe with per-subscriber bounded mailboxes.
//!
//! Publish never blocks: each subscriber owns a bounded mailbox, and on
//! overflow the subscription's policy fires (`DropOldest` by default). A
//! stalled subscriber loses events and increments its dropped counter; it
//! cannot stall the publisher or any other subscriber.
//!
//! The bus holds only weak delivery handles; the subscriber owns its
//! mailbox, so a dropped `Subscription` is collected on the next publish.

use crate::load::LoadState;
use crate::measurement::Measurement;
use sb_protocol::AttentionLevel;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

/// Well-known topic constructors.
pub mod topics {
    /// Measurement fan-out for one sensor.
    pub fn data(sensor_id: &str) -> String {
        format!("data:{sensor_id}")
    }

    /// State-change notifications for one sensor.
    pub fn signal(sensor_id: &str) -> String {
        format!("signal:{sensor_id}")
    }

    /// Attention level changes for one sensor.
    pub fn attention(sensor_id: &str) -> String {
        format!("attention:{sensor_id}")
    }

    /// System-wide load level changes.
    pub const SYSTEM_LOAD: &str = "system:load";
}

/// Everything that travels over the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Measurement {
        sensor_id: String,
        measurement: Measurement,
    },
    /// One event carrying the whole accepted batch: subscribers see
    /// all-or-none visibility of the list.
    MeasurementBatch {
        sensor_id: String,
        measurements: Arc<Vec<Measurement>>,
    },
    /// The sensor's attribute registry changed.
    NewState { sensor_id: String },
    AttentionChanged {
        sensor_id: String,
        level: AttentionLevel,
    },
    SystemLoadChanged { state: LoadState },
}

/// What happens when a subscriber's mailbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room (principled loss).
    #[default]
    DropOldest,
    /// Close the subscription; the subscriber observes end-of-stream.
    CloseSubscriber,
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

struct Mailbox {
    queue: Mutex<VecDeque<BusEvent>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Mailbox {
    fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue one event, applying the overflow policy. Returns the number
    /// of events dropped in the process. Never blocks.
    fn push(&self, event: BusEvent) -> u64 {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let mut dropped = 0;
        {
            let mut queue = self.queue.lock().expect("mailbox mutex poisoned");
            if queue.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        dropped = 1;
                    }
                    OverflowPolicy::CloseSubscriber => {
                        queue.clear();
                        drop(queue);
                        self.close();
                        return 0;
                    }
                }
            }
            queue.push_back(event);
        }
        self.dropped.fetch_add(dropped, Ordering::Relaxed);
        self.notify.notify_one();
        dropped
    }

    /// Enqueue a batch under a single lock, preserving order.
    fn push_many(&self, events: &[BusEvent]) -> u64 {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let mut dropped = 0;
        {
            let mut queue = self.queue.lock().expect("mailbox mutex poisoned");
            for event in events {
                if queue.len() >= self.capacity {
                    match self.policy {
                        OverflowPolicy::DropOldest => {
                            queue.pop_front();
                            dropped += 1;
                        }
                        OverflowPolicy::CloseSubscriber => {
                            queue.clear();
                            drop(queue);
                            self.close();
                            self.dropped.fetch_add(dropped, Ordering::Relaxed);
                            return dropped;
                        }
                    }
                }
                queue.push_back(event.clone());
            }
        }
        self.dropped.fetch_add(dropped, Ordering::Relaxed);
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<BusEvent> {
        self.queue
            .lock()
            .expect("mailbox mutex poisoned")
            .pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().expect("mailbox mutex poisoned").len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Subscription (subscriber side)
// ---------------------------------------------------------------------------

/// A registered subscriber. Owns its mailbox; dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    id: u64,
    mailbox: Arc<Mailbox>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Receive the next event. Returns `None` once the subscription is
    /// closed and drained.
    pub async fn recv(&self) -> Option<BusEvent> {
        loop {
            // Register interest before checking, so a push or close landing
            // between the check and the await still wakes us.
            let notified = self.mailbox.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(event) = self.mailbox.pop() {
                return Some(event);
            }
            if self.mailbox.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<BusEvent> {
        self.mailbox.pop()
    }

    /// Detach from the bus. Idempotent: repeated calls are no-ops.
    pub fn unsubscribe(&self) {
        self.mailbox.close();
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.topic, self.id);
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Events lost to the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.mailbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailbox.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

struct SubscriberEntry {
    id: u64,
    mailbox: Weak<Mailbox>,
}

struct BusInner {
    /// Per-topic subscriber lists, guarded by a short critical section:
    /// publish copies the list, then releases before delivering.
    topics: Mutex<HashMap<String, Vec<SubscriberEntry>>>,
    next_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl BusInner {
    fn remove(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock().expect("bus mutex poisoned");
        if let Some(entries) = topics.get_mut(topic) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Copy the live delivery handles for `topic`, pruning dead entries.
    fn delivery_list(&self, topic: &str) -> Vec<Arc<Mailbox>> {
        let mut topics = self.topics.lock().expect("bus mutex poisoned");
        let Some(entries) = topics.get_mut(topic) else {
            return Vec::new();
        };
        entries.retain(|e| {
            e.mailbox
                .upgrade()
                .is_some_and(|mailbox| !mailbox.is_closed())
        });
        let list: Vec<Arc<Mailbox>> =
            entries.iter().filter_map(|e| e.mailbox.upgrade()).collect();
        if entries.is_empty() {
            topics.remove(topic);
        }
        list
    }
}

/// Aggregate publish/drop counters.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BusStats {
    pub published: u64,
    pub dropped: u64,
}

/// Mailbox depth summary, consumed by the load monitor.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthStats {
    pub max: usize,
    pub mean: f64,
    pub subscribers: usize,
}

/// The topic-keyed message bus. Cheap to clone.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
    default_capacity: usize,
}

impl MessageBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            default_capacity,
        }
    }

    /// Subscribe with the default capacity and `DropOldest` policy.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        self.subscribe_with(topic, self.default_capacity, OverflowPolicy::default())
    }

    /// Subscribe with explicit capacity and overflow policy.
    pub fn subscribe_with(
        &self,
        topic: &str,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Subscription {
        let mailbox = Arc::new(Mailbox::new(capacity.max(1), policy));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut topics = self.inner.topics.lock().expect("bus mutex poisoned");
            topics.entry(topic.to_owned()).or_default().push(SubscriberEntry {
                id,
                mailbox: Arc::downgrade(&mailbox),
            });
        }
        Subscription {
            topic: topic.to_owned(),
            id,
            mailbox,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Detach a subscription. Idempotent.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }

    /// Deliver `event` to every subscriber of `topic`. Never blocks; on
    /// overflow the subscription's policy fires and the dropped counters
    /// are incremented. No errors surface to the publisher.
    pub fn publish(&self, topic: &str, event: BusEvent) {
        let list = self.inner.delivery_list(topic);
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        for mailbox in &list {
            let dropped = mailbox.push(event.clone());
            if dropped > 0 {
                self.inner.dropped.fetch_add(dropped, Ordering::Relaxed);
                tracing::debug!(topic, dropped, "subscriber mailbox overflow");
            }
        }
    }

    /// Batched publish. Ordering within the batch is preserved per
    /// subscriber.
    pub fn broadcast_many(&self, topic: &str, events: Vec<BusEvent>) {
        if events.is_empty() {
            return;
        }
        let list = self.inner.delivery_list(topic);
        self.inner
            .published
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        for mailbox in &list {
            let dropped = mailbox.push_many(&events);
            if dropped > 0 {
                self.inner.dropped.fetch_add(dropped, Ordering::Relaxed);
                tracing::debug!(topic, dropped, "subscriber mailbox overflow");
            }
        }
    }

    /// Live subscriber count for a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.delivery_list(topic).len()
    }

    /// Depth summary over every live mailbox on the bus.
    pub fn depth_stats(&self) -> DepthStats {
        let mut max = 0usize;
        let mut total = 0usize;
        let mut count = 0usize;
        let topics = self.inner.topics.lock().expect("bus mutex poisoned");
        for entries in topics.values() {
            for entry in entries {
                if let Some(mailbox) = entry.mailbox.upgrade() {
                    if mailbox.is_closed() {
                        continue;
                    }
                    let len = mailbox.len();
                    max = max.max(len);
                    total += len;
                    count += 1;
                }
            }
        }
        DepthStats {
            max,
            mean: if count == 0 {
                0.0
            } else {
                total as f64 / count as f64
            },
            subscribers: count,
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}
