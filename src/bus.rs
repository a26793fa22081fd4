//! Fan-out event bus with drop-oldest backpressure.
//!
//! One producer (the TCP receive loop) publishes into per-subscriber
//! bounded queues. A full queue evicts its oldest element rather than ever
//! blocking the producer; stale market data is worth less than fresh data,
//! and an unbounded queue only converts consumer lag into memory growth
//! and latency amplification.
//!
//! Delivery per subscription preserves publish order: drops remove older
//! events, never reorder them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::event::Event;
use crate::metrics::Metrics;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

struct SubQueue {
    id: u64,
    name: String,
    capacity: usize,
    queue: Mutex<VecDeque<Arc<Event>>>,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
    notify: Notify,
}

/// Receiver half of one bus subscription. Dropping it unsubscribes.
pub struct Subscription {
    inner: Arc<SubQueue>,
    bus: Weak<Bus>,
}

pub struct Bus {
    subs: RwLock<Vec<Arc<SubQueue>>>,
    default_capacity: usize,
    next_id: AtomicU64,
    published: AtomicU64,
    drops: AtomicU64,
    metrics: Arc<Metrics>,
}

impl Bus {
    pub fn new(default_capacity: usize, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            subs: RwLock::new(Vec::new()),
            default_capacity: default_capacity.max(1),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            metrics,
        })
    }

    pub fn subscribe(self: &Arc<Self>, name: &str) -> Subscription {
        self.subscribe_with_capacity(name, self.default_capacity)
    }

    pub fn subscribe_with_capacity(self: &Arc<Self>, name: &str, capacity: usize) -> Subscription {
        let inner = Arc::new(SubQueue {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        });
        self.subs.write().push(inner.clone());
        Subscription {
            inner,
            bus: Arc::downgrade(self),
        }
    }

    /// Remove a subscription; queued events are discarded with it.
    pub fn unsubscribe(&self, sub: &Subscription) {
        self.remove(sub.inner.id);
    }

    fn remove(&self, id: u64) {
        self.subs.write().retain(|s| s.id != id);
    }

    /// Deliver to every current subscriber. Never blocks: a full queue
    /// drops its head before the new event is enqueued.
    pub fn publish(&self, event: &Arc<Event>) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let subs = self.subs.read();
        for sub in subs.iter() {
            {
                let mut queue = sub.queue.lock();
                if queue.len() == sub.capacity {
                    queue.pop_front();
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    self.drops.fetch_add(1, Ordering::Relaxed);
                    self.metrics.inc_drops();
                }
                queue.push_back(event.clone());
                sub.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            sub.notify.notify_one();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.read().len()
    }

    pub fn queue_depths(&self) -> Vec<(String, usize)> {
        self.subs
            .read()
            .iter()
            .map(|s| (s.name.clone(), s.queue.lock().len()))
            .collect()
    }

    pub fn max_queue_depth(&self) -> usize {
        self.subs
            .read()
            .iter()
            .map(|s| s.queue.lock().len())
            .max()
            .unwrap_or(0)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn drops_total(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

impl Subscription {
    /// Wait for the next event in publish order.
    pub async fn recv(&self) -> Arc<Event> {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Non-suspending receive, used by drain-on-shutdown paths.
    pub fn try_recv(&self) -> Option<Arc<Event>> {
        let event = self.inner.queue.lock().pop_front();
        if event.is_some() {
            self.inner.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        event
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn depth(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn enqueued(&self) -> u64 {
        self.inner.enqueued.load(Ordering::Relaxed)
    }

    pub fn dequeued(&self) -> u64 {
        self.inner.dequeued.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.inner.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u64) -> Arc<Event> {
        let payload = format!(r#"{{"product_id":"BTC-USD","trade_id":{}}}"#, n);
        Arc::new(Event::parse(payload.as_bytes(), 0).unwrap())
    }

    fn bus(capacity: usize) -> Arc<Bus> {
        Bus::new(capacity, Metrics::new())
    }

    #[tokio::test]
    async fn test_publish_recv_in_order() {
        let bus = bus(10);
        let sub = bus.subscribe("t");
        for n in 0..5 {
            bus.publish(&event(n));
        }
        for n in 0..5 {
            assert_eq!(sub.recv().await.trade_id, Some(n));
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_tail() {
        let bus = bus(4);
        let sub = bus.subscribe("t");
        // A..F with capacity 4: A and B evicted, C..F retained.
        for n in 0..6 {
            bus.publish(&event(n));
        }
        assert_eq!(sub.depth(), 4);
        assert_eq!(sub.dropped(), 2);
        for n in 2..6 {
            assert_eq!(sub.try_recv().unwrap().trade_id, Some(n));
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_publish_never_blocks() {
        let bus = bus(8);
        let sub = bus.subscribe("stalled");
        // Far more than capacity, never received; publish must complete.
        for n in 0..1000 {
            bus.publish(&event(n));
        }
        assert_eq!(sub.depth(), 8);
        assert_eq!(sub.dropped(), 992);
        assert_eq!(bus.drops_total(), 992);
    }

    #[tokio::test]
    async fn test_drop_accounting_across_subscribers() {
        let bus = bus(4);
        let fast = bus.subscribe("fast");
        let slow = bus.subscribe("slow");

        for n in 0..10 {
            bus.publish(&event(n));
            // Fast consumer keeps up.
            assert!(fast.try_recv().is_some());
        }

        assert_eq!(fast.dropped(), 0);
        assert_eq!(slow.dropped(), 6);
        // Every publish landed in every subscriber's ledger.
        for sub in [&fast, &slow] {
            assert_eq!(sub.enqueued(), 10);
            assert_eq!(
                sub.dequeued() + sub.dropped() + sub.depth() as u64,
                bus.published()
            );
        }
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let bus = bus(4);
        let sub = bus.subscribe("t");
        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                bus.publish(&event(7));
            })
        };
        assert_eq!(sub.recv().await.trade_id, Some(7));
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let bus = bus(4);
        let sub = bus.subscribe("t");
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        // Publishing to an empty bus is a no-op.
        bus.publish(&event(1));
        assert_eq!(bus.drops_total(), 0);
    }

    #[tokio::test]
    async fn test_mixed_capacities() {
        let bus = bus(4);
        let small = bus.subscribe("small");
        let big = bus.subscribe_with_capacity("big", 100);
        for n in 0..50 {
            bus.publish(&event(n));
        }
        assert_eq!(small.depth(), 4);
        assert_eq!(small.dropped(), 46);
        assert_eq!(big.depth(), 50);
        assert_eq!(big.dropped(), 0);
    }
}
