//! Two-level priority send queue with weighted round-robin dequeue

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::core::packet::Packet;
use crate::core::queue::PacketQueue;
use crate::core::registry::Registry;

/// Service weights of the high and low priority sub-queues
///
/// With the default 2:1, under contention the high queue gets two of every three
/// dequeues and the low queue is never starved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityRatio {
    high: u32,
    low: u32,
}

impl Default for PriorityRatio {
    fn default() -> Self {
        Self { high: 2, low: 1 }
    }
}

impl PriorityRatio {
    /// Create a ratio; zero weights are clamped to 1
    #[must_use]
    pub fn new(high: u32, low: u32) -> Self {
        Self {
            high: high.max(1),
            low: low.max(1),
        }
    }

    /// High-priority weight
    #[must_use]
    pub fn high(&self) -> u32 {
        self.high
    }

    /// Low-priority weight
    #[must_use]
    pub fn low(&self) -> u32 {
        self.low
    }

    fn cycle_len(&self) -> u32 {
        self.high + self.low
    }
}

/// Outbound queue keyed by per-module priority
///
/// Packets of unregistered modules are rejected. Within each priority class
/// delivery is strictly FIFO; across classes it follows the [`PriorityRatio`].
#[derive(Debug)]
pub struct SendingQueue {
    high: PacketQueue,
    low: PacketQueue,
    priorities: Registry<bool>,
    ratio: PriorityRatio,
    /// Position within the round-robin cycle; `< ratio.high` means high's turn
    cursor: Mutex<u32>,
    available: Notify,
}

impl Default for SendingQueue {
    fn default() -> Self {
        Self::new(PriorityRatio::default())
    }
}

impl SendingQueue {
    /// Create a queue with the given service ratio
    #[must_use]
    pub fn new(ratio: PriorityRatio) -> Self {
        Self {
            high: PacketQueue::new(),
            low: PacketQueue::new(),
            priorities: Registry::new(),
            ratio,
            cursor: Mutex::new(0),
            available: Notify::new(),
        }
    }

    /// Configured service ratio
    #[must_use]
    pub fn ratio(&self) -> PriorityRatio {
        self.ratio
    }

    /// Register a module's priority; `false` if the name is already taken
    pub fn register_module(&self, module: &str, is_high_priority: bool) -> bool {
        let registered = self.priorities.try_register(module, is_high_priority);
        if registered {
            tracing::debug!(
                "Registered module {} ({} priority)",
                module,
                if is_high_priority { "high" } else { "low" }
            );
        }
        registered
    }

    /// Forget a module registration
    pub fn unregister_module(&self, module: &str) -> bool {
        self.priorities.remove(module).is_some()
    }

    /// Check whether a module is registered
    #[must_use]
    pub fn is_registered(&self, module: &str) -> bool {
        self.priorities.contains(module)
    }

    /// Priority class of a registered module
    #[must_use]
    pub fn is_high_priority(&self, module: &str) -> Option<bool> {
        self.priorities.get(module)
    }

    /// Queue a packet; `false` if its module was never registered
    pub fn enqueue(&self, packet: Packet) -> bool {
        let Some(is_high) = self.priorities.get(packet.module()) else {
            return false;
        };

        if is_high {
            self.high.enqueue(packet);
        } else {
            self.low.enqueue(packet);
        }
        self.available.notify_waiters();
        true
    }

    /// Pop the next packet according to the round-robin cursor
    ///
    /// When the scheduled sub-queue is empty the other one is served without
    /// consuming the turn.
    pub fn dequeue(&self) -> Option<Packet> {
        let mut cursor = self.cursor.lock();
        let high_turn = *cursor < self.ratio.high;

        let (scheduled, fallback) = if high_turn {
            (&self.high, &self.low)
        } else {
            (&self.low, &self.high)
        };

        if let Some(packet) = scheduled.dequeue() {
            *cursor = (*cursor + 1) % self.ratio.cycle_len();
            return Some(packet);
        }
        fallback.dequeue()
    }

    /// Total number of queued packets
    #[must_use]
    pub fn size(&self) -> usize {
        self.high.size() + self.low.size()
    }

    /// Check if both sub-queues are empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }

    /// Drop every queued packet and reset the cursor
    pub fn clear(&self) {
        let mut cursor = self.cursor.lock();
        self.high.clear();
        self.low.clear();
        *cursor = 0;
    }

    /// Wait until either sub-queue holds a packet
    pub async fn wait_for_packet(&self) {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn queue_with_modules() -> SendingQueue {
        let queue = SendingQueue::default();
        assert!(queue.register_module("hi", true));
        assert!(queue.register_module("lo", false));
        queue
    }

    #[test]
    fn test_unregistered_module_rejected() {
        let queue = queue_with_modules();
        assert!(!queue.enqueue(Packet::broadcast("x", "nobody")));
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let queue = queue_with_modules();
        assert!(!queue.register_module("hi", false));
        assert_eq!(queue.is_high_priority("hi"), Some(true));
    }

    #[test]
    fn test_weighted_round_robin() {
        let queue = queue_with_modules();
        for i in 0..6 {
            assert!(queue.enqueue(Packet::broadcast(format!("h{i}"), "hi")));
            assert!(queue.enqueue(Packet::broadcast(format!("l{i}"), "lo")));
        }

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
            .map(|p| p.into_serialized_data())
            .collect();

        assert_eq!(
            order,
            vec![
                "h0", "h1", "l0", "h2", "h3", "l1", "h4", "h5", "l2", "l3", "l4", "l5"
            ]
        );
    }

    #[test]
    fn test_fallback_does_not_consume_turn() {
        let queue = queue_with_modules();
        queue.enqueue(Packet::broadcast("l0", "lo"));
        queue.enqueue(Packet::broadcast("l1", "lo"));

        // High's turn but high is empty: low served, cursor stays on high
        assert_eq!(queue.dequeue().unwrap().serialized_data(), "l0");

        queue.enqueue(Packet::broadcast("h0", "hi"));
        queue.enqueue(Packet::broadcast("h1", "hi"));
        queue.enqueue(Packet::broadcast("h2", "hi"));

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
            .map(|p| p.into_serialized_data())
            .collect();
        assert_eq!(order, vec!["h0", "h1", "l1", "h2"]);
    }

    #[test]
    fn test_custom_ratio() {
        let queue = SendingQueue::new(PriorityRatio::new(1, 1));
        queue.register_module("hi", true);
        queue.register_module("lo", false);
        for i in 0..3 {
            queue.enqueue(Packet::broadcast(format!("h{i}"), "hi"));
            queue.enqueue(Packet::broadcast(format!("l{i}"), "lo"));
        }
        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
            .map(|p| p.into_serialized_data())
            .collect();
        assert_eq!(order, vec!["h0", "l0", "h1", "l1", "h2", "l2"]);
    }

    #[test]
    fn test_zero_weight_clamped() {
        let ratio = PriorityRatio::new(0, 0);
        assert_eq!(ratio.high(), 1);
        assert_eq!(ratio.low(), 1);
    }

    #[test]
    fn test_clear() {
        let queue = queue_with_modules();
        queue.enqueue(Packet::broadcast("a", "hi"));
        queue.enqueue(Packet::broadcast("b", "lo"));
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_concurrent_enqueue() {
        let queue = Arc::new(queue_with_modules());
        let handles: Vec<_> = ["hi", "lo"]
            .into_iter()
            .map(|module| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        assert!(queue.enqueue(Packet::broadcast(i.to_string(), module)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.size(), 200);
    }

    #[tokio::test]
    async fn test_wait_for_packet() {
        let queue = Arc::new(queue_with_modules());
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(Packet::broadcast("x", "lo"));
        });

        tokio::time::timeout(Duration::from_secs(1), queue.wait_for_packet())
            .await
            .expect("wait_for_packet did not wake");
        assert_eq!(queue.size(), 1);
    }
}
