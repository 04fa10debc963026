//! Thread-safe packet FIFO with async wait-for-item

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

use crate::core::packet::Packet;

/// Self-locking FIFO of packets
///
/// Producers may be plain threads or tasks; consumers await
/// [`PacketQueue::wait_for_packet`] instead of polling.
#[derive(Debug, Default)]
pub struct PacketQueue {
    items: Mutex<VecDeque<Packet>>,
    available: Notify,
}

/// Queue of packets read off the wire, awaiting dispatch
pub type ReceivingQueue = PacketQueue;

impl PacketQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet to the tail
    pub fn enqueue(&self, packet: Packet) {
        self.items.lock().push_back(packet);
        self.available.notify_waiters();
    }

    /// Pop the head packet, if any
    pub fn dequeue(&self) -> Option<Packet> {
        self.items.lock().pop_front()
    }

    /// Number of queued packets
    #[must_use]
    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    /// Check if queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drop every queued packet
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Wait until at least one packet is queued
    pub async fn wait_for_packet(&self) {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so an enqueue in between is not missed
            notified.as_mut().enable();

            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
