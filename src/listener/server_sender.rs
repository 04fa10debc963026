//! Server-side fan-out write path
//!
//! A single [`ServerSendListener`] drains the shared sending queue and resolves
//! each packet's destination. Bytes are handed to one [`ClientLane`] per connected
//! client; the lane task is the only writer of its socket and owns the
//! retry-before-eviction policy. Packets for a client whose lane is retrying queue
//! behind the retry, so per-destination order is kept and other clients are not held up.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::framing::frame;
use crate::core::registry::Registry;
use crate::core::sending_queue::SendingQueue;
use crate::error::{NetworkError, Result};
use crate::listener::frame_writer::write_frame;

/// How long a lane keeps trying before declaring its client gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed write
    pub max_retries: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
    /// Upper bound for a single write attempt
    pub write_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Single-writer channel to one client socket
pub struct ClientLane {
    client_id: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    task: JoinHandle<()>,
}

impl ClientLane {
    /// Spawn the lane task; `evictions` receives the client id if the socket dies
    #[must_use]
    pub fn spawn(
        client_id: impl Into<String>,
        write_half: OwnedWriteHalf,
        policy: RetryPolicy,
        evictions: mpsc::UnboundedSender<String>,
    ) -> Self {
        let client_id = client_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(lane_loop(client_id.clone(), write_half, rx, policy, evictions));

        Self {
            client_id,
            tx: Mutex::new(Some(tx)),
            task,
        }
    }

    /// Client id served by this lane
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Queue framed bytes; `false` if the lane already closed
    pub fn push(&self, frame: Bytes) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Stop accepting bytes; queued frames are still written, then the socket is shut down
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Drop the lane immediately, discarding queued frames
    pub fn abort(&self) {
        self.tx.lock().take();
        self.task.abort();
    }

    /// Whether the lane task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn lane_loop(
    client_id: String,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    policy: RetryPolicy,
    evictions: mpsc::UnboundedSender<String>,
) {
    while let Some(frame) = rx.recv().await {
        if !write_with_retry(&client_id, &mut write_half, &frame, policy).await {
            tracing::warn!("Client {} unreachable, evicting", client_id);
            let _ = evictions.send(client_id);
            return;
        }
    }

    let _ = write_half.shutdown().await;
    tracing::debug!("Lane for client {} closed", client_id);
}

/// First attempt doubles as the liveness check
///
/// Only failures that wrote nothing are retried; a frame cut off part way gives up at once.
async fn write_with_retry(
    client_id: &str,
    write_half: &mut OwnedWriteHalf,
    frame: &[u8],
    policy: RetryPolicy,
) -> bool {
    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            tokio::time::sleep(policy.retry_delay).await;
            tracing::debug!(
                "Retrying write to client {} ({}/{})",
                client_id,
                attempt,
                policy.max_retries
            );
        }

        match write_frame(write_half, frame, policy.write_timeout).await {
            Ok(()) => return true,
            Err(failure) if failure.is_torn() => {
                tracing::warn!(
                    "Write to client {} broke off after {} of {} bytes: {}",
                    client_id,
                    failure.written,
                    frame.len(),
                    failure.error
                );
                return false;
            }
            Err(failure) => tracing::warn!("Write to client {} failed: {}", client_id, failure.error),
        }
    }
    false
}

/// Drains the shared sending queue into client lanes
pub struct ServerSendListener {
    queue: Arc<SendingQueue>,
    lanes: Arc<Registry<Arc<ClientLane>>>,
    running: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerSendListener {
    /// Create the fan-out listener over a lane table
    #[must_use]
    pub fn new(queue: Arc<SendingQueue>, lanes: Arc<Registry<Arc<ClientLane>>>) -> Self {
        Self {
            queue,
            lanes,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Start the fan-out loop
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(NetworkError::invalid_state("Server send listener already running"));
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let task = tokio::spawn(fan_out_loop(
            Arc::clone(&self.queue),
            Arc::clone(&self.lanes),
            Arc::clone(&self.running),
            shutdown_rx,
        ));
        *self.task.lock() = Some(task);

        tracing::debug!("Server send listener started");
        Ok(())
    }

    /// Stop the fan-out loop
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let shutdown_tx = self.shutdown_tx.lock().take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(()).await;
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::debug!("Server send listener stopped");
    }

    /// Check if the loop is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

async fn fan_out_loop(
    queue: Arc<SendingQueue>,
    lanes: Arc<Registry<Arc<ClientLane>>>,
    running: Arc<AtomicBool>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    'outer: loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = queue.wait_for_packet() => {}
        }

        while let Some(packet) = queue.dequeue() {
            if !running.load(Ordering::Acquire) {
                break 'outer;
            }

            let bytes = match frame(&packet) {
                Ok(framed) => Bytes::from(framed),
                Err(e) => {
                    tracing::warn!("Dropping {}: {}", packet, e);
                    continue;
                }
            };

            match packet.destination() {
                None => {
                    for lane in lanes.values() {
                        if !lane.push(bytes.clone()) {
                            tracing::debug!("Lane for client {} is closed", lane.client_id());
                        }
                    }
                }
                Some(client_id) => match lanes.get(client_id) {
                    Some(lane) => {
                        if !lane.push(bytes) {
                            tracing::debug!("Lane for client {} is closed", client_id);
                        }
                    }
                    None => tracing::warn!("Dropping {}: client {} is gone", packet, client_id),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::framing::FrameDecoder;
    use crate::core::packet::Packet;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn read_packets(stream: &mut TcpStream, count: usize) -> Vec<Packet> {
        let mut decoder = FrameDecoder::new();
        let mut packets = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), async {
            while packets.len() < count {
                let mut chunk = [0u8; 512];
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "peer closed early");
                decoder.extend(&chunk[..n]);
                while let Some(packet) = decoder.decode().unwrap() {
                    packets.push(packet);
                }
            }
        })
        .await
        .expect("timed out reading packets");
        packets
    }

    #[tokio::test]
    async fn test_broadcast_and_unicast_routing() {
        let (mut peer_a, server_a) = socket_pair().await;
        let (mut peer_b, server_b) = socket_pair().await;
        let (evict_tx, _evict_rx) = mpsc::unbounded_channel();

        let lanes = Arc::new(Registry::new());
        for (id, stream) in [("a", server_a), ("b", server_b)] {
            let (_read, write) = stream.into_split();
            let lane = ClientLane::spawn(id, write, RetryPolicy::default(), evict_tx.clone());
            assert!(lanes.try_register(id, Arc::new(lane)));
        }

        let queue = Arc::new(SendingQueue::default());
        queue.register_module("chat", true);
        let listener = ServerSendListener::new(Arc::clone(&queue), Arc::clone(&lanes));
        listener.start().unwrap();
        assert!(listener.start().is_err());

        queue.enqueue(Packet::broadcast("everyone", "chat"));
        queue.enqueue(Packet::unicast("only b", "chat", "b"));
        queue.enqueue(Packet::unicast("nobody", "chat", "missing"));

        let a = read_packets(&mut peer_a, 1).await;
        assert_eq!(a[0].serialized_data(), "everyone");

        let b = read_packets(&mut peer_b, 2).await;
        assert_eq!(b[0].serialized_data(), "everyone");
        assert_eq!(b[1].serialized_data(), "only b");

        listener.stop().await;
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_lane_close_flushes_then_shuts_down() {
        let (mut peer, server) = socket_pair().await;
        let (_read, write) = server.into_split();
        let (evict_tx, mut evict_rx) = mpsc::unbounded_channel();
        let lane = ClientLane::spawn("c", write, RetryPolicy::default(), evict_tx);

        let framed = frame(&Packet::unicast("bye", "chat", "c")).unwrap();
        assert!(lane.push(Bytes::from(framed)));
        lane.close();
        assert!(!lane.push(Bytes::from_static(b"late")));

        let packets = read_packets(&mut peer, 1).await;
        assert_eq!(packets[0].serialized_data(), "bye");

        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), peer.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(evict_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lane_retries_then_evicts_reset_peer() {
        let (peer, server) = socket_pair().await;
        socket2::SockRef::from(&peer).set_linger(Some(Duration::ZERO)).unwrap();
        drop(peer);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (_read, write) = server.into_split();
        let (evict_tx, mut evict_rx) = mpsc::unbounded_channel();
        let policy = RetryPolicy {
            max_retries: 3,
            retry_delay: Duration::from_millis(40),
            write_timeout: Duration::from_secs(1),
        };
        let lane = ClientLane::spawn("gone", write, policy, evict_tx);

        let started = tokio::time::Instant::now();
        let framed = frame(&Packet::unicast("anyone there", "chat", "gone")).unwrap();
        assert!(lane.push(Bytes::from(framed)));

        let evicted = tokio::time::timeout(Duration::from_secs(2), evict_rx.recv())
            .await
            .expect("lane never gave up");
        assert_eq!(evicted.as_deref(), Some("gone"));
        assert!(started.elapsed() >= policy.retry_delay * policy.max_retries);
        assert!(evict_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_lane_evicts_without_retry_after_torn_write() {
        let (peer, server) = socket_pair().await;
        socket2::SockRef::from(&peer).set_recv_buffer_size(4096).unwrap();
        socket2::SockRef::from(&server).set_send_buffer_size(4096).unwrap();

        let (_read, write) = server.into_split();
        let (evict_tx, mut evict_rx) = mpsc::unbounded_channel();
        let policy = RetryPolicy {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            write_timeout: Duration::from_millis(200),
        };
        let lane = ClientLane::spawn("stalled", write, policy, evict_tx);

        // The peer never reads, so the frame stops part way
        assert!(lane.push(Bytes::from(vec![b'x'; 8 * 1024 * 1024])));

        let evicted = tokio::time::timeout(Duration::from_secs(2), evict_rx.recv())
            .await
            .expect("torn write was retried");
        assert_eq!(evicted.as_deref(), Some("stalled"));
        drop(peer);
    }
}
