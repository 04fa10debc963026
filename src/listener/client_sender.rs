//! Client-side write task

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::framing::frame;
use crate::core::sending_queue::SendingQueue;
use crate::error::{NetworkError, Result};
use crate::listener::frame_writer::write_frame;

/// Drains the sending queue onto the client's single socket
///
/// A failed write that sent nothing is logged and the loop carries on with the next
/// packet. A write cut off part way closes the write side, since anything sent after
/// it would land in the middle of a frame.
pub struct ClientSendListener {
    write_half: Mutex<Option<OwnedWriteHalf>>,
    queue: Arc<SendingQueue>,
    write_timeout: Duration,
    running: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSendListener {
    /// Create a writer for `write_half`
    #[must_use]
    pub fn new(write_half: OwnedWriteHalf, queue: Arc<SendingQueue>, write_timeout: Duration) -> Self {
        Self {
            write_half: Mutex::new(Some(write_half)),
            queue,
            write_timeout,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Start the write loop
    pub fn start(&self) -> Result<()> {
        let write_half = self
            .write_half
            .lock()
            .take()
            .ok_or_else(|| NetworkError::invalid_state("Send listener already started"))?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        self.running.store(true, Ordering::Release);

        let task = tokio::spawn(write_loop(
            write_half,
            Arc::clone(&self.queue),
            self.write_timeout,
            Arc::clone(&self.running),
            shutdown_rx,
        ));
        *self.task.lock() = Some(task);

        tracing::debug!("Client send listener started");
        Ok(())
    }

    /// Stop the loop and shut down the socket's write side
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
        tracing::debug!("Client send listener stopped");
    }

    /// Check if the loop is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for ClientSendListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    queue: Arc<SendingQueue>,
    write_timeout: Duration,
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

            let framed = match frame(&packet) {
                Ok(framed) => framed,
                Err(e) => {
                    tracing::warn!("Dropping {}: {}", packet, e);
                    continue;
                }
            };

            match write_frame(&mut write_half, framed.as_bytes(), write_timeout).await {
                Ok(()) => tracing::trace!("Sent {}", packet),
                Err(failure) if failure.is_torn() => {
                    tracing::error!(
                        "Write of {} broke off after {} bytes, closing connection: {}",
                        packet,
                        failure.written,
                        failure.error
                    );
                    running.store(false, Ordering::Release);
                    break 'outer;
                }
                Err(failure) => tracing::warn!("Failed to write {}: {}", packet, failure.error),
            }
        }
    }

    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::framing::FrameDecoder;
    use crate::core::packet::Packet;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_writes_in_priority_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let queue = Arc::new(SendingQueue::default());
        queue.register_module("hi", true);
        queue.register_module("lo", false);
        queue.enqueue(Packet::broadcast("l0", "lo"));
        queue.enqueue(Packet::broadcast("h0", "hi"));
        queue.enqueue(Packet::broadcast("h1", "hi"));

        let (_read_half, write_half) = client.into_split();
        let sender = ClientSendListener::new(write_half, Arc::clone(&queue), Duration::from_secs(1));
        sender.start().unwrap();

        let mut decoder = FrameDecoder::new();
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), async {
            while received.len() < 3 {
                let mut chunk = [0u8; 256];
                let n = server.read(&mut chunk).await.unwrap();
                decoder.extend(&chunk[..n]);
                while let Some(packet) = decoder.decode().unwrap() {
                    received.push(packet.into_serialized_data());
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(received, vec!["h0", "h1", "l0"]);
        sender.stop().await;
        assert!(!sender.is_running());
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_failed_writes_are_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        socket2::SockRef::from(&server).set_linger(Some(Duration::ZERO)).unwrap();
        drop(server);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let queue = Arc::new(SendingQueue::default());
        queue.register_module("chat", true);
        for i in 0..3 {
            queue.enqueue(Packet::broadcast(format!("m{i}"), "chat"));
        }

        let (_read_half, write_half) = client.into_split();
        let sender = ClientSendListener::new(write_half, Arc::clone(&queue), Duration::from_secs(1));
        sender.start().unwrap();

        wait_until(|| queue.is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sender.is_running());
        sender.stop().await;
    }

    #[tokio::test]
    async fn test_torn_write_closes_writer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        socket2::SockRef::from(&server).set_recv_buffer_size(4096).unwrap();
        socket2::SockRef::from(&client).set_send_buffer_size(4096).unwrap();

        let queue = Arc::new(SendingQueue::default());
        queue.register_module("chat", true);
        queue.enqueue(Packet::broadcast("x".repeat(4 * 1024 * 1024), "chat"));

        let (_read_half, write_half) = client.into_split();
        let sender =
            ClientSendListener::new(write_half, Arc::clone(&queue), Duration::from_millis(200));
        sender.start().unwrap();

        wait_until(|| !sender.is_running()).await;
        queue.enqueue(Packet::broadcast("after", "chat"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.size(), 1);

        sender.stop().await;
        drop(server);
    }
}
