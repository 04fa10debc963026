//! Per-connection read task

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::framing::FrameDecoder;
use crate::core::queue::ReceivingQueue;
use crate::error::{NetworkError, Result};

/// Default read buffer size
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Reads framed packets off one socket into the receiving queue
///
/// Trailing partial frames stay buffered until the next read completes. Once
/// stopped, a read that was already in flight is discarded.
pub struct SocketListener {
    label: String,
    read_half: Mutex<Option<OwnedReadHalf>>,
    queue: Arc<ReceivingQueue>,
    read_buffer_size: usize,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    close_notifier: Option<mpsc::UnboundedSender<String>>,
}

impl SocketListener {
    /// Create a listener for `read_half`
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        read_half: OwnedReadHalf,
        queue: Arc<ReceivingQueue>,
        read_buffer_size: usize,
    ) -> Self {
        Self {
            label: label.into(),
            read_half: Mutex::new(Some(read_half)),
            queue,
            read_buffer_size: read_buffer_size.max(1),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            close_notifier: None,
        }
    }

    /// Report the label on `notifier` when the peer closes or the read fails
    #[must_use]
    pub fn with_close_notifier(mut self, notifier: mpsc::UnboundedSender<String>) -> Self {
        self.close_notifier = Some(notifier);
        self
    }

    /// Start reading
    pub fn start(&self) -> Result<()> {
        let read_half = self
            .read_half
            .lock()
            .take()
            .ok_or_else(|| NetworkError::invalid_state("Socket listener already started"))?;

        self.running.store(true, Ordering::Release);

        let task = tokio::spawn(read_loop(
            self.label.clone(),
            read_half,
            Arc::clone(&self.queue),
            self.read_buffer_size,
            Arc::clone(&self.running),
            self.close_notifier.clone(),
        ));
        *self.task.lock() = Some(task);

        tracing::debug!("Socket listener for {} started", self.label);
        Ok(())
    }

    /// Stop reading; the socket's read half is dropped with the task
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        tracing::debug!("Socket listener for {} stopped", self.label);
    }

    /// Check if the listener is still reading
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Connection label (client id or peer address)
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn read_loop(
    label: String,
    mut read_half: OwnedReadHalf,
    queue: Arc<ReceivingQueue>,
    read_buffer_size: usize,
    running: Arc<AtomicBool>,
    close_notifier: Option<mpsc::UnboundedSender<String>>,
) {
    let mut decoder = FrameDecoder::new();

    loop {
        decoder.buffer_mut().reserve(read_buffer_size);

        match read_half.read_buf(decoder.buffer_mut()).await {
            Ok(0) => {
                tracing::info!("Connection {} closed by peer", label);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Read from {} failed: {}", label, e);
                break;
            }
        }

        if !drain_decoder(&label, &mut decoder, &queue, &running) {
            return;
        }
    }

    // Only report a close that was not caused by stop()
    if running.swap(false, Ordering::AcqRel) {
        if let Some(notifier) = close_notifier {
            let _ = notifier.send(label);
        }
    }
}

/// Move every complete frame into the queue; `false` once the listener was stopped
fn drain_decoder(
    label: &str,
    decoder: &mut FrameDecoder,
    queue: &ReceivingQueue,
    running: &AtomicBool,
) -> bool {
    loop {
        match decoder.decode() {
            Ok(Some(packet)) => {
                if !running.load(Ordering::Acquire) {
                    return false;
                }
                tracing::trace!("Received {} from {}", packet, label);
                queue.enqueue(packet);
            }
            Ok(None) => return running.load(Ordering::Acquire),
            Err(e) => tracing::warn!("Dropping malformed frame from {}: {}", label, e),
        }
    }
}
