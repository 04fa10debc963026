//! Receive-side dispatch
//!
//! The dispatch loop never runs handler code itself. Each module gets its own
//! worker task fed by a FIFO channel, so one slow module cannot delay the others
//! while every module still sees its packets in arrival order.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::queue::ReceivingQueue;
use crate::core::registry::Registry;
use crate::error::{NetworkError, Result};
use crate::handler::NotificationHandler;

/// Module name → handler table
pub type HandlerRegistry = Registry<Arc<dyn NotificationHandler>>;

struct ModuleWorker {
    tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl ModuleWorker {
    fn spawn(module: String, handler: Arc<dyn NotificationHandler>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let task = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                handler.on_data_received(data).await;
            }
            tracing::debug!("Dispatch worker for module {} exited", module);
        });
        Self { tx, task }
    }

    /// Hand data to the worker; gives the data back if the worker died
    fn push(&self, data: String) -> std::result::Result<(), String> {
        self.tx.send(data).map_err(|e| e.0)
    }
}

/// Routes received packets to the handler of their module
pub struct ReceiveQueueListener {
    queue: Arc<ReceivingQueue>,
    handlers: Arc<HandlerRegistry>,
    running: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReceiveQueueListener {
    /// Create a dispatcher over a shared handler table
    #[must_use]
    pub fn new(queue: Arc<ReceivingQueue>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            queue,
            handlers,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Register a module's handler; `false` if the name is already taken
    pub fn register_module(&self, module: &str, handler: Arc<dyn NotificationHandler>) -> bool {
        self.handlers.try_register(module, handler)
    }

    /// Forget a module's handler
    pub fn unregister_module(&self, module: &str) -> bool {
        self.handlers.remove(module).is_some()
    }

    /// Shared handler table
    #[must_use]
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Start dispatching
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(NetworkError::invalid_state("Receive listener already running"));
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let task = tokio::spawn(dispatch_loop(
            Arc::clone(&self.queue),
            Arc::clone(&self.handlers),
            Arc::clone(&self.running),
            shutdown_rx,
        ));
        *self.task.lock() = Some(task);

        tracing::debug!("Receive listener started");
        Ok(())
    }

    /// Stop dispatching; module workers are torn down with the loop
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
        tracing::debug!("Receive listener stopped");
    }

    /// Check if the dispatcher is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for ReceiveQueueListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn dispatch_loop(
    queue: Arc<ReceivingQueue>,
    handlers: Arc<HandlerRegistry>,
    running: Arc<AtomicBool>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut workers: HashMap<String, ModuleWorker> = HashMap::new();

    'outer: loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = queue.wait_for_packet() => {}
        }

        while let Some(packet) = queue.dequeue() {
            if !running.load(Ordering::Acquire) {
                break 'outer;
            }

            let module = packet.module().to_string();
            let Some(handler) = handlers.get(&module) else {
                tracing::warn!("No handler for module {}, dropping {}", module, packet);
                continue;
            };

            let data = packet.into_serialized_data();
            let worker = workers
                .entry(module.clone())
                .or_insert_with(|| ModuleWorker::spawn(module.clone(), Arc::clone(&handler)));

            if let Err(data) = worker.push(data) {
                // Handler panicked and took its worker down; start a fresh one
                tracing::error!("Dispatch worker for module {} died, restarting", module);
                let replacement = ModuleWorker::spawn(module.clone(), handler);
                let _ = replacement.push(data);
                workers.insert(module, replacement);
            }
        }
    }

    for (_, worker) in workers.drain() {
        worker.task.abort();
    }
}
