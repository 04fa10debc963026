//! Server-side communicator

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::communicator::{
    configure_stream, subscribe_module, Communicator, SERVER_IP_ENV, SERVER_PORT_ENV,
};
use crate::core::packet::Packet;
use crate::core::queue::ReceivingQueue;
use crate::core::registry::Registry;
use crate::core::sending_queue::{PriorityRatio, SendingQueue};
use crate::error::{NetworkError, Result};
use crate::handler::{NotificationHandler, PendingConnection};
use crate::listener::socket::DEFAULT_READ_BUFFER_SIZE;
use crate::listener::{
    ClientLane, HandlerRegistry, ReceiveQueueListener, RetryPolicy, ServerSendListener,
    SocketListener,
};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind; `None` picks the first non-loopback local IPv4
    pub bind_ip: Option<IpAddr>,
    /// Port to bind; 0 lets the OS choose
    pub port: u16,
    /// Write timeout for a single frame
    pub write_timeout: Duration,
    /// Write retries before a client is considered gone
    pub max_send_retries: u32,
    /// Delay between write retries
    pub retry_delay: Duration,
    /// Keep-alive interval
    pub keep_alive: Option<Duration>,
    /// Read buffer size of each client's socket listener
    pub read_buffer_size: usize,
    /// High/low service ratio of the sending queue
    pub priority_ratio: PriorityRatio,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: None,
            port: 0,
            write_timeout: Duration::from_secs(10),
            max_send_retries: 3,
            retry_delay: Duration::from_millis(100),
            keep_alive: Some(Duration::from_secs(60)),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            priority_ratio: PriorityRatio::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default configuration with the test-mode environment overrides applied
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(ip) = std::env::var(SERVER_IP_ENV) {
            match ip.parse() {
                Ok(ip) => config.bind_ip = Some(ip),
                Err(e) => tracing::warn!("Ignoring {}={}: {}", SERVER_IP_ENV, ip, e),
            }
        }
        if let Ok(port) = std::env::var(SERVER_PORT_ENV) {
            match port.parse() {
                Ok(port) => config.port = port,
                Err(e) => tracing::warn!("Ignoring {}={}: {}", SERVER_PORT_ENV, port, e),
            }
        }

        config
    }

    /// Set bind address
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = Some(ip);
        self
    }

    /// Set port
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set write timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set retry count and delay for failed writes
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_send_retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_send_retries = max_retries;
        self.retry_delay = delay;
        self
    }

    /// Set keep-alive interval
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval;
        self
    }

    /// Set read buffer size
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the high/low priority service ratio
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_priority_ratio(mut self, ratio: PriorityRatio) -> Self {
        self.priority_ratio = ratio;
        self
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_send_retries,
            retry_delay: self.retry_delay,
            write_timeout: self.write_timeout,
        }
    }
}

/// Server facade: accepts clients and multiplexes modules across them
///
/// Inbound connections are offered to every module through
/// [`NotificationHandler::on_client_joined`]; a module assigns the client an id
/// and calls [`Communicator::add_client`].
pub struct ServerCommunicator {
    config: ServerConfig,
    running: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    sending_queue: Arc<SendingQueue>,
    receiving_queue: Arc<ReceivingQueue>,
    handlers: Arc<HandlerRegistry>,
    /// client id → writer of its socket
    lanes: Arc<Registry<Arc<ClientLane>>>,
    /// client id → reader of its socket
    readers: Arc<Registry<SocketListener>>,
    sender: ServerSendListener,
    receiver: ReceiveQueueListener,
    subscribe_lock: Mutex<()>,
    evictions_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    accept_shutdown: Mutex<Option<mpsc::Sender<()>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ServerCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCommunicator {
    /// Create a server with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Create a server with custom configuration
    #[must_use]
    pub fn with_config(config: ServerConfig) -> Self {
        let sending_queue = Arc::new(SendingQueue::new(config.priority_ratio));
        let receiving_queue = Arc::new(ReceivingQueue::new());
        let handlers: Arc<HandlerRegistry> = Arc::new(Registry::new());
        let lanes = Arc::new(Registry::new());

        let sender = ServerSendListener::new(Arc::clone(&sending_queue), Arc::clone(&lanes));
        let receiver = ReceiveQueueListener::new(Arc::clone(&receiving_queue), Arc::clone(&handlers));

        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
            sending_queue,
            receiving_queue,
            handlers,
            lanes,
            readers: Arc::new(Registry::new()),
            sender,
            receiver,
            subscribe_lock: Mutex::new(()),
            evictions_tx: Mutex::new(None),
            accept_shutdown: Mutex::new(None),
            accept_task: Mutex::new(None),
            eviction_task: Mutex::new(None),
        }
    }

    /// Bind, start the send/receive tasks and begin accepting clients
    ///
    /// Returns the bound `ip:port`.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(NetworkError::invalid_state("Server is already running"));
        }

        match self.start_tasks().await {
            Ok(addr) => {
                tracing::info!("Server communicator listening on {}", addr);
                Ok(addr)
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                self.sender.stop().await;
                self.receiver.stop().await;
                tracing::error!("Failed to start server communicator: {}", e);
                Err(e)
            }
        }
    }

    async fn start_tasks(&self) -> Result<SocketAddr> {
        let ip = match self.config.bind_ip {
            Some(ip) => ip,
            None => local_ipv4().await,
        };

        let listener = TcpListener::bind(SocketAddr::new(ip, self.config.port))
            .await
            .map_err(|e| NetworkError::connection(format!("Failed to bind: {}", e)))?;
        let addr = listener.local_addr()?;

        self.sender.start()?;
        self.receiver.start()?;

        let (evictions_tx, evictions_rx) = mpsc::unbounded_channel();
        *self.evictions_tx.lock() = Some(evictions_tx);
        *self.eviction_task.lock() = Some(tokio::spawn(eviction_loop(
            evictions_rx,
            Arc::clone(&self.lanes),
            Arc::clone(&self.readers),
            Arc::clone(&self.handlers),
        )));

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.accept_shutdown.lock() = Some(shutdown_tx);
        *self.accept_task.lock() = Some(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.handlers),
            self.config.keep_alive,
            shutdown_rx,
        )));

        *self.local_addr.lock() = Some(addr);
        Ok(addr)
    }

    /// Check if server is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bound address while running
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Ids of the currently registered clients
    #[must_use]
    pub fn client_ids(&self) -> Vec<String> {
        self.lanes.names()
    }

    /// Check whether a client id is registered
    #[must_use]
    pub fn has_client(&self, client_id: &str) -> bool {
        self.lanes.contains(client_id)
    }

    /// Number of packets waiting to be fanned out
    #[must_use]
    pub fn pending_sends(&self) -> usize {
        self.sending_queue.size()
    }
}

#[async_trait]
impl Communicator for ServerCommunicator {
    async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let accept_shutdown = self.accept_shutdown.lock().take();
        if let Some(tx) = accept_shutdown {
            let _ = tx.send(()).await;
        }
        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }

        for (_, reader) in self.readers.drain() {
            reader.stop();
        }
        for (_, lane) in self.lanes.drain() {
            lane.abort();
        }

        self.sender.stop().await;
        self.receiver.stop().await;

        self.evictions_tx.lock().take();
        let eviction_task = self.eviction_task.lock().take();
        if let Some(task) = eviction_task {
            task.abort();
        }

        self.sending_queue.clear();
        self.receiving_queue.clear();
        *self.local_addr.lock() = None;
        tracing::info!("Server communicator stopped");
    }

    fn send(&self, data: &str, module: &str) -> Result<()> {
        if self.sending_queue.enqueue(Packet::broadcast(data, module)) {
            Ok(())
        } else {
            tracing::warn!("Send for unregistered module {} rejected", module);
            Err(NetworkError::ModuleNotRegistered(module.to_string()))
        }
    }

    fn send_to(&self, data: &str, module: &str, destination: &str) -> Result<()> {
        if !self.lanes.contains(destination) {
            return Err(NetworkError::UnknownClient(destination.to_string()));
        }
        if self
            .sending_queue
            .enqueue(Packet::unicast(data, module, destination))
        {
            Ok(())
        } else {
            tracing::warn!("Send for unregistered module {} rejected", module);
            Err(NetworkError::ModuleNotRegistered(module.to_string()))
        }
    }

    fn subscribe(
        &self,
        module: &str,
        handler: Arc<dyn NotificationHandler>,
        is_high_priority: bool,
    ) -> bool {
        subscribe_module(
            &self.subscribe_lock,
            &self.sending_queue,
            &self.handlers,
            module,
            handler,
            is_high_priority,
        )
    }

    fn add_client(&self, client_id: &str, connection: &PendingConnection) -> Result<()> {
        let evictions = self
            .evictions_tx
            .lock()
            .clone()
            .ok_or_else(|| NetworkError::invalid_state("Server is not running"))?;

        // A reader without a lane belongs to a client the eviction actor is still tearing down
        if self.lanes.contains(client_id) || self.readers.contains(client_id) {
            return Err(NetworkError::ClientAlreadyRegistered(client_id.to_string()));
        }

        let stream = connection
            .take()
            .ok_or_else(|| NetworkError::invalid_state("Connection was already claimed"))?;
        let (read_half, write_half) = stream.into_split();

        let lane = Arc::new(ClientLane::spawn(
            client_id,
            write_half,
            self.config.retry_policy(),
            evictions.clone(),
        ));
        if !self.lanes.try_register(client_id, Arc::clone(&lane)) {
            lane.abort();
            return Err(NetworkError::ClientAlreadyRegistered(client_id.to_string()));
        }

        let reader = SocketListener::new(
            client_id,
            read_half,
            Arc::clone(&self.receiving_queue),
            self.config.read_buffer_size,
        )
        .with_close_notifier(evictions);

        // Register before starting so an immediate close finds the entry to evict
        let started = if self.readers.try_register(client_id, reader) {
            self.readers
                .with(client_id, SocketListener::start)
                .unwrap_or_else(|| {
                    Err(NetworkError::invalid_state("Client evicted during registration"))
                })
        } else {
            Err(NetworkError::ClientAlreadyRegistered(client_id.to_string()))
        };

        if let Err(e) = started {
            self.lanes
                .remove_if(client_id, |current| Arc::ptr_eq(current, &lane));
            lane.abort();
            tracing::warn!("Failed to register client {}: {}", client_id, e);
            return Err(e);
        }

        tracing::info!(
            "Client {} registered from {}",
            client_id,
            connection.peer_addr()
        );
        Ok(())
    }

    fn remove_client(&self, client_id: &str) -> Result<()> {
        let reader = self.readers.remove(client_id);
        let lane = self.lanes.remove(client_id);

        if reader.is_none() && lane.is_none() {
            return Err(NetworkError::UnknownClient(client_id.to_string()));
        }

        if let Some(reader) = reader {
            reader.stop();
        }
        if let Some(lane) = lane {
            lane.close();
        }

        tracing::info!("Client {} removed", client_id);
        Ok(())
    }
}

impl Drop for ServerCommunicator {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            tracing::warn!("ServerCommunicator dropped while still running - aborting tasks");

            if let Some(task) = self.accept_task.get_mut().take() {
                task.abort();
            }
            if let Some(task) = self.eviction_task.get_mut().take() {
                task.abort();
            }
            for (_, lane) in self.lanes.drain() {
                lane.abort();
            }
            for (_, reader) in self.readers.drain() {
                reader.stop();
            }
            self.running.store(false, Ordering::Release);
        }
    }
}

/// First non-loopback local IPv4, falling back to 127.0.0.1
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick the
/// outbound interface.
async fn local_ipv4() -> IpAddr {
    let discover = async {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).await?;
        Ok::<_, std::io::Error>(socket.local_addr()?)
    };

    match discover.await {
        Ok(addr) if !addr.ip().is_loopback() && !addr.ip().is_unspecified() => addr.ip(),
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            tracing::debug!("No routable local IPv4 ({}), using loopback", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handlers: Arc<HandlerRegistry>,
    keep_alive: Option<Duration>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                let stream = match configure_stream(stream, keep_alive) {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!("Rejecting {}: {}", peer_addr, e);
                        continue;
                    }
                };

                tracing::info!("Accepted connection from {}", peer_addr);
                let connection = PendingConnection::new(stream, peer_addr);
                let handlers = handlers.values();

                // Handlers may be slow; keep accepting meanwhile
                tokio::spawn(async move {
                    for handler in handlers {
                        handler.on_client_joined(connection.clone()).await;
                    }
                    if connection.take().is_some() {
                        tracing::warn!("No module claimed connection from {}, closing it", peer_addr);
                    }
                });
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Accept loop received shutdown signal");
                break;
            }
        }
    }
}

/// Tears down clients whose socket died and tells every module
async fn eviction_loop(
    mut evictions: mpsc::UnboundedReceiver<String>,
    lanes: Arc<Registry<Arc<ClientLane>>>,
    readers: Arc<Registry<SocketListener>>,
    handlers: Arc<HandlerRegistry>,
) {
    while let Some(client_id) = evictions.recv().await {
        let lane = lanes.remove(&client_id);
        let reader = readers.remove(&client_id);

        // Already removed explicitly, or a second report for the same client
        if lane.is_none() && reader.is_none() {
            continue;
        }

        if let Some(reader) = reader {
            reader.stop();
        }
        if let Some(lane) = lane {
            lane.abort();
        }

        tracing::info!("Client {} disconnected", client_id);
        for handler in handlers.values() {
            handler.on_client_left(&client_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl NotificationHandler for Noop {
        async fn on_data_received(&self, _serialized_data: String) {}
    }

    fn loopback_config() -> ServerConfig {
        ServerConfig::new().with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new()
            .with_port(9000)
            .with_send_retries(5, Duration::from_millis(50));

        assert_eq!(config.port, 9000);
        assert_eq!(config.max_send_retries, 5);
        assert_eq!(config.retry_policy().retry_delay, Duration::from_millis(50));
        assert!(config.bind_ip.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = ServerCommunicator::new();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
        assert!(server.client_ids().is_empty());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let server = ServerCommunicator::with_config(loopback_config());
        let addr = server.start().await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert!(server.is_running());
        assert!(server.start().await.is_err());

        server.stop().await;
        assert!(!server.is_running());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_client_fails() {
        let server = ServerCommunicator::with_config(loopback_config());
        server.subscribe("chat", Arc::new(Noop), true);
        server.start().await.unwrap();

        assert!(matches!(
            server.send_to("hi", "chat", "nobody"),
            Err(NetworkError::UnknownClient(_))
        ));
        assert!(server.send("hi", "chat").is_ok());
        assert!(matches!(
            server.send("hi", "unknown"),
            Err(NetworkError::ModuleNotRegistered(_))
        ));
        assert!(matches!(
            server.remove_client("nobody"),
            Err(NetworkError::UnknownClient(_))
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_local_ipv4_is_usable() {
        let ip = local_ipv4().await;
        assert!(ip.is_ipv4());
        assert!(!ip.is_unspecified());
    }

    #[tokio::test]
    async fn test_add_client_rejects_id_still_being_evicted() {
        use tokio::net::TcpStream;

        let server = ServerCommunicator::with_config(loopback_config());
        let addr = server.start().await.unwrap();

        // Reader left behind by an eviction that has removed the lane but not the reader
        let stale = TcpStream::connect(addr).await.unwrap();
        let (stale_read, _stale_write) = stale.into_split();
        let stale_reader = SocketListener::new(
            "7",
            stale_read,
            Arc::clone(&server.receiving_queue),
            DEFAULT_READ_BUFFER_SIZE,
        );
        stale_reader.start().unwrap();
        assert!(server.readers.try_register("7", stale_reader));

        let fresh = TcpStream::connect(addr).await.unwrap();
        let peer_addr = fresh.peer_addr().unwrap();
        let connection = PendingConnection::new(fresh, peer_addr);
        assert!(matches!(
            server.add_client("7", &connection),
            Err(NetworkError::ClientAlreadyRegistered(_))
        ));
        assert!(!connection.is_claimed());
        assert!(!server.has_client("7"));
        assert!(matches!(
            server.send_to("hi", "chat", "7"),
            Err(NetworkError::UnknownClient(_))
        ));

        server.readers.remove("7");
        server.add_client("7", &connection).unwrap();
        assert!(server.has_client("7"));
        assert!(connection.is_claimed());
        server.stop().await;
    }
}
