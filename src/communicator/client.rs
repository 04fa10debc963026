//! Client-side communicator

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::communicator::{
    configure_stream, server_address_from_env, subscribe_module, Communicator, SERVER_IP_ENV,
    SERVER_PORT_ENV,
};
use crate::core::packet::Packet;
use crate::core::queue::ReceivingQueue;
use crate::core::registry::Registry;
use crate::core::sending_queue::{PriorityRatio, SendingQueue};
use crate::error::{NetworkError, Result};
use crate::handler::NotificationHandler;
use crate::listener::socket::DEFAULT_READ_BUFFER_SIZE;
use crate::listener::{ClientSendListener, HandlerRegistry, ReceiveQueueListener, SocketListener};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Write timeout for a single frame
    pub write_timeout: Duration,
    /// Keep-alive interval
    pub keep_alive: Option<Duration>,
    /// Read buffer size of the socket listener
    pub read_buffer_size: usize,
    /// High/low service ratio of the sending queue
    pub priority_ratio: PriorityRatio,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            keep_alive: Some(Duration::from_secs(60)),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            priority_ratio: PriorityRatio::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set connection timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set write timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
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
}

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicatorState {
    Disconnected,
    Connecting,
    Connected,
}

/// Per-connection tasks, torn down together on stop
struct ActiveConnection {
    peer_addr: SocketAddr,
    reader: SocketListener,
    sender: ClientSendListener,
}

/// Client facade: one TCP connection multiplexed across modules
pub struct ClientCommunicator {
    config: ClientConfig,
    state: RwLock<CommunicatorState>,
    sending_queue: Arc<SendingQueue>,
    receiving_queue: Arc<ReceivingQueue>,
    handlers: Arc<HandlerRegistry>,
    receiver: ReceiveQueueListener,
    subscribe_lock: Mutex<()>,
    connection: Mutex<Option<ActiveConnection>>,
}

impl Default for ClientCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCommunicator {
    /// Create a client with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a client with custom configuration
    #[must_use]
    pub fn with_config(config: ClientConfig) -> Self {
        let sending_queue = Arc::new(SendingQueue::new(config.priority_ratio));
        let receiving_queue = Arc::new(ReceivingQueue::new());
        let handlers: Arc<HandlerRegistry> = Arc::new(Registry::new());
        let receiver = ReceiveQueueListener::new(Arc::clone(&receiving_queue), Arc::clone(&handlers));

        Self {
            config,
            state: RwLock::new(CommunicatorState::Disconnected),
            sending_queue,
            receiving_queue,
            handlers,
            receiver,
            subscribe_lock: Mutex::new(()),
            connection: Mutex::new(None),
        }
    }

    /// Connect to the server and start the read, write and dispatch tasks
    ///
    /// `host` may be a literal IP or a DNS name.
    pub async fn start(&self, host: &str, port: u16) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != CommunicatorState::Disconnected {
                return Err(NetworkError::invalid_state(
                    "Client is already connected or connecting",
                ));
            }
            *state = CommunicatorState::Connecting;
        }

        match self.connect(host, port).await {
            Ok(peer_addr) => {
                *self.state.write() = CommunicatorState::Connected;
                tracing::info!("Connected to server at {}", peer_addr);
                Ok(())
            }
            Err(e) => {
                *self.state.write() = CommunicatorState::Disconnected;
                tracing::error!("Failed to connect to {}:{}: {}", host, port, e);
                Err(e)
            }
        }
    }

    /// Connect to the address given by the test-mode environment overrides
    pub async fn start_from_env(&self) -> Result<()> {
        let (host, port) = server_address_from_env().ok_or_else(|| {
            NetworkError::invalid_address(format!(
                "{} and {} must both be set",
                SERVER_IP_ENV, SERVER_PORT_ENV
            ))
        })?;
        self.start(&host, port).await
    }

    async fn connect(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let addr = resolve(host, port).await?;

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::timeout("Connection timed out"))?
            .map_err(|e| NetworkError::connection(format!("Failed to connect: {}", e)))?;
        let stream = configure_stream(stream, self.config.keep_alive)?;

        let (read_half, write_half) = stream.into_split();
        let reader = SocketListener::new(
            addr.to_string(),
            read_half,
            Arc::clone(&self.receiving_queue),
            self.config.read_buffer_size,
        );
        let sender = ClientSendListener::new(
            write_half,
            Arc::clone(&self.sending_queue),
            self.config.write_timeout,
        );

        reader.start()?;
        sender.start()?;
        if let Err(e) = self.receiver.start() {
            reader.stop();
            sender.stop().await;
            return Err(e);
        }

        *self.connection.lock() = Some(ActiveConnection {
            peer_addr: addr,
            reader,
            sender,
        });
        Ok(addr)
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> CommunicatorState {
        *self.state.read()
    }

    /// Check if connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == CommunicatorState::Connected
    }

    /// Address of the connected server
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection.lock().as_ref().map(|c| c.peer_addr)
    }

    /// Number of packets waiting to be written
    #[must_use]
    pub fn pending_sends(&self) -> usize {
        self.sending_queue.size()
    }
}

#[async_trait]
impl Communicator for ClientCommunicator {
    async fn stop(&self) {
        {
            let state = self.state.read();
            if *state != CommunicatorState::Connected {
                return;
            }
        }

        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.reader.stop();
            connection.sender.stop().await;
        }
        self.receiver.stop().await;

        self.sending_queue.clear();
        self.receiving_queue.clear();
        *self.state.write() = CommunicatorState::Disconnected;
        tracing::info!("Client communicator stopped");
    }

    fn send(&self, data: &str, module: &str) -> Result<()> {
        if self.sending_queue.enqueue(Packet::broadcast(data, module)) {
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
}

/// Literal IP first, DNS otherwise (IPv4 preferred)
async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| NetworkError::invalid_address(format!("Failed to resolve {}: {}", host, e)))?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| NetworkError::invalid_address(format!("No addresses found for {}", host)))
}
