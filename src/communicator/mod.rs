//! Communicator facades consumed by application modules

pub mod client;
pub mod server;

pub use client::{ClientCommunicator, ClientConfig, CommunicatorState};
pub use server::{ServerCommunicator, ServerConfig};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::core::sending_queue::SendingQueue;
use crate::error::{NetworkError, Result};
use crate::handler::{NotificationHandler, PendingConnection};
use crate::listener::HandlerRegistry;

/// Environment variable overriding the server IP (test mode)
pub const SERVER_IP_ENV: &str = "COMMUNICATOR_SERVER_IP";

/// Environment variable overriding the server port (test mode)
pub const SERVER_PORT_ENV: &str = "COMMUNICATOR_SERVER_PORT";

/// Operations shared by the client and server facades
///
/// Server-only operations fail with [`NetworkError::Unsupported`] unless the
/// implementor overrides them.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Stop every task and close the socket(s); a no-op when not running
    async fn stop(&self);

    /// Queue `data` for `module` with no explicit destination
    fn send(&self, data: &str, module: &str) -> Result<()>;

    /// Queue `data` for `module` addressed to one client
    fn send_to(&self, _data: &str, _module: &str, _destination: &str) -> Result<()> {
        Err(NetworkError::unsupported(
            "sending to a specific destination is only available on the server",
        ))
    }

    /// Register a module with both the send and receive paths
    ///
    /// Returns `false` if the module name is already taken; nothing is registered then.
    fn subscribe(
        &self,
        module: &str,
        handler: Arc<dyn NotificationHandler>,
        is_high_priority: bool,
    ) -> bool;

    /// Map `client_id` to an accepted connection and start reading from it
    fn add_client(&self, _client_id: &str, _connection: &PendingConnection) -> Result<()> {
        Err(NetworkError::unsupported("add_client is only available on the server"))
    }

    /// Stop reading from a client and close its socket
    fn remove_client(&self, _client_id: &str) -> Result<()> {
        Err(NetworkError::unsupported("remove_client is only available on the server"))
    }
}

/// Register a module with the sending queue and the handler table as one step
pub(crate) fn subscribe_module(
    lock: &Mutex<()>,
    sending_queue: &SendingQueue,
    handlers: &HandlerRegistry,
    module: &str,
    handler: Arc<dyn NotificationHandler>,
    is_high_priority: bool,
) -> bool {
    let _guard = lock.lock();

    if !sending_queue.register_module(module, is_high_priority) {
        tracing::warn!("Module {} is already registered", module);
        return false;
    }
    if !handlers.try_register(module, handler) {
        sending_queue.unregister_module(module);
        tracing::warn!("Module {} already has a handler", module);
        return false;
    }

    tracing::info!(
        "Module {} subscribed ({} priority)",
        module,
        if is_high_priority { "high" } else { "low" }
    );
    true
}

/// Apply socket options: no linger, no Nagle, optional keep-alive
pub(crate) fn configure_stream(stream: TcpStream, keep_alive: Option<Duration>) -> Result<TcpStream> {
    stream
        .set_nodelay(true)
        .map_err(|e| NetworkError::connection(format!("Failed to set nodelay: {}", e)))?;

    let std_stream = stream.into_std().map_err(|e| {
        NetworkError::connection(format!("Failed to convert tokio stream to std: {}", e))
    })?;
    let socket = socket2::Socket::from(std_stream);

    socket
        .set_linger(None)
        .map_err(|e| NetworkError::connection(format!("Failed to disable linger: {}", e)))?;

    if let Some(keep_alive) = keep_alive {
        let keep_alive = socket2::TcpKeepalive::new().with_time(keep_alive);
        socket
            .set_tcp_keepalive(&keep_alive)
            .map_err(|e| NetworkError::connection(format!("Failed to set keep-alive: {}", e)))?;
    }

    // socket2 calls may reset the flag and tokio requires a nonblocking socket
    socket.set_nonblocking(true).map_err(|e| {
        NetworkError::connection(format!("Failed to restore nonblocking mode: {}", e))
    })?;

    TcpStream::from_std(socket.into()).map_err(|e| {
        NetworkError::connection(format!("Failed to convert std socket back to tokio: {}", e))
    })
}

/// Server address from the test-mode environment overrides, if both are set and valid
#[must_use]
pub fn server_address_from_env() -> Option<(String, u16)> {
    let ip = std::env::var(SERVER_IP_ENV).ok()?;
    let port = std::env::var(SERVER_PORT_ENV).ok()?.parse().ok()?;
    Some((ip, port))
}
