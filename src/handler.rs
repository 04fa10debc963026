//! Module notification handlers

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Callback interface implemented by application modules
///
/// `on_data_received` runs on the module's own dispatch worker, so a slow module
/// only delays its own packets. The client-lifecycle callbacks fire on the server
/// side only.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Called with the payload of every packet addressed to the module
    async fn on_data_received(&self, serialized_data: String);

    /// Called for every inbound connection; a module claims it via `add_client`
    async fn on_client_joined(&self, _connection: PendingConnection) {}

    /// Called once when a registered client is detected as disconnected
    async fn on_client_left(&self, _client_id: &str) {}
}

/// Accepted socket waiting for a module to assign it a client id
///
/// Clones share the same socket; the first `add_client` call takes it.
#[derive(Clone)]
pub struct PendingConnection {
    peer_addr: SocketAddr,
    stream: Arc<Mutex<Option<TcpStream>>>,
}

impl PendingConnection {
    /// Wrap an accepted stream
    #[must_use]
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            stream: Arc::new(Mutex::new(Some(stream))),
        }
    }

    /// Remote address of the connection
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether a module already claimed the socket
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.stream.lock().is_none()
    }

    /// Take ownership of the socket (once)
    pub(crate) fn take(&self) -> Option<TcpStream> {
        self.stream.lock().take()
    }
}

impl std::fmt::Debug for PendingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnection")
            .field("peer_addr", &self.peer_addr)
            .field("claimed", &self.is_claimed())
            .finish()
    }
}
