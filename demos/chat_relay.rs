//! Chat relay demo: a server module that names clients and rebroadcasts their messages

use async_trait::async_trait;
use rust_communicator::{
    ClientCommunicator, Communicator, NotificationHandler, PendingConnection, ServerCommunicator,
    ServerConfig,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// Server-side chat module
struct ChatServer {
    server: OnceLock<Weak<ServerCommunicator>>,
    next_id: AtomicU64,
}

impl ChatServer {
    fn server(&self) -> Option<Arc<ServerCommunicator>> {
        self.server.get().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl NotificationHandler for ChatServer {
    async fn on_data_received(&self, serialized_data: String) {
        if let Some(server) = self.server() {
            if let Err(e) = server.send(&format!("relay: {}", serialized_data), "chat") {
                tracing::warn!("Relay failed: {}", e);
            }
        }
    }

    async fn on_client_joined(&self, connection: PendingConnection) {
        let Some(server) = self.server() else { return };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        match server.add_client(&id, &connection) {
            Ok(()) => {
                let _ = server.send_to(&format!("welcome, you are {}", id), "chat", &id);
            }
            Err(e) => tracing::warn!("Could not register {}: {}", connection.peer_addr(), e),
        }
    }

    async fn on_client_left(&self, client_id: &str) {
        println!("[server] client {} left", client_id);
    }
}

/// Client-side chat module
struct ChatClient {
    name: &'static str,
}

#[async_trait]
impl NotificationHandler for ChatClient {
    async fn on_data_received(&self, serialized_data: String) {
        println!("[{}] {}", self.name, serialized_data);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let server = Arc::new(ServerCommunicator::with_config(
        ServerConfig::from_env().with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    ));
    let chat = Arc::new(ChatServer {
        server: OnceLock::new(),
        next_id: AtomicU64::new(1),
    });
    let _ = chat.server.set(Arc::downgrade(&server));
    server.subscribe("chat", chat, true);

    let addr = server.start().await?;
    println!("Server listening on {}", addr);

    let alice = ClientCommunicator::new();
    alice.subscribe("chat", Arc::new(ChatClient { name: "alice" }), true);
    alice.start(&addr.ip().to_string(), addr.port()).await?;

    let bob = ClientCommunicator::new();
    bob.subscribe("chat", Arc::new(ChatClient { name: "bob" }), true);
    bob.start(&addr.ip().to_string(), addr.port()).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    alice.send("hi everyone", "chat")?;
    bob.send("hello alice", "chat")?;

    tokio::time::sleep(Duration::from_millis(500)).await;

    alice.stop().await;
    bob.stop().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.stop().await;

    println!("Done!");
    Ok(())
}
