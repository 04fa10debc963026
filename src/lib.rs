//! Rust Communicator
//!
//! A module-multiplexed TCP transport: many application modules (chat,
//! whiteboard, screen share, dashboard, ...) share one connection per client.
//!
//! ## Features
//!
//! - Async TCP client/server built on tokio
//! - Per-module high/low priority with weighted round-robin send scheduling
//! - Marker-delimited, escaped framing of JSON-encoded packets
//! - Broadcast and unicast addressing on the server
//! - Retry-before-eviction disconnect detection with `on_client_left` callbacks
//! - Per-module dispatch workers so one slow module cannot stall the others
//!
//! ## Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use rust_communicator::{ClientCommunicator, Communicator, NotificationHandler};
//! use std::sync::Arc;
//!
//! struct Chat;
//!
//! #[async_trait]
//! impl NotificationHandler for Chat {
//!     async fn on_data_received(&self, serialized_data: String) {
//!         println!("chat: {}", serialized_data);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClientCommunicator::new();
//!     client.subscribe("chat", Arc::new(Chat), true);
//!     client.start("127.0.0.1", 8080).await?;
//!
//!     client.send("hello", "chat")?;
//!
//!     client.stop().await;
//!     Ok(())
//! }
//! ```

pub mod communicator;
pub mod core;
pub mod error;
pub mod handler;
pub mod listener;

// Re-export main types
pub use communicator::{
    server_address_from_env, ClientCommunicator, ClientConfig, Communicator, CommunicatorState,
    ServerCommunicator, ServerConfig,
};
pub use core::{
    frame, unframe, FrameDecoder, Packet, PacketQueue, PriorityRatio, ReceivingQueue, Registry,
    SendingQueue, ESCAPE_TOKEN, FRAME_MARKER, MAX_FRAME_SIZE,
};
pub use error::{NetworkError, Result};
pub use handler::{NotificationHandler, PendingConnection};
pub use listener::RetryPolicy;
