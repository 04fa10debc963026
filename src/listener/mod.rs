//! Long-running tasks that move packets between queues and sockets
//!
//! - [`SocketListener`]: socket → receiving queue (one per connection)
//! - [`ClientSendListener`]: sending queue → the client's socket
//! - [`ServerSendListener`]: sending queue → per-client [`ClientLane`]s
//! - [`ReceiveQueueListener`]: receiving queue → module handlers

pub mod client_sender;
mod frame_writer;
pub mod receiver;
pub mod server_sender;
pub mod socket;

pub use client_sender::ClientSendListener;
pub use receiver::{HandlerRegistry, ReceiveQueueListener};
pub use server_sender::{ClientLane, RetryPolicy, ServerSendListener};
pub use socket::SocketListener;
