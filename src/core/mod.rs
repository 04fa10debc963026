//! Core transport components

pub mod framing;
pub mod packet;
pub mod queue;
pub mod registry;
pub mod sending_queue;

pub use framing::{frame, unframe, FrameDecoder, ESCAPE_TOKEN, FRAME_MARKER, MAX_FRAME_SIZE};
pub use packet::Packet;
pub use queue::{PacketQueue, ReceivingQueue};
pub use registry::Registry;
pub use sending_queue::{PriorityRatio, SendingQueue};
