//! Packet: the unit handed to the transport

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{NetworkError, Result};

/// Wire-level unit carrying an opaque payload for one module
///
/// A packet with no destination is a broadcast (only meaningful on the server side).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "SerializedData")]
    serialized_data: String,
    #[serde(rename = "Destination")]
    destination: Option<String>,
    #[serde(rename = "ModuleOfPacket")]
    module: String,
}

impl Packet {
    /// Create a new packet
    #[must_use]
    pub fn new(
        serialized_data: impl Into<String>,
        destination: Option<String>,
        module: impl Into<String>,
    ) -> Self {
        Self {
            serialized_data: serialized_data.into(),
            destination,
            module: module.into(),
        }
    }

    /// Create a broadcast packet (no destination)
    #[must_use]
    pub fn broadcast(serialized_data: impl Into<String>, module: impl Into<String>) -> Self {
        Self::new(serialized_data, None, module)
    }

    /// Create a packet addressed to a single client
    #[must_use]
    pub fn unicast(
        serialized_data: impl Into<String>,
        module: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self::new(serialized_data, Some(destination.into()), module)
    }

    /// Get the payload
    #[must_use]
    pub fn serialized_data(&self) -> &str {
        &self.serialized_data
    }

    /// Get the destination client id, if any
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Get the owning module name
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Consume the packet, yielding its payload
    #[must_use]
    pub fn into_serialized_data(self) -> String {
        self.serialized_data
    }

    /// Serialize the whole packet (payload, destination and module) to a string
    pub fn to_wire_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            NetworkError::serialization(format!("Packet serialization failed: {}", e))
        })
    }

    /// Parse a packet previously produced by [`Packet::to_wire_string`]
    pub fn from_wire_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| {
            NetworkError::serialization(format!("Packet deserialization failed: {}", e))
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.destination {
            Some(dest) => write!(
                f,
                "Packet[{} -> {}, {} bytes]",
                self.module,
                dest,
                self.serialized_data.len()
            ),
            None => write!(
                f,
                "Packet[{} -> *, {} bytes]",
                self.module,
                self.serialized_data.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_creation() {
        let packet = Packet::unicast("hello", "chat", "42");
        assert_eq!(packet.serialized_data(), "hello");
        assert_eq!(packet.module(), "chat");
        assert_eq!(packet.destination(), Some("42"));

        let packet = Packet::broadcast("hi", "whiteboard");
        assert!(packet.destination().is_none());
    }

    #[test]
    fn test_wire_string_field_names() {
        let packet = Packet::unicast("x", "chat", "7");
        let wire = packet.to_wire_string().unwrap();
        assert!(wire.contains("\"SerializedData\":\"x\""));
        assert!(wire.contains("\"Destination\":\"7\""));
        assert!(wire.contains("\"ModuleOfPacket\":\"chat\""));

        let broadcast = Packet::broadcast("x", "chat").to_wire_string().unwrap();
        assert!(broadcast.contains("\"Destination\":null"));
    }

    #[test]
    fn test_from_wire_rejects_garbage() {
        assert!(Packet::from_wire_str("not json").is_err());
        assert!(Packet::from_wire_str("{\"SerializedData\":\"x\"}").is_err());
    }

    #[test]
    fn test_display() {
        let packet = Packet::unicast("abc", "chat", "1");
        assert_eq!(packet.to_string(), "Packet[chat -> 1, 3 bytes]");
    }
}
