//! Error types for the communicator

use std::io;
use thiserror::Error;

/// Result type for communicator operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Communicator errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed frame on the wire
    #[error("Framing error: {0}")]
    Framing(String),

    /// Invalid state error
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Address parse or resolution error
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Operation not available on this side of the connection
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Packet references a module nobody subscribed
    #[error("Module not registered: {0}")]
    ModuleNotRegistered(String),

    /// Unicast to a client id that is not connected
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    /// Client id already mapped to a socket
    #[error("Client already registered: {0}")]
    ClientAlreadyRegistered(String),
}

impl NetworkError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a framing error
    pub fn framing<S: Into<String>>(msg: S) -> Self {
        Self::Framing(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an invalid address error
    pub fn invalid_address<S: Into<String>>(msg: S) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Self::Unsupported(msg.into())
    }
}
