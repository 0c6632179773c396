//! Wire protocol error types.

use thiserror::Error;

/// Result type for wire protocol operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur during wire protocol operations.
#[derive(Debug, Error)]
pub enum WireError {
    /// Inbound record announces a length above the protocol maximum.
    #[error("client message too large: {size} bytes (max {max})")]
    ClientMessageTooLarge { size: u32, max: u32 },

    /// Outbound record would exceed the protocol maximum.
    #[error("server message too large: {size} bytes (max {max})")]
    ServerMessageTooLarge { size: usize, max: u32 },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for WireError {
    fn from(e: bincode::Error) -> Self {
        WireError::Deserialization(e.to_string())
    }
}
