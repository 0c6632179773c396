//! Server error types.

use std::net::SocketAddr;

use thiserror::Error;

use logvault_wire::WireError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur during server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Wire protocol error.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// No listener could be created; fatal at startup and reload.
    #[error("unable to set up any listen socket")]
    NoListeners,

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// No relay host could be resolved.
    #[error("unable to resolve relay host {0}")]
    RelayUnavailable(String),

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<nix::Error> for ServerError {
    fn from(e: nix::Error) -> Self {
        ServerError::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}

/// A per-connection failure, classified by the reply-and-teardown policy
/// it triggers.
#[derive(Debug)]
pub(crate) enum Fault {
    /// Protocol violation: the error string is sent to the client before
    /// the connection is closed.
    Protocol(String),
    /// Local resource failure: best-effort error reply, then close.
    Resource(String),
    /// Transport failure: close immediately, no reply attempt.
    Transport(String),
}

impl Fault {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Fault::Protocol(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Fault::Resource(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Fault::Transport(msg.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Fault::Protocol(msg) | Fault::Resource(msg) | Fault::Transport(msg) => msg,
        }
    }
}
