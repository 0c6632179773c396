//! # logvault-wire: Wire protocol for the LogVault audit log server
//!
//! This crate defines the framed binary protocol spoken between audit
//! clients, LogVault servers, and upstream relays.
//!
//! ## Frame Format
//!
//! ```text
//! ┌──────────────┬──────────────────┐
//! │ Length (4 B) │  Payload (var)   │
//! └──────────────┴──────────────────┘
//! ```
//!
//! - **Length**: Payload length in bytes, big-endian (max 512 KiB)
//! - **Payload**: Bincode-encoded message
//!
//! ## Message Types
//!
//! Clients send a [`ClientMessage`] stream describing one command
//! invocation: the accept/reject decision, interleaved terminal I/O
//! buffers, window-size and suspend events, and the exit status. The
//! server answers with [`ServerMessage`] replies: a hello, the I/O log
//! identifier, periodic commit points, and errors.
//!
//! Journal files written in store-and-forward mode use the exact same
//! framing as the wire, so a journal can be replayed through the same
//! decoder.

mod error;
mod frame;
mod message;

pub use error::{WireError, WireResult};
pub use frame::{Frame, LEN_PREFIX_SIZE, MESSAGE_SIZE_MAX};
pub use message::{
    AcceptMessage, AlertMessage, ChangeWindowSize, ClientHello, ClientMessage, CommandSuspend,
    ExitMessage, InfoMessage, InfoValue, IoBuffer, IoStream, RejectMessage, RestartMessage,
    ServerHello, ServerMessage, TimeSpec,
};

#[cfg(test)]
mod tests;
