//! # logvault-server: LogVault audit log server
//!
//! This crate is the connection engine of LogVault: a network server that
//! receives framed audit streams from privilege-escalation clients and
//! persists them locally, forwards them to an upstream relay, or journals
//! them for store-and-forward replay.
//!
//! ## Architecture
//!
//! The server uses `mio` for non-blocking I/O with a poll-based event
//! loop; one thread multiplexes listeners, client connections, outbound
//! relay connections, signal pipes, and timers.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        logvault-server                         │
//! │  ┌──────────┐   ┌─────────────┐   ┌───────────────────────┐    │
//! │  │ Listener │ → │ Connections │ → │ Sink                  │    │
//! │  │ (TCP/TLS)│   │ (mio poll)  │   │ (local/relay/journal) │    │
//! │  └──────────┘   └─────────────┘   └───────────────────────┘    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each inbound record flows codec → state machine → sink. The sink is
//! chosen once, when the connection is accepted: local persistence by
//! default, live relay forwarding when a relay is configured, or
//! journal-then-forward in store-first mode. A per-connection commit
//! timer periodically acknowledges the durable elapsed time back to the
//! client.
//!
//! ## Usage
//!
//! ```ignore
//! use logvault_server::{Config, Server, ServerOptions};
//!
//! let config = Config::load(Path::new("/etc/logvault/logvaultd.toml"))?;
//! let mut server = Server::new(config, ServerOptions::default())?;
//! server.run()?;
//! ```

pub mod config;
mod buffer;
mod connection;
mod error;
mod eventlog;
mod iolog;
mod journal;
mod local;
mod relay;
mod server;
mod sink;
pub mod tls;

#[cfg(test)]
mod tests;

pub use config::{Config, ListenAddress, RelaySection, ServerSection, TlsSection};
pub use error::{ServerError, ServerResult};
pub use server::{Server, ServerOptions, ACK_FREQUENCY, SERVER_ID, SHUTDOWN_TIMEO};
