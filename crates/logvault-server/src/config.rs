//! Server configuration.
//!
//! Read from a TOML file (default `/etc/logvault/logvaultd.toml`) at startup
//! and again on reload. A missing file yields the built-in defaults; a file
//! that fails to parse or validate is a configuration error.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ServerError, ServerResult};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 30344;

/// One configured bind endpoint.
///
/// Accepts either a bare `"addr:port"` string or a
/// `{ addr = "addr:port", tls = true }` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "ListenAddressDe")]
pub struct ListenAddress {
    /// Address and port to bind.
    pub addr: SocketAddr,
    /// Whether connections on this endpoint use TLS.
    pub tls: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListenAddressDe {
    Plain(SocketAddr),
    Full {
        addr: SocketAddr,
        #[serde(default)]
        tls: bool,
    },
}

impl From<ListenAddressDe> for ListenAddress {
    fn from(de: ListenAddressDe) -> Self {
        match de {
            ListenAddressDe::Plain(addr) => ListenAddress { addr, tls: false },
            ListenAddressDe::Full { addr, tls } => ListenAddress { addr, tls },
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    /// Ordered list of bind endpoints.
    pub listen: Vec<ListenAddress>,
    /// Read/write/handshake timeout in seconds.
    pub timeout: u64,
    /// Enable `SO_KEEPALIVE` on accepted sockets.
    pub tcp_keepalive: bool,
    /// Pid file path; not written when absent.
    pub pid_file: Option<PathBuf>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: vec![ListenAddress {
                addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
                tls: false,
            }],
            timeout: 30,
            tcp_keepalive: true,
            pid_file: None,
        }
    }
}

/// `[tls]` section. Required when any listener or the relay uses TLS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSection {
    /// Server certificate chain, PEM.
    pub cert: PathBuf,
    /// Server private key, PEM.
    pub key: PathBuf,
    /// CA bundle used for peer verification and relay trust.
    pub ca: Option<PathBuf>,
    /// Require and verify a client certificate.
    #[serde(default)]
    pub verify_client: bool,
}

/// `[relay]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelaySection {
    /// Upstream relay hosts, tried in order. Empty disables relaying.
    pub hosts: Vec<String>,
    /// Connect to relays over TLS.
    pub tls: bool,
    /// Journal the complete client stream locally before replaying it to
    /// the relay.
    pub store_first: bool,
    /// Directory holding journal files.
    pub journal_dir: PathBuf,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            tls: false,
            store_first: false,
            journal_dir: PathBuf::from("/var/log/logvault/incoming"),
        }
    }
}

/// `[eventlog]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventLogSection {
    /// JSON-lines audit event file.
    pub path: PathBuf,
}

impl Default for EventLogSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/log/logvault/events.jsonl"),
        }
    }
}

/// `[iolog]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IoLogSection {
    /// Root directory for per-session I/O log directories.
    pub dir: PathBuf,
    /// File creation mode for I/O log files.
    pub mode: u32,
}

impl Default for IoLogSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/log/logvault/io"),
            mode: 0o600,
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerSection,
    pub tls: Option<TlsSection>,
    pub relay: RelaySection,
    pub eventlog: EventLogSection,
    pub iolog: IoLogSection,
}

impl Config {
    /// Loads the configuration from a TOML file.
    ///
    /// A missing file yields the defaults; parse and validation failures
    /// are errors.
    pub fn load(path: &Path) -> ServerResult<Self> {
        if !path.exists() {
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            ServerError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-section consistency.
    pub fn validate(&self) -> ServerResult<()> {
        if self.server.listen.is_empty() {
            return Err(ServerError::Config(
                "no listen address configured".to_string(),
            ));
        }
        if self.server.listen.iter().any(|l| l.tls) && self.tls.is_none() {
            return Err(ServerError::Config(
                "a TLS listen address is configured but the [tls] section is missing".to_string(),
            ));
        }
        if self.relay.tls && self.relay.hosts.is_empty() {
            return Err(ServerError::Config(
                "relay.tls is set but no relay hosts are configured".to_string(),
            ));
        }
        if self.relay.store_first && self.relay.hosts.is_empty() {
            return Err(ServerError::Config(
                "relay.store_first is set but no relay hosts are configured".to_string(),
            ));
        }
        Ok(())
    }

    /// The server read/write/handshake timeout.
    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout)
    }

    /// True when sessions are forwarded to an upstream relay.
    pub fn has_relay(&self) -> bool {
        !self.relay.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.server.listen.len(), 1);
        assert_eq!(config.server.listen[0].addr.port(), DEFAULT_PORT);
        assert!(!config.server.listen[0].tls);
        assert_eq!(config.server_timeout(), Duration::from_secs(30));
        assert!(!config.has_relay());
    }

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = ["127.0.0.1:30344", { addr = "127.0.0.1:30345", tls = true }]
            timeout = 10
            tcp_keepalive = false
            pid_file = "/run/logvaultd.pid"

            [tls]
            cert = "/etc/logvault/server.crt"
            key = "/etc/logvault/server.key"
            verify_client = true

            [relay]
            hosts = ["relay.example.com:30344"]
            store_first = true
            journal_dir = "/tmp/journals"

            [eventlog]
            path = "/tmp/events.jsonl"

            [iolog]
            dir = "/tmp/io"
            mode = 0o640
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.listen.len(), 2);
        assert!(!config.server.listen[0].tls);
        assert!(config.server.listen[1].tls);
        assert!(!config.server.tcp_keepalive);
        assert!(config.tls.as_ref().unwrap().verify_client);
        assert!(config.relay.store_first);
        assert!(config.has_relay());
        assert_eq!(config.iolog.mode, 0o640);
    }

    #[test]
    fn tls_listener_requires_tls_section() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = [{ addr = "127.0.0.1:30345", tls = true }]
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn store_first_requires_relay_hosts() {
        let config: Config = toml::from_str(
            r#"
            [relay]
            store_first = true
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }
}
