//! The audit server event loop.
//!
//! One mio poll multiplexes listeners, client connections, outbound
//! relay connections, signal pipes, and deadlines. Everything runs on a
//! single thread; handlers run to completion between suspension points.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::{TcpListener, TcpStream, UnixStream};
use mio::{Events, Interest, Poll, Registry, Token};
use nix::sys::socket::sockopt::{Ipv6V6Only, KeepAlive, ReuseAddr};
use nix::sys::socket::{self, Backlog, SockFlag, SockType, SockaddrIn, SockaddrIn6};
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::connection::{Connection, ConnectionState};
use crate::error::{ServerError, ServerResult};
use crate::eventlog::EventLog;
use crate::iolog::SessionSeq;
use crate::journal::{JournalFile, JournalReplay, JournalSink};
use crate::local::LocalSink;
use crate::sink::{RelaySink, Sink};
use crate::tls::{build_relay_client_config, build_server_config, TlsSession};

/// Identification string sent in the server greeting.
pub const SERVER_ID: &str = concat!("LogVault Audit Server ", env!("CARGO_PKG_VERSION"));

/// Period of the commit-point acknowledgment timer.
pub const ACK_FREQUENCY: Duration = Duration::from_secs(2);

/// Grace period for draining connections on shutdown.
pub const SHUTDOWN_TIMEO: Duration = Duration::from_secs(10);

/// Token of the shutdown signal pipe.
const SHUTDOWN_TOKEN: Token = Token(0);
/// Token of the reload signal pipe.
const RELOAD_TOKEN: Token = Token(1);
/// First listener token.
const LISTENER_BASE: usize = 2;
/// First connection/relay token.
const CONN_TOKEN_BASE: usize = 1024;

/// Maximum events to process per poll iteration.
const MAX_EVENTS: usize = 1024;

/// A bound, listening socket.
struct Listener {
    socket: TcpListener,
    tls: bool,
    addr: SocketAddr,
}

/// Runtime options that come from the command line, not the config file.
#[derive(Debug, Default, Clone)]
pub struct ServerOptions {
    /// Probability (0.0-1.0) of dropping a connection per I/O buffer.
    pub random_drop: Option<f64>,
    /// Path the configuration was loaded from, re-read on reload.
    pub config_path: Option<PathBuf>,
}

/// Shared engine state handed into connection handlers.
pub(crate) struct EngineCtx<'a> {
    pub registry: &'a Registry,
    pub config: &'a Config,
    pub eventlog: &'a mut EventLog,
    pub seq: &'a mut SessionSeq,
    pub random_drop: Option<f64>,
    pub server_id: &'a str,
    pub tls_client: Option<&'a Arc<rustls::ClientConfig>>,
    pub next_token: &'a mut usize,
    pub relay_routes: &'a mut HashMap<Token, Token>,
}

impl EngineCtx<'_> {
    pub fn alloc_token(&mut self) -> Token {
        let token = Token(*self.next_token);
        *self.next_token += 1;
        token
    }
}

/// The LogVault audit server.
pub struct Server {
    config: Config,
    config_path: Option<PathBuf>,
    poll: Poll,
    listeners: Vec<Listener>,
    connections: HashMap<Token, Connection>,
    /// Relay socket token -> owning connection token.
    relay_routes: HashMap<Token, Token>,
    next_token: usize,
    tls_server: Option<Arc<rustls::ServerConfig>>,
    tls_client: Option<Arc<rustls::ClientConfig>>,
    eventlog: EventLog,
    seq: SessionSeq,
    random_drop: Option<f64>,
    shutdown_pipe: Option<UnixStream>,
    reload_pipe: Option<UnixStream>,
    shutting_down: bool,
    shutdown_deadline: Option<Instant>,
    loop_break: bool,
}

impl Server {
    /// Creates a server: builds TLS contexts, binds all listeners, and
    /// prepares the collaborators.
    pub fn new(config: Config, options: ServerOptions) -> ServerResult<Self> {
        config.validate()?;
        let poll = Poll::new()?;

        let (tls_server, tls_client) = build_tls_contexts(&config)?;
        let eventlog = EventLog::new(&config.eventlog.path);
        let seq = SessionSeq::scan(&config.iolog.dir);

        let mut server = Self {
            config,
            config_path: options.config_path,
            poll,
            listeners: Vec::new(),
            connections: HashMap::new(),
            relay_routes: HashMap::new(),
            next_token: CONN_TOKEN_BASE,
            tls_server,
            tls_client,
            eventlog,
            seq,
            random_drop: options.random_drop,
            shutdown_pipe: None,
            reload_pipe: None,
            shutting_down: false,
            shutdown_deadline: None,
            loop_break: false,
        };
        server.setup_listeners()?;
        Ok(server)
    }

    /// Wires the signal self-pipes into the poll: a byte on `shutdown`
    /// starts the graceful shutdown, a byte on `reload` re-reads the
    /// configuration.
    pub fn set_signal_pipes(
        &mut self,
        shutdown: std::os::unix::net::UnixStream,
        reload: std::os::unix::net::UnixStream,
    ) -> ServerResult<()> {
        shutdown.set_nonblocking(true)?;
        reload.set_nonblocking(true)?;
        let mut shutdown = UnixStream::from_std(shutdown);
        let mut reload = UnixStream::from_std(reload);
        self.poll
            .registry()
            .register(&mut shutdown, SHUTDOWN_TOKEN, Interest::READABLE)?;
        self.poll
            .registry()
            .register(&mut reload, RELOAD_TOKEN, Interest::READABLE)?;
        self.shutdown_pipe = Some(shutdown);
        self.reload_pipe = Some(reload);
        Ok(())
    }

    /// The addresses the server is actually listening on.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.socket.local_addr().ok())
            .collect()
    }

    /// Returns the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Starts the graceful shutdown sequence.
    pub fn initiate_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!("shutting down");
        self.shutting_down = true;

        if self.connections.is_empty() {
            self.loop_break = true;
            return;
        }

        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            let registry = self.poll.registry();
            if let Some(conn) = self.connections.get_mut(&token) {
                conn.begin_shutdown();
                conn.update_registration(registry);
            }
        }
        self.sweep_closed();

        if self.connections.is_empty() {
            self.loop_break = true;
        } else {
            // Exit eventually even if clients never drain.
            self.shutdown_deadline = Some(Instant::now() + SHUTDOWN_TIMEO);
        }
    }

    /// Runs the event loop until shutdown completes.
    pub fn run(&mut self) -> ServerResult<()> {
        info!(server_id = SERVER_ID, "server event loop started");
        while !self.loop_break {
            let timeout = self.next_timeout();
            self.poll_once(timeout)?;
        }

        // Listener list drains before the connection list.
        self.drop_listeners();
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close_connection(token);
        }
        info!("server event loop finished");
        Ok(())
    }

    /// Runs a single iteration of the event loop.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> ServerResult<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        if let Err(e) = self.poll.poll(&mut events, timeout) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        for event in &events {
            self.dispatch(event)?;
        }

        self.sweep_timers();
        self.sweep_closed();
        Ok(())
    }

    fn dispatch(&mut self, event: &Event) -> ServerResult<()> {
        let token = event.token();
        let readable = event.is_readable();
        let writable = event.is_writable();

        match token {
            SHUTDOWN_TOKEN => {
                drain_pipe(self.shutdown_pipe.as_mut());
                self.initiate_shutdown();
            }
            RELOAD_TOKEN => {
                drain_pipe(self.reload_pipe.as_mut());
                self.reload()?;
            }
            t if t.0 >= LISTENER_BASE && t.0 < LISTENER_BASE + self.listeners.len() => {
                self.accept_ready(t.0 - LISTENER_BASE);
            }
            t if self.connections.contains_key(&t) => {
                let registry = self.poll.registry();
                let mut ctx = EngineCtx {
                    registry,
                    config: &self.config,
                    eventlog: &mut self.eventlog,
                    seq: &mut self.seq,
                    random_drop: self.random_drop,
                    server_id: SERVER_ID,
                    tls_client: self.tls_client.as_ref(),
                    next_token: &mut self.next_token,
                    relay_routes: &mut self.relay_routes,
                };
                let conn = self.connections.get_mut(&t).expect("checked above");
                if readable {
                    conn.on_readable(&mut ctx);
                }
                if writable && !conn.closing {
                    conn.on_writable(&mut ctx);
                }
            }
            t => {
                let Some(&parent) = self.relay_routes.get(&t) else {
                    trace!(?token, "event for unknown token");
                    return Ok(());
                };
                let registry = self.poll.registry();
                let mut ctx = EngineCtx {
                    registry,
                    config: &self.config,
                    eventlog: &mut self.eventlog,
                    seq: &mut self.seq,
                    random_drop: self.random_drop,
                    server_id: SERVER_ID,
                    tls_client: self.tls_client.as_ref(),
                    next_token: &mut self.next_token,
                    relay_routes: &mut self.relay_routes,
                };
                if let Some(conn) = self.connections.get_mut(&parent) {
                    conn.on_relay_event(readable, writable, &mut ctx);
                }
            }
        }
        Ok(())
    }

    /// Accepts pending connections on one listener.
    fn accept_ready(&mut self, idx: usize) {
        loop {
            let (accepted, tls) = {
                let listener = &self.listeners[idx];
                (listener.socket.accept(), listener.tls)
            };
            match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = self.new_connection(stream, addr, tls) {
                        warn!(peer = %addr, error = %e, "unable to start new connection");
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "unable to accept new connection");
                    break;
                }
            }
        }
    }

    fn new_connection(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
        tls: bool,
    ) -> ServerResult<()> {
        if self.shutting_down {
            return Err(ServerError::ConnectionClosed);
        }
        if self.config.server.tcp_keepalive {
            // SAFETY: the fd is owned by `stream`, which outlives the call.
            let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
            if let Err(e) = socket::setsockopt(&fd, KeepAlive, &true) {
                debug!(error = %e, "unable to set SO_KEEPALIVE");
            }
        }

        let peer = addr.ip().to_string();
        debug!(peer = %peer, tls, "connection accepted");

        let tls_session = if tls {
            let config = self
                .tls_server
                .as_ref()
                .ok_or_else(|| ServerError::Tls("no TLS context".to_string()))?;
            Some(TlsSession::server(Arc::clone(config))?)
        } else {
            None
        };

        let sink: Box<dyn Sink> = if self.config.has_relay() && self.config.relay.store_first {
            Box::new(JournalSink::new())
        } else if self.config.has_relay() {
            Box::new(RelaySink)
        } else {
            Box::new(LocalSink::new())
        };

        let token = Token(self.next_token);
        self.next_token += 1;

        let mut conn = Connection::new_client(
            token,
            stream,
            peer,
            tls_session,
            sink,
            self.config.relay.store_first,
        );
        conn.register_initial(self.poll.registry())?;

        let registry = self.poll.registry();
        let mut ctx = EngineCtx {
            registry,
            config: &self.config,
            eventlog: &mut self.eventlog,
            seq: &mut self.seq,
            random_drop: self.random_drop,
            server_id: SERVER_ID,
            tls_client: self.tls_client.as_ref(),
            next_token: &mut self.next_token,
            relay_routes: &mut self.relay_routes,
        };

        if tls {
            conn.handshake_deadline = Some(Instant::now() + self.config.server_timeout());
        } else if self.config.has_relay() && !self.config.relay.store_first {
            // The client greeting goes out once the relay is connected.
            conn.connect_relay(&mut ctx)?;
        } else {
            conn.start_protocol(&mut ctx);
        }

        self.connections.insert(token, conn);
        Ok(())
    }

    /// Fires expired deadlines: handshake, write, relay, and commit.
    fn sweep_timers(&mut self) {
        let now = Instant::now();

        if self.shutdown_deadline.is_some_and(|d| d <= now) {
            warn!("shutdown timeout reached, exiting event loop");
            self.loop_break = true;
            return;
        }

        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            let registry = self.poll.registry();
            let mut ctx = EngineCtx {
                registry,
                config: &self.config,
                eventlog: &mut self.eventlog,
                seq: &mut self.seq,
                random_drop: self.random_drop,
                server_id: SERVER_ID,
                tls_client: self.tls_client.as_ref(),
                next_token: &mut self.next_token,
                relay_routes: &mut self.relay_routes,
            };
            let Some(conn) = self.connections.get_mut(&token) else {
                continue;
            };

            if conn.handshake_deadline.is_some_and(|d| d <= now) {
                debug!(peer = %conn.peer, "TLS handshake timed out");
                conn.closing = true;
                continue;
            }
            if conn.write_deadline.is_some_and(|d| d <= now) {
                debug!(peer = %conn.peer, "timed out writing to client");
                conn.closing = true;
                continue;
            }
            if conn
                .relay
                .as_ref()
                .and_then(|r| r.deadline)
                .is_some_and(|d| d <= now)
            {
                debug!(peer = %conn.peer, "relay connection timed out");
                conn.closing = true;
                continue;
            }
            if conn.commit_deadline.is_some_and(|d| d <= now) {
                conn.fire_commit(&mut ctx);
            }
        }
    }

    /// The earliest pending deadline, as a poll timeout.
    fn next_timeout(&self) -> Option<Duration> {
        let mut next = self.shutdown_deadline;
        for conn in self.connections.values() {
            let deadlines = [
                conn.commit_deadline,
                conn.write_deadline,
                conn.handshake_deadline,
                conn.relay.as_ref().and_then(|r| r.deadline),
            ];
            for deadline in deadlines.into_iter().flatten() {
                next = Some(next.map_or(deadline, |n| n.min(deadline)));
            }
        }
        next.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Closes every connection marked for teardown.
    fn sweep_closed(&mut self) {
        loop {
            let Some(token) = self
                .connections
                .iter()
                .find(|(_, conn)| conn.closing)
                .map(|(t, _)| *t)
            else {
                break;
            };
            self.close_connection(token);
        }
    }

    /// Removes a connection, releasing every resource it owns exactly
    /// once. A finished store-first session spawns its journal replay
    /// here; a finished replay unlinks its journal.
    fn close_connection(&mut self, token: Token) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        conn.deregister_all(self.poll.registry());
        if let Some(relay) = &conn.relay {
            self.relay_routes.remove(&relay.token);
        }
        debug!(peer = %conn.peer, state = ?conn.state, "closing connection");

        if conn.store_first
            && conn.state == ConnectionState::Finished
            && conn.relay.is_none()
            && !self.shutting_down
            && !self.loop_break
        {
            if let Some(journal) = conn.take_journal() {
                self.spawn_replay(journal);
            }
        }

        if conn.state == ConnectionState::Finished {
            if let Some(replay) = &conn.replay {
                info!(journal = %replay.path.display(), "journal relayed, removing");
                if let Err(e) = std::fs::remove_file(&replay.path) {
                    warn!(journal = %replay.path.display(), error = %e,
                        "unable to remove journal file");
                }
            }
        }

        if self.shutting_down && self.connections.is_empty() {
            self.loop_break = true;
        }
    }

    /// Builds a relay-only connection that replays a finished journal.
    fn spawn_replay(&mut self, journal: JournalFile) {
        let path = journal.path.clone();
        let replay = match JournalReplay::new(journal) {
            Ok(replay) => replay,
            Err(e) => {
                warn!(journal = %path.display(), error = %e, "unable to open journal for replay");
                return;
            }
        };

        let token = Token(self.next_token);
        self.next_token += 1;
        let mut conn = Connection::new_replay(token, replay, Box::new(RelaySink));

        let registry = self.poll.registry();
        let mut ctx = EngineCtx {
            registry,
            config: &self.config,
            eventlog: &mut self.eventlog,
            seq: &mut self.seq,
            random_drop: self.random_drop,
            server_id: SERVER_ID,
            tls_client: self.tls_client.as_ref(),
            next_token: &mut self.next_token,
            relay_routes: &mut self.relay_routes,
        };
        match conn.connect_relay(&mut ctx) {
            Ok(()) => {
                debug!(journal = %path.display(), "replaying journal to relay");
                self.connections.insert(token, conn);
            }
            Err(e) => {
                // The journal file stays on disk for a later attempt.
                warn!(journal = %path.display(), error = %e, "unable to connect to relay");
            }
        }
    }

    /// Re-reads the configuration and rebuilds the listeners.
    ///
    /// A config that fails to parse or validate keeps the previous one;
    /// failing to create any listener is fatal, as at startup.
    fn reload(&mut self) -> ServerResult<()> {
        let Some(path) = self.config_path.clone() else {
            info!("no configuration file to reload");
            return Ok(());
        };
        info!(config = %path.display(), "reloading server configuration");

        let config = match Config::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "reload failed, keeping previous configuration");
                return Ok(());
            }
        };
        let (tls_server, tls_client) = match build_tls_contexts(&config) {
            Ok(contexts) => contexts,
            Err(e) => {
                warn!(error = %e, "reload failed, keeping previous configuration");
                return Ok(());
            }
        };

        self.config = config;
        self.tls_server = tls_server;
        self.tls_client = tls_client;
        self.eventlog = EventLog::new(&self.config.eventlog.path);
        self.seq = SessionSeq::scan(&self.config.iolog.dir);
        self.setup_listeners()
    }

    /// Frees old listeners (if any) and registers new ones.
    fn setup_listeners(&mut self) -> ServerResult<()> {
        self.drop_listeners();

        for listen in &self.config.server.listen {
            match create_listener(listen.addr) {
                Ok(socket) => {
                    self.listeners.push(Listener {
                        socket,
                        tls: listen.tls,
                        addr: listen.addr,
                    });
                }
                Err(e) => {
                    warn!(addr = %listen.addr, error = %e, "unable to create listener");
                }
            }
        }
        if self.listeners.is_empty() {
            return Err(ServerError::NoListeners);
        }

        for (idx, listener) in self.listeners.iter_mut().enumerate() {
            self.poll.registry().register(
                &mut listener.socket,
                Token(LISTENER_BASE + idx),
                Interest::READABLE,
            )?;
            info!(addr = %listener.addr, tls = listener.tls, "listening");
        }
        Ok(())
    }

    fn drop_listeners(&mut self) {
        for listener in &mut self.listeners {
            let _ = self.poll.registry().deregister(&mut listener.socket);
        }
        self.listeners.clear();
    }
}

/// Builds the TLS server and relay-client contexts the config calls for.
#[allow(clippy::type_complexity)]
fn build_tls_contexts(
    config: &Config,
) -> ServerResult<(
    Option<Arc<rustls::ServerConfig>>,
    Option<Arc<rustls::ClientConfig>>,
)> {
    let tls_server = if config.server.listen.iter().any(|l| l.tls) {
        let section = config
            .tls
            .as_ref()
            .ok_or_else(|| ServerError::Config("missing [tls] section".to_string()))?;
        Some(build_server_config(section)?)
    } else {
        None
    };
    let tls_client = if config.relay.tls {
        Some(build_relay_client_config(config.tls.as_ref())?)
    } else {
        None
    };
    Ok((tls_server, tls_client))
}

/// Creates a bound, listening, non-blocking TCP socket.
fn create_listener(addr: SocketAddr) -> ServerResult<TcpListener> {
    let family = if addr.is_ipv6() {
        socket::AddressFamily::Inet6
    } else {
        socket::AddressFamily::Inet
    };
    let fd = socket::socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    socket::setsockopt(&fd, ReuseAddr, &true)?;
    if addr.is_ipv6() {
        // Keep IPv4-mapped addresses off IPv6 listeners.
        if let Err(e) = socket::setsockopt(&fd, Ipv6V6Only, &true) {
            warn!(addr = %addr, error = %e, "unable to set IPV6_V6ONLY");
        }
    }

    let bound = match addr {
        SocketAddr::V4(v4) => socket::bind(fd.as_raw_fd(), &SockaddrIn::from(v4)),
        SocketAddr::V6(v6) => socket::bind(fd.as_raw_fd(), &SockaddrIn6::from(v6)),
    };
    bound.map_err(|e| ServerError::BindFailed {
        addr,
        source: std::io::Error::from_raw_os_error(e as i32),
    })?;

    socket::listen(&fd, Backlog::MAXCONN)?;
    Ok(TcpListener::from_std(std::net::TcpListener::from(fd)))
}

/// Drains a signal pipe so level-triggered wakeups stop.
fn drain_pipe(pipe: Option<&mut UnixStream>) {
    use std::io::Read;
    if let Some(pipe) = pipe {
        let mut buf = [0u8; 64];
        while let Ok(n) = pipe.read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}
