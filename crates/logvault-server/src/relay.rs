//! Outbound relay connections.
//!
//! A relay connection is the client half of the protocol, spoken to an
//! upstream server of the same kind. It is registered in the same poll as
//! everything else: connect completion arrives as a writable event,
//! inbound `ServerMessage` replies as readable events. Forwarded frames
//! queue until the upstream's hello has been seen.

use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use rustls::ClientConfig;
use tracing::{debug, trace, warn};

use logvault_wire::{Frame, ServerMessage};

use crate::buffer::WriteQueue;
use crate::error::{Fault, ServerError, ServerResult};
use crate::tls::{TlsIo, TlsSession};

/// Upper bound on queued-but-unsent relay frames; journal replay stops
/// pumping until the queue drains below this.
pub(crate) const RELAY_QUEUE_LIMIT: usize = 64;

/// The client half of a connection to an upstream relay.
pub(crate) struct RelayStream {
    pub token: Token,
    host: String,
    stream: TcpStream,
    tls: Option<TlsSession>,
    connected: bool,
    saw_hello: bool,
    read_buf: BytesMut,
    write_q: WriteQueue,
    timeout: Duration,
    /// Progress deadline: connect, handshake, and pending-write phases
    /// must advance before it expires.
    pub deadline: Option<Instant>,
}

impl RelayStream {
    /// Starts a non-blocking connection to the first resolvable relay
    /// host and registers it with the poll.
    pub fn connect(
        hosts: &[String],
        tls_config: Option<&Arc<ClientConfig>>,
        token: Token,
        registry: &Registry,
        timeout: Duration,
    ) -> ServerResult<Self> {
        let (host, addr) = resolve_first(hosts)?;
        let mut stream = TcpStream::connect(addr)?;
        registry.register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let tls = match tls_config {
            Some(config) => {
                let server_name = host.rsplit_once(':').map_or(host.as_str(), |(h, _)| h);
                Some(TlsSession::client(Arc::clone(config), server_name)?)
            }
            None => None,
        };

        debug!(host = %host, addr = %addr, "connecting to relay");
        Ok(Self {
            token,
            host,
            stream,
            tls,
            connected: false,
            saw_hello: false,
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_q: WriteQueue::new(),
            timeout,
            deadline: Some(Instant::now() + timeout),
        })
    }

    /// True once the relay has greeted us and forwarding may proceed.
    pub fn ready(&self) -> bool {
        self.saw_hello
    }

    /// True while queued frames are waiting to go out.
    pub fn has_pending_writes(&self) -> bool {
        !self.write_q.is_empty()
    }

    pub fn queued_frames(&self) -> usize {
        self.write_q.len()
    }

    /// Queues one already-packed record for forwarding.
    pub fn queue_frame(&mut self, payload: &[u8]) {
        self.write_q.enqueue_raw_frame(payload);
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.timeout);
        }
    }

    /// Handles a writable event: connect completion, TLS handshake
    /// progress, then flushing queued frames.
    pub fn on_writable(&mut self) -> Result<(), Fault> {
        if !self.connected {
            match self.stream.peer_addr() {
                Ok(_) => {
                    debug!(host = %self.host, "relay connected");
                    self.connected = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => return Ok(()),
                Err(e) => {
                    return Err(Fault::transport(format!(
                        "unable to connect to relay {}: {e}",
                        self.host
                    )));
                }
            }
        }

        if let Some(tls) = &mut self.tls {
            if tls.is_handshaking() {
                match tls.drive_handshake(&mut self.stream) {
                    Ok(true) => {}
                    Ok(false) => return Ok(()),
                    Err(e) => {
                        return Err(Fault::transport(format!(
                            "relay TLS handshake failed: {e}"
                        )));
                    }
                }
            }
        }

        self.flush()
    }

    /// Handles a readable event, returning decoded upstream replies and
    /// whether the relay reached end of stream.
    ///
    /// The upstream hello is consumed here; everything after it is
    /// returned for the owning connection to act on. Replies that arrive
    /// in the same read as the close are still delivered: an upstream
    /// may send its final commit point and shut down immediately.
    pub fn on_readable(&mut self) -> Result<(Vec<ServerMessage>, bool), Fault> {
        match &mut self.tls {
            Some(tls) if tls.is_handshaking() => {
                match tls.drive_handshake(&mut self.stream) {
                    Ok(true) => {}
                    Ok(false) => return Ok((Vec::new(), false)),
                    Err(e) => {
                        return Err(Fault::transport(format!(
                            "relay TLS handshake failed: {e}"
                        )));
                    }
                }
            }
            _ => {}
        }

        let mut eof = false;
        match &mut self.tls {
            Some(tls) => match tls.read(&mut self.stream, &mut self.read_buf) {
                Ok(TlsIo::Data(_)) => {}
                Ok(TlsIo::Eof) => eof = true,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    return Err(Fault::transport(format!("relay read error: {e}")));
                }
            },
            None => {
                let mut tmp = [0u8; 4096];
                loop {
                    match self.stream.read(&mut tmp) {
                        Ok(0) => {
                            eof = true;
                            break;
                        }
                        Ok(n) => self.read_buf.extend_from_slice(&tmp[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            return Err(Fault::transport(format!("relay read error: {e}")));
                        }
                    }
                }
            }
        }

        let mut messages = Vec::new();
        loop {
            match Frame::decode(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    let msg = ServerMessage::from_frame(&frame).map_err(|e| {
                        Fault::transport(format!("bad message from relay {}: {e}", self.host))
                    })?;
                    if !self.saw_hello {
                        if let ServerMessage::Hello(hello) = &msg {
                            debug!(host = %self.host, server_id = %hello.server_id,
                                "relay greeting received");
                            self.saw_hello = true;
                            self.deadline = None;
                            // The backlog queued before the greeting can go now.
                            self.flush()?;
                            continue;
                        }
                        warn!(host = %self.host, "relay spoke before its hello");
                        return Err(Fault::transport("relay protocol violation".to_string()));
                    }
                    messages.push(msg);
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(Fault::transport(format!(
                        "bad frame from relay {}: {e}",
                        self.host
                    )));
                }
            }
        }

        Ok((messages, eof))
    }

    /// Writes queued frames until the socket blocks.
    pub fn flush(&mut self) -> Result<(), Fault> {
        if !self.saw_hello {
            // TLS-internal data still has to move during the handshake.
            if let Some(tls) = &mut self.tls {
                if let Err(e) = tls.flush(&mut self.stream) {
                    return Err(Fault::transport(format!("relay write error: {e}")));
                }
            }
            return Ok(());
        }

        while let Some(head) = self.write_q.head_mut() {
            let chunk = head.remaining();
            let result = match &mut self.tls {
                Some(tls) => tls.write(&mut self.stream, chunk),
                None => self.stream.write(chunk),
            };
            match result {
                Ok(0) => {
                    return Err(Fault::transport("relay write returned zero".to_string()));
                }
                Ok(n) => {
                    trace!(host = %self.host, bytes = n, "flushed to relay");
                    head.advance(n);
                    if head.is_done() {
                        self.write_q.recycle_head();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    return Err(Fault::transport(format!("relay write error: {e}")));
                }
            }
        }

        self.deadline = if self.write_q.is_empty() {
            None
        } else {
            Some(Instant::now() + self.timeout)
        };
        Ok(())
    }

    /// The poll interest this relay currently needs.
    pub fn interest(&self) -> Interest {
        let wants_write = !self.connected
            || self.has_pending_writes()
            || self.tls.as_ref().is_some_and(TlsSession::wants_write);
        if wants_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Applies the current interest to the poll registration.
    pub fn update_registration(&mut self, registry: &Registry) -> std::io::Result<()> {
        let interest = self.interest();
        registry.reregister(&mut self.stream, self.token, interest)
    }

    /// Removes the relay socket from the poll.
    pub fn deregister(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
    }
}

fn resolve_first(hosts: &[String]) -> ServerResult<(String, SocketAddr)> {
    for host in hosts {
        match host.to_socket_addrs() {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    return Ok((host.clone(), addr));
                }
            }
            Err(e) => {
                warn!(host = %host, error = %e, "unable to resolve relay host");
            }
        }
    }
    Err(ServerError::RelayUnavailable(
        hosts.first().cloned().unwrap_or_default(),
    ))
}
