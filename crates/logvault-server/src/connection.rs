//! Per-connection state.
//!
//! A connection exclusively owns its socket, TLS session, read buffer,
//! write queue, sink, optional nested relay connection, and optional
//! journal replay source. Inbound records are processed strictly in
//! arrival order; outbound replies are emitted strictly in enqueue order.

use std::io::{Read, Write};
use std::time::Instant;

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace, warn};

use logvault_wire::{ClientMessage, Frame, ServerHello, ServerMessage, TimeSpec, WireError};

use crate::buffer::WriteQueue;
use crate::error::Fault;
use crate::journal::JournalReplay;
use crate::relay::{RelayStream, RELAY_QUEUE_LIMIT};
use crate::server::{EngineCtx, ACK_FREQUENCY};
use crate::sink::{Sink, SinkCtx};
use crate::tls::{TlsIo, TlsSession};

/// Protocol state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    /// Waiting for the client's opening decision.
    Initial,
    /// Session in progress.
    Running,
    /// Command exited; the final commit point is still owed to the client.
    Exited,
    /// Session complete.
    Finished,
    /// Failed; an error reply is on its way out.
    Error,
    /// Server is shutting down.
    Shutdown,
}

impl ConnectionState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Finished | ConnectionState::Error | ConnectionState::Shutdown
        )
    }
}

/// One client connection (or relay-only journal replay).
pub(crate) struct Connection {
    pub token: Token,
    /// The client socket. Journal replay connections have none.
    stream: Option<TcpStream>,
    tls: Option<TlsSession>,
    /// Peer IP literal, or the journal path for replayed sessions.
    pub peer: String,
    pub state: ConnectionState,
    read_buf: BytesMut,
    write_q: WriteQueue,
    sink: Box<dyn Sink>,
    pub log_io: bool,
    pub store_first: bool,
    read_enabled: bool,
    registered: bool,
    started: bool,
    /// Last elapsed time known durable (local sinks) or acknowledged
    /// upstream (relay mode).
    pub elapsed: TimeSpec,
    /// Final elapsed time recorded when the exit record went through.
    exit_elapsed: Option<TimeSpec>,
    /// The upstream commit point has covered `exit_elapsed`.
    relay_final_seen: bool,
    pub commit_deadline: Option<Instant>,
    pub write_deadline: Option<Instant>,
    pub handshake_deadline: Option<Instant>,
    pub relay: Option<RelayStream>,
    pub replay: Option<JournalReplay>,
    pub closing: bool,
}

impl Connection {
    /// Creates a connection for an accepted client socket.
    pub fn new_client(
        token: Token,
        stream: TcpStream,
        peer: String,
        tls: Option<TlsSession>,
        sink: Box<dyn Sink>,
        store_first: bool,
    ) -> Self {
        Self {
            token,
            stream: Some(stream),
            tls,
            peer,
            state: ConnectionState::Initial,
            read_buf: BytesMut::with_capacity(64 * 1024),
            write_q: WriteQueue::new(),
            sink,
            log_io: false,
            store_first,
            read_enabled: false,
            registered: false,
            started: false,
            elapsed: TimeSpec::default(),
            exit_elapsed: None,
            relay_final_seen: false,
            commit_deadline: None,
            write_deadline: None,
            handshake_deadline: None,
            relay: None,
            replay: None,
            closing: false,
        }
    }

    /// Creates a relay-only connection that replays a journal file.
    pub fn new_replay(token: Token, replay: JournalReplay, sink: Box<dyn Sink>) -> Self {
        let peer = replay.path.display().to_string();
        Self {
            token,
            stream: None,
            tls: None,
            peer,
            state: ConnectionState::Initial,
            read_buf: BytesMut::new(),
            write_q: WriteQueue::new(),
            sink,
            log_io: false,
            store_first: false,
            read_enabled: false,
            registered: false,
            started: false,
            elapsed: TimeSpec::default(),
            exit_elapsed: None,
            relay_final_seen: false,
            commit_deadline: None,
            write_deadline: None,
            handshake_deadline: None,
            relay: None,
            replay: Some(replay),
            closing: false,
        }
    }

    pub fn take_journal(&mut self) -> Option<crate::journal::JournalFile> {
        self.sink.take_journal()
    }

    /// Registers the client socket for the first time.
    pub fn register_initial(&mut self, registry: &Registry) -> std::io::Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            if self.tls.is_some() {
                registry.register(stream, self.token, Interest::READABLE)?;
                self.registered = true;
                return Ok(());
            }
        }
        self.update_registration(registry);
        Ok(())
    }

    /// Sends the server greeting and starts reading client records.
    pub fn start_protocol(&mut self, ctx: &mut EngineCtx<'_>) {
        self.started = true;
        if self.stream.is_some() {
            let hello = ServerMessage::Hello(ServerHello {
                server_id: ctx.server_id.to_string(),
            });
            if let Err(fault) = self.enqueue_server_msg(hello, ctx) {
                self.fail(fault, ctx);
                return;
            }
            self.read_enabled = true;
        }
        self.update_registration(ctx.registry);
    }

    /// Opens the outbound relay connection for this session.
    pub fn connect_relay(&mut self, ctx: &mut EngineCtx<'_>) -> crate::error::ServerResult<()> {
        let token = ctx.alloc_token();
        let tls = if ctx.config.relay.tls {
            ctx.tls_client
        } else {
            None
        };
        let relay = RelayStream::connect(
            &ctx.config.relay.hosts,
            tls,
            token,
            ctx.registry,
            ctx.config.server_timeout(),
        )?;
        ctx.relay_routes.insert(token, self.token);
        self.relay = Some(relay);
        Ok(())
    }

    // ========================================================================
    // Client socket events
    // ========================================================================

    pub fn on_readable(&mut self, ctx: &mut EngineCtx<'_>) {
        if self.tls.as_ref().is_some_and(TlsSession::is_handshaking) {
            self.drive_tls_handshake(ctx);
            return;
        }

        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let mut eof = false;
        match &mut self.tls {
            Some(tls) => match tls.read(stream, &mut self.read_buf) {
                Ok(TlsIo::Data(n)) => {
                    trace!(peer = %self.peer, bytes = n, "received TLS data");
                }
                Ok(TlsIo::Eof) => eof = true,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "TLS read error");
                    self.closing = true;
                    return;
                }
            },
            None => {
                let mut tmp = [0u8; 4096];
                loop {
                    match stream.read(&mut tmp) {
                        Ok(0) => {
                            eof = true;
                            break;
                        }
                        Ok(n) => {
                            trace!(peer = %self.peer, bytes = n, "received data");
                            self.read_buf.extend_from_slice(&tmp[..n]);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            debug!(peer = %self.peer, error = %e, "read error");
                            self.closing = true;
                            return;
                        }
                    }
                }
            }
        }

        self.process_read_buf(ctx);
        self.service_relay(ctx);

        if eof {
            if self.state != ConnectionState::Finished {
                warn!(peer = %self.peer, "unexpected EOF");
            }
            self.closing = true;
            return;
        }

        self.maybe_finish();
        self.update_registration(ctx.registry);
    }

    /// Flushes anything the dispatch queued onto the relay and refreshes
    /// its poll interest.
    fn service_relay(&mut self, ctx: &mut EngineCtx<'_>) {
        let Some(relay) = self.relay.as_mut() else {
            return;
        };
        if relay.ready() && relay.has_pending_writes() {
            if let Err(fault) = relay.flush() {
                self.relay_fault(fault, ctx);
                return;
            }
        }
        if let Some(relay) = self.relay.as_mut() {
            let _ = relay.update_registration(ctx.registry);
        }
    }

    pub fn on_writable(&mut self, ctx: &mut EngineCtx<'_>) {
        if self.tls.as_ref().is_some_and(TlsSession::is_handshaking) {
            self.drive_tls_handshake(ctx);
            return;
        }

        self.flush_writes();
        self.maybe_finish();
        self.update_registration(ctx.registry);
    }

    fn drive_tls_handshake(&mut self, ctx: &mut EngineCtx<'_>) {
        let (Some(tls), Some(stream)) = (self.tls.as_mut(), self.stream.as_mut()) else {
            return;
        };
        match tls.drive_handshake(stream) {
            Ok(true) => {
                self.handshake_deadline = None;
                if ctx.config.has_relay() && !self.store_first {
                    if let Err(e) = self.connect_relay(ctx) {
                        warn!(peer = %self.peer, error = %e, "unable to connect to relay");
                        self.closing = true;
                        return;
                    }
                    // The greeting goes out once the relay is ready.
                    self.update_registration(ctx.registry);
                } else {
                    self.start_protocol(ctx);
                }
            }
            Ok(false) => {
                self.update_registration(ctx.registry);
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "TLS handshake failed");
                self.closing = true;
            }
        }
    }

    fn flush_writes(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        // TLS-internal data (handshake tails, rekeys) goes first.
        if let Some(tls) = self.tls.as_mut() {
            if let Err(e) = tls.flush(stream) {
                if e.kind() != std::io::ErrorKind::WouldBlock {
                    debug!(peer = %self.peer, error = %e, "TLS flush error");
                    self.closing = true;
                    return;
                }
            }
        }

        while let Some(head) = self.write_q.head_mut() {
            let chunk = head.remaining();
            let result = match self.tls.as_mut() {
                Some(tls) => tls.write(stream, chunk),
                None => stream.write(chunk),
            };
            match result {
                Ok(0) => {
                    debug!(peer = %self.peer, "write returned zero");
                    self.closing = true;
                    return;
                }
                Ok(n) => {
                    trace!(peer = %self.peer, bytes = n, "sent to client");
                    head.advance(n);
                    if head.is_done() {
                        self.write_q.recycle_head();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "write error");
                    self.closing = true;
                    return;
                }
            }
        }

        if self.write_q.is_empty() {
            self.write_deadline = None;
        }
    }

    fn process_read_buf(&mut self, ctx: &mut EngineCtx<'_>) {
        loop {
            if self.closing || self.state == ConnectionState::Error {
                break;
            }
            match Frame::decode(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    if let Err(fault) = self.handle_frame(&frame, ctx) {
                        self.fail(fault, ctx);
                        break;
                    }
                }
                Ok(None) => break,
                Err(WireError::ClientMessageTooLarge { size, .. }) => {
                    warn!(peer = %self.peer, size, "client message too large");
                    self.fail(Fault::protocol("client message too large"), ctx);
                    break;
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "unable to decode frame");
                    self.fail(Fault::protocol("invalid ClientMessage"), ctx);
                    break;
                }
            }
        }
    }

    // ========================================================================
    // Message dispatch
    // ========================================================================

    fn check_state(&self, expected: ConnectionState) -> Result<(), Fault> {
        if self.state == expected {
            Ok(())
        } else {
            warn!(peer = %self.peer, state = ?self.state, "unexpected state");
            Err(Fault::protocol("state machine error"))
        }
    }

    fn run_sink<R>(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        f: impl FnOnce(&mut dyn Sink, &mut SinkCtx<'_>) -> Result<R, Fault>,
    ) -> Result<R, Fault> {
        let mut sctx = SinkCtx {
            peer: &self.peer,
            eventlog: ctx.eventlog,
            iolog: &ctx.config.iolog,
            seq: ctx.seq,
            relay_config: &ctx.config.relay,
            relay: self.relay.as_mut(),
            random_drop: ctx.random_drop,
        };
        f(self.sink.as_mut(), &mut sctx)
    }

    fn handle_frame(&mut self, frame: &Frame, ctx: &mut EngineCtx<'_>) -> Result<(), Fault> {
        let msg = ClientMessage::from_frame(frame)
            .map_err(|_| Fault::protocol("invalid ClientMessage"))?;
        trace!(peer = %self.peer, msg = msg.name(), "received client message");
        let raw: &[u8] = &frame.payload;

        if let Some((stream_id, iobuf)) = msg.io_buffer() {
            self.check_state(ConnectionState::Running)?;
            if !self.log_io {
                warn!(peer = %self.peer, "not logging I/O");
                return Err(Fault::protocol("protocol error"));
            }
            self.run_sink(ctx, |sink, sctx| sink.iobuf(stream_id, iobuf, raw, sctx))?;
            self.elapsed += iobuf.delay;
            self.enable_commit();
            return Ok(());
        }

        match &msg {
            ClientMessage::Hello(hello) => {
                self.check_state(ConnectionState::Initial)?;
                debug!(peer = %self.peer, client_id = %hello.client_id, "client greeting");
                Ok(())
            }
            ClientMessage::Accept(accept) => {
                self.check_state(ConnectionState::Initial)?;
                if accept.info.is_empty() {
                    return Err(Fault::protocol("invalid AcceptMessage"));
                }
                let log_id = self.run_sink(ctx, |sink, sctx| sink.accept(accept, raw, sctx))?;
                if let Some(id) = log_id {
                    self.enqueue_server_msg(ServerMessage::LogId(id), ctx)?;
                }
                if accept.expect_iobufs {
                    self.log_io = true;
                }
                self.state = ConnectionState::Running;
                Ok(())
            }
            ClientMessage::Reject(reject) => {
                self.check_state(ConnectionState::Initial)?;
                if reject.info.is_empty() {
                    return Err(Fault::protocol("invalid RejectMessage"));
                }
                self.run_sink(ctx, |sink, sctx| sink.reject(reject, raw, sctx))?;
                self.state = ConnectionState::Finished;
                Ok(())
            }
            ClientMessage::Exit(exit) => {
                self.check_state(ConnectionState::Running)?;
                self.run_sink(ctx, |sink, sctx| sink.exit(exit, raw, sctx))?;
                if let Some(run_time) = exit.run_time {
                    if run_time > self.elapsed {
                        self.elapsed = run_time;
                    }
                }
                if self.elapsed.is_set() {
                    debug!(peer = %self.peer, elapsed = %self.elapsed, "command exited");
                }
                self.exit_elapsed = Some(self.elapsed);
                if self.log_io && self.relay.is_none() {
                    // Client waits for the final commit point.
                    self.state = ConnectionState::Exited;
                    self.commit_deadline = Some(Instant::now());
                } else {
                    self.state = ConnectionState::Finished;
                }
                self.read_enabled = false;
                Ok(())
            }
            ClientMessage::Restart(restart) => {
                self.check_state(ConnectionState::Initial)?;
                debug!(peer = %self.peer, log_id = %restart.log_id, "restart requested");
                self.run_sink(ctx, |sink, sctx| sink.restart(restart, raw, sctx))?;
                self.elapsed = restart.resume_point;
                self.log_io = true;
                self.state = ConnectionState::Running;
                Ok(())
            }
            ClientMessage::Alert(alert) => {
                self.check_state(ConnectionState::Running)?;
                if alert.reason.is_empty() {
                    return Err(Fault::protocol("invalid AlertMessage"));
                }
                self.run_sink(ctx, |sink, sctx| sink.alert(alert, raw, sctx))
            }
            ClientMessage::Winsize(winsize) => {
                self.check_state(ConnectionState::Running)?;
                if !self.log_io {
                    warn!(peer = %self.peer, "not logging I/O");
                    return Err(Fault::protocol("protocol error"));
                }
                self.run_sink(ctx, |sink, sctx| sink.winsize(winsize, raw, sctx))?;
                self.elapsed += winsize.delay;
                self.enable_commit();
                Ok(())
            }
            ClientMessage::Suspend(suspend) => {
                self.check_state(ConnectionState::Running)?;
                if !self.log_io {
                    warn!(peer = %self.peer, "not logging I/O");
                    return Err(Fault::protocol("protocol error"));
                }
                self.run_sink(ctx, |sink, sctx| sink.suspend(suspend, raw, sctx))?;
                self.elapsed += suspend.delay;
                self.enable_commit();
                Ok(())
            }
            // I/O buffers were handled above.
            _ => Err(Fault::protocol("unrecognized ClientMessage type")),
        }
    }

    /// Arms the commit timer if no relay owns the acknowledgments.
    fn enable_commit(&mut self) {
        if self.relay.is_none() && self.commit_deadline.is_none() {
            self.commit_deadline = Some(Instant::now() + ACK_FREQUENCY);
        }
    }

    /// Emits a commit point for the last durable elapsed time.
    ///
    /// Fired by the timer sweep; also drives `Exited -> Finished`.
    pub fn fire_commit(&mut self, ctx: &mut EngineCtx<'_>) {
        self.commit_deadline = None;
        let commit = self.elapsed;
        debug!(peer = %self.peer, commit = %commit, "sending commit point");
        if let Err(fault) = self.enqueue_server_msg(ServerMessage::CommitPoint(commit), ctx) {
            self.fail(fault, ctx);
            return;
        }
        if self.state == ConnectionState::Exited {
            self.state = ConnectionState::Finished;
        }
        self.maybe_finish();
        self.update_registration(ctx.registry);
    }

    fn enqueue_server_msg(
        &mut self,
        msg: ServerMessage,
        ctx: &mut EngineCtx<'_>,
    ) -> Result<(), Fault> {
        // Journal replay connections have no client to reply to.
        if self.stream.is_none() {
            return Ok(());
        }
        let frame = msg
            .to_frame()
            .map_err(|e| Fault::resource(format!("unable to format server message: {e}")))?;
        self.write_q.enqueue_frame(&frame);
        if self.write_deadline.is_none() {
            self.write_deadline = Some(Instant::now() + ctx.config.server_timeout());
        }
        Ok(())
    }

    /// Applies the failure policy for `fault`.
    pub fn fail(&mut self, fault: Fault, ctx: &mut EngineCtx<'_>) {
        match &fault {
            Fault::Protocol(msg) | Fault::Resource(msg) => {
                warn!(peer = %self.peer, error = %msg, "connection failed");
                if self.state == ConnectionState::Error || self.stream.is_none() {
                    self.state = ConnectionState::Error;
                    self.closing = true;
                    return;
                }
                self.read_enabled = false;
                self.state = ConnectionState::Error;
                let reply = ServerMessage::Error(msg.clone());
                if self.enqueue_server_msg(reply, ctx).is_err() {
                    self.closing = true;
                    return;
                }
                self.update_registration(ctx.registry);
            }
            Fault::Transport(msg) => {
                debug!(peer = %self.peer, error = %msg, "closing connection");
                if self.state != ConnectionState::Finished {
                    self.state = ConnectionState::Error;
                }
                self.closing = true;
            }
        }
    }

    // ========================================================================
    // Relay events
    // ========================================================================

    pub fn on_relay_event(&mut self, readable: bool, writable: bool, ctx: &mut EngineCtx<'_>) {
        if writable {
            if let Some(relay) = self.relay.as_mut() {
                if let Err(fault) = relay.on_writable() {
                    self.relay_fault(fault, ctx);
                    return;
                }
            }
        }

        if readable {
            let (messages, became_ready, relay_eof) = match self.relay.as_mut() {
                Some(relay) => {
                    let was_ready = relay.ready();
                    match relay.on_readable() {
                        Ok((messages, eof)) => (messages, !was_ready && relay.ready(), eof),
                        Err(fault) => {
                            self.relay_fault(fault, ctx);
                            return;
                        }
                    }
                }
                None => return,
            };

            if became_ready && !self.started {
                self.start_protocol(ctx);
            }
            for msg in messages {
                if self.closing {
                    break;
                }
                self.handle_relay_message(msg, ctx);
            }
            if relay_eof && !self.closing {
                self.on_relay_eof(ctx);
            }
        }

        self.pump_replay(ctx);

        if let Some(relay) = self.relay.as_mut() {
            let _ = relay.update_registration(ctx.registry);
        }
        self.maybe_finish();
        self.update_registration(ctx.registry);
    }

    fn handle_relay_message(&mut self, msg: ServerMessage, ctx: &mut EngineCtx<'_>) {
        let result = match msg {
            ServerMessage::Hello(_) => Ok(()),
            ServerMessage::LogId(id) => self.enqueue_server_msg(ServerMessage::LogId(id), ctx),
            ServerMessage::CommitPoint(commit) => {
                trace!(peer = %self.peer, commit = %commit, "relay commit point");
                if commit > self.elapsed {
                    self.elapsed = commit;
                }
                if self.exit_elapsed.is_some_and(|exit| commit >= exit) {
                    self.relay_final_seen = true;
                }
                self.enqueue_server_msg(ServerMessage::CommitPoint(commit), ctx)
            }
            ServerMessage::Error(errstr) => {
                warn!(peer = %self.peer, error = %errstr, "error from relay");
                let result = self.enqueue_server_msg(ServerMessage::Error(errstr), ctx);
                self.read_enabled = false;
                self.state = ConnectionState::Error;
                result
            }
        };
        if let Err(fault) = result {
            self.fail(fault, ctx);
        }
    }

    /// The relay hit end of stream. Fine after a fully acknowledged
    /// session, fatal any earlier.
    fn on_relay_eof(&mut self, ctx: &mut EngineCtx<'_>) {
        if self.state == ConnectionState::Finished && self.relay_done() {
            debug!(peer = %self.peer, "relay closed after final commit");
            return;
        }
        self.relay_fault(
            Fault::transport("relay closed the connection".to_string()),
            ctx,
        );
    }

    fn relay_fault(&mut self, fault: Fault, ctx: &mut EngineCtx<'_>) {
        warn!(peer = %self.peer, error = %fault.message(), "relay connection failed");
        if self.stream.is_some() && self.state != ConnectionState::Shutdown {
            self.fail(Fault::resource("relay connection failed"), ctx);
        } else {
            if self.state != ConnectionState::Finished {
                self.state = ConnectionState::Error;
            }
            self.closing = true;
        }
    }

    /// Feeds journal frames into the relay while its queue has room.
    fn pump_replay(&mut self, ctx: &mut EngineCtx<'_>) {
        if self.replay.is_none() || self.closing {
            return;
        }

        loop {
            let ready = match self.relay.as_ref() {
                Some(relay) => relay.ready() && relay.queued_frames() < RELAY_QUEUE_LIMIT,
                None => {
                    self.closing = true;
                    return;
                }
            };
            if !ready {
                break;
            }

            let frame = match self.replay.as_mut().map(JournalReplay::next_frame) {
                Some(Ok(Some(frame))) => frame,
                Some(Ok(None)) => {
                    if self.state != ConnectionState::Finished {
                        warn!(peer = %self.peer, "journal ended before the session finished");
                        self.state = ConnectionState::Error;
                        self.closing = true;
                    }
                    break;
                }
                Some(Err(e)) => {
                    warn!(peer = %self.peer, error = %e, "journal replay failed");
                    self.state = ConnectionState::Error;
                    self.closing = true;
                    break;
                }
                None => break,
            };

            if let Err(fault) = self.handle_frame(&frame, ctx) {
                self.fail(fault, ctx);
                break;
            }
        }

        if let Some(relay) = self.relay.as_mut() {
            if let Err(fault) = relay.flush() {
                self.relay_fault(fault, ctx);
            }
        }
    }

    // ========================================================================
    // Teardown and registration
    // ========================================================================

    /// True when the relay side is done with everything the close is
    /// waiting on.
    fn relay_done(&self) -> bool {
        match &self.relay {
            None => true,
            Some(relay) => match self.state {
                ConnectionState::Finished => {
                    !relay.has_pending_writes() && (!self.log_io || self.relay_final_seen)
                }
                ConnectionState::Shutdown => !relay.has_pending_writes(),
                // Errors close without waiting on the relay.
                _ => true,
            },
        }
    }

    /// Marks the connection closed once its terminal state has fully
    /// drained.
    fn maybe_finish(&mut self) {
        if !self.state.is_terminal() || self.closing {
            return;
        }
        // A scheduled commit point (the shutdown ack) still has to go out.
        if self.commit_deadline.is_some() {
            return;
        }
        if !self.write_q.is_empty() {
            return;
        }
        if self.tls.as_ref().is_some_and(TlsSession::wants_write) {
            return;
        }
        if !self.relay_done() {
            return;
        }
        // A replayed journal must be fully consumed before the close
        // unlinks it.
        if self
            .replay
            .as_ref()
            .is_some_and(|r| self.state == ConnectionState::Finished && !r.finished())
        {
            return;
        }
        self.closing = true;
    }

    fn desired_interest(&self) -> Option<Interest> {
        if self.stream.is_none() {
            return None;
        }
        if let Some(tls) = &self.tls {
            if tls.is_handshaking() {
                // The handshake registration follows the library's
                // direction preference.
                return Some(if tls.wants_write() {
                    Interest::WRITABLE
                } else {
                    Interest::READABLE
                });
            }
        }

        let want_read = self.read_enabled && !self.closing;
        let want_write = !self.write_q.is_empty()
            || self.tls.as_ref().is_some_and(TlsSession::wants_write);
        match (want_read, want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Applies the currently needed poll interest, registering or
    /// deregistering the socket as it changes.
    pub fn update_registration(&mut self, registry: &Registry) {
        let desired = self.desired_interest();
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let result = match (desired, self.registered) {
            (Some(interest), true) => registry.reregister(stream, self.token, interest),
            (Some(interest), false) => {
                let result = registry.register(stream, self.token, interest);
                self.registered = result.is_ok();
                result
            }
            (None, true) => {
                self.registered = false;
                registry.deregister(stream)
            }
            (None, false) => Ok(()),
        };
        if let Err(e) = result {
            warn!(peer = %self.peer, error = %e, "unable to update poll registration");
            self.closing = true;
        }
    }

    /// Removes every poll registration owned by this connection.
    pub fn deregister_all(&mut self, registry: &Registry) {
        if self.registered {
            if let Some(stream) = self.stream.as_mut() {
                let _ = registry.deregister(stream);
            }
            self.registered = false;
        }
        if let Some(relay) = self.relay.as_mut() {
            relay.deregister(registry);
        }
    }

    /// Puts the connection into shutdown per the lifecycle controller.
    pub fn begin_shutdown(&mut self) {
        self.state = ConnectionState::Shutdown;
        self.read_enabled = false;
        if self.relay.is_some() {
            // Let pending relay output flush; maybe_finish waits on it.
        } else if self.log_io {
            // Schedule the final commit point immediately.
            self.commit_deadline = Some(Instant::now());
        }
        self.maybe_finish();
    }
}
