//! Integration tests for the server.
//!
//! These drive a real server over localhost sockets with a minimal
//! in-process client speaking the wire protocol.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tempfile::TempDir;

use logvault_wire::{
    AcceptMessage, ClientHello, ClientMessage, ExitMessage, Frame, InfoMessage, IoBuffer,
    RejectMessage, RestartMessage, ServerMessage, TimeSpec,
};

use crate::config::ListenAddress;
use crate::{Config, Server, ServerOptions, SERVER_ID};

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.server.listen = vec![ListenAddress {
        addr: "127.0.0.1:0".parse().expect("valid address"),
        tls: false,
    }];
    config.server.timeout = 5;
    config.eventlog.path = dir.join("events.jsonl");
    config.iolog.dir = dir.join("io");
    config.relay.journal_dir = dir.join("incoming");
    config
}

fn spawn_server(mut server: Server, running: Arc<AtomicBool>) -> thread::JoinHandle<Server> {
    thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            let _ = server.poll_once(Some(Duration::from_millis(20)));
        }
        server
    })
}

/// Minimal blocking protocol client for tests.
struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to server");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("set read timeout");
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    fn send(&mut self, msg: &ClientMessage) {
        let mut out = BytesMut::new();
        msg.to_frame().expect("encode message").encode(&mut out);
        self.stream.write_all(&out).expect("send message");
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("send raw bytes");
    }

    /// Receives the next server message, or `None` at EOF.
    fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf).expect("well-formed frame") {
                return Some(ServerMessage::from_frame(&frame).expect("decodable reply"));
            }
            let mut tmp = [0u8; 4096];
            match self.stream.read(&mut tmp) {
                Ok(0) => return None,
                Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
                Err(e) => panic!("read from server failed: {e}"),
            }
        }
    }

    /// Drains replies until EOF, returning everything received.
    fn recv_until_eof(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Some(msg) = self.recv() {
            messages.push(msg);
        }
        messages
    }

    fn expect_hello(&mut self) {
        match self.recv() {
            Some(ServerMessage::Hello(hello)) => {
                assert_eq!(hello.server_id, SERVER_ID);
            }
            other => panic!("expected server hello, got {other:?}"),
        }
    }
}

fn accept_message(expect_iobufs: bool) -> ClientMessage {
    ClientMessage::Accept(AcceptMessage {
        submit_time: TimeSpec::new(1_700_000_000, 0),
        info: vec![
            InfoMessage::text("user", "alice"),
            InfoMessage::text("command", "/bin/ls"),
        ],
        expect_iobufs,
    })
}

fn ttyout(delay: TimeSpec, data: &[u8]) -> ClientMessage {
    ClientMessage::TtyOut(IoBuffer {
        delay,
        data: data.to_vec(),
    })
}

fn exit_message(run_time: TimeSpec) -> ClientMessage {
    ClientMessage::Exit(ExitMessage {
        exit_value: 0,
        signal: None,
        dumped_core: false,
        run_time: Some(run_time),
    })
}

fn wait_for<F: FnMut() -> bool>(mut condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    false
}

#[test]
fn server_binds_and_reports_address() {
    let dir = TempDir::new().expect("temp dir");
    let server = Server::new(test_config(dir.path()), ServerOptions::default())
        .expect("create server");

    let addrs = server.local_addrs();
    assert_eq!(addrs.len(), 1);
    assert_ne!(addrs[0].port(), 0);
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn happy_path_logs_io_and_sends_final_commit() {
    let dir = TempDir::new().expect("temp dir");
    let server = Server::new(test_config(dir.path()), ServerOptions::default())
        .expect("create server");
    let addr = server.local_addrs()[0];
    let running = Arc::new(AtomicBool::new(true));
    let handle = spawn_server(server, Arc::clone(&running));

    let mut client = TestClient::connect(addr);
    client.expect_hello();
    client.send(&ClientMessage::Hello(ClientHello {
        client_id: "test client 1.0".to_string(),
    }));
    client.send(&accept_message(true));

    let log_id = match client.recv() {
        Some(ServerMessage::LogId(id)) => id,
        other => panic!("expected LogId, got {other:?}"),
    };
    assert_eq!(log_id, "000001");

    client.send(&ttyout(TimeSpec::new(0, 100_000_000), b"hello\n"));
    client.send(&exit_message(TimeSpec::new(3, 0)));

    let replies = client.recv_until_eof();
    let last = replies.last().expect("a final reply");
    assert_eq!(*last, ServerMessage::CommitPoint(TimeSpec::new(3, 0)));
    for reply in &replies {
        assert!(matches!(reply, ServerMessage::CommitPoint(_)));
    }

    running.store(false, Ordering::SeqCst);
    handle.join().expect("server thread");

    // The I/O log holds the stream data and a completed timing file.
    let session = dir.path().join("io").join("000001");
    assert_eq!(std::fs::read(session.join("ttyout")).expect("ttyout"), b"hello\n");
    let timing_meta = std::fs::metadata(session.join("timing")).expect("timing");
    use std::os::unix::fs::PermissionsExt;
    assert_eq!(timing_meta.permissions().mode() & 0o222, 0);

    // The event log has the accept and exit records.
    let events = std::fs::read_to_string(dir.path().join("events.jsonl")).expect("event log");
    let lines: Vec<&str> = events.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"accept\""));
    assert!(lines[1].contains("\"exit\""));
}

#[test]
fn commit_points_are_sent_periodically() {
    let dir = TempDir::new().expect("temp dir");
    let server = Server::new(test_config(dir.path()), ServerOptions::default())
        .expect("create server");
    let addr = server.local_addrs()[0];
    let running = Arc::new(AtomicBool::new(true));
    let handle = spawn_server(server, Arc::clone(&running));

    let mut client = TestClient::connect(addr);
    client.expect_hello();
    client.send(&accept_message(true));
    match client.recv() {
        Some(ServerMessage::LogId(_)) => {}
        other => panic!("expected LogId, got {other:?}"),
    }
    client.send(&ttyout(TimeSpec::new(0, 100_000_000), b"tick"));

    // The ack timer fires while the client stays silent.
    match client.recv() {
        Some(ServerMessage::CommitPoint(commit)) => {
            assert!(commit >= TimeSpec::new(0, 100_000_000));
        }
        other => panic!("expected CommitPoint, got {other:?}"),
    }

    client.send(&exit_message(TimeSpec::new(3, 0)));
    let replies = client.recv_until_eof();
    assert_eq!(
        replies.last(),
        Some(&ServerMessage::CommitPoint(TimeSpec::new(3, 0)))
    );

    running.store(false, Ordering::SeqCst);
    handle.join().expect("server thread");
}

#[test]
fn rejected_session_gets_no_log_id_or_commit() {
    let dir = TempDir::new().expect("temp dir");
    let server = Server::new(test_config(dir.path()), ServerOptions::default())
        .expect("create server");
    let addr = server.local_addrs()[0];
    let running = Arc::new(AtomicBool::new(true));
    let handle = spawn_server(server, Arc::clone(&running));

    let mut client = TestClient::connect(addr);
    client.expect_hello();
    client.send(&ClientMessage::Reject(RejectMessage {
        submit_time: TimeSpec::new(1_700_000_000, 0),
        reason: "policy denied".to_string(),
        info: vec![InfoMessage::text("user", "mallory")],
    }));

    assert_eq!(client.recv_until_eof(), Vec::new());

    running.store(false, Ordering::SeqCst);
    handle.join().expect("server thread");

    let events = std::fs::read_to_string(dir.path().join("events.jsonl")).expect("event log");
    assert!(events.contains("\"reject\""));
    assert!(events.contains("policy denied"));
    // No I/O log directory was created.
    assert!(!dir.path().join("io").join("000001").exists());
}

#[test]
fn out_of_order_restart_is_a_state_machine_error() {
    let dir = TempDir::new().expect("temp dir");
    let server = Server::new(test_config(dir.path()), ServerOptions::default())
        .expect("create server");
    let addr = server.local_addrs()[0];
    let running = Arc::new(AtomicBool::new(true));
    let handle = spawn_server(server, Arc::clone(&running));

    let mut client = TestClient::connect(addr);
    client.expect_hello();
    client.send(&accept_message(false));
    client.send(&ClientMessage::Restart(RestartMessage {
        log_id: "000001".to_string(),
        resume_point: TimeSpec::new(1, 0),
    }));

    let replies = client.recv_until_eof();
    assert_eq!(
        replies,
        vec![ServerMessage::Error("state machine error".to_string())]
    );

    running.store(false, Ordering::SeqCst);
    handle.join().expect("server thread");
}

#[test]
fn oversize_frame_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let server = Server::new(test_config(dir.path()), ServerOptions::default())
        .expect("create server");
    let addr = server.local_addrs()[0];
    let running = Arc::new(AtomicBool::new(true));
    let handle = spawn_server(server, Arc::clone(&running));

    let mut client = TestClient::connect(addr);
    client.expect_hello();

    // A 1 MiB length prefix exceeds the 512 KiB maximum; the error comes
    // back before any payload arrives.
    client.send_raw(&0x0010_0000u32.to_be_bytes());
    client.send_raw(&[0u8; 1024]);

    let replies = client.recv_until_eof();
    assert_eq!(
        replies,
        vec![ServerMessage::Error("client message too large".to_string())]
    );

    running.store(false, Ordering::SeqCst);
    handle.join().expect("server thread");
}

#[test]
fn graceful_shutdown_sends_final_commit_point() {
    let dir = TempDir::new().expect("temp dir");
    let mut server = Server::new(test_config(dir.path()), ServerOptions::default())
        .expect("create server");
    let addr = server.local_addrs()[0];

    let client_thread = thread::spawn(move || {
        let mut client = TestClient::connect(addr);
        client.expect_hello();
        client.send(&accept_message(true));
        match client.recv() {
            Some(ServerMessage::LogId(_)) => {}
            other => panic!("expected LogId, got {other:?}"),
        }
        client.send(&ttyout(TimeSpec::new(0, 500_000_000), b"mid-session"));
        client.recv_until_eof()
    });

    // Let the session get going, then shut down underneath it.
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.connection_count() == 0 && Instant::now() < deadline {
        server.poll_once(Some(Duration::from_millis(10))).expect("poll");
    }
    for _ in 0..30 {
        server.poll_once(Some(Duration::from_millis(10))).expect("poll");
    }

    server.initiate_shutdown();
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.connection_count() > 0 && Instant::now() < deadline {
        server.poll_once(Some(Duration::from_millis(10))).expect("poll");
    }
    assert_eq!(server.connection_count(), 0);

    let replies = client_thread.join().expect("client thread");
    match replies.last() {
        Some(ServerMessage::CommitPoint(commit)) => {
            assert_eq!(*commit, TimeSpec::new(0, 500_000_000));
        }
        other => panic!("expected a final CommitPoint, got {other:?}"),
    }
}

#[test]
fn store_first_session_is_journaled_then_replayed() {
    let upstream_dir = TempDir::new().expect("temp dir");
    let local_dir = TempDir::new().expect("temp dir");

    // Upstream relay target: a plain local-persistence server.
    let upstream = Server::new(test_config(upstream_dir.path()), ServerOptions::default())
        .expect("create upstream");
    let upstream_addr = upstream.local_addrs()[0];

    // Store-first server pointing at the upstream.
    let mut config = test_config(local_dir.path());
    config.relay.hosts = vec![upstream_addr.to_string()];
    config.relay.store_first = true;
    let server = Server::new(config, ServerOptions::default()).expect("create server");
    let addr = server.local_addrs()[0];

    let running = Arc::new(AtomicBool::new(true));
    let upstream_handle = spawn_server(upstream, Arc::clone(&running));
    let server_handle = spawn_server(server, Arc::clone(&running));

    let mut client = TestClient::connect(addr);
    client.expect_hello();
    client.send(&accept_message(true));
    let log_id = match client.recv() {
        Some(ServerMessage::LogId(id)) => id,
        other => panic!("expected LogId, got {other:?}"),
    };
    assert!(log_id.starts_with("incoming."));

    client.send(&ttyout(TimeSpec::new(0, 100_000_000), b"hello\n"));
    client.send(&exit_message(TimeSpec::new(3, 0)));
    let replies = client.recv_until_eof();
    assert_eq!(
        replies.last(),
        Some(&ServerMessage::CommitPoint(TimeSpec::new(3, 0)))
    );
    drop(client);

    // The journal replays to the upstream, which persists the I/O log;
    // a clean replay removes the journal file.
    let upstream_session = upstream_dir.path().join("io").join("000001");
    assert!(
        wait_for(
            || upstream_session.join("ttyout").exists(),
            Duration::from_secs(10),
        ),
        "upstream never received the replayed session"
    );
    assert!(
        wait_for(
            || {
                std::fs::read_dir(local_dir.path().join("incoming"))
                    .map(|entries| entries.count() == 0)
                    .unwrap_or(false)
            },
            Duration::from_secs(10),
        ),
        "journal file was not removed after replay"
    );

    running.store(false, Ordering::SeqCst);
    upstream_handle.join().expect("upstream thread");
    server_handle.join().expect("server thread");

    assert_eq!(
        std::fs::read(upstream_session.join("ttyout")).expect("replayed ttyout"),
        b"hello\n"
    );
    let events = std::fs::read_to_string(upstream_dir.path().join("events.jsonl"))
        .expect("upstream event log");
    assert!(events.contains("\"accept\""));
}
