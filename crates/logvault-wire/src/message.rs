//! Client and server message types for the audit protocol.
//!
//! Messages are serialized using bincode for efficient binary encoding.

use std::fmt;
use std::ops::AddAssign;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{WireError, WireResult};
use crate::frame::Frame;

/// A point in elapsed or wall-clock time with nanosecond resolution.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TimeSpec {
    /// Whole seconds.
    pub sec: i64,
    /// Nanoseconds, always in `0..1_000_000_000`.
    pub nsec: i32,
}

impl TimeSpec {
    const NSEC_PER_SEC: i32 = 1_000_000_000;

    /// Creates a normalized `TimeSpec`.
    pub fn new(sec: i64, nsec: i32) -> Self {
        let mut ts = Self { sec, nsec };
        ts.normalize();
        ts
    }

    /// Returns true if this is not the zero time.
    pub fn is_set(&self) -> bool {
        self.sec != 0 || self.nsec != 0
    }

    fn normalize(&mut self) {
        while self.nsec >= Self::NSEC_PER_SEC {
            self.sec += 1;
            self.nsec -= Self::NSEC_PER_SEC;
        }
        while self.nsec < 0 {
            self.sec -= 1;
            self.nsec += Self::NSEC_PER_SEC;
        }
    }
}

impl AddAssign for TimeSpec {
    fn add_assign(&mut self, rhs: Self) {
        self.sec += rhs.sec;
        self.nsec += rhs.nsec;
        self.normalize();
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// One key/value entry of the event information list sent with accept,
/// reject, and alert decisions. The list order is preserved end to end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoMessage {
    /// Entry key, e.g. `"user"` or `"command"`.
    pub key: String,
    /// Entry value.
    pub value: InfoValue,
}

/// Value of an [`InfoMessage`] entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoValue {
    /// Integer value.
    Number(i64),
    /// String value.
    Text(String),
    /// List-of-strings value, e.g. a command argument vector.
    List(Vec<String>),
}

impl InfoMessage {
    /// Creates a string-valued entry.
    pub fn text(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: InfoValue::Text(value.into()),
        }
    }

    /// Creates a number-valued entry.
    pub fn number(key: impl Into<String>, value: i64) -> Self {
        Self {
            key: key.into(),
            value: InfoValue::Number(value),
        }
    }
}

/// Identifies one of the five logged I/O streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoStream {
    /// Standard input.
    Stdin,
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
    /// Terminal input.
    TtyIn,
    /// Terminal output.
    TtyOut,
}

impl IoStream {
    /// All streams, in timing-file id order.
    pub const ALL: [IoStream; 5] = [
        IoStream::Stdin,
        IoStream::Stdout,
        IoStream::Stderr,
        IoStream::TtyIn,
        IoStream::TtyOut,
    ];

    /// Numeric id used in timing files.
    pub fn id(self) -> usize {
        match self {
            IoStream::Stdin => 0,
            IoStream::Stdout => 1,
            IoStream::Stderr => 2,
            IoStream::TtyIn => 3,
            IoStream::TtyOut => 4,
        }
    }

    /// On-disk file name of the stream log.
    pub fn file_name(self) -> &'static str {
        match self {
            IoStream::Stdin => "stdin",
            IoStream::Stdout => "stdout",
            IoStream::Stderr => "stderr",
            IoStream::TtyIn => "ttyin",
            IoStream::TtyOut => "ttyout",
        }
    }
}

impl fmt::Display for IoStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// Pre-protocol greeting from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    /// Free-form client identification string.
    pub client_id: String,
}

/// The command was allowed to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptMessage {
    /// Wall-clock time the command was submitted.
    pub submit_time: TimeSpec,
    /// Ordered event information entries.
    pub info: Vec<InfoMessage>,
    /// True if the client will stream I/O buffers for this session.
    pub expect_iobufs: bool,
}

/// The command was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectMessage {
    /// Wall-clock time the command was submitted.
    pub submit_time: TimeSpec,
    /// Human-readable denial reason.
    pub reason: String,
    /// Ordered event information entries.
    pub info: Vec<InfoMessage>,
}

/// The command finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitMessage {
    /// Process exit value.
    pub exit_value: i32,
    /// Name of the terminating signal, if the command was killed.
    pub signal: Option<String>,
    /// True if the command dumped core.
    pub dumped_core: bool,
    /// Total elapsed run time.
    pub run_time: Option<TimeSpec>,
}

/// Resume an interrupted session identified by a previous `LogId` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartMessage {
    /// The log identifier to resume.
    pub log_id: String,
    /// Elapsed time the client wants to resume from.
    pub resume_point: TimeSpec,
}

/// An asynchronous security alert tied to the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertMessage {
    /// Wall-clock time of the alert.
    pub alert_time: TimeSpec,
    /// Human-readable alert reason.
    pub reason: String,
    /// Ordered event information entries.
    pub info: Vec<InfoMessage>,
}

/// A chunk of captured I/O with its delay since the previous record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoBuffer {
    /// Elapsed time since the previous session record.
    pub delay: TimeSpec,
    /// Raw captured bytes.
    pub data: Vec<u8>,
}

/// The terminal window changed size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeWindowSize {
    /// Elapsed time since the previous session record.
    pub delay: TimeSpec,
    /// New number of rows.
    pub rows: u32,
    /// New number of columns.
    pub cols: u32,
}

/// The command was suspended or resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSuspend {
    /// Elapsed time since the previous session record.
    pub delay: TimeSpec,
    /// Signal name, e.g. `"TSTP"` or `"CONT"`.
    pub signal: String,
}

/// A message from the audit client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Pre-protocol greeting.
    Hello(ClientHello),
    /// Command accepted.
    Accept(AcceptMessage),
    /// Command rejected.
    Reject(RejectMessage),
    /// Command exited.
    Exit(ExitMessage),
    /// Resume an interrupted session.
    Restart(RestartMessage),
    /// Security alert.
    Alert(AlertMessage),
    /// Terminal input buffer.
    TtyIn(IoBuffer),
    /// Terminal output buffer.
    TtyOut(IoBuffer),
    /// Standard input buffer.
    Stdin(IoBuffer),
    /// Standard output buffer.
    Stdout(IoBuffer),
    /// Standard error buffer.
    Stderr(IoBuffer),
    /// Window size change.
    Winsize(ChangeWindowSize),
    /// Command suspend/resume.
    Suspend(CommandSuspend),
}

impl ClientMessage {
    /// Encodes the message to a frame.
    pub fn to_frame(&self) -> WireResult<Frame> {
        let payload =
            bincode::serialize(self).map_err(|e| WireError::Serialization(e.to_string()))?;
        Frame::new(Bytes::from(payload))
    }

    /// Decodes a message from a frame.
    pub fn from_frame(frame: &Frame) -> WireResult<Self> {
        bincode::deserialize(&frame.payload).map_err(WireError::from)
    }

    /// Short message name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Hello(_) => "ClientHello",
            ClientMessage::Accept(_) => "AcceptMessage",
            ClientMessage::Reject(_) => "RejectMessage",
            ClientMessage::Exit(_) => "ExitMessage",
            ClientMessage::Restart(_) => "RestartMessage",
            ClientMessage::Alert(_) => "AlertMessage",
            ClientMessage::TtyIn(_) => "IoBuffer[ttyin]",
            ClientMessage::TtyOut(_) => "IoBuffer[ttyout]",
            ClientMessage::Stdin(_) => "IoBuffer[stdin]",
            ClientMessage::Stdout(_) => "IoBuffer[stdout]",
            ClientMessage::Stderr(_) => "IoBuffer[stderr]",
            ClientMessage::Winsize(_) => "ChangeWindowSize",
            ClientMessage::Suspend(_) => "CommandSuspend",
        }
    }

    /// Returns the stream id and buffer for the five I/O buffer variants.
    pub fn io_buffer(&self) -> Option<(IoStream, &IoBuffer)> {
        match self {
            ClientMessage::TtyIn(buf) => Some((IoStream::TtyIn, buf)),
            ClientMessage::TtyOut(buf) => Some((IoStream::TtyOut, buf)),
            ClientMessage::Stdin(buf) => Some((IoStream::Stdin, buf)),
            ClientMessage::Stdout(buf) => Some((IoStream::Stdout, buf)),
            ClientMessage::Stderr(buf) => Some((IoStream::Stderr, buf)),
            _ => None,
        }
    }

    /// Constructs the I/O buffer variant for a stream id.
    pub fn from_io_buffer(stream: IoStream, buf: IoBuffer) -> Self {
        match stream {
            IoStream::TtyIn => ClientMessage::TtyIn(buf),
            IoStream::TtyOut => ClientMessage::TtyOut(buf),
            IoStream::Stdin => ClientMessage::Stdin(buf),
            IoStream::Stdout => ClientMessage::Stdout(buf),
            IoStream::Stderr => ClientMessage::Stderr(buf),
        }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Server greeting, sent once per connection before anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    /// Server identification string, e.g. `"LogVault Audit Server 0.3.1"`.
    pub server_id: String,
}

/// A message from the server to the audit client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Server greeting.
    Hello(ServerHello),
    /// I/O log identifier the client may later pass in a restart.
    LogId(String),
    /// Durable-offset acknowledgment: everything up to this elapsed time
    /// has been persisted.
    CommitPoint(TimeSpec),
    /// Fatal error string, sent before the connection is closed.
    Error(String),
}

impl ServerMessage {
    /// Encodes the message to a frame.
    pub fn to_frame(&self) -> WireResult<Frame> {
        let payload =
            bincode::serialize(self).map_err(|e| WireError::Serialization(e.to_string()))?;
        Frame::new(Bytes::from(payload))
    }

    /// Decodes a message from a frame.
    pub fn from_frame(frame: &Frame) -> WireResult<Self> {
        bincode::deserialize(&frame.payload).map_err(WireError::from)
    }
}
