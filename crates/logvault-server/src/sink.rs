//! Message sinks.
//!
//! Every inbound message is routed to exactly one sink, selected when the
//! connection is constructed and never switched afterwards:
//!
//! - [`LocalSink`](crate::local::LocalSink): persist events and I/O
//!   buffers to disk,
//! - [`RelaySink`]: forward each record to the upstream relay connection,
//! - [`JournalSink`](crate::journal::JournalSink): append records to a
//!   local journal file for later replay to the relay.
//!
//! Sinks receive both the decoded message and the raw packed record so
//! the forwarding sinks can re-frame it verbatim. They return typed
//! outcomes; enqueueing replies and state transitions stay with the
//! connection driver.

use crate::error::Fault;
use crate::eventlog::EventLog;
use crate::config::{IoLogSection, RelaySection};
use crate::iolog::SessionSeq;
use crate::relay::RelayStream;

use logvault_wire::{
    AcceptMessage, AlertMessage, ChangeWindowSize, CommandSuspend, ExitMessage, IoBuffer,
    IoStream, RejectMessage, RestartMessage,
};

/// Shared server state a sink may need while handling one message.
pub(crate) struct SinkCtx<'a> {
    /// Peer address (or journal path for replayed sessions), for logging.
    pub peer: &'a str,
    pub eventlog: &'a mut EventLog,
    pub iolog: &'a IoLogSection,
    pub seq: &'a mut SessionSeq,
    pub relay_config: &'a RelaySection,
    /// The nested relay connection, when one is attached.
    pub relay: Option<&'a mut RelayStream>,
    /// Probability of dropping the connection per I/O buffer (debug).
    pub random_drop: Option<f64>,
}

/// The capability set one message sink provides.
///
/// `accept` may return a log id for the `LogId` reply; all handlers fail
/// with a [`Fault`] that the driver turns into the error-reply-and-close
/// policy. `Send` lets a server holding sinks move across threads.
pub(crate) trait Sink: Send {
    fn accept(
        &mut self,
        msg: &AcceptMessage,
        raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<Option<String>, Fault>;

    fn reject(&mut self, msg: &RejectMessage, raw: &[u8], ctx: &mut SinkCtx<'_>)
        -> Result<(), Fault>;

    fn exit(&mut self, msg: &ExitMessage, raw: &[u8], ctx: &mut SinkCtx<'_>) -> Result<(), Fault>;

    fn restart(
        &mut self,
        msg: &RestartMessage,
        raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault>;

    fn alert(&mut self, msg: &AlertMessage, raw: &[u8], ctx: &mut SinkCtx<'_>)
        -> Result<(), Fault>;

    fn iobuf(
        &mut self,
        stream: IoStream,
        buf: &IoBuffer,
        raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault>;

    fn winsize(
        &mut self,
        msg: &ChangeWindowSize,
        raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault>;

    fn suspend(
        &mut self,
        msg: &CommandSuspend,
        raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault>;

    /// Hands the journal file over for replay; only the journal sink has
    /// one.
    fn take_journal(&mut self) -> Option<crate::journal::JournalFile> {
        None
    }
}

/// Forwards every record verbatim to the attached relay connection.
pub(crate) struct RelaySink;

impl RelaySink {
    fn forward(raw: &[u8], ctx: &mut SinkCtx<'_>) -> Result<(), Fault> {
        match ctx.relay.as_deref_mut() {
            Some(relay) => {
                relay.queue_frame(raw);
                Ok(())
            }
            None => Err(Fault::transport("no relay connection".to_string())),
        }
    }
}

impl Sink for RelaySink {
    fn accept(
        &mut self,
        _msg: &AcceptMessage,
        raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<Option<String>, Fault> {
        // The upstream's LogId reply is forwarded when it arrives.
        Self::forward(raw, ctx).map(|()| None)
    }

    fn reject(
        &mut self,
        _msg: &RejectMessage,
        raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        Self::forward(raw, ctx)
    }

    fn exit(&mut self, _msg: &ExitMessage, raw: &[u8], ctx: &mut SinkCtx<'_>) -> Result<(), Fault> {
        Self::forward(raw, ctx)
    }

    fn restart(
        &mut self,
        _msg: &RestartMessage,
        raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        Self::forward(raw, ctx)
    }

    fn alert(&mut self, _msg: &AlertMessage, raw: &[u8], ctx: &mut SinkCtx<'_>) -> Result<(), Fault> {
        Self::forward(raw, ctx)
    }

    fn iobuf(
        &mut self,
        _stream: IoStream,
        _buf: &IoBuffer,
        raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        Self::forward(raw, ctx)
    }

    fn winsize(
        &mut self,
        _msg: &ChangeWindowSize,
        raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        Self::forward(raw, ctx)
    }

    fn suspend(
        &mut self,
        _msg: &CommandSuspend,
        raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        Self::forward(raw, ctx)
    }
}
