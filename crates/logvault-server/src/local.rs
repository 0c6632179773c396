//! Local persistence sink.
//!
//! Accept/reject/alert/exit events go to the structured event log; when a
//! session streams I/O, the buffers and timing data go to a per-session
//! I/O log directory.

use tracing::warn;

use logvault_wire::{
    AcceptMessage, AlertMessage, ChangeWindowSize, CommandSuspend, ExitMessage, IoBuffer,
    IoStream, RejectMessage, RestartMessage,
};

use crate::error::Fault;
use crate::iolog::IoLog;
use crate::sink::{Sink, SinkCtx};

/// Persists sessions to the local event log and I/O log tree.
#[derive(Default)]
pub(crate) struct LocalSink {
    iolog: Option<IoLog>,
}

impl LocalSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn iolog_mut(&mut self) -> Result<&mut IoLog, Fault> {
        self.iolog
            .as_mut()
            .ok_or_else(|| Fault::protocol("protocol error".to_string()))
    }
}

impl Sink for LocalSink {
    fn accept(
        &mut self,
        msg: &AcceptMessage,
        _raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<Option<String>, Fault> {
        let mut log_id = None;
        if msg.expect_iobufs {
            let id = ctx.seq.next_id();
            let iolog = IoLog::create(&ctx.iolog.dir, id, ctx.iolog.mode, msg)
                .map_err(|e| {
                    warn!(peer = ctx.peer, error = %e, "unable to create I/O log");
                    Fault::resource("error creating I/O log".to_string())
                })?;
            log_id = Some(iolog.id().to_string());
            self.iolog = Some(iolog);
        }

        ctx.eventlog
            .accept(ctx.peer, msg, log_id.as_deref())
            .map_err(|e| {
                warn!(peer = ctx.peer, error = %e, "unable to log accept event");
                Fault::resource("error logging accept event".to_string())
            })?;
        Ok(log_id)
    }

    fn reject(
        &mut self,
        msg: &RejectMessage,
        _raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        ctx.eventlog.reject(ctx.peer, msg).map_err(|e| {
            warn!(peer = ctx.peer, error = %e, "unable to log reject event");
            Fault::resource("error logging reject event".to_string())
        })
    }

    fn exit(&mut self, msg: &ExitMessage, _raw: &[u8], ctx: &mut SinkCtx<'_>) -> Result<(), Fault> {
        if let Some(iolog) = &mut self.iolog {
            // Completion is marked by dropping the write bits from the
            // timing file; replay tools treat that as end-of-session.
            if let Err(e) = iolog.finish() {
                warn!(peer = ctx.peer, error = %e, "unable to finish I/O log");
            }
        }
        let iolog_id = self.iolog.as_ref().map(|l| l.id().to_string());
        ctx.eventlog
            .exit(ctx.peer, msg, iolog_id.as_deref())
            .map_err(|e| {
                warn!(peer = ctx.peer, error = %e, "unable to log exit event");
                Fault::resource("error logging exit event".to_string())
            })
    }

    fn restart(
        &mut self,
        msg: &RestartMessage,
        _raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        if !valid_log_id(&msg.log_id) {
            return Err(Fault::protocol("invalid RestartMessage".to_string()));
        }
        let iolog = IoLog::restart(&ctx.iolog.dir, &msg.log_id, ctx.iolog.mode, msg.resume_point)
            .map_err(|e| {
                warn!(peer = ctx.peer, log_id = %msg.log_id, error = %e,
                    "unable to restart I/O log");
                Fault::protocol("unable to restart I/O log".to_string())
            })?;
        self.iolog = Some(iolog);
        Ok(())
    }

    fn alert(&mut self, msg: &AlertMessage, _raw: &[u8], ctx: &mut SinkCtx<'_>) -> Result<(), Fault> {
        ctx.eventlog.alert(ctx.peer, msg).map_err(|e| {
            warn!(peer = ctx.peer, error = %e, "unable to log alert event");
            Fault::resource("error logging alert event".to_string())
        })
    }

    fn iobuf(
        &mut self,
        stream: IoStream,
        buf: &IoBuffer,
        _raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        self.iolog_mut()?.write_iobuf(stream, buf).map_err(|e| {
            warn!(peer = ctx.peer, stream = %stream, error = %e, "failed to store IoBuffer");
            Fault::resource("error writing IoBuffer".to_string())
        })?;

        // Random drop is a debugging tool to test client restart.
        if let Some(p) = ctx.random_drop {
            let randval: f64 = rand::random();
            if randval < p {
                warn!(peer = ctx.peer, "randomly dropping connection ({randval:.4} < {p:.4})");
                return Err(Fault::transport("random drop".to_string()));
            }
        }
        Ok(())
    }

    fn winsize(
        &mut self,
        msg: &ChangeWindowSize,
        _raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        self.iolog_mut()?.write_winsize(msg).map_err(|e| {
            warn!(peer = ctx.peer, error = %e, "failed to store ChangeWindowSize");
            Fault::resource("error writing ChangeWindowSize".to_string())
        })
    }

    fn suspend(
        &mut self,
        msg: &CommandSuspend,
        _raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        self.iolog_mut()?.write_suspend(msg).map_err(|e| {
            warn!(peer = ctx.peer, error = %e, "failed to store CommandSuspend");
            Fault::resource("error writing CommandSuspend".to_string())
        })
    }
}

/// Log ids name directories directly under the I/O log root; reject
/// anything that could escape it.
pub(crate) fn valid_log_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
        && !id.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_id_validation() {
        assert!(valid_log_id("000001"));
        assert!(valid_log_id("incoming.Ab3XyZ"));
        assert!(!valid_log_id(""));
        assert!(!valid_log_id("../etc"));
        assert!(!valid_log_id("a/b"));
        assert!(!valid_log_id(".hidden"));
    }
}
