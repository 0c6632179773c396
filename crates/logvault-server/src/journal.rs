//! Store-and-forward journals.
//!
//! In store-first mode the complete client stream is appended to a local
//! journal file, framed identically to the wire. Once the client session
//! finishes, the journal is replayed through a relay-only connection; the
//! file is unlinked only after a clean replay.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tracing::{debug, warn};

use logvault_wire::{
    AcceptMessage, AlertMessage, ChangeWindowSize, CommandSuspend, ExitMessage, Frame, IoBuffer,
    IoStream, RejectMessage, RestartMessage,
};

use crate::error::{Fault, ServerResult};
use crate::local::valid_log_id;
use crate::sink::{Sink, SinkCtx};

/// An open journal file and its path.
pub(crate) struct JournalFile {
    pub file: File,
    pub path: PathBuf,
    pub id: String,
}

impl JournalFile {
    /// Creates a uniquely named journal file in the journal directory.
    fn create(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let (file, path) = tempfile::Builder::new()
            .prefix("incoming.")
            .rand_bytes(8)
            .tempfile_in(dir)?
            .keep()
            .map_err(|e| e.error)?;
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!(journal = %path.display(), "created journal file");
        Ok(Self { file, path, id })
    }

    /// Reopens an existing journal by id to resume an interrupted
    /// session.
    fn reopen(dir: &Path, id: &str) -> std::io::Result<Self> {
        let path = dir.join(id);
        let file = OpenOptions::new().append(true).open(&path)?;
        debug!(journal = %path.display(), "reopened journal file");
        Ok(Self {
            file,
            path,
            id: id.to_string(),
        })
    }

    /// Appends one record, framed exactly as it arrived on the wire.
    fn append_frame(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.file
            .write_all(&(payload.len() as u32).to_be_bytes())?;
        self.file.write_all(payload)
    }
}

/// Appends each inbound record to a per-session journal file.
#[derive(Default)]
pub(crate) struct JournalSink {
    journal: Option<JournalFile>,
}

impl JournalSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&mut self, raw: &[u8]) -> Result<(), Fault> {
        let journal = self
            .journal
            .as_mut()
            .ok_or_else(|| Fault::protocol("protocol error".to_string()))?;
        journal.append_frame(raw).map_err(|e| {
            warn!(journal = %journal.path.display(), error = %e, "journal write failed");
            Fault::resource("error writing journal".to_string())
        })
    }
}

impl Sink for JournalSink {
    fn accept(
        &mut self,
        msg: &AcceptMessage,
        raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<Option<String>, Fault> {
        let journal = JournalFile::create(&ctx.relay_config.journal_dir).map_err(|e| {
            warn!(peer = ctx.peer, error = %e, "unable to create journal file");
            Fault::resource("unable to create journal file".to_string())
        })?;
        let id = journal.id.clone();
        self.journal = Some(journal);
        self.append(raw)?;
        Ok(msg.expect_iobufs.then_some(id))
    }

    fn reject(
        &mut self,
        _msg: &RejectMessage,
        raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        if self.journal.is_none() {
            let journal = JournalFile::create(&ctx.relay_config.journal_dir).map_err(|e| {
                warn!(peer = ctx.peer, error = %e, "unable to create journal file");
                Fault::resource("unable to create journal file".to_string())
            })?;
            self.journal = Some(journal);
        }
        self.append(raw)
    }

    fn exit(&mut self, _msg: &ExitMessage, raw: &[u8], _ctx: &mut SinkCtx<'_>) -> Result<(), Fault> {
        self.append(raw)?;
        if let Some(journal) = &mut self.journal {
            // The final commit point acknowledges the whole journal.
            if let Err(e) = journal.file.sync_data() {
                warn!(journal = %journal.path.display(), error = %e, "journal sync failed");
                return Err(Fault::resource("error writing journal".to_string()));
            }
        }
        Ok(())
    }

    fn restart(
        &mut self,
        msg: &RestartMessage,
        raw: &[u8],
        ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        if !valid_log_id(&msg.log_id) {
            return Err(Fault::protocol("invalid RestartMessage".to_string()));
        }
        let journal =
            JournalFile::reopen(&ctx.relay_config.journal_dir, &msg.log_id).map_err(|e| {
                warn!(peer = ctx.peer, log_id = %msg.log_id, error = %e,
                    "unable to restart journal");
                Fault::protocol("unable to restart journal".to_string())
            })?;
        self.journal = Some(journal);
        self.append(raw)
    }

    fn alert(&mut self, _msg: &AlertMessage, raw: &[u8], _ctx: &mut SinkCtx<'_>) -> Result<(), Fault> {
        self.append(raw)
    }

    fn iobuf(
        &mut self,
        _stream: IoStream,
        _buf: &IoBuffer,
        raw: &[u8],
        _ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        self.append(raw)
    }

    fn winsize(
        &mut self,
        _msg: &ChangeWindowSize,
        raw: &[u8],
        _ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        self.append(raw)
    }

    fn suspend(
        &mut self,
        _msg: &CommandSuspend,
        raw: &[u8],
        _ctx: &mut SinkCtx<'_>,
    ) -> Result<(), Fault> {
        self.append(raw)
    }

    fn take_journal(&mut self) -> Option<JournalFile> {
        self.journal.take()
    }
}

/// Reads a finished journal back as a sequence of frames for replay.
///
/// Regular files are always readable, so the replay is pumped from the
/// relay's write side instead of a poll registration: whenever the relay
/// queue has room, more frames are decoded from the file.
pub(crate) struct JournalReplay {
    file: File,
    pub path: PathBuf,
    buf: BytesMut,
    eof: bool,
}

impl JournalReplay {
    const CHUNK: usize = 8 * 1024;

    pub fn new(mut journal: JournalFile) -> std::io::Result<Self> {
        journal.file.seek(SeekFrom::Start(0))?;
        Ok(Self {
            file: journal.file,
            path: journal.path,
            buf: BytesMut::with_capacity(Self::CHUNK),
            eof: false,
        })
    }

    /// Decodes the next journaled frame, reading more of the file as
    /// needed. Returns `None` at a clean end of file.
    pub fn next_frame(&mut self) -> ServerResult<Option<Frame>> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                // Trailing partial record: the journal was cut short.
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "truncated journal record",
                )
                .into());
            }

            let mut tmp = [0u8; Self::CHUNK];
            let n = self.file.read(&mut tmp)?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buf.extend_from_slice(&tmp[..n]);
            }
        }
    }

    /// True once the file is exhausted and all frames were handed out.
    pub fn finished(&self) -> bool {
        self.eof && self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logvault_wire::{ClientHello, ClientMessage};

    #[test]
    fn journal_roundtrip_through_replay() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = JournalFile::create(dir.path()).unwrap();
        assert!(journal.id.starts_with("incoming."));

        let messages = vec![
            ClientMessage::Hello(ClientHello {
                client_id: "test".to_string(),
            }),
            ClientMessage::Stdout(IoBuffer {
                delay: Default::default(),
                data: b"hi".to_vec(),
            }),
        ];
        for msg in &messages {
            let frame = msg.to_frame().unwrap();
            journal.append_frame(&frame.payload).unwrap();
        }

        let mut replay = JournalReplay::new(journal).unwrap();
        for expected in &messages {
            let frame = replay.next_frame().unwrap().unwrap();
            assert_eq!(&ClientMessage::from_frame(&frame).unwrap(), expected);
        }
        assert!(replay.next_frame().unwrap().is_none());
        assert!(replay.finished());
    }

    #[test]
    fn truncated_journal_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = JournalFile::create(dir.path()).unwrap();
        journal.file.write_all(&100u32.to_be_bytes()).unwrap();
        journal.file.write_all(b"short").unwrap();

        let mut replay = JournalReplay::new(journal).unwrap();
        assert!(replay.next_frame().is_err());
    }

    #[test]
    fn reopen_appends_to_existing_journal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = JournalFile::create(dir.path()).unwrap();
        let id = journal.id.clone();
        drop(journal);

        let mut reopened = JournalFile::reopen(dir.path(), &id).unwrap();
        reopened.append_frame(b"rec").unwrap();
        assert!(JournalFile::reopen(dir.path(), "missing").is_err());
    }
}
