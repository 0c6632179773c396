//! Replayable per-session I/O logs.
//!
//! Each logged session gets its own directory under the configured I/O log
//! root, named by a monotonic six-digit id:
//!
//! ```text
//! {iolog_dir}/
//! └── 000001/
//!     ├── log      <- session info (JSON)
//!     ├── timing   <- one line per event: id, delay, size/details
//!     ├── ttyin / ttyout / stdin / stdout / stderr
//! ```
//!
//! Timing lines use the numeric stream ids of [`IoStream::id`] plus
//! `5` for window-size changes and `6` for suspend events. When a session
//! completes, the write bits of the timing file are cleared to mark the
//! log as finished.

use std::fs::{self, File, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{debug, warn};

use logvault_wire::{AcceptMessage, ChangeWindowSize, CommandSuspend, IoBuffer, IoStream, TimeSpec};

/// Timing-file event id for window-size changes.
const EVENT_WINSIZE: usize = 5;
/// Timing-file event id for suspend/resume.
const EVENT_SUSPEND: usize = 6;

/// Allocator for session directory names.
///
/// Scans the I/O log root once at startup and hands out six-digit ids
/// after the highest existing one.
#[derive(Debug)]
pub struct SessionSeq {
    next: u64,
}

impl SessionSeq {
    /// Scans `root` for existing session directories.
    pub fn scan(root: &Path) -> Self {
        let mut max = 0u64;
        if let Ok(entries) = fs::read_dir(root) {
            for entry in entries.flatten() {
                if let Some(n) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<u64>().ok())
                {
                    max = max.max(n);
                }
            }
        }
        Self { next: max + 1 }
    }

    /// Returns the next session id.
    pub fn next_id(&mut self) -> String {
        let id = format!("{:06}", self.next);
        self.next += 1;
        id
    }
}

/// An open per-session I/O log.
#[derive(Debug)]
pub struct IoLog {
    dir: PathBuf,
    id: String,
    mode: u32,
    timing: File,
    streams: [File; 5],
}

impl IoLog {
    /// Creates a new session directory and opens all log files.
    pub fn create(
        root: &Path,
        id: String,
        mode: u32,
        msg: &AcceptMessage,
    ) -> std::io::Result<Self> {
        let dir = root.join(&id);
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, Permissions::from_mode(0o700 | mode))?;

        let info = json!({
            "submit_time": { "sec": msg.submit_time.sec, "nsec": msg.submit_time.nsec },
            "info": crate::eventlog::info_entries(&msg.info),
        });
        let mut log_file = open_log_file(&dir.join("log"), mode)?;
        log_file.write_all(info.to_string().as_bytes())?;
        log_file.write_all(b"\n")?;

        let timing = open_log_file(&dir.join("timing"), mode)?;
        let streams = open_streams(&dir, mode)?;

        debug!(id = %id, dir = %dir.display(), "created I/O log");
        Ok(Self {
            dir,
            id,
            mode,
            timing,
            streams,
        })
    }

    /// Reopens an existing session directory to resume an interrupted
    /// session, truncating all files to `resume_point`.
    pub fn restart(root: &Path, id: &str, mode: u32, resume_point: TimeSpec) -> std::io::Result<Self> {
        let dir = root.join(id);
        let timing_path = dir.join("timing");

        // An interrupted session normally still has its write bits, but a
        // crashed-and-finished one may not; restore them before truncating.
        fs::set_permissions(&timing_path, Permissions::from_mode(mode))?;
        let contents = fs::read_to_string(&timing_path)?;

        let mut elapsed = TimeSpec::default();
        let mut stream_bytes = [0u64; 5];
        let mut kept = String::new();
        for line in contents.lines() {
            let Some(record) = TimingRecord::parse(line) else {
                warn!(id, line, "skipping malformed timing line");
                continue;
            };
            elapsed += record.delay;
            if elapsed > resume_point {
                break;
            }
            if let Some(stream) = record.stream() {
                stream_bytes[stream.id()] += record.size;
            }
            kept.push_str(line);
            kept.push('\n');
        }

        fs::write(&timing_path, &kept)?;
        for stream in IoStream::ALL {
            let path = dir.join(stream.file_name());
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(stream_bytes[stream.id()])?;
        }

        let timing = OpenOptions::new().append(true).open(&timing_path)?;
        let streams = open_streams(&dir, mode)?;

        debug!(id, resume_point = %resume_point, "restarted I/O log");
        Ok(Self {
            dir,
            id: id.to_string(),
            mode,
            timing,
            streams,
        })
    }

    /// The session id, sent to clients as the `LogId` reply.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Appends an I/O buffer to its stream file and the timing file.
    pub fn write_iobuf(&mut self, stream: IoStream, buf: &IoBuffer) -> std::io::Result<()> {
        self.streams[stream.id()].write_all(&buf.data)?;
        writeln!(self.timing, "{} {} {}", stream.id(), buf.delay, buf.data.len())
    }

    /// Appends a window-size change to the timing file.
    pub fn write_winsize(&mut self, msg: &ChangeWindowSize) -> std::io::Result<()> {
        writeln!(
            self.timing,
            "{EVENT_WINSIZE} {} {} {}",
            msg.delay, msg.rows, msg.cols
        )
    }

    /// Appends a suspend/resume event to the timing file.
    pub fn write_suspend(&mut self, msg: &CommandSuspend) -> std::io::Result<()> {
        writeln!(self.timing, "{EVENT_SUSPEND} {} {}", msg.delay, msg.signal)
    }

    /// Marks the session complete by clearing the write bits of the
    /// timing file.
    pub fn finish(&mut self) -> std::io::Result<()> {
        self.timing.flush()?;
        let mode = self.mode & !0o222;
        fs::set_permissions(self.dir.join("timing"), Permissions::from_mode(mode))
    }
}

fn open_log_file(path: &Path, mode: u32) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(mode)
        .open(path)
}

fn open_streams(dir: &Path, mode: u32) -> std::io::Result<[File; 5]> {
    Ok([
        open_log_file(&dir.join(IoStream::Stdin.file_name()), mode)?,
        open_log_file(&dir.join(IoStream::Stdout.file_name()), mode)?,
        open_log_file(&dir.join(IoStream::Stderr.file_name()), mode)?,
        open_log_file(&dir.join(IoStream::TtyIn.file_name()), mode)?,
        open_log_file(&dir.join(IoStream::TtyOut.file_name()), mode)?,
    ])
}

/// One parsed timing-file line.
struct TimingRecord {
    event: usize,
    delay: TimeSpec,
    /// Byte count for stream events, 0 otherwise.
    size: u64,
}

impl TimingRecord {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_ascii_whitespace();
        let event: usize = fields.next()?.parse().ok()?;
        let delay = parse_delay(fields.next()?)?;
        let size = if event < 5 {
            fields.next()?.parse().ok()?
        } else {
            0
        };
        Some(Self { event, delay, size })
    }

    fn stream(&self) -> Option<IoStream> {
        IoStream::ALL.into_iter().find(|s| s.id() == self.event)
    }
}

fn parse_delay(field: &str) -> Option<TimeSpec> {
    let (sec, frac) = field.split_once('.')?;
    if frac.len() != 9 {
        return None;
    }
    Some(TimeSpec::new(sec.parse().ok()?, frac.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use logvault_wire::InfoMessage;

    fn accept_msg() -> AcceptMessage {
        AcceptMessage {
            submit_time: TimeSpec::new(1_700_000_000, 0),
            info: vec![InfoMessage::text("user", "alice")],
            expect_iobufs: true,
        }
    }

    fn iobuf(delay: TimeSpec, data: &[u8]) -> IoBuffer {
        IoBuffer {
            delay,
            data: data.to_vec(),
        }
    }

    #[test]
    fn session_seq_continues_after_existing() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("000001")).unwrap();
        fs::create_dir(dir.path().join("000007")).unwrap();
        fs::create_dir(dir.path().join("not-a-session")).unwrap();

        let mut seq = SessionSeq::scan(dir.path());
        assert_eq!(seq.next_id(), "000008");
        assert_eq!(seq.next_id(), "000009");
    }

    #[test]
    fn create_writes_streams_and_timing() {
        let dir = tempfile::tempdir().unwrap();
        let mut log =
            IoLog::create(dir.path(), "000001".to_string(), 0o600, &accept_msg()).unwrap();

        log.write_iobuf(IoStream::TtyOut, &iobuf(TimeSpec::new(0, 100_000_000), b"hello\n"))
            .unwrap();
        log.write_winsize(&ChangeWindowSize {
            delay: TimeSpec::new(0, 50_000_000),
            rows: 24,
            cols: 80,
        })
        .unwrap();
        log.write_suspend(&CommandSuspend {
            delay: TimeSpec::new(1, 0),
            signal: "TSTP".to_string(),
        })
        .unwrap();

        let session = dir.path().join("000001");
        assert_eq!(fs::read(session.join("ttyout")).unwrap(), b"hello\n");

        let log = fs::read_to_string(session.join("log")).unwrap();
        let info: serde_json::Value = serde_json::from_str(log.trim_end()).unwrap();
        assert_eq!(info["submit_time"]["sec"], 1_700_000_000i64);
        assert_eq!(info["info"][0]["key"], "user");
        assert_eq!(info["info"][0]["value"], "alice");

        let timing = fs::read_to_string(session.join("timing")).unwrap();
        let lines: Vec<&str> = timing.lines().collect();
        assert_eq!(lines[0], "4 0.100000000 6");
        assert_eq!(lines[1], "5 0.050000000 24 80");
        assert_eq!(lines[2], "6 1.000000000 TSTP");
    }

    #[test]
    fn finish_clears_write_bits() {
        let dir = tempfile::tempdir().unwrap();
        let mut log =
            IoLog::create(dir.path(), "000001".to_string(), 0o644, &accept_msg()).unwrap();
        log.write_iobuf(IoStream::Stdout, &iobuf(TimeSpec::default(), b"x"))
            .unwrap();
        log.finish().unwrap();

        let meta = fs::metadata(dir.path().join("000001").join("timing")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o222, 0);
        assert_eq!(meta.permissions().mode() & 0o444, 0o444);
    }

    #[test]
    fn restart_truncates_to_resume_point() {
        let dir = tempfile::tempdir().unwrap();
        let mut log =
            IoLog::create(dir.path(), "000001".to_string(), 0o600, &accept_msg()).unwrap();
        log.write_iobuf(IoStream::Stdout, &iobuf(TimeSpec::new(1, 0), b"one"))
            .unwrap();
        log.write_iobuf(IoStream::Stdout, &iobuf(TimeSpec::new(1, 0), b"two"))
            .unwrap();
        log.write_iobuf(IoStream::Stdout, &iobuf(TimeSpec::new(1, 0), b"three"))
            .unwrap();
        drop(log);

        // Resume from t=2: the third buffer (cumulative t=3) is discarded.
        let mut log =
            IoLog::restart(dir.path(), "000001", 0o600, TimeSpec::new(2, 0)).unwrap();

        let session = dir.path().join("000001");
        assert_eq!(fs::read(session.join("stdout")).unwrap(), b"onetwo");
        let timing = fs::read_to_string(session.join("timing")).unwrap();
        assert_eq!(timing.lines().count(), 2);

        // The log accepts appends again after the restart.
        log.write_iobuf(IoStream::Stdout, &iobuf(TimeSpec::new(0, 1), b"!"))
            .unwrap();
        assert_eq!(fs::read(session.join("stdout")).unwrap(), b"onetwo!");
    }

    #[test]
    fn restart_of_missing_session_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(IoLog::restart(dir.path(), "999999", 0o600, TimeSpec::default()).is_err());
    }
}
