//! Structured audit event log.
//!
//! Accept, reject, alert, and exit events are appended as JSON lines to a
//! single file. The info list keeps the order the client sent it in.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use serde_json::{json, Map, Value};
use tracing::debug;

use logvault_wire::{
    AcceptMessage, AlertMessage, ExitMessage, InfoMessage, InfoValue, RejectMessage, TimeSpec,
};

/// Append-only JSON-lines audit log.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    file: Option<File>,
}

impl EventLog {
    /// Creates an event log writer for the given path.
    ///
    /// The file is opened lazily on the first append so a server with no
    /// traffic never touches the filesystem.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    fn file(&mut self) -> std::io::Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().expect("opened above"))
    }

    fn append(&mut self, record: Value) -> std::io::Result<()> {
        let file = self.file()?;
        let mut line = record.to_string();
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.flush()
    }

    /// Records an accepted command.
    pub fn accept(
        &mut self,
        peer: &str,
        msg: &AcceptMessage,
        iolog_id: Option<&str>,
    ) -> std::io::Result<()> {
        debug!(peer, iolog_id, "logging accept event");
        let mut record = event_record("accept", peer, Some(msg.submit_time), &msg.info);
        if let Some(id) = iolog_id {
            record.insert("iolog_id".to_string(), json!(id));
        }
        self.append(Value::Object(record))
    }

    /// Records a rejected command.
    pub fn reject(&mut self, peer: &str, msg: &RejectMessage) -> std::io::Result<()> {
        debug!(peer, reason = %msg.reason, "logging reject event");
        let mut record = event_record("reject", peer, Some(msg.submit_time), &msg.info);
        record.insert("reason".to_string(), json!(msg.reason));
        self.append(Value::Object(record))
    }

    /// Records a security alert.
    pub fn alert(&mut self, peer: &str, msg: &AlertMessage) -> std::io::Result<()> {
        debug!(peer, reason = %msg.reason, "logging alert event");
        let mut record = event_record("alert", peer, Some(msg.alert_time), &msg.info);
        record.insert("reason".to_string(), json!(msg.reason));
        self.append(Value::Object(record))
    }

    /// Records a command exit.
    pub fn exit(
        &mut self,
        peer: &str,
        msg: &ExitMessage,
        iolog_id: Option<&str>,
    ) -> std::io::Result<()> {
        debug!(peer, exit_value = msg.exit_value, "logging exit event");
        let mut record = event_record("exit", peer, None, &[]);
        record.insert("exit_value".to_string(), json!(msg.exit_value));
        if let Some(signal) = &msg.signal {
            record.insert("signal".to_string(), json!(signal));
            record.insert("dumped_core".to_string(), json!(msg.dumped_core));
        }
        if let Some(run_time) = msg.run_time {
            record.insert("run_time".to_string(), timespec_value(run_time));
        }
        if let Some(id) = iolog_id {
            record.insert("iolog_id".to_string(), json!(id));
        }
        self.append(Value::Object(record))
    }
}

fn event_record(
    event: &str,
    peer: &str,
    submit_time: Option<TimeSpec>,
    info: &[InfoMessage],
) -> Map<String, Value> {
    let mut record = Map::new();
    record.insert("event".to_string(), json!(event));
    record.insert(
        "logged_at".to_string(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    record.insert("peer".to_string(), json!(peer));
    if let Some(ts) = submit_time {
        record.insert("submit_time".to_string(), timespec_value(ts));
    }
    if !info.is_empty() {
        record.insert("info".to_string(), Value::Array(info_entries(info)));
    }
    record
}

/// Serializes an info list to JSON objects, preserving order and the
/// number/text/list value kinds.
pub(crate) fn info_entries(info: &[InfoMessage]) -> Vec<Value> {
    info.iter()
        .map(|entry| {
            let value = match &entry.value {
                InfoValue::Number(n) => json!(n),
                InfoValue::Text(s) => json!(s),
                InfoValue::List(items) => json!(items),
            };
            json!({ "key": entry.key, "value": value })
        })
        .collect()
}

fn timespec_value(ts: TimeSpec) -> Value {
    json!({ "sec": ts.sec, "nsec": ts.nsec })
}

#[cfg(test)]
mod tests {
    use super::*;
    use logvault_wire::InfoMessage;

    #[test]
    fn appends_parseable_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut log = EventLog::new(&path);

        log.accept(
            "192.0.2.7",
            &AcceptMessage {
                submit_time: TimeSpec::new(1_700_000_000, 0),
                info: vec![
                    InfoMessage::text("user", "alice"),
                    InfoMessage::text("command", "/bin/ls"),
                ],
                expect_iobufs: true,
            },
            Some("000001"),
        )
        .unwrap();
        log.reject(
            "192.0.2.7",
            &RejectMessage {
                submit_time: TimeSpec::new(1_700_000_100, 0),
                reason: "policy denied".to_string(),
                info: vec![InfoMessage::text("user", "mallory")],
            },
        )
        .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let accept: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(accept["event"], "accept");
        assert_eq!(accept["peer"], "192.0.2.7");
        assert_eq!(accept["iolog_id"], "000001");
        assert_eq!(accept["info"][0]["key"], "user");
        assert_eq!(accept["info"][0]["value"], "alice");
        assert_eq!(accept["submit_time"]["sec"], 1_700_000_000i64);

        let reject: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(reject["event"], "reject");
        assert_eq!(reject["reason"], "policy denied");
    }

    #[test]
    fn exit_event_carries_signal_and_run_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut log = EventLog::new(&path);

        log.exit(
            "198.51.100.1",
            &ExitMessage {
                exit_value: 1,
                signal: Some("SEGV".to_string()),
                dumped_core: true,
                run_time: Some(TimeSpec::new(3, 0)),
            },
            None,
        )
        .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let record: Value = serde_json::from_str(contents.trim_end()).unwrap();
        assert_eq!(record["event"], "exit");
        assert_eq!(record["signal"], "SEGV");
        assert_eq!(record["dumped_core"], true);
        assert_eq!(record["run_time"]["sec"], 3);
    }
}
