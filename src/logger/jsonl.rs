//! Append-only JSONL activity log.
//!
//! One self-contained JSON object per line, assembled in memory and written with
//! a single `write_all` so a tailing reader never sees a partial line. When the
//! file cannot be written the writer degrades to stderr, then to discarding;
//! a cycle never fails because of logging.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions, rename};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{MwError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Activity event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DaemonStart,
    DaemonStop,
    ConfigReload,
    CycleComplete,
    CycleAborted,
    AlertRaised,
    AlertCleared,
    AppAdded,
    AppRemoved,
    AppEnabled,
    AppDisabled,
    UserAction,
    Error,
}

/// One activity record; everything but `ts`, `event` and `severity` is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Byte delta observed this cycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slow_avg: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fast_avg: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_time: Option<bool>,
    /// Rows evaluated by a cycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluated: Option<usize>,
    /// Alerts raised by a cycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// New entry stamped with the current UTC time.
    #[must_use]
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            uid: None,
            label: None,
            delta: None,
            slow_avg: None,
            fast_avg: None,
            first_time: None,
            evaluated: None,
            alerts: None,
            duration_ms: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }

    #[must_use]
    pub fn for_uid(event: EventType, uid: i32) -> Self {
        Self {
            uid: Some(uid),
            ..Self::new(event, Severity::Info)
        }
    }

    /// Error entry carrying the code and message of `err`.
    #[must_use]
    pub fn from_error(event: EventType, err: &MwError) -> Self {
        Self {
            error_code: Some(err.code().to_string()),
            error_message: Some(err.to_string()),
            ..Self::new(event, Severity::Error)
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Normal,
    Stderr,
    Discard,
}

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Rotate once the file would exceed this size.
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
}

impl JsonlConfig {
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_size_bytes: 16 * 1024 * 1024,
            max_rotated_files: 3,
        }
    }
}

/// Append-only JSONL writer with size rotation and graceful degradation.
pub struct JsonlWriter {
    config: JsonlConfig,
    writer: Option<BufWriter<File>>,
    state: WriterState,
    bytes_written: u64,
}

impl JsonlWriter {
    /// Open the log, degrading to stderr when the file is unusable.
    #[must_use]
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            writer: None,
            state: WriterState::Discard,
            bytes_written: 0,
        };
        writer.open_primary();
        writer
    }

    /// Writer that drops everything.
    #[must_use]
    pub fn discard() -> Self {
        Self {
            config: JsonlConfig::at(PathBuf::new()),
            writer: None,
            state: WriterState::Discard,
            bytes_written: 0,
        }
    }

    /// Append one entry and flush it.
    pub fn write_entry(&mut self, entry: &LogEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(json) => format!("{json}\n"),
            Err(err) => {
                tracing::error!(error = %err, "activity entry failed to serialize");
                return;
            }
        };
        self.write_line(&line);
        self.flush();
    }

    pub fn flush(&mut self) {
        if let Some(w) = self.writer.as_mut()
            && w.flush().is_err()
        {
            self.degrade();
        }
    }

    #[must_use]
    pub fn state(&self) -> &'static str {
        match self.state {
            WriterState::Normal => "normal",
            WriterState::Stderr => "stderr",
            WriterState::Discard => "discard",
        }
    }

    /// Reopen the primary file after a degradation.
    pub fn try_recover(&mut self) {
        if self.state != WriterState::Normal && !self.config.path.as_os_str().is_empty() {
            self.open_primary();
        }
    }

    // ──────────────────── internals ────────────────────

    fn open_primary(&mut self) {
        match open_append(&self.config.path) {
            Ok((file, size)) => {
                self.writer = Some(BufWriter::new(file));
                self.state = WriterState::Normal;
                self.bytes_written = size;
            }
            Err(err) => {
                tracing::warn!(error = %err, "activity log unavailable, writing to stderr");
                self.writer = None;
                self.state = WriterState::Stderr;
            }
        }
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if self.state == WriterState::Normal
            && self.bytes_written > 0
            && self.bytes_written + len > self.config.max_size_bytes
        {
            self.rotate();
        }

        match self.state {
            WriterState::Normal => {
                let Some(w) = self.writer.as_mut() else {
                    self.degrade();
                    self.write_line(line);
                    return;
                };
                if w.write_all(line.as_bytes()).is_err() {
                    self.degrade();
                    self.write_line(line);
                    return;
                }
                self.bytes_written += len;
            }
            WriterState::Stderr => {
                if write!(io::stderr(), "[MW-JSONL] {line}").is_err() {
                    self.state = WriterState::Discard;
                }
            }
            WriterState::Discard => {}
        }
    }

    fn degrade(&mut self) {
        self.writer = None;
        self.state = match self.state {
            WriterState::Normal => WriterState::Stderr,
            WriterState::Stderr | WriterState::Discard => WriterState::Discard,
        };
    }

    fn rotate(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
        self.writer = None;

        let base = self.config.path.clone();
        let keep = self.config.max_rotated_files.max(1);
        let _ = fs::remove_file(rotated_name(&base, keep));
        for index in (1..keep).rev() {
            let _ = rename(rotated_name(&base, index), rotated_name(&base, index + 1));
        }
        let _ = rename(&base, rotated_name(&base, 1));

        match open_append(&base) {
            Ok((file, _)) => {
                self.writer = Some(BufWriter::new(file));
                self.bytes_written = 0;
            }
            Err(_) => self.degrade(),
        }
    }
}

/// Read back entries, skipping lines that fail to parse. Missing file is empty.
pub fn read_entries(path: &Path) -> Result<Vec<LogEntry>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(MwError::io(path, err)),
    };
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| MwError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| MwError::io(path, source))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

/// `activity.jsonl` -> `activity.jsonl.2`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_at(path: &Path, max_size_bytes: u64) -> JsonlWriter {
        JsonlWriter::open(JsonlConfig {
            path: path.to_path_buf(),
            max_size_bytes,
            max_rotated_files: 2,
        })
    }

    #[test]
    fn entries_are_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.jsonl");
        let mut writer = writer_at(&path, 1024 * 1024);

        let mut alert = LogEntry::for_uid(EventType::AlertRaised, 10_057);
        alert.first_time = Some(true);
        alert.delta = Some(2_000);
        writer.write_entry(&alert);
        writer.write_entry(&LogEntry::new(EventType::CycleComplete, Severity::Info));

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "alert_raised");
        assert_eq!(first["uid"], 10_057);
        assert_eq!(first["first_time"], true);
        assert!(!lines[1].contains("\"uid\""));
    }

    #[test]
    fn read_entries_round_trips_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.jsonl");
        let mut writer = writer_at(&path, 1024 * 1024);
        writer.write_entry(&LogEntry::for_uid(EventType::AppAdded, 10_001));
        drop(writer);
        let mut raw = fs::read_to_string(&path).unwrap();
        raw.push_str("not json\n");
        fs::write(&path, raw).unwrap();

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, EventType::AppAdded);
        assert!(read_entries(&dir.path().join("missing.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn rotation_keeps_bounded_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.jsonl");
        let mut writer = writer_at(&path, 120);
        for _ in 0..10 {
            writer.write_entry(&LogEntry::new(EventType::CycleComplete, Severity::Info));
        }
        assert!(path.exists());
        assert!(rotated_name(&path, 1).exists());
        assert!(!rotated_name(&path, 3).exists());
    }

    #[test]
    fn unwritable_path_degrades_to_stderr() {
        let writer = writer_at(Path::new("/proc/meterwatch-denied/activity.jsonl"), 1024);
        assert_eq!(writer.state(), "stderr");
        assert_eq!(JsonlWriter::discard().state(), "discard");
    }

    #[test]
    fn error_entries_carry_code() {
        let err = MwError::transport("xt_qtaguid", "gone");
        let entry = LogEntry::from_error(EventType::CycleAborted, &err);
        assert_eq!(entry.severity, Severity::Error);
        assert_eq!(entry.error_code.as_deref(), Some("MW-2001"));
    }
}
