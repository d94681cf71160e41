//! Alert presentation: multi-channel notifications for usage alerts and daemon events.
//!
//! Channels are fire-and-forget. A failing channel is logged and skipped; it
//! never blocks or fails the sampling cycle that produced the event.

#![allow(missing_docs)]

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::config::default_data_dir;

// ──────────────────── alerts ────────────────────

/// Follow-up the user can take from an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertAction {
    /// Block the app's metered data.
    Restrict,
    /// Stop monitoring the app.
    Suppress,
}

impl fmt::Display for AlertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restrict => write!(f, "restrict"),
            Self::Suppress => write!(f, "suppress"),
        }
    }
}

/// Alert emitted by a cycle for one uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageAlert {
    pub uid: i32,
    pub label: String,
    pub first_time: bool,
    pub actions: Vec<AlertAction>,
}

impl UsageAlert {
    /// First-time alerts only offer restriction; a continuing alert also offers to stop monitoring.
    #[must_use]
    pub fn new(uid: i32, label: impl Into<String>, first_time: bool) -> Self {
        let actions = if first_time {
            vec![AlertAction::Restrict]
        } else {
            vec![AlertAction::Restrict, AlertAction::Suppress]
        };
        Self {
            uid,
            label: label.into(),
            first_time,
            actions,
        }
    }

    fn display_name(&self) -> String {
        if self.label.is_empty() {
            format!("uid {}", self.uid)
        } else {
            self.label.clone()
        }
    }
}

/// Receiver of alerts raised by the cycle orchestrator.
pub trait AlertSink: Send + Sync {
    fn emit_alert(&self, alert: &UsageAlert);
}

/// Sink that keeps every alert in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    alerts: Mutex<Vec<UsageAlert>>,
}

impl RecordingSink {
    #[must_use]
    pub fn alerts(&self) -> Vec<UsageAlert> {
        self.alerts.lock().clone()
    }

    pub fn clear(&self) {
        self.alerts.lock().clear();
    }
}

impl AlertSink for RecordingSink {
    fn emit_alert(&self, alert: &UsageAlert) {
        self.alerts.lock().push(alert.clone());
    }
}

// ──────────────────── notification events ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    UsageAlert(UsageAlert),
    AlertCleared {
        uid: i32,
        label: String,
    },
    DaemonStarted {
        version: String,
        tracked_apps: usize,
    },
    DaemonStopped {
        reason: String,
        uptime_secs: u64,
    },
    Error {
        code: String,
        message: String,
    },
}

impl NotificationEvent {
    #[must_use]
    pub const fn level(&self) -> NotificationLevel {
        match self {
            Self::UsageAlert(alert) => {
                if alert.first_time {
                    NotificationLevel::Warning
                } else {
                    NotificationLevel::Critical
                }
            }
            Self::AlertCleared { .. } | Self::DaemonStarted { .. } | Self::DaemonStopped { .. } => {
                NotificationLevel::Info
            }
            Self::Error { .. } => NotificationLevel::Warning,
        }
    }

    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::UsageAlert(alert) => {
                let name = alert.display_name();
                if alert.first_time {
                    format!("{name} is using more mobile data than usual")
                } else {
                    format!("{name} is still using more mobile data than usual")
                }
            }
            Self::AlertCleared { uid, label } => {
                if label.is_empty() {
                    format!("uid {uid} is back to normal data usage")
                } else {
                    format!("{label} is back to normal data usage")
                }
            }
            Self::DaemonStarted {
                version,
                tracked_apps,
            } => format!("meterwatch v{version} started, {tracked_apps} apps tracked"),
            Self::DaemonStopped {
                reason,
                uptime_secs,
            } => {
                let hours = uptime_secs / 3600;
                let minutes = (uptime_secs % 3600) / 60;
                format!("meterwatch stopped ({reason}) after {hours}h {minutes}m")
            }
            Self::Error { code, message } => format!("[{code}] {message}"),
        }
    }
}

// ──────────────────── configuration ────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationConfig {
    /// Master switch for all channels.
    pub enabled: bool,
    /// Channel names to activate: `journal`, `file`, `desktop`.
    pub channels: Vec<String>,
    pub desktop: DesktopConfig,
    pub file: FileConfig,
    pub journal: JournalConfig,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channels: vec!["journal".to_string(), "file".to_string()],
            desktop: DesktopConfig::default(),
            file: FileConfig::default(),
            journal: JournalConfig::default(),
        }
    }
}

/// Desktop notifications via `notify-send`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DesktopConfig {
    pub enabled: bool,
    pub min_level: NotificationLevel,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_level: NotificationLevel::Warning,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FileConfig {
    pub path: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir().join("notifications.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JournalConfig {
    pub min_level: NotificationLevel,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            min_level: NotificationLevel::Info,
        }
    }
}

#[derive(Debug, Serialize)]
struct NotificationRecord {
    ts: String,
    level: NotificationLevel,
    summary: String,
    #[serde(flatten)]
    event: NotificationEvent,
}

// ──────────────────── channels ────────────────────

trait Channel: Send + Sync {
    fn name(&self) -> &'static str;
    fn send(&self, event: &NotificationEvent);
}

struct DesktopChannel {
    min_level: NotificationLevel,
}

impl Channel for DesktopChannel {
    fn name(&self) -> &'static str {
        "desktop"
    }

    fn send(&self, event: &NotificationEvent) {
        if event.level() < self.min_level {
            return;
        }
        let urgency = match event.level() {
            NotificationLevel::Critical => "critical",
            NotificationLevel::Warning => "normal",
            NotificationLevel::Info => "low",
        };
        let mut body = event.summary();
        if let NotificationEvent::UsageAlert(alert) = event {
            let actions: Vec<String> = alert.actions.iter().map(ToString::to_string).collect();
            body.push_str(&format!(
                "\nmeterwatch {} {}",
                actions.join(" | meterwatch "),
                alert.uid
            ));
        }
        if let Err(err) = Command::new("notify-send")
            .arg("--urgency")
            .arg(urgency)
            .arg("--app-name=meterwatch")
            .arg("Data usage")
            .arg(&body)
            .spawn()
        {
            tracing::debug!(error = %err, "notify-send unavailable");
        }
    }
}

struct FileChannel {
    path: PathBuf,
}

impl Channel for FileChannel {
    fn name(&self) -> &'static str {
        "file"
    }

    fn send(&self, event: &NotificationEvent) {
        let record = NotificationRecord {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: event.level(),
            summary: event.summary(),
            event: event.clone(),
        };
        let Ok(json) = serde_json::to_string(&record) else {
            return;
        };

        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let file = {
            let mut opts = OpenOptions::new();
            opts.create(true).append(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt as _;
                opts.mode(0o600);
            }
            opts.open(&self.path)
        };
        match file {
            Ok(mut f) => {
                if let Err(err) = writeln!(f, "{json}") {
                    tracing::warn!(path = %self.path.display(), error = %err, "notification write failed");
                }
            }
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "notification file unavailable");
            }
        }
    }
}

/// Structured log line; under systemd the subscriber's output lands in the journal.
struct JournalChannel {
    min_level: NotificationLevel,
}

impl Channel for JournalChannel {
    fn name(&self) -> &'static str {
        "journal"
    }

    fn send(&self, event: &NotificationEvent) {
        let level = event.level();
        if level < self.min_level {
            return;
        }
        let summary = event.summary();
        match level {
            NotificationLevel::Critical | NotificationLevel::Warning => {
                tracing::warn!(target: "meterwatch::notify", %level, "{summary}");
            }
            NotificationLevel::Info => {
                tracing::info!(target: "meterwatch::notify", %level, "{summary}");
            }
        }
    }
}

// ──────────────────── manager ────────────────────

/// Dispatches events to every configured channel.
pub struct NotificationManager {
    channels: Vec<Box<dyn Channel>>,
    enabled: bool,
}

impl NotificationManager {
    #[must_use]
    pub fn from_config(config: &NotificationConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }

        let mut channels: Vec<Box<dyn Channel>> = Vec::new();
        for channel_name in &config.channels {
            match channel_name.as_str() {
                "desktop" if config.desktop.enabled => channels.push(Box::new(DesktopChannel {
                    min_level: config.desktop.min_level,
                })),
                "file" => channels.push(Box::new(FileChannel {
                    path: config.file.path.clone(),
                })),
                "journal" => channels.push(Box::new(JournalChannel {
                    min_level: config.journal.min_level,
                })),
                other => {
                    tracing::debug!(channel = other, "skipping unknown or disabled channel");
                }
            }
        }

        Self {
            channels,
            enabled: true,
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            channels: Vec::new(),
            enabled: false,
        }
    }

    pub fn notify(&self, event: &NotificationEvent) {
        if !self.enabled {
            return;
        }
        for channel in &self.channels {
            channel.send(event);
        }
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }
}

impl AlertSink for NotificationManager {
    fn emit_alert(&self, alert: &UsageAlert) {
        self.notify(&NotificationEvent::UsageAlert(alert.clone()));
    }
}
