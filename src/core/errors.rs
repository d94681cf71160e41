//! MW-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, MwError>;

/// Top-level error type for meterwatch.
#[derive(Debug, Error)]
pub enum MwError {
    #[error("[MW-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[MW-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[MW-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[MW-1101] invalid uid {uid}: {reason}")]
    InvalidUid { uid: i32, reason: &'static str },

    #[error("[MW-2001] accounting backend unreachable at {source_name}: {details}")]
    Transport {
        source_name: String,
        details: String,
    },

    #[error("[MW-2002] accounting table parse failure: {details}")]
    StatsParse { details: String },

    #[error("[MW-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[MW-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[MW-2201] network policy rejected uid {uid}: {reason}")]
    PolicyRejected { uid: i32, reason: String },

    #[error("[MW-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[MW-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl MwError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "MW-1001",
            Self::MissingConfig { .. } => "MW-1002",
            Self::ConfigParse { .. } => "MW-1003",
            Self::InvalidUid { .. } => "MW-1101",
            Self::Transport { .. } => "MW-2001",
            Self::StatsParse { .. } => "MW-2002",
            Self::Serialization { .. } => "MW-2101",
            Self::Sql { .. } => "MW-2102",
            Self::PolicyRejected { .. } => "MW-2201",
            Self::Io { .. } => "MW-3002",
            Self::Runtime { .. } => "MW-3900",
        }
    }

    /// Whether retrying (at the next sampling tick) might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::StatsParse { .. }
                | Self::Io { .. }
                | Self::Sql { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for accounting backend failures.
    #[must_use]
    pub fn transport(source_name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Transport {
            source_name: source_name.into(),
            details: details.into(),
        }
    }
}

impl From<rusqlite::Error> for MwError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for MwError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for MwError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
