//! Bounded history of recent per-cycle deltas kept in a row's `extra` column.

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

/// Ring buffer of recent deltas, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticHistory {
    samples: Vec<i64>,
}

impl DiagnosticHistory {
    /// Parse stored content. Anything unparseable yields an empty history.
    #[must_use]
    pub fn parse(extra: &str) -> Self {
        if extra.trim().is_empty() {
            return Self::default();
        }
        serde_json::from_str(extra).unwrap_or_else(|err| {
            tracing::debug!(error = %err, "discarding unreadable diagnostic history");
            Self::default()
        })
    }

    /// Append `delta`, dropping the oldest entries beyond `capacity`.
    pub fn push(&mut self, delta: i64, capacity: usize) {
        self.samples.push(delta);
        let excess = self.samples.len().saturating_sub(capacity.max(1));
        self.samples.drain(..excess);
    }

    #[must_use]
    pub fn samples(&self) -> &[i64] {
        &self.samples
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Serialized form for the `extra` column.
    #[must_use]
    pub fn to_extra(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
