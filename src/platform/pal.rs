//! Collaborator traits the detection core depends on, plus in-memory mocks.
//!
//! The core never talks to the kernel, the package database or the user manager
//! directly; it consumes these narrow read-only views so every piece can be
//! swapped for a deterministic fake in tests.

#![allow(missing_docs)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::config::ProfilesConfig;
use crate::core::errors::{MwError, Result};

/// Cumulative byte counters attributed to one uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidSample {
    pub uid: i32,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl UidSample {
    #[must_use]
    pub const fn new(uid: i32, rx_bytes: u64, tx_bytes: u64) -> Self {
        Self {
            uid,
            rx_bytes,
            tx_bytes,
        }
    }

    /// rx + tx, saturated into the store's signed 64-bit range.
    #[must_use]
    pub fn total_bytes(&self) -> i64 {
        let sum = self.rx_bytes.saturating_add(self.tx_bytes);
        i64::try_from(sum).unwrap_or(i64::MAX)
    }
}

/// Time range a cycle asks the accounting backend about (epoch milliseconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl SampleWindow {
    /// Everything counted since the counters were last reset, up to now.
    #[must_use]
    pub fn until_now() -> Self {
        Self {
            start_ms: 0,
            end_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Per-uid byte accounting backend.
pub trait UsageSource: Send + Sync {
    /// Human-readable backend name for error reports.
    fn name(&self) -> &str;
    /// Fails with [`MwError::Transport`] when the backend is unreachable.
    fn fetch_samples(&self, window: SampleWindow) -> Result<Vec<UidSample>>;
}

/// Best-effort uid -> display label lookup. Never fails; unknown is `""`.
pub trait LabelResolver: Send + Sync {
    fn resolve_label(&self, uid: i32) -> String;
}

/// Read-only view of the device's users.
pub trait ProfileDirectory: Send + Sync {
    fn active_profiles(&self) -> BTreeSet<i32>;
    fn foreground_user(&self) -> i32;
    fn user_exists(&self, user_id: i32) -> bool;
}

/// Whether the current connection qualifies for sampling.
pub trait NetworkState: Send + Sync {
    fn is_metered_connection(&self) -> bool;
}

/// Blocks a uid's access to metered data.
pub trait NetworkPolicy: Send + Sync {
    fn restrict(&self, uid: i32) -> Result<()>;
}

/// Bundle of collaborators wired into the daemon and CLI.
#[derive(Clone)]
pub struct Collaborators {
    pub usage: Arc<dyn UsageSource>,
    pub labels: Arc<dyn LabelResolver>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub network: Arc<dyn NetworkState>,
    pub policy: Arc<dyn NetworkPolicy>,
}

// ──────────────────── static profiles ────────────────────

/// Profiles taken verbatim from the `[profiles]` config section.
#[derive(Debug, Clone)]
pub struct StaticProfiles {
    foreground: i32,
    active: BTreeSet<i32>,
    known: BTreeSet<i32>,
}

impl StaticProfiles {
    #[must_use]
    pub fn new(foreground: i32, active: impl IntoIterator<Item = i32>) -> Self {
        let active: BTreeSet<i32> = active.into_iter().collect();
        let known = active.clone();
        Self {
            foreground,
            active,
            known,
        }
    }

    /// Users that still exist but are not among the active profiles.
    #[must_use]
    pub fn with_known_users(mut self, users: impl IntoIterator<Item = i32>) -> Self {
        self.known.extend(users);
        self
    }

    #[must_use]
    pub fn from_config(config: &ProfilesConfig) -> Self {
        Self::new(
            config.foreground_user,
            config.active_profiles.iter().copied(),
        )
        .with_known_users(config.known_users.iter().copied())
    }
}

impl ProfileDirectory for StaticProfiles {
    fn active_profiles(&self) -> BTreeSet<i32> {
        self.active.clone()
    }

    fn foreground_user(&self) -> i32 {
        self.foreground
    }

    fn user_exists(&self, user_id: i32) -> bool {
        self.known.contains(&user_id)
    }
}

// ──────────────────── mocks ────────────────────

/// Scripted accounting backend: each fetch pops the next scripted response,
/// repeating the last successful snapshot once the script runs out.
#[derive(Debug, Default)]
pub struct MockUsageSource {
    script: Mutex<VecDeque<Option<Vec<UidSample>>>>,
    last: Mutex<Vec<UidSample>>,
    fetches: Mutex<u64>,
}

impl MockUsageSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a snapshot for a future fetch.
    pub fn push_snapshot(&self, samples: Vec<UidSample>) {
        self.script.lock().push_back(Some(samples));
    }

    /// Queue a transport failure for a future fetch.
    pub fn push_failure(&self) {
        self.script.lock().push_back(None);
    }

    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        *self.fetches.lock()
    }
}

impl UsageSource for MockUsageSource {
    fn name(&self) -> &str {
        "mock"
    }

    fn fetch_samples(&self, _window: SampleWindow) -> Result<Vec<UidSample>> {
        *self.fetches.lock() += 1;
        match self.script.lock().pop_front() {
            Some(Some(samples)) => {
                self.last.lock().clone_from(&samples);
                Ok(samples)
            }
            Some(None) => Err(MwError::transport("mock", "scripted failure")),
            None => Ok(self.last.lock().clone()),
        }
    }
}

/// Fixed label table.
#[derive(Debug, Clone, Default)]
pub struct MockLabels {
    labels: HashMap<i32, String>,
}

impl MockLabels {
    #[must_use]
    pub fn with(mut self, uid: i32, label: &str) -> Self {
        self.labels.insert(uid, label.to_string());
        self
    }
}

impl LabelResolver for MockLabels {
    fn resolve_label(&self, uid: i32) -> String {
        self.labels.get(&uid).cloned().unwrap_or_default()
    }
}

/// Connection state toggled by tests.
#[derive(Debug, Default)]
pub struct MockNetworkState {
    metered: Mutex<bool>,
}

impl MockNetworkState {
    #[must_use]
    pub fn new(metered: bool) -> Self {
        Self {
            metered: Mutex::new(metered),
        }
    }

    pub fn set_metered(&self, metered: bool) {
        *self.metered.lock() = metered;
    }
}

impl NetworkState for MockNetworkState {
    fn is_metered_connection(&self) -> bool {
        *self.metered.lock()
    }
}

/// Records every restricted uid.
#[derive(Debug, Default)]
pub struct MockNetworkPolicy {
    restricted: Mutex<Vec<i32>>,
}

impl MockNetworkPolicy {
    #[must_use]
    pub fn restricted(&self) -> Vec<i32> {
        self.restricted.lock().clone()
    }
}

impl NetworkPolicy for MockNetworkPolicy {
    fn restrict(&self, uid: i32) -> Result<()> {
        self.restricted.lock().push(uid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_total_saturates() {
        let sample = UidSample::new(10_001, u64::MAX, 5);
        assert_eq!(sample.total_bytes(), i64::MAX);
        assert_eq!(UidSample::new(10_001, 10, 5).total_bytes(), 15);
    }

    #[test]
    fn static_profiles_know_active_and_listed_users() {
        let profiles = StaticProfiles::new(0, [0, 10]).with_known_users([11]);
        assert_eq!(profiles.foreground_user(), 0);
        assert!(profiles.active_profiles().contains(&10));
        assert!(profiles.user_exists(10));
        assert!(profiles.user_exists(11));
        assert!(!profiles.user_exists(12));
    }

    #[test]
    fn mock_source_replays_script_then_repeats() {
        let source = MockUsageSource::new();
        source.push_snapshot(vec![UidSample::new(10_001, 1, 1)]);
        source.push_failure();

        let window = SampleWindow::until_now();
        assert_eq!(source.fetch_samples(window).unwrap().len(), 1);
        assert!(source.fetch_samples(window).is_err());
        assert_eq!(source.fetch_samples(window).unwrap().len(), 1);
        assert_eq!(source.fetch_count(), 3);
    }
}
