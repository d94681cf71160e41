//! Store mutations driven from outside the cycle: package lifecycle, user
//! responses to alerts, and the service-wide sampling gate.

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::errors::{MwError, Result};
use crate::core::uid;
use crate::platform::pal::{LabelResolver, NetworkPolicy, NetworkState};
use crate::store::usage::{TrackedAppPatch, UsageStore};

// ──────────────────── package lifecycle ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageEvent {
    Added,
    Changed,
    Replaced,
    Removed,
    FullyRemoved,
}

impl FromStr for PackageEvent {
    type Err = MwError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "added" => Ok(Self::Added),
            "changed" => Ok(Self::Changed),
            "replaced" => Ok(Self::Replaced),
            "removed" => Ok(Self::Removed),
            "fully-removed" => Ok(Self::FullyRemoved),
            other => Err(MwError::Runtime {
                details: format!("unknown package event {other:?}"),
            }),
        }
    }
}

/// What a package event did to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum PackageEffect {
    Tracked { label: String },
    Untracked { existed: bool },
    Unchanged,
}

/// Keep tracked rows in step with installs and uninstalls.
pub fn handle_package_event(
    store: &UsageStore,
    labels: &dyn LabelResolver,
    event: PackageEvent,
    uid: i32,
) -> Result<PackageEffect> {
    let uid = uid::ensure_valid(uid)?;
    match event {
        PackageEvent::Added => {
            let label = labels.resolve_label(uid);
            store.add_app(uid, &label)?;
            tracing::info!(uid, %label, "tracking new package");
            Ok(PackageEffect::Tracked { label })
        }
        PackageEvent::Removed | PackageEvent::FullyRemoved => {
            let existed = store.remove(uid)?;
            tracing::info!(uid, existed, "package removed");
            Ok(PackageEffect::Untracked { existed })
        }
        PackageEvent::Changed | PackageEvent::Replaced => Ok(PackageEffect::Unchanged),
    }
}

// ──────────────────── user actions ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserAction {
    /// Dismiss the current alert; detection continues.
    Acknowledge,
    /// Stop monitoring the uid entirely.
    Suppress,
    /// Block the uid's metered data.
    Restrict,
}

impl fmt::Display for UserAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acknowledge => write!(f, "acknowledge"),
            Self::Suppress => write!(f, "suppress"),
            Self::Restrict => write!(f, "restrict"),
        }
    }
}

pub fn acknowledge(store: &UsageStore, uid: i32) -> Result<()> {
    store.set_alert_active(uid, false)
}

/// Disable detection and forget the last total so a later re-enable starts clean.
pub fn suppress(store: &UsageStore, uid: i32) -> Result<()> {
    let uid = uid::ensure_valid(uid)?;
    let patch = TrackedAppPatch::default()
        .enabled(false)
        .alert_active(false)
        .total_bytes(0);
    store.upsert_by_uid(uid, &patch)
}

pub fn restrict(policy: &dyn NetworkPolicy, uid: i32) -> Result<()> {
    let uid = uid::ensure_valid(uid)?;
    policy.restrict(uid)
}

pub fn apply_user_action(
    store: &UsageStore,
    policy: &dyn NetworkPolicy,
    action: UserAction,
    uid: i32,
) -> Result<()> {
    let result = match action {
        UserAction::Acknowledge => acknowledge(store, uid),
        UserAction::Suppress => suppress(store, uid),
        UserAction::Restrict => restrict(policy, uid),
    };
    match &result {
        Ok(()) => tracing::info!(uid, %action, "user action applied"),
        Err(err) => tracing::warn!(uid, %action, error = %err, "user action failed"),
    }
    result
}

// ──────────────────── sampling gate ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateStatus {
    pub service_enabled: bool,
    pub metered: bool,
    pub require_metered: bool,
}

impl GateStatus {
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.service_enabled && (self.metered || !self.require_metered)
    }
}

/// Samples only run while the service flag is on and the connection qualifies.
pub struct ServiceGate {
    store: Arc<UsageStore>,
    network: Arc<dyn NetworkState>,
    require_metered: bool,
}

impl ServiceGate {
    #[must_use]
    pub fn new(store: Arc<UsageStore>, network: Arc<dyn NetworkState>, require_metered: bool) -> Self {
        Self {
            store,
            network,
            require_metered,
        }
    }

    pub fn status(&self) -> Result<GateStatus> {
        Ok(GateStatus {
            service_enabled: self.store.service_enabled()?,
            metered: self.network.is_metered_connection(),
            require_metered: self.require_metered,
        })
    }

    pub fn is_open(&self) -> Result<bool> {
        Ok(self.status()?.is_open())
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.store.set_service_enabled(enabled)
    }
}
