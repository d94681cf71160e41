//! Per-cycle aggregation of raw uid samples into accounting buckets.
//!
//! Each call starts from empty state and returns a fresh [`CycleUsage`]; nothing
//! is carried between cycles.

#![allow(missing_docs)]

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::core::uid::{self, BucketKey};
use crate::platform::pal::{ProfileDirectory, UidSample};

/// Kind of accounting bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    App,
    User,
}

/// One bucket's usage for the current cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppItem {
    pub key: BucketKey,
    pub category: Category,
    pub member_uids: BTreeSet<i32>,
    pub total: i64,
}

impl AppItem {
    fn new(key: BucketKey, category: Category) -> Self {
        Self {
            key,
            category,
            member_uids: BTreeSet::new(),
            total: 0,
        }
    }
}

/// Profile view frozen for the duration of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSnapshot {
    pub active: BTreeSet<i32>,
    pub foreground: i32,
}

impl ProfileSnapshot {
    #[must_use]
    pub fn capture(profiles: &dyn ProfileDirectory) -> Self {
        Self {
            active: profiles.active_profiles(),
            foreground: profiles.foreground_user(),
        }
    }
}

/// Result of aggregating one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleUsage {
    pub items: HashMap<BucketKey, AppItem>,
    /// Largest bucket total seen this cycle (display scaling only).
    pub largest: i64,
}

impl CycleUsage {
    #[must_use]
    pub fn get(&self, key: BucketKey) -> Option<&AppItem> {
        self.items.get(&key)
    }

    /// Lookup by the raw collapse key stored as a row's uid.
    #[must_use]
    pub fn by_raw_key(&self, raw: i32) -> Option<&AppItem> {
        self.items.get(&BucketKey::from_raw(raw))
    }

    fn fold(&mut self, key: BucketKey, category: Category, sample: &UidSample) {
        let item = self
            .items
            .entry(key)
            .or_insert_with(|| AppItem::new(key, category));
        item.member_uids.insert(sample.uid);
        item.total = item.total.saturating_add(sample.total_bytes());
        self.largest = self.largest.max(item.total);
    }
}

/// Collapse samples into app, per-user and removed-user buckets.
pub fn aggregate(
    samples: &[UidSample],
    profiles: &ProfileSnapshot,
    user_exists: impl Fn(i32) -> bool,
) -> CycleUsage {
    let mut usage = CycleUsage::default();
    for sample in samples {
        if !uid::is_app(sample.uid) {
            continue;
        }
        let user = uid::user_id(sample.uid);
        if profiles.active.contains(&user) {
            if user != profiles.foreground {
                usage.fold(BucketKey::User(user), Category::User, sample);
            }
            usage.fold(BucketKey::App(sample.uid), Category::App, sample);
        } else if user_exists(user) {
            usage.fold(BucketKey::User(user), Category::User, sample);
        } else {
            usage.fold(BucketKey::Removed, Category::App, sample);
        }
    }
    usage
}
