//! Multi-user uid arithmetic and synthetic collapse keys.
//!
//! A uid packs `user_id * PER_USER_RANGE + app_id`. Application uids occupy the
//! `FIRST_APPLICATION_UID..=LAST_APPLICATION_UID` app-id band in every user;
//! everything below it belongs to the system and is never tracked.

use crate::core::errors::{MwError, Result};

/// Width of the uid range reserved for each user.
pub const PER_USER_RANGE: i32 = 100_000;
/// First app id handed out to installed applications.
pub const FIRST_APPLICATION_UID: i32 = 10_000;
/// Last app id handed out to installed applications.
pub const LAST_APPLICATION_UID: i32 = 19_999;
/// Raw collapse key of the bucket holding traffic of users that no longer exist.
pub const UID_REMOVED: i32 = -4;

const USER_KEY_BASE: i32 = 2_000;

/// Owning user of a uid.
#[must_use]
pub const fn user_id(uid: i32) -> i32 {
    uid / PER_USER_RANGE
}

/// Per-user application id of a uid.
#[must_use]
pub const fn app_id(uid: i32) -> i32 {
    uid % PER_USER_RANGE
}

/// Whether the uid belongs to an installed application (as opposed to a system uid).
#[must_use]
pub const fn is_app(uid: i32) -> bool {
    if uid <= 0 {
        return false;
    }
    let app = app_id(uid);
    app >= FIRST_APPLICATION_UID && app <= LAST_APPLICATION_UID
}

/// Raw collapse key of the aggregate bucket for `user_id`.
#[must_use]
pub const fn user_bucket_key(user_id: i32) -> i32 {
    -(USER_KEY_BASE + user_id)
}

/// Reject uids that can never identify a tracked application row.
pub fn ensure_valid(uid: i32) -> Result<i32> {
    if uid <= 0 {
        return Err(MwError::InvalidUid {
            uid,
            reason: "uid must be positive",
        });
    }
    Ok(uid)
}

/// Accounting bucket a sample is folded into for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BucketKey {
    /// A single application uid.
    App(i32),
    /// Everything attributed to one user (secondary profile or inactive user).
    User(i32),
    /// Traffic of users that have been deleted.
    Removed,
}

impl BucketKey {
    /// Integer collapse key as stored and looked up by uid.
    #[must_use]
    pub const fn raw(self) -> i32 {
        match self {
            Self::App(uid) => uid,
            Self::User(user) => user_bucket_key(user),
            Self::Removed => UID_REMOVED,
        }
    }

    /// Inverse of [`BucketKey::raw`].
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        if raw == UID_REMOVED {
            Self::Removed
        } else if raw <= -USER_KEY_BASE {
            Self::User(-raw - USER_KEY_BASE)
        } else {
            Self::App(raw)
        }
    }
}
