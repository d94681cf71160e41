//! Usage store: one SQLite row per tracked uid plus a small settings table.
//!
//! Every write runs inside an IMMEDIATE transaction so a read-modify-write on a
//! row is isolated from other writers, including other processes sharing the
//! same database file (the CLI acknowledging an alert while the daemon samples).

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};

use crate::core::errors::{MwError, Result};
use crate::core::uid;

const SERVICE_ENABLED_KEY: &str = "service_enabled";

/// Persisted per-uid detection state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedApp {
    pub uid: i32,
    pub label: String,
    pub enabled: bool,
    pub alert_active: bool,
    /// Last observed cumulative total; zero until the first sampled cycle.
    pub total_bytes: i64,
    pub slow_avg: i64,
    pub slow_samples: i32,
    pub fast_avg: i64,
    pub fast_samples: i32,
    /// Diagnostic ring buffer, never read by detection.
    pub extra: String,
}

/// Field set written by [`UsageStore::upsert_by_uid`]; `None` leaves a column alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedAppPatch {
    pub label: Option<String>,
    pub enabled: Option<bool>,
    pub alert_active: Option<bool>,
    pub total_bytes: Option<i64>,
    pub slow_avg: Option<i64>,
    pub slow_samples: Option<i32>,
    pub fast_avg: Option<i64>,
    pub fast_samples: Option<i32>,
    pub extra: Option<String>,
}

impl TrackedAppPatch {
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    #[must_use]
    pub const fn alert_active(mut self, active: bool) -> Self {
        self.alert_active = Some(active);
        self
    }

    #[must_use]
    pub const fn total_bytes(mut self, total: i64) -> Self {
        self.total_bytes = Some(total);
        self
    }

    /// Full snapshot of a row's detection state.
    #[must_use]
    pub fn from_stats(app: &TrackedApp) -> Self {
        Self {
            label: None,
            enabled: None,
            alert_active: Some(app.alert_active),
            total_bytes: Some(app.total_bytes),
            slow_avg: Some(app.slow_avg),
            slow_samples: Some(app.slow_samples),
            fast_avg: Some(app.fast_avg),
            fast_samples: Some(app.fast_samples),
            extra: Some(app.extra.clone()),
        }
    }
}

/// SQLite-backed store of tracked applications.
pub struct UsageStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl UsageStore {
    /// Open (or create) the store at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| MwError::io(parent, source))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ──────────────────── reads ────────────────────

    pub fn get(&self, uid: i32) -> Result<Option<TrackedApp>> {
        let conn = self.conn.lock();
        read_row(&conn, uid)
    }

    /// Rows with detection enabled, ordered by uid.
    pub fn list_enabled(&self) -> Result<Vec<TrackedApp>> {
        self.list_where("WHERE enabled = 1")
    }

    pub fn list_all(&self) -> Result<Vec<TrackedApp>> {
        self.list_where("")
    }

    fn list_where(&self, filter: &str) -> Result<Vec<TrackedApp>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {COLUMNS} FROM tracked_apps {filter} ORDER BY uid");
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map([], map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_enabled(&self, uid: i32) -> Result<bool> {
        Ok(self.get(uid)?.is_some_and(|app| app.enabled))
    }

    // ──────────────────── writes ────────────────────

    /// Update the row for `uid`, or insert one seeded from `patch` with zeroed statistics.
    pub fn upsert_by_uid(&self, uid: i32, patch: &TrackedAppPatch) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        write_patch(&tx, uid, patch)?;
        tx.commit()?;
        Ok(())
    }

    /// Isolated read-decide-write on one row.
    ///
    /// `decide` sees the row as committed inside the write transaction and returns
    /// the patch to apply along with a value handed back to the caller. Returns
    /// `None` without calling `decide` when the row does not exist.
    pub fn update_with<T, F>(&self, uid: i32, decide: F) -> Result<Option<T>>
    where
        F: FnOnce(&TrackedApp) -> (Option<TrackedAppPatch>, T),
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(current) = read_row(&tx, uid)? else {
            return Ok(None);
        };
        let (patch, output) = decide(&current);
        if let Some(patch) = patch {
            write_patch(&tx, uid, &patch)?;
        }
        tx.commit()?;
        Ok(Some(output))
    }

    /// Start tracking a newly installed application; an existing row only gets its label refreshed.
    pub fn add_app(&self, uid: i32, label: &str) -> Result<()> {
        let uid = uid::ensure_valid(uid)?;
        self.upsert_by_uid(uid, &TrackedAppPatch::default().label(label))
    }

    /// Returns whether a row was deleted.
    pub fn remove(&self, uid: i32) -> Result<bool> {
        let uid = uid::ensure_valid(uid)?;
        let conn = self.conn.lock();
        let deleted = conn
            .prepare_cached("DELETE FROM tracked_apps WHERE uid = ?1")?
            .execute(params![uid])?;
        Ok(deleted > 0)
    }

    pub fn set_enabled(&self, uid: i32, enabled: bool, label: Option<&str>) -> Result<()> {
        let uid = uid::ensure_valid(uid)?;
        let mut patch = TrackedAppPatch::default().enabled(enabled);
        patch.label = label.map(str::to_string);
        self.upsert_by_uid(uid, &patch)
    }

    pub fn set_alert_active(&self, uid: i32, active: bool) -> Result<()> {
        let uid = uid::ensure_valid(uid)?;
        self.upsert_by_uid(uid, &TrackedAppPatch::default().alert_active(active))
    }

    // ──────────────────── settings ────────────────────

    /// Service-wide enable flag; off until explicitly turned on.
    pub fn service_enabled(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .prepare_cached("SELECT value FROM settings WHERE key = ?1")?
            .query_row(params![SERVICE_ENABLED_KEY], |row| row.get(0))
            .optional()?;
        Ok(value.as_deref() == Some("1"))
    }

    pub fn set_service_enabled(&self, enabled: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )?
        .execute(params![SERVICE_ENABLED_KEY, if enabled { "1" } else { "0" }])?;
        Ok(())
    }

    /// Whether the connection is in WAL journal mode.
    pub fn is_wal_mode(&self) -> bool {
        let conn = self.conn.lock();
        conn.query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .is_ok_and(|mode| mode.eq_ignore_ascii_case("wal"))
    }
}

const COLUMNS: &str = "uid, label, enabled, alert_active, total_bytes, \
                       slow_avg, slow_samples, fast_avg, fast_samples, extra";

fn map_row(row: &Row<'_>) -> rusqlite::Result<TrackedApp> {
    Ok(TrackedApp {
        uid: row.get(0)?,
        label: row.get(1)?,
        enabled: row.get(2)?,
        alert_active: row.get(3)?,
        total_bytes: row.get(4)?,
        slow_avg: row.get(5)?,
        slow_samples: row.get(6)?,
        fast_avg: row.get(7)?,
        fast_samples: row.get(8)?,
        extra: row.get(9)?,
    })
}

fn read_row(conn: &Connection, uid: i32) -> Result<Option<TrackedApp>> {
    let sql = format!("SELECT {COLUMNS} FROM tracked_apps WHERE uid = ?1");
    let row = conn
        .prepare_cached(&sql)?
        .query_row(params![uid], map_row)
        .optional()?;
    Ok(row)
}

fn write_patch(tx: &Transaction<'_>, uid: i32, patch: &TrackedAppPatch) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let updated = tx
        .prepare_cached(
            "UPDATE tracked_apps SET
                label = COALESCE(?2, label),
                enabled = COALESCE(?3, enabled),
                alert_active = COALESCE(?4, alert_active),
                total_bytes = COALESCE(?5, total_bytes),
                slow_avg = COALESCE(?6, slow_avg),
                slow_samples = COALESCE(?7, slow_samples),
                fast_avg = COALESCE(?8, fast_avg),
                fast_samples = COALESCE(?9, fast_samples),
                extra = COALESCE(?10, extra),
                updated_at = ?11
             WHERE uid = ?1",
        )?
        .execute(params![
            uid,
            patch.label,
            patch.enabled,
            patch.alert_active,
            patch.total_bytes,
            patch.slow_avg,
            patch.slow_samples,
            patch.fast_avg,
            patch.fast_samples,
            patch.extra,
            now,
        ])?;
    if updated > 0 {
        return Ok(());
    }

    tx.prepare_cached(
        "INSERT INTO tracked_apps (
            uid, label, enabled, alert_active, total_bytes,
            slow_avg, slow_samples, fast_avg, fast_samples, extra, updated_at
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
    )?
    .execute(params![
        uid,
        patch.label.as_deref().unwrap_or_default(),
        patch.enabled.unwrap_or(false),
        patch.alert_active.unwrap_or(false),
        patch.total_bytes.unwrap_or(0),
        patch.slow_avg.unwrap_or(0),
        patch.slow_samples.unwrap_or(0),
        patch.fast_avg.unwrap_or(0),
        patch.fast_samples.unwrap_or(0),
        patch.extra.as_deref().unwrap_or_default(),
        now,
    ])?;
    tracing::debug!(uid, "inserted tracked app row");
    Ok(())
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(%mode, "requested WAL journal mode but sqlite refused");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tracked_apps (
            uid INTEGER PRIMARY KEY,
            label TEXT NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL DEFAULT 0,
            alert_active INTEGER NOT NULL DEFAULT 0,
            total_bytes INTEGER NOT NULL DEFAULT 0,
            slow_avg INTEGER NOT NULL DEFAULT 0,
            slow_samples INTEGER NOT NULL DEFAULT 0,
            fast_avg INTEGER NOT NULL DEFAULT 0,
            fast_samples INTEGER NOT NULL DEFAULT 0,
            extra TEXT NOT NULL DEFAULT '',
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tracked_enabled ON tracked_apps(enabled);

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}
