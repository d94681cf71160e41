//! Persistent per-uid detection state (SQLite, WAL).

pub mod usage;
