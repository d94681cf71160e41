#![forbid(unsafe_code)]

//! meterwatch: per-application data usage anomaly detector for metered links.
//!
//! Each sampling cycle reads cumulative per-uid byte counters, folds them into
//! app and per-user buckets, and compares a short ("fast") moving average of
//! each enabled app's traffic against its own long ("slow") baseline. Apps
//! that jump above the baseline by more than the configured percentage raise
//! an alert that the user can acknowledge, suppress, or turn into a network
//! restriction.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use meterwatch::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use meterwatch::core::config::Config;
//! use meterwatch::monitor::detector::AnomalyDetector;
//! ```

pub mod prelude;

pub mod core;
pub mod daemon;
pub mod logger;
pub mod monitor;
pub mod platform;
pub mod store;
