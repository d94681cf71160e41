//! Usage monitoring: per-cycle aggregation, dual-average anomaly detection,
//! and the diagnostic delta history.

pub mod aggregate;
pub mod detector;
pub mod diagnostics;
