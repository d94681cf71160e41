//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use meterwatch::prelude::*;
//! ```

// Core
pub use crate::core::config::{Config, DetectionConfig};
pub use crate::core::errors::{MwError, Result};

// Platform
pub use crate::platform::pal::{
    Collaborators, LabelResolver, NetworkPolicy, NetworkState, ProfileDirectory, SampleWindow,
    UidSample, UsageSource,
};

// Monitor
pub use crate::monitor::aggregate::{AppItem, Category, CycleUsage, ProfileSnapshot, aggregate};
pub use crate::monitor::detector::{AnomalyDetector, Evaluation, Outcome, UsageStats};

// Store
pub use crate::store::usage::{TrackedApp, TrackedAppPatch, UsageStore};

// Daemon
pub use crate::daemon::actions::{PackageEvent, ServiceGate, UserAction};
pub use crate::daemon::cycle::{CycleOrchestrator, CycleReport};
pub use crate::daemon::notifications::{AlertSink, UsageAlert};
