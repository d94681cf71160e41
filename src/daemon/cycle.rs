//! One sampling cycle: fetch, aggregate, evaluate each enabled row, emit alerts.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::config::DetectionConfig;
use crate::core::errors::Result;
use crate::daemon::notifications::{AlertSink, UsageAlert};
use crate::monitor::aggregate::{ProfileSnapshot, aggregate};
use crate::monitor::detector::{AnomalyDetector, Outcome, UsageStats};
use crate::platform::pal::{Collaborators, LabelResolver, ProfileDirectory, SampleWindow, UsageSource};
use crate::store::usage::UsageStore;

/// Per-row result of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowOutcome {
    pub uid: i32,
    pub label: String,
    pub delta: i64,
    pub stats: UsageStats,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub samples: usize,
    /// Enabled rows with traffic this cycle.
    pub rows: Vec<RowOutcome>,
    /// Enabled rows with no bucket this cycle, left untouched.
    pub untouched: usize,
    /// Rows whose store write failed; retried next cycle.
    pub failed: usize,
    pub alerts: Vec<UsageAlert>,
    /// Uids whose active alert cleared this cycle.
    pub cleared: Vec<i32>,
    pub largest_bucket: i64,
    #[serde(skip)]
    pub duration: Duration,
}

/// Drives a cycle end to end.
///
/// Not reentrant: the host must not overlap calls to [`CycleOrchestrator::run_cycle`].
pub struct CycleOrchestrator {
    store: Arc<UsageStore>,
    usage: Arc<dyn UsageSource>,
    labels: Arc<dyn LabelResolver>,
    profiles: Arc<dyn ProfileDirectory>,
    sink: Arc<dyn AlertSink>,
    detector: AnomalyDetector,
}

impl CycleOrchestrator {
    #[must_use]
    pub fn new(
        store: Arc<UsageStore>,
        collaborators: &Collaborators,
        sink: Arc<dyn AlertSink>,
        detection: DetectionConfig,
    ) -> Self {
        Self {
            store,
            usage: Arc::clone(&collaborators.usage),
            labels: Arc::clone(&collaborators.labels),
            profiles: Arc::clone(&collaborators.profiles),
            sink,
            detector: AnomalyDetector::new(detection),
        }
    }

    #[must_use]
    pub const fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    /// Run one cycle.
    ///
    /// A fetch failure aborts before anything is written. Each row is its own
    /// transaction, so an error on one row leaves the others committed.
    pub fn run_cycle(&self, window: SampleWindow) -> Result<CycleReport> {
        let started = Instant::now();
        let samples = self.usage.fetch_samples(window)?;

        let snapshot = ProfileSnapshot::capture(self.profiles.as_ref());
        let profiles = Arc::clone(&self.profiles);
        let usage = aggregate(&samples, &snapshot, |user| profiles.user_exists(user));

        let mut report = CycleReport {
            samples: samples.len(),
            largest_bucket: usage.largest,
            ..CycleReport::default()
        };

        for row in self.store.list_enabled()? {
            let Some(item) = usage.by_raw_key(row.uid) else {
                report.untouched += 1;
                continue;
            };
            let observed_total = item.total;

            let decided = self.store.update_with(row.uid, |current| {
                if !current.enabled {
                    return (None, None);
                }
                let eval = self.detector.evaluate(&UsageStats::from(current), observed_total);
                let mut patch = eval.stats.to_patch();
                patch.extra = Some(self.detector.record_diagnostic(&current.extra, eval.delta));
                (Some(patch), Some((eval, current.label.clone())))
            });

            let (eval, label) = match decided {
                Ok(Some(Some(decided))) => decided,
                Ok(_) => {
                    tracing::debug!(uid = row.uid, "row disabled or removed mid-cycle");
                    report.untouched += 1;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(uid = row.uid, error = %err, "row update failed, retrying next cycle");
                    report.failed += 1;
                    continue;
                }
            };

            tracing::debug!(
                uid = row.uid,
                delta = eval.delta,
                slow_avg = eval.stats.slow_avg,
                slow_samples = eval.stats.slow_samples,
                fast_avg = eval.stats.fast_avg,
                fast_samples = eval.stats.fast_samples,
                outcome = ?eval.outcome,
                "row evaluated"
            );

            match eval.outcome {
                Outcome::Alert { first_time } => {
                    let label = if label.is_empty() {
                        self.labels.resolve_label(row.uid)
                    } else {
                        label.clone()
                    };
                    let alert = UsageAlert::new(row.uid, label, first_time);
                    tracing::info!(uid = row.uid, first_time, label = %alert.label, "usage alert");
                    self.sink.emit_alert(&alert);
                    report.alerts.push(alert);
                }
                Outcome::Clear { was_active: true } => report.cleared.push(row.uid),
                Outcome::Idle | Outcome::Learning | Outcome::Clear { .. } => {}
            }

            report.rows.push(RowOutcome {
                uid: row.uid,
                label,
                delta: eval.delta,
                stats: eval.stats,
                outcome: eval.outcome,
            });
        }

        report.duration = started.elapsed();
        Ok(report)
    }
}
