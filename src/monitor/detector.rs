//! Dual moving-average anomaly detector.
//!
//! Each tracked row keeps a slow (long-horizon) and a fast (short-horizon)
//! average of per-cycle byte deltas. Both windows grow one sample at a time
//! until they reach their configured width, then behave as fixed-width moving
//! averages. Once the slow window is full, a fast average that exceeds the slow
//! one by more than the warning percentage raises the alert.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

use serde::Serialize;

use crate::core::config::DetectionConfig;
use crate::monitor::diagnostics::DiagnosticHistory;
use crate::store::usage::{TrackedApp, TrackedAppPatch};

/// Detection-relevant slice of a tracked row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub total_bytes: i64,
    pub slow_avg: i64,
    pub slow_samples: i32,
    pub fast_avg: i64,
    pub fast_samples: i32,
    pub alert_active: bool,
}

impl From<&TrackedApp> for UsageStats {
    fn from(app: &TrackedApp) -> Self {
        Self {
            total_bytes: app.total_bytes,
            slow_avg: app.slow_avg,
            slow_samples: app.slow_samples,
            fast_avg: app.fast_avg,
            fast_samples: app.fast_samples,
            alert_active: app.alert_active,
        }
    }
}

impl UsageStats {
    /// Store patch persisting these statistics.
    #[must_use]
    pub fn to_patch(&self) -> TrackedAppPatch {
        TrackedAppPatch {
            alert_active: Some(self.alert_active),
            total_bytes: Some(self.total_bytes),
            slow_avg: Some(self.slow_avg),
            slow_samples: Some(self.slow_samples),
            fast_avg: Some(self.fast_avg),
            fast_samples: Some(self.fast_samples),
            ..TrackedAppPatch::default()
        }
    }
}

/// What a cycle decided for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Delta at or below the idle threshold; only the total advanced.
    Idle,
    /// Slow baseline not yet established; averages advanced, no alert possible.
    Learning,
    /// Fast average exceeds the baseline.
    Alert { first_time: bool },
    /// Baseline established and usage within bounds.
    Clear { was_active: bool },
}

/// Result of evaluating one row against this cycle's observed total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub stats: UsageStats,
    pub delta: i64,
    pub outcome: Outcome,
}

/// Stateless evaluator parameterized by detection thresholds.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    config: DetectionConfig,
}

impl AnomalyDetector {
    #[must_use]
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &DetectionConfig {
        &self.config
    }

    fn slow_window(&self) -> i32 {
        window_width(self.config.min_slow_samples)
    }

    fn fast_window(&self) -> i32 {
        window_width(self.config.min_fast_samples)
    }

    /// Fold `observed_total` into `previous` and decide the alert state.
    #[must_use]
    pub fn evaluate(&self, previous: &UsageStats, observed_total: i64) -> Evaluation {
        let delta = cycle_delta(previous.total_bytes, observed_total);
        let mut stats = UsageStats {
            total_bytes: observed_total,
            ..*previous
        };

        if delta <= self.config.max_idle_bytes {
            return Evaluation {
                stats,
                delta,
                outcome: Outcome::Idle,
            };
        }

        let slow_window = self.slow_window();
        let fast_window = self.fast_window();
        let slow_before = previous.slow_samples.clamp(0, slow_window);
        let baseline_ready = slow_before >= slow_window;

        (stats.slow_avg, stats.slow_samples) =
            advance_average(previous.slow_avg, slow_before, slow_window, delta);
        (stats.fast_avg, stats.fast_samples) = advance_average(
            previous.fast_avg,
            previous.fast_samples.clamp(0, fast_window),
            fast_window,
            delta,
        );

        let outcome = if !baseline_ready {
            stats.alert_active = false;
            Outcome::Learning
        } else if exceeds_baseline(stats.slow_avg, stats.fast_avg, self.config.warning_percentage) {
            stats.alert_active = true;
            Outcome::Alert {
                first_time: !previous.alert_active,
            }
        } else {
            stats.alert_active = false;
            Outcome::Clear {
                was_active: previous.alert_active,
            }
        };

        Evaluation {
            stats,
            delta,
            outcome,
        }
    }

    /// New `extra` column content after observing `delta`.
    ///
    /// Empty when diagnostics are off.
    #[must_use]
    pub fn record_diagnostic(&self, extra: &str, delta: i64) -> String {
        if !self.config.record_diagnostics {
            return String::new();
        }
        let mut history = DiagnosticHistory::parse(extra);
        history.push(delta, self.config.max_diagnostic_samples);
        history.to_extra()
    }
}

fn window_width(samples: u32) -> i32 {
    i32::try_from(samples.max(1)).unwrap_or(i32::MAX)
}

/// Byte delta since the previous cycle; zero on the first observation or a counter reset.
#[must_use]
pub fn cycle_delta(previous_total: i64, observed_total: i64) -> i64 {
    if previous_total == 0 {
        return 0;
    }
    observed_total.saturating_sub(previous_total).max(0)
}

/// Advance a growing-then-fixed window mean by one delta.
///
/// Below `window` the mean grows (`(avg*n + d) / (n+1)`, `n+1`). At `window` it
/// becomes a fixed-width mean (`(avg*(n-1) + d) / n`, `n`), which divides by `n`
/// rather than `n+1` at the boundary.
#[must_use]
pub fn advance_average(avg: i64, samples: i32, window: i32, delta: i64) -> (i64, i32) {
    let avg_f = avg.max(0) as f64;
    let delta_f = delta as f64;
    let (next, count) = if samples < window {
        let n = f64::from(samples.max(0));
        ((avg_f * n + delta_f) / (n + 1.0), samples.max(0) + 1)
    } else {
        let n = f64::from(samples);
        ((avg_f * (n - 1.0) + delta_f) / n, samples)
    };
    ((next as i64).max(0), count)
}

/// How far `fast` sits above `slow`, in percent of `slow`.
#[must_use]
pub fn exceed_percentage(slow: i64, fast: i64) -> f64 {
    if slow <= 0 {
        return if fast > slow { f64::INFINITY } else { 0.0 };
    }
    (fast - slow) as f64 / slow as f64 * 100.0
}

#[must_use]
pub fn exceeds_baseline(slow: i64, fast: i64, warning_percentage: u32) -> bool {
    fast > slow && exceed_percentage(slow, fast) > f64::from(warning_percentage)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(DetectionConfig::default())
    }

    fn established(slow_avg: i64, fast_avg: i64) -> UsageStats {
        UsageStats {
            total_bytes: 1_000_000,
            slow_avg,
            slow_samples: 60,
            fast_avg,
            fast_samples: 5,
            alert_active: false,
        }
    }

    #[test]
    fn threshold_boundary() {
        assert!(exceeds_baseline(100, 169, 68));
        assert!(!exceeds_baseline(100, 165, 68));
        assert!(!exceeds_baseline(100, 168, 68));
        assert!(!exceeds_baseline(100, 90, 0));
    }

    #[test]
    fn zero_baseline_with_traffic_counts_as_exceeding() {
        assert!(exceed_percentage(0, 10).is_infinite());
        assert!(exceeds_baseline(0, 10, 68));
        assert!(!exceeds_baseline(0, 0, 68));
    }

    #[test]
    fn growing_window_is_running_mean() {
        assert_eq!(advance_average(0, 0, 60, 1_000), (1_000, 1));
        assert_eq!(advance_average(1_000, 1, 60, 3_000), (2_000, 2));
        assert_eq!(advance_average(2_000, 2, 60, 5_000), (3_000, 3));
    }

    #[test]
    fn full_window_keeps_count_and_divides_by_width() {
        assert_eq!(advance_average(1_000, 60, 60, 2_000), (1_016, 60));
        assert_eq!(advance_average(1_000, 5, 5, 2_000), (1_200, 5));
        assert_eq!(advance_average(500, 1, 1, 2_000), (2_000, 1));
    }

    #[test]
    fn first_observation_has_no_delta() {
        assert_eq!(cycle_delta(0, 50_000), 0);
        assert_eq!(cycle_delta(50_000, 70_000), 20_000);
        assert_eq!(cycle_delta(70_000, 10), 0);
    }

    #[test]
    fn idle_cycle_only_moves_total() {
        let previous = established(10_000, 20_000);
        let eval = detector().evaluate(&previous, previous.total_bytes + 5_120);
        assert_eq!(eval.outcome, Outcome::Idle);
        assert_eq!(eval.stats.slow_avg, previous.slow_avg);
        assert_eq!(eval.stats.fast_avg, previous.fast_avg);
        assert_eq!(eval.stats.total_bytes, previous.total_bytes + 5_120);
    }

    #[test]
    fn learning_never_alerts() {
        let previous = UsageStats {
            total_bytes: 1,
            slow_samples: 3,
            slow_avg: 10_000,
            fast_samples: 3,
            fast_avg: 10_000,
            ..UsageStats::default()
        };
        let eval = detector().evaluate(&previous, 1 + 10_000_000);
        assert_eq!(eval.outcome, Outcome::Learning);
        assert_eq!(eval.stats.slow_samples, 4);
        assert!(!eval.stats.alert_active);
    }

    #[test]
    fn alert_then_continue_then_clear() {
        let detector = detector();
        let mut stats = established(10_000, 10_000);

        stats = {
            let eval = detector.evaluate(&stats, stats.total_bytes + 100_000);
            assert_eq!(eval.outcome, Outcome::Alert { first_time: true });
            eval.stats
        };
        stats = {
            let eval = detector.evaluate(&stats, stats.total_bytes + 100_000);
            assert_eq!(eval.outcome, Outcome::Alert { first_time: false });
            assert!(eval.stats.alert_active);
            eval.stats
        };
        for _ in 0..10 {
            stats = detector.evaluate(&stats, stats.total_bytes + 6_000).stats;
        }
        assert!(!stats.alert_active);
    }

    #[test]
    fn lowered_window_clamps_stored_counts() {
        let detector = AnomalyDetector::new(DetectionConfig {
            min_slow_samples: 10,
            min_fast_samples: 2,
            ..DetectionConfig::default()
        });
        let previous = UsageStats {
            slow_samples: 60,
            fast_samples: 5,
            ..established(10_000, 10_000)
        };
        let eval = detector.evaluate(&previous, previous.total_bytes + 10_000);
        assert_eq!(eval.stats.slow_samples, 10);
        assert_eq!(eval.stats.fast_samples, 2);
    }

    #[test]
    fn diagnostics_follow_config() {
        assert_eq!(detector().record_diagnostic("{\"samples\":[1]}", 7), "");

        let recording = AnomalyDetector::new(DetectionConfig {
            record_diagnostics: true,
            max_diagnostic_samples: 2,
            ..DetectionConfig::default()
        });
        let extra = recording.record_diagnostic("", 1);
        let extra = recording.record_diagnostic(&extra, 2);
        let extra = recording.record_diagnostic(&extra, 3);
        assert_eq!(DiagnosticHistory::parse(&extra).samples(), &[2, 3]);
    }

    #[test]
    fn stats_patch_leaves_identity_alone() {
        let patch = established(1, 2).to_patch();
        assert!(patch.label.is_none());
        assert!(patch.enabled.is_none());
        assert!(patch.extra.is_none());
        assert_eq!(patch.slow_samples, Some(60));
    }
}
