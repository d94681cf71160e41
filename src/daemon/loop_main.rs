//! Sampling loop: start delay, fixed-period ticks, gate check, one cycle per tick.
//!
//! Single-threaded so cycles can never overlap. Signals are polled between
//! short sleeps: shutdown ends the loop, reload re-reads the config file,
//! sample-now runs a cycle without waiting for the next tick.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::daemon::actions::ServiceGate;
use crate::daemon::cycle::{CycleOrchestrator, CycleReport};
use crate::daemon::notifications::{NotificationEvent, NotificationManager};
use crate::daemon::signals::SignalHandler;
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
use crate::monitor::detector::Outcome;
use crate::platform::linux;
use crate::platform::pal::{Collaborators, SampleWindow};
use crate::store::usage::UsageStore;

const POLL_SLICE: Duration = Duration::from_millis(250);

/// Arguments for `meterwatch daemon`.
#[derive(Debug, Clone, Default)]
pub struct DaemonArgs {
    /// Sample immediately instead of waiting for the configured start delay.
    pub skip_start_delay: bool,
    /// Stop after this many ticks (gated ticks included).
    pub max_ticks: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Elapsed,
    SampleNow,
    Reload,
    Shutdown,
}

// ──────────────────── daemon ────────────────────

pub struct SamplingDaemon {
    config: Config,
    args: DaemonArgs,
    store: Arc<UsageStore>,
    collaborators: Collaborators,
    notifications: Arc<NotificationManager>,
    gate: ServiceGate,
    cycle: CycleOrchestrator,
    activity: JsonlWriter,
    signals: SignalHandler,
    start_time: Instant,
    ticks: u64,
}

impl SamplingDaemon {
    /// Wire the daemon against the Linux collaborators and real signal hooks.
    pub fn init(config: Config, args: DaemonArgs) -> Result<Self> {
        let store = Arc::new(UsageStore::open(&config.paths.sqlite_db)?);
        let collaborators = linux::collaborators(&config);
        Ok(Self::with_parts(config, args, store, collaborators, SignalHandler::new()))
    }

    #[must_use]
    pub fn with_parts(
        config: Config,
        args: DaemonArgs,
        store: Arc<UsageStore>,
        collaborators: Collaborators,
        signals: SignalHandler,
    ) -> Self {
        let notifications = Arc::new(NotificationManager::from_config(&config.notifications));
        let gate = build_gate(&config, &store, &collaborators);
        let cycle = CycleOrchestrator::new(
            Arc::clone(&store),
            &collaborators,
            notifications.clone(),
            config.detection.clone(),
        );
        let activity = JsonlWriter::open(JsonlConfig::at(&config.paths.jsonl_log));
        Self {
            config,
            args,
            store,
            collaborators,
            notifications,
            gate,
            cycle,
            activity,
            signals,
            start_time: Instant::now(),
            ticks: 0,
        }
    }

    /// Run until shutdown is requested or `max_ticks` is reached.
    pub fn run(&mut self) -> Result<()> {
        let tracked = self.store.list_enabled()?.len();
        let config_hash = self.config.stable_hash().unwrap_or_default();
        tracing::info!(tracked, %config_hash, "meterwatch daemon starting");
        self.activity.write_entry(
            &LogEntry::new(EventType::DaemonStart, Severity::Info)
                .with_details(format!("config hash: {config_hash}")),
        );
        self.notifications.notify(&NotificationEvent::DaemonStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            tracked_apps: tracked,
        });

        let mut wake = if self.args.skip_start_delay {
            Wake::Elapsed
        } else {
            self.wait(Duration::from_secs(self.config.sampling.start_delay_secs))
        };

        let reason = loop {
            match wake {
                Wake::Shutdown => break "signal",
                Wake::Reload => {
                    self.reload();
                    wake = self.wait(self.period());
                    continue;
                }
                Wake::Elapsed | Wake::SampleNow => {}
            }

            let tick_started = Instant::now();
            self.tick();
            if self.args.max_ticks.is_some_and(|max| self.ticks >= max) {
                break "tick limit";
            }
            wake = self.wait(self.period().saturating_sub(tick_started.elapsed()));
        };

        let uptime_secs = self.start_time.elapsed().as_secs();
        tracing::info!(reason, uptime_secs, ticks = self.ticks, "meterwatch daemon stopping");
        self.activity.write_entry(
            &LogEntry::new(EventType::DaemonStop, Severity::Info).with_details(reason),
        );
        self.notifications.notify(&NotificationEvent::DaemonStopped {
            reason: reason.to_string(),
            uptime_secs,
        });
        Ok(())
    }

    /// One scheduled tick: run a cycle if the gate is open.
    pub fn tick(&mut self) -> Option<CycleReport> {
        self.ticks += 1;
        match self.gate.status() {
            Ok(status) if status.is_open() => {}
            Ok(status) => {
                tracing::debug!(?status, "sampling gate closed, skipping tick");
                return None;
            }
            Err(err) => {
                tracing::warn!(error = %err, "gate check failed, skipping tick");
                return None;
            }
        }

        match self.cycle.run_cycle(SampleWindow::until_now()) {
            Ok(report) => {
                self.log_report(&report);
                Some(report)
            }
            Err(err) => {
                tracing::warn!(error = %err, retryable = err.is_retryable(), "cycle aborted");
                self.activity
                    .write_entry(&LogEntry::from_error(EventType::CycleAborted, &err));
                self.activity.try_recover();
                None
            }
        }
    }

    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    // ──────────────────── helpers ────────────────────

    fn period(&self) -> Duration {
        Duration::from_secs(self.config.sampling.period_secs.max(1))
    }

    fn wait(&self, duration: Duration) -> Wake {
        let deadline = Instant::now() + duration;
        loop {
            if self.signals.should_shutdown() {
                return Wake::Shutdown;
            }
            if self.signals.should_reload() {
                return Wake::Reload;
            }
            if self.signals.should_sample() {
                return Wake::SampleNow;
            }
            let now = Instant::now();
            if now >= deadline {
                return Wake::Elapsed;
            }
            thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }

    fn log_report(&mut self, report: &CycleReport) {
        for row in &report.rows {
            let event = match row.outcome {
                Outcome::Alert { .. } => EventType::AlertRaised,
                Outcome::Clear { was_active: true } => EventType::AlertCleared,
                _ => continue,
            };
            let mut entry = LogEntry::for_uid(event, row.uid);
            entry.label = Some(row.label.clone());
            entry.delta = Some(row.delta);
            entry.slow_avg = Some(row.stats.slow_avg);
            entry.fast_avg = Some(row.stats.fast_avg);
            if let Outcome::Alert { first_time } = row.outcome {
                entry.severity = Severity::Warning;
                entry.first_time = Some(first_time);
            } else {
                self.notifications.notify(&NotificationEvent::AlertCleared {
                    uid: row.uid,
                    label: row.label.clone(),
                });
            }
            self.activity.write_entry(&entry);
        }

        let mut summary = LogEntry::new(EventType::CycleComplete, Severity::Info);
        summary.evaluated = Some(report.rows.len());
        summary.alerts = Some(report.alerts.len());
        summary.duration_ms = u64::try_from(report.duration.as_millis()).ok();
        if report.failed > 0 {
            summary.severity = Severity::Warning;
            summary.details = Some(format!("{} row updates failed", report.failed));
        }
        self.activity.write_entry(&summary);
        tracing::info!(
            samples = report.samples,
            evaluated = report.rows.len(),
            untouched = report.untouched,
            alerts = report.alerts.len(),
            cleared = report.cleared.len(),
            "cycle complete"
        );
    }

    fn reload(&mut self) {
        tracing::info!("config reload requested");
        match Config::load(Some(&self.config.paths.config_file)) {
            Ok(new_config) => {
                let old_hash = self.config.stable_hash().unwrap_or_default();
                let new_hash = new_config.stable_hash().unwrap_or_default();
                if old_hash == new_hash {
                    tracing::info!("config unchanged, skipping reload");
                    return;
                }
                if new_config.paths.sqlite_db != self.config.paths.sqlite_db {
                    tracing::warn!("paths.sqlite_db changes take effect on restart");
                }
                self.collaborators = linux::collaborators(&new_config);
                self.notifications =
                    Arc::new(NotificationManager::from_config(&new_config.notifications));
                self.gate = build_gate(&new_config, &self.store, &self.collaborators);
                self.cycle = CycleOrchestrator::new(
                    Arc::clone(&self.store),
                    &self.collaborators,
                    self.notifications.clone(),
                    new_config.detection.clone(),
                );
                if new_config.paths.jsonl_log != self.config.paths.jsonl_log {
                    self.activity = JsonlWriter::open(JsonlConfig::at(&new_config.paths.jsonl_log));
                }
                self.activity.write_entry(
                    &LogEntry::new(EventType::ConfigReload, Severity::Info)
                        .with_details(format!("config hash: {old_hash} -> {new_hash}")),
                );
                self.config = new_config;
            }
            Err(err) => {
                tracing::error!(error = %err, "config reload failed, keeping previous config");
                self.activity
                    .write_entry(&LogEntry::from_error(EventType::Error, &err));
            }
        }
    }
}

fn build_gate(config: &Config, store: &Arc<UsageStore>, collaborators: &Collaborators) -> ServiceGate {
    ServiceGate::new(
        Arc::clone(store),
        Arc::clone(&collaborators.network),
        config.sampling.require_metered,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::jsonl::read_entries;
    use crate::platform::pal::{
        MockLabels, MockNetworkPolicy, MockNetworkState, MockUsageSource, StaticProfiles, UidSample,
    };

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<UsageStore>,
        source: Arc<MockUsageSource>,
        network: Arc<MockNetworkState>,
        daemon: SamplingDaemon,
    }

    fn fixture(args: DaemonArgs, signals: SignalHandler) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths.sqlite_db = dir.path().join("usage.sqlite3");
        config.paths.jsonl_log = dir.path().join("activity.jsonl");
        config.paths.config_file = dir.path().join("config.toml");
        config.notifications.enabled = false;
        config.sampling.start_delay_secs = 0;

        let store = Arc::new(UsageStore::open(&config.paths.sqlite_db).unwrap());
        let source = Arc::new(MockUsageSource::new());
        let network = Arc::new(MockNetworkState::new(true));
        let collaborators = Collaborators {
            usage: source.clone(),
            labels: Arc::new(MockLabels::default()),
            profiles: Arc::new(StaticProfiles::new(0, [0])),
            network: network.clone(),
            policy: Arc::new(MockNetworkPolicy::default()),
        };
        let daemon = SamplingDaemon::with_parts(config, args, Arc::clone(&store), collaborators, signals);
        Fixture {
            dir,
            store,
            source,
            network,
            daemon,
        }
    }

    #[test]
    fn closed_gate_skips_fetch() {
        let mut f = fixture(DaemonArgs::default(), SignalHandler::unregistered());
        assert!(f.daemon.tick().is_none());
        assert_eq!(f.source.fetch_count(), 0);

        f.store.set_service_enabled(true).unwrap();
        f.network.set_metered(false);
        assert!(f.daemon.tick().is_none());
        assert_eq!(f.source.fetch_count(), 0);

        f.network.set_metered(true);
        f.source.push_snapshot(vec![UidSample::new(10_057, 1, 1)]);
        assert!(f.daemon.tick().is_some());
        assert_eq!(f.source.fetch_count(), 1);
        assert_eq!(f.daemon.ticks(), 3);
    }

    #[test]
    fn aborted_cycle_is_logged() {
        let mut f = fixture(DaemonArgs::default(), SignalHandler::unregistered());
        f.store.set_service_enabled(true).unwrap();
        f.source.push_failure();
        assert!(f.daemon.tick().is_none());

        let entries = read_entries(&f.dir.path().join("activity.jsonl")).unwrap();
        let aborted = entries.iter().find(|e| e.event == EventType::CycleAborted).unwrap();
        assert_eq!(aborted.error_code.as_deref(), Some("MW-2001"));
    }

    #[test]
    fn run_stops_after_tick_limit() {
        let args = DaemonArgs {
            skip_start_delay: true,
            max_ticks: Some(1),
        };
        let mut f = fixture(args, SignalHandler::unregistered());
        f.store.set_service_enabled(true).unwrap();
        f.source.push_snapshot(Vec::new());
        f.daemon.run().unwrap();

        let events: Vec<EventType> = read_entries(&f.dir.path().join("activity.jsonl"))
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(
            events,
            vec![EventType::DaemonStart, EventType::CycleComplete, EventType::DaemonStop]
        );
    }

    #[test]
    fn pending_shutdown_ends_run_before_sampling() {
        let signals = SignalHandler::unregistered();
        signals.request_shutdown();
        let mut f = fixture(DaemonArgs::default(), signals);
        f.daemon.run().unwrap();
        assert_eq!(f.daemon.ticks(), 0);
        assert_eq!(f.source.fetch_count(), 0);
    }

    #[test]
    fn failed_reload_keeps_config() {
        let signals = SignalHandler::unregistered();
        let mut f = fixture(DaemonArgs::default(), signals.clone());
        std::fs::write(&f.daemon.config().paths.config_file, "[detection]\nmin_fast_samples = 0\n")
            .unwrap();
        f.daemon.reload();
        assert_eq!(f.daemon.config().detection.min_fast_samples, 5);

        let entries = read_entries(&f.dir.path().join("activity.jsonl")).unwrap();
        assert!(entries.iter().any(|e| e.event == EventType::Error));
    }
}
