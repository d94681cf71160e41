//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{MwError, Result};
use crate::daemon::notifications::NotificationConfig;

/// Full meterwatch configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub detection: DetectionConfig,
    pub sampling: SamplingConfig,
    pub profiles: ProfilesConfig,
    pub labels: LabelsConfig,
    pub policy: PolicyConfig,
    pub paths: PathsConfig,
    pub notifications: NotificationConfig,
}

/// Anomaly detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DetectionConfig {
    /// Active samples needed before the slow baseline is trusted; also its window width.
    pub min_slow_samples: u32,
    /// Window width of the fast average.
    pub min_fast_samples: u32,
    /// Percentage by which the fast average must exceed the slow one to alert.
    pub warning_percentage: u32,
    /// Per-cycle deltas at or below this many bytes carry no usage signal.
    pub max_idle_bytes: i64,
    /// Keep a ring buffer of recent deltas in each row's `extra` column.
    pub record_diagnostics: bool,
    /// Ring buffer capacity when diagnostics are recorded.
    pub max_diagnostic_samples: usize,
}

/// Sampling cadence and accounting source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SamplingConfig {
    pub period_secs: u64,
    pub start_delay_secs: u64,
    /// Per-uid kernel accounting table.
    pub stats_path: PathBuf,
    /// Interface name prefixes treated as the metered (mobile) template.
    pub metered_interfaces: Vec<String>,
    /// Only sample while a metered interface is up.
    pub require_metered: bool,
    pub sysfs_net_dir: PathBuf,
}

/// Static view of the device's users and profiles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProfilesConfig {
    pub foreground_user: i32,
    /// Profiles of the foreground user (itself plus managed profiles).
    pub active_profiles: Vec<i32>,
    /// Every user that still exists on the device.
    pub known_users: Vec<i32>,
}

/// Label resolution sources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LabelsConfig {
    pub packages_list: PathBuf,
}

/// Data restriction hook used by the `restrict` user action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PolicyConfig {
    /// Argv template; `{uid}` is substituted. Empty disables restriction.
    pub restrict_command: Vec<String>,
}

/// Filesystem paths used by meterwatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub sqlite_db: PathBuf,
    pub jsonl_log: PathBuf,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_slow_samples: 60,
            min_fast_samples: 5,
            warning_percentage: 68,
            max_idle_bytes: 5 * 1024,
            record_diagnostics: false,
            max_diagnostic_samples: 1_000,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            period_secs: 60,
            start_delay_secs: 60,
            stats_path: PathBuf::from("/proc/net/xt_qtaguid/stats"),
            metered_interfaces: vec!["rmnet".to_string(), "wwan".to_string(), "ccmni".to_string()],
            require_metered: true,
            sysfs_net_dir: PathBuf::from("/sys/class/net"),
        }
    }
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            foreground_user: 0,
            active_profiles: vec![0],
            known_users: vec![0],
        }
    }
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            packages_list: PathBuf::from("/data/system/packages.list"),
        }
    }
}

fn home_dir() -> PathBuf {
    env::var_os("HOME").map_or_else(
        || {
            tracing::warn!("HOME not set, falling back to /tmp for data paths");
            PathBuf::from("/tmp")
        },
        PathBuf::from,
    )
}

/// Directory holding the usage database and logs.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    home_dir().join(".local").join("share").join("meterwatch")
}

impl Default for PathsConfig {
    fn default() -> Self {
        let cfg = home_dir()
            .join(".config")
            .join("meterwatch")
            .join("config.toml");
        let data = default_data_dir();
        Self {
            config_file: cfg,
            sqlite_db: data.join("usage.sqlite3"),
            jsonl_log: data.join("activity.jsonl"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| MwError::io(&path_buf, source))?;
            toml::from_str::<Self>(&raw)?
        } else if is_explicit_path {
            return Err(MwError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the activity log.
    ///
    /// FNV-1a so the value is stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let detection = &mut self.detection;
        override_parsed(&mut lookup, "MW_DETECTION_MIN_SLOW_SAMPLES", &mut detection.min_slow_samples)?;
        override_parsed(&mut lookup, "MW_DETECTION_MIN_FAST_SAMPLES", &mut detection.min_fast_samples)?;
        override_parsed(
            &mut lookup,
            "MW_DETECTION_WARNING_PERCENTAGE",
            &mut detection.warning_percentage,
        )?;
        override_parsed(&mut lookup, "MW_DETECTION_MAX_IDLE_BYTES", &mut detection.max_idle_bytes)?;
        if let Some(raw) = lookup("MW_DETECTION_RECORD_DIAGNOSTICS") {
            detection.record_diagnostics = parse_env_bool("MW_DETECTION_RECORD_DIAGNOSTICS", &raw)?;
        }

        override_parsed(&mut lookup, "MW_SAMPLING_PERIOD_SECS", &mut self.sampling.period_secs)?;
        override_parsed(
            &mut lookup,
            "MW_SAMPLING_START_DELAY_SECS",
            &mut self.sampling.start_delay_secs,
        )?;
        if let Some(raw) = lookup("MW_SAMPLING_STATS_PATH") {
            self.sampling.stats_path = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("MW_SAMPLING_REQUIRE_METERED") {
            self.sampling.require_metered = parse_env_bool("MW_SAMPLING_REQUIRE_METERED", &raw)?;
        }

        override_parsed(
            &mut lookup,
            "MW_PROFILES_FOREGROUND_USER",
            &mut self.profiles.foreground_user,
        )?;
        if let Some(raw) = lookup("MW_LABELS_PACKAGES_LIST") {
            self.labels.packages_list = PathBuf::from(raw);
        }

        if let Some(raw) = lookup("MW_SQLITE_DB") {
            self.paths.sqlite_db = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("MW_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }

        if let Some(raw) = lookup("MW_NOTIFICATIONS_ENABLED") {
            self.notifications.enabled = parse_env_bool("MW_NOTIFICATIONS_ENABLED", &raw)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let detection = &self.detection;
        if detection.min_slow_samples == 0 || detection.min_fast_samples == 0 {
            return Err(MwError::InvalidConfig {
                details: "detection.min_slow_samples and detection.min_fast_samples must be >= 1"
                    .to_string(),
            });
        }
        if detection.min_fast_samples > detection.min_slow_samples {
            return Err(MwError::InvalidConfig {
                details: format!(
                    "detection.min_fast_samples ({}) must be <= detection.min_slow_samples ({})",
                    detection.min_fast_samples, detection.min_slow_samples
                ),
            });
        }
        if detection.max_idle_bytes < 0 {
            return Err(MwError::InvalidConfig {
                details: format!(
                    "detection.max_idle_bytes must be >= 0, got {}",
                    detection.max_idle_bytes
                ),
            });
        }
        if detection.max_diagnostic_samples == 0 {
            return Err(MwError::InvalidConfig {
                details: "detection.max_diagnostic_samples must be >= 1".to_string(),
            });
        }

        if self.sampling.period_secs == 0 {
            return Err(MwError::InvalidConfig {
                details: "sampling.period_secs must be >= 1".to_string(),
            });
        }
        if self.sampling.require_metered && self.sampling.metered_interfaces.is_empty() {
            return Err(MwError::InvalidConfig {
                details: "sampling.metered_interfaces cannot be empty when require_metered=true"
                    .to_string(),
            });
        }

        if !self
            .profiles
            .active_profiles
            .contains(&self.profiles.foreground_user)
        {
            return Err(MwError::InvalidConfig {
                details: format!(
                    "profiles.active_profiles must contain the foreground user {}",
                    self.profiles.foreground_user
                ),
            });
        }
        if self.profiles.active_profiles.iter().any(|user| *user < 0) {
            return Err(MwError::InvalidConfig {
                details: "profiles.active_profiles cannot contain negative user ids".to_string(),
            });
        }

        if let Some(program) = self.policy.restrict_command.first()
            && program.trim().is_empty()
        {
            return Err(MwError::InvalidConfig {
                details: "policy.restrict_command program cannot be blank".to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn override_parsed<F, T>(lookup: &mut F, name: &str, slot: &mut T) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.trim().parse::<T>().map_err(|error| MwError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(MwError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: expected boolean"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().expect("defaults must validate");
    }

    #[test]
    fn default_detection_thresholds() {
        let detection = DetectionConfig::default();
        assert_eq!(detection.min_slow_samples, 60);
        assert_eq!(detection.min_fast_samples, 5);
        assert_eq!(detection.warning_percentage, 68);
        assert_eq!(detection.max_idle_bytes, 5_120);
        assert!(!detection.record_diagnostics);
    }

    #[test]
    fn fast_window_larger_than_slow_rejected() {
        let mut cfg = Config::default();
        cfg.detection.min_fast_samples = 90;
        let err = cfg.validate().expect_err("expected window ordering error");
        assert!(err.to_string().contains("min_fast_samples"));
    }

    #[test]
    fn zero_window_rejected() {
        let mut cfg = Config::default();
        cfg.detection.min_fast_samples = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_period_rejected() {
        let mut cfg = Config::default();
        cfg.sampling.period_secs = 0;
        let err = cfg.validate().expect_err("expected period error");
        assert!(err.to_string().contains("period_secs"));
    }

    #[test]
    fn foreground_user_must_be_active() {
        let mut cfg = Config::default();
        cfg.profiles.foreground_user = 10;
        let err = cfg.validate().expect_err("expected profiles error");
        assert!(err.to_string().contains("foreground user"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        let overrides = vars(&[
            ("MW_DETECTION_MIN_SLOW_SAMPLES", "12"),
            ("MW_DETECTION_WARNING_PERCENTAGE", "40"),
            ("MW_DETECTION_RECORD_DIAGNOSTICS", "on"),
            ("MW_SQLITE_DB", "/tmp/mw/usage.sqlite3"),
        ]);
        cfg.apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect("overrides should parse");

        assert_eq!(cfg.detection.min_slow_samples, 12);
        assert_eq!(cfg.detection.warning_percentage, 40);
        assert!(cfg.detection.record_diagnostics);
        assert_eq!(cfg.paths.sqlite_db, PathBuf::from("/tmp/mw/usage.sqlite3"));
    }

    #[test]
    fn env_invalid_number_rejected() {
        let mut cfg = Config::default();
        let overrides = vars(&[("MW_SAMPLING_PERIOD_SECS", "soon")]);
        let err = cfg
            .apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect_err("invalid number should fail");
        match err {
            MwError::ConfigParse { context, details } => {
                assert_eq!(context, "env");
                assert!(details.contains("MW_SAMPLING_PERIOD_SECS"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: Config = toml::from_str(
            "[detection]\nwarning_percentage = 50\n\n[profiles]\nactive_profiles = [0, 10]\n",
        )
        .expect("parse");
        assert_eq!(cfg.detection.warning_percentage, 50);
        assert_eq!(cfg.detection.min_slow_samples, 60);
        assert_eq!(cfg.profiles.active_profiles, vec![0, 10]);
        assert_eq!(cfg.profiles.foreground_user, 0);
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let result = Config::load(Some(Path::new("/nonexistent/meterwatch/config.toml")));
        assert!(matches!(result, Err(MwError::MissingConfig { .. })));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[sampling]\nperiod_secs = 30\n").unwrap();
        let cfg = Config::load(Some(&path)).expect("load");
        assert_eq!(cfg.sampling.period_secs, 30);
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn stable_hash_tracks_changes() {
        let base = Config::default();
        let mut changed = base.clone();
        changed.detection.warning_percentage = 10;
        assert_eq!(base.stable_hash().unwrap(), base.stable_hash().unwrap());
        assert_ne!(base.stable_hash().unwrap(), changed.stable_hash().unwrap());
    }
}
