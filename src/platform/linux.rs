//! Linux-backed collaborators: kernel uid accounting, package list, sysfs link state.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::core::config::Config;
use crate::core::errors::{MwError, Result};
use crate::core::uid;
use crate::platform::pal::{
    Collaborators, LabelResolver, NetworkPolicy, NetworkState, SampleWindow, StaticProfiles,
    UidSample, UsageSource,
};

/// Build the production collaborator set from configuration.
#[must_use]
pub fn collaborators(config: &Config) -> Collaborators {
    Collaborators {
        usage: Arc::new(QtaguidUsageSource::new(
            config.sampling.stats_path.clone(),
            config.sampling.metered_interfaces.clone(),
        )),
        labels: Arc::new(PackagesListResolver::new(
            config.labels.packages_list.clone(),
        )),
        profiles: Arc::new(StaticProfiles::from_config(&config.profiles)),
        network: Arc::new(SysfsNetworkState::new(
            config.sampling.sysfs_net_dir.clone(),
            config.sampling.metered_interfaces.clone(),
        )),
        policy: Arc::new(CommandPolicy::new(config.policy.restrict_command.clone())),
    }
}

// ──────────────────── per-uid accounting ────────────────────

/// Reads the `xt_qtaguid` per-uid statistics table.
///
/// The table holds cumulative counters since boot, so the sampling window is
/// implicitly "since reset"; the detector turns consecutive snapshots into deltas.
#[derive(Debug, Clone)]
pub struct QtaguidUsageSource {
    path: PathBuf,
    interface_prefixes: Vec<String>,
}

impl QtaguidUsageSource {
    #[must_use]
    pub fn new(path: PathBuf, interface_prefixes: Vec<String>) -> Self {
        Self {
            path,
            interface_prefixes,
        }
    }
}

impl UsageSource for QtaguidUsageSource {
    fn name(&self) -> &str {
        "xt_qtaguid"
    }

    fn fetch_samples(&self, window: SampleWindow) -> Result<Vec<UidSample>> {
        let raw = fs::read_to_string(&self.path).map_err(|err| {
            MwError::transport(self.path.display().to_string(), err.to_string())
        })?;
        tracing::trace!(path = %self.path.display(), end_ms = window.end_ms, "read accounting table");
        parse_qtaguid_stats(&raw, &self.interface_prefixes)
    }
}

/// Parse the qtaguid table, keeping untagged traffic on matching interfaces.
///
/// An empty prefix list keeps every interface.
pub fn parse_qtaguid_stats(raw: &str, interface_prefixes: &[String]) -> Result<Vec<UidSample>> {
    let mut lines = raw.lines();
    let header = lines.next().ok_or_else(|| MwError::transport("xt_qtaguid", "empty table"))?;
    let columns: Vec<&str> = header.split_whitespace().collect();
    let column = |name: &str| {
        columns
            .iter()
            .position(|col| *col == name)
            .ok_or_else(|| MwError::StatsParse {
                details: format!("header missing column {name}"),
            })
    };
    let iface_col = column("iface")?;
    let tag_col = column("acct_tag_hex")?;
    let uid_col = column("uid_tag_int")?;
    let rx_col = column("rx_bytes")?;
    let tx_col = column("tx_bytes")?;

    let mut per_uid: BTreeMap<i32, (u64, u64)> = BTreeMap::new();
    for (line_no, line) in lines.enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        let parsed = (|| {
            let iface = *fields.get(iface_col)?;
            let tag = *fields.get(tag_col)?;
            let uid = fields.get(uid_col)?.parse::<i32>().ok()?;
            let rx = fields.get(rx_col)?.parse::<u64>().ok()?;
            let tx = fields.get(tx_col)?.parse::<u64>().ok()?;
            Some((iface, tag, uid, rx, tx))
        })();
        let Some((iface, tag, uid, rx, tx)) = parsed else {
            tracing::warn!(line = line_no + 2, "skipping malformed accounting row");
            continue;
        };
        if tag != "0x0" {
            continue;
        }
        if !interface_prefixes.is_empty()
            && !interface_prefixes
                .iter()
                .any(|prefix| iface.starts_with(prefix.as_str()))
        {
            continue;
        }
        let entry = per_uid.entry(uid).or_insert((0, 0));
        entry.0 = entry.0.saturating_add(rx);
        entry.1 = entry.1.saturating_add(tx);
    }

    Ok(per_uid
        .into_iter()
        .map(|(uid, (rx, tx))| UidSample::new(uid, rx, tx))
        .collect())
}

// ──────────────────── labels ────────────────────

/// Resolves labels from `packages.list` (`name app_uid ...` per line).
#[derive(Debug, Clone)]
pub struct PackagesListResolver {
    path: PathBuf,
}

impl PackagesListResolver {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl LabelResolver for PackagesListResolver {
    fn resolve_label(&self, uid: i32) -> String {
        if !uid::is_app(uid) {
            return String::new();
        }
        match fs::read_to_string(&self.path) {
            Ok(raw) => lookup_package(&raw, uid::app_id(uid)).unwrap_or_default(),
            Err(err) => {
                tracing::debug!(path = %self.path.display(), error = %err, "package list unreadable");
                String::new()
            }
        }
    }
}

/// First package registered under `app_id`.
#[must_use]
pub fn lookup_package(raw: &str, app_id: i32) -> Option<String> {
    raw.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let name = fields.next()?;
        let owner = fields.next()?.parse::<i32>().ok()?;
        (uid::app_id(owner) == app_id).then(|| name.to_string())
    })
}

// ──────────────────── link state ────────────────────

/// Metered when any interface with a configured prefix reports `operstate == up`.
#[derive(Debug, Clone)]
pub struct SysfsNetworkState {
    net_dir: PathBuf,
    prefixes: Vec<String>,
}

impl SysfsNetworkState {
    #[must_use]
    pub fn new(net_dir: PathBuf, prefixes: Vec<String>) -> Self {
        Self { net_dir, prefixes }
    }

    fn interface_up(dir: &Path) -> bool {
        fs::read_to_string(dir.join("operstate")).is_ok_and(|state| state.trim() == "up")
    }
}

impl NetworkState for SysfsNetworkState {
    fn is_metered_connection(&self) -> bool {
        let Ok(entries) = fs::read_dir(&self.net_dir) else {
            tracing::debug!(dir = %self.net_dir.display(), "network directory unreadable");
            return false;
        };
        entries.filter_map(std::result::Result::ok).any(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            self.prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
                && Self::interface_up(&entry.path())
        })
    }
}

// ──────────────────── policy ────────────────────

/// Runs an operator-provided command to cut a uid off metered data.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    argv: Vec<String>,
}

impl CommandPolicy {
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    /// Argument vector with `{uid}` substituted.
    #[must_use]
    pub fn render(&self, uid: i32) -> Vec<String> {
        let uid = uid.to_string();
        self.argv
            .iter()
            .map(|arg| arg.replace("{uid}", &uid))
            .collect()
    }
}

impl NetworkPolicy for CommandPolicy {
    fn restrict(&self, uid: i32) -> Result<()> {
        let argv = self.render(uid);
        let Some((program, args)) = argv.split_first() else {
            return Err(MwError::PolicyRejected {
                uid,
                reason: "policy.restrict_command is not configured".to_string(),
            });
        };
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|err| MwError::io(program, err))?;
        if status.success() {
            Ok(())
        } else {
            Err(MwError::PolicyRejected {
                uid,
                reason: format!("{program} exited with {status}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
idx iface acct_tag_hex uid_tag_int cnt_set rx_bytes rx_packets tx_bytes tx_packets
2 rmnet0 0x0 10057 0 1000 10 200 2
3 rmnet0 0x0 10057 1 500 5 300 3
4 rmnet0 0x3e800000000 10057 0 9999 9 9999 9
5 wlan0 0x0 10057 0 7777 7 7777 7
6 rmnet0 0x0 1010057 0 40 1 60 1
7 rmnet0 garbage
";

    fn mobile() -> Vec<String> {
        vec!["rmnet".to_string()]
    }

    #[test]
    fn parses_untagged_metered_rows() {
        let samples = parse_qtaguid_stats(TABLE, &mobile()).unwrap();
        assert_eq!(
            samples,
            vec![
                UidSample::new(10_057, 1_500, 500),
                UidSample::new(1_010_057, 40, 60),
            ]
        );
    }

    #[test]
    fn empty_prefix_list_keeps_all_interfaces() {
        let samples = parse_qtaguid_stats(TABLE, &[]).unwrap();
        let app = samples.iter().find(|s| s.uid == 10_057).unwrap();
        assert_eq!(app.rx_bytes, 1_500 + 7_777);
    }

    #[test]
    fn empty_table_is_transport_error() {
        let err = parse_qtaguid_stats("", &mobile()).unwrap_err();
        assert_eq!(err.code(), "MW-2001");
    }

    #[test]
    fn missing_column_is_parse_error() {
        let err = parse_qtaguid_stats("idx iface uid_tag_int\n", &mobile()).unwrap_err();
        assert_eq!(err.code(), "MW-2002");
    }

    #[test]
    fn unreadable_table_fails_fetch() {
        let source = QtaguidUsageSource::new(PathBuf::from("/nonexistent/qtaguid"), mobile());
        let err = source.fetch_samples(SampleWindow::until_now()).unwrap_err();
        assert!(matches!(err, MwError::Transport { .. }));
    }

    #[test]
    fn package_lookup_uses_app_id() {
        let raw = "com.example.mail 10057 0 /data/data/com.example.mail\n\
                   com.example.maps 10058 0 /data/data/com.example.maps\n";
        assert_eq!(lookup_package(raw, 10_058).as_deref(), Some("com.example.maps"));
        assert_eq!(lookup_package(raw, 10_099), None);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packages.list");
        fs::write(&path, raw).unwrap();
        let resolver = PackagesListResolver::new(path);
        assert_eq!(resolver.resolve_label(1_010_057), "com.example.mail");
        assert_eq!(resolver.resolve_label(1_000), "");
    }

    #[test]
    fn missing_package_list_degrades_to_empty_label() {
        let resolver = PackagesListResolver::new(PathBuf::from("/nonexistent/packages.list"));
        assert_eq!(resolver.resolve_label(10_057), "");
    }

    #[test]
    fn sysfs_state_reads_operstate() {
        let dir = tempfile::tempdir().unwrap();
        for (name, state) in [("rmnet0", "down"), ("wlan0", "up")] {
            let iface = dir.path().join(name);
            fs::create_dir_all(&iface).unwrap();
            fs::write(iface.join("operstate"), format!("{state}\n")).unwrap();
        }
        let state = SysfsNetworkState::new(dir.path().to_path_buf(), mobile());
        assert!(!state.is_metered_connection());

        fs::write(dir.path().join("rmnet0").join("operstate"), "up\n").unwrap();
        assert!(state.is_metered_connection());
    }

    #[test]
    fn command_policy_substitutes_uid() {
        let policy = CommandPolicy::new(vec![
            "iptables".to_string(),
            "--uid-owner".to_string(),
            "{uid}".to_string(),
        ]);
        assert_eq!(policy.render(10_057), vec!["iptables", "--uid-owner", "10057"]);
    }

    #[test]
    fn unconfigured_policy_rejects() {
        let err = CommandPolicy::new(Vec::new()).restrict(10_057).unwrap_err();
        assert!(matches!(err, MwError::PolicyRejected { uid: 10_057, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn failing_policy_command_rejects() {
        let err = CommandPolicy::new(vec!["false".to_string()])
            .restrict(10_057)
            .unwrap_err();
        assert_eq!(err.code(), "MW-2201");
        assert!(CommandPolicy::new(vec!["true".to_string()]).restrict(10_057).is_ok());
    }
}
