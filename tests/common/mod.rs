#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    /// Parse the last stdout line as JSON.
    pub fn json(&self) -> serde_json::Value {
        let line = self.stdout.lines().last().unwrap_or_default();
        serde_json::from_str(line).unwrap_or_else(|err| {
            panic!(
                "stdout is not JSON ({err}): {:?}; log: {}",
                self.stdout,
                self.log_path.display()
            )
        })
    }
}

/// Scratch directory with a config file whose paths all point inside it.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub config_path: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let root = dir.path();
        fs::create_dir_all(root.join("net")).expect("create net dir");
        fs::write(
            root.join("packages.list"),
            "com.example.mail 10057 0 /data/user/0/com.example.mail default 3003\n\
             com.example.maps 10058 0 /data/user/0/com.example.maps default 3003\n",
        )
        .expect("write packages.list");

        let config_path = root.join("meterwatch.toml");
        let config = format!(
            r#"[detection]
min_slow_samples = 3
min_fast_samples = 1
max_idle_bytes = 100

[sampling]
stats_path = "{stats}"
require_metered = false
sysfs_net_dir = "{net}"

[labels]
packages_list = "{packages}"

[policy]
restrict_command = ["true", "{{uid}}"]

[paths]
sqlite_db = "{db}"
jsonl_log = "{log}"

[notifications]
enabled = false
"#,
            stats = root.join("stats").display(),
            net = root.join("net").display(),
            packages = root.join("packages.list").display(),
            db = root.join("usage.sqlite3").display(),
            log = root.join("activity.jsonl").display(),
        );
        fs::write(&config_path, config).expect("write config");
        Self { dir, config_path }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Replace the accounting table with one untagged rmnet row per uid.
    pub fn write_stats(&self, rows: &[(i32, u64, u64)]) {
        let mut table =
            String::from("idx iface acct_tag_hex uid_tag_int cnt_set rx_bytes rx_packets tx_bytes tx_packets\n");
        for (idx, (uid, rx, tx)) in rows.iter().enumerate() {
            table.push_str(&format!("{} rmnet0 0x0 {uid} 0 {rx} 1 {tx} 1\n", idx + 2));
        }
        fs::write(self.path("stats"), table).expect("write stats");
    }

    /// Run the CLI against this environment's config in JSON mode.
    pub fn run(&self, case_name: &str, args: &[&str]) -> CmdResult {
        let mut full = vec!["--config", path_str(&self.config_path), "--json"];
        full.extend_from_slice(args);
        run_cli_case(case_name, &full)
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 temp path")
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_meterwatch") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) {
        "meterwatch.exe"
    } else {
        "meterwatch"
    };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve meterwatch binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("meterwatch-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env("MW_LOG", "meterwatch=debug")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute meterwatch command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}
