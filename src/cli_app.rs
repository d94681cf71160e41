//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use meterwatch::core::config::Config;
use meterwatch::core::errors::MwError;
use meterwatch::daemon::actions::{
    self, PackageEffect, PackageEvent, ServiceGate, UserAction,
};
use meterwatch::daemon::cycle::{CycleOrchestrator, CycleReport};
use meterwatch::daemon::loop_main::{DaemonArgs as LoopArgs, SamplingDaemon};
use meterwatch::daemon::notifications::NotificationManager;
use meterwatch::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
use meterwatch::monitor::detector::exceed_percentage;
use meterwatch::platform::linux;
use meterwatch::platform::pal::SampleWindow;
use meterwatch::store::usage::{TrackedApp, UsageStore};

/// meterwatch: flags apps whose metered data usage jumps above their own baseline.
#[derive(Debug, Parser)]
#[command(
    name = "meterwatch",
    author,
    version,
    about = "Per-app mobile data anomaly detector",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the sampling daemon.
    Daemon(DaemonArgs),
    /// Run a single sampling cycle now.
    Cycle(CycleArgs),
    /// Inspect and edit tracked applications.
    Apps(AppsArgs),
    /// Apply a package lifecycle event (added, changed, replaced, removed, fully-removed).
    Package(PackageArgs),
    /// Dismiss the current alert for a uid.
    Ack(UidArg),
    /// Stop monitoring a uid.
    Suppress(UidArg),
    /// Block a uid's metered data via the configured policy command.
    Restrict(UidArg),
    /// Service-wide sampling switch.
    Service(ServiceArgs),
    /// Show, locate or validate configuration.
    Config(ConfigArgs),
    /// Print version information.
    Version(VersionArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct DaemonArgs {
    /// Sample right away instead of waiting for sampling.start_delay_secs.
    #[arg(long)]
    no_start_delay: bool,
    /// Exit after this many ticks.
    #[arg(long, value_name = "N")]
    max_ticks: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct CycleArgs {
    /// Skip the cycle unless the service is enabled and the link is metered.
    #[arg(long)]
    respect_gate: bool,
}

#[derive(Debug, Clone, Args)]
struct AppsArgs {
    #[command(subcommand)]
    command: AppsCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum AppsCommand {
    /// List tracked applications.
    List {
        /// Only rows with detection enabled.
        #[arg(long)]
        enabled: bool,
    },
    /// Show one tracked application.
    Show(UidArg),
    /// Start tracking a uid (detection stays disabled).
    Add {
        uid: i32,
        #[arg(long)]
        label: Option<String>,
    },
    /// Stop tracking a uid and drop its history.
    Remove(UidArg),
    /// Enable detection for a uid.
    Enable {
        uid: i32,
        #[arg(long)]
        label: Option<String>,
    },
    /// Disable detection for a uid.
    Disable(UidArg),
}

#[derive(Debug, Clone, Args)]
struct PackageArgs {
    event: PackageEvent,
    uid: i32,
}

#[derive(Debug, Clone, Args)]
struct UidArg {
    /// Application uid.
    uid: i32,
}

#[derive(Debug, Clone, Args)]
struct ServiceArgs {
    #[command(subcommand)]
    command: ServiceCommand,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum ServiceCommand {
    Enable,
    Disable,
    /// Show the flag and the current link qualification.
    Status,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum ConfigCommand {
    /// Print the config file path.
    Path,
    /// Print the effective configuration.
    Show,
    /// Validate the configuration.
    Validate,
}

#[derive(Debug, Clone, Args)]
struct VersionArgs {
    /// Include build details.
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

impl From<MwError> for CliError {
    fn from(err: MwError) -> Self {
        match err {
            MwError::InvalidUid { .. }
            | MwError::InvalidConfig { .. }
            | MwError::MissingConfig { .. }
            | MwError::ConfigParse { .. } => Self::User(err.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// Dispatch a parsed command line.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }
    init_tracing(cli);

    match &cli.command {
        Command::Daemon(args) => run_daemon(cli, args),
        Command::Cycle(args) => run_cycle(cli, args),
        Command::Apps(args) => run_apps(cli, args),
        Command::Package(args) => run_package(cli, args),
        Command::Ack(arg) => run_user_action(cli, UserAction::Acknowledge, arg.uid),
        Command::Suppress(arg) => run_user_action(cli, UserAction::Suppress, arg.uid),
        Command::Restrict(arg) => run_user_action(cli, UserAction::Restrict, arg.uid),
        Command::Service(args) => run_service(cli, args.command),
        Command::Config(args) => run_config(cli, args.command.unwrap_or(ConfigCommand::Path)),
        Command::Version(args) => emit_version(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose {
        "meterwatch=debug"
    } else if cli.quiet {
        "error"
    } else {
        "meterwatch=info"
    };
    let filter = std::env::var("MW_LOG")
        .ok()
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(!cli.no_color && io::stderr().is_terminal())
        .try_init();
}

// ──────────────────── shared plumbing ────────────────────

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

fn open_store(config: &Config) -> Result<UsageStore, CliError> {
    Ok(UsageStore::open(&config.paths.sqlite_db)?)
}

fn activity_log(config: &Config) -> JsonlWriter {
    JsonlWriter::open(JsonlConfig::at(&config.paths.jsonl_log))
}

fn app_json(app: &TrackedApp) -> Value {
    json!({
        "uid": app.uid,
        "label": app.label,
        "enabled": app.enabled,
        "alert_active": app.alert_active,
        "total_bytes": app.total_bytes,
        "slow_avg": app.slow_avg,
        "slow_samples": app.slow_samples,
        "fast_avg": app.fast_avg,
        "fast_samples": app.fast_samples,
    })
}

fn print_app_row(app: &TrackedApp) {
    let state = match (app.enabled, app.alert_active) {
        (true, true) => "ALERT".red().bold().to_string(),
        (true, false) => "watching".green().to_string(),
        (false, _) => "off".dimmed().to_string(),
    };
    println!(
        "  {:>8}  {:<28}  {:<10}  {:>12}  {:>12}  {:>5}",
        app.uid,
        truncate(&app.label, 28),
        state,
        app.slow_avg,
        app.fast_avg,
        app.slow_samples
    );
}

fn truncate(label: &str, width: usize) -> String {
    if label.chars().count() <= width {
        label.to_string()
    } else {
        let mut short: String = label.chars().take(width.saturating_sub(1)).collect();
        short.push('~');
        short
    }
}

// ──────────────────── daemon / cycle ────────────────────

fn run_daemon(cli: &Cli, args: &DaemonArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let loop_args = LoopArgs {
        skip_start_delay: args.no_start_delay,
        max_ticks: args.max_ticks,
    };
    let mut daemon = SamplingDaemon::init(config, loop_args)?;
    daemon.run()?;
    Ok(())
}

fn run_cycle(cli: &Cli, args: &CycleArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = Arc::new(open_store(&config)?);
    let collaborators = linux::collaborators(&config);

    if args.respect_gate {
        let gate = ServiceGate::new(
            Arc::clone(&store),
            Arc::clone(&collaborators.network),
            config.sampling.require_metered,
        );
        let status = gate.status()?;
        if !status.is_open() {
            match output_mode(cli) {
                OutputMode::Human => println!("Sampling gate closed; cycle skipped."),
                OutputMode::Json => write_json_line(&json!({
                    "command": "cycle",
                    "skipped": true,
                    "gate": status,
                }))?,
            }
            return Ok(());
        }
    }

    let sink = Arc::new(NotificationManager::from_config(&config.notifications));
    let orchestrator = CycleOrchestrator::new(
        Arc::clone(&store),
        &collaborators,
        sink,
        config.detection.clone(),
    );
    let mut activity = activity_log(&config);
    let report = match orchestrator.run_cycle(SampleWindow::until_now()) {
        Ok(report) => report,
        Err(err) => {
            activity.write_entry(&LogEntry::from_error(EventType::CycleAborted, &err));
            return Err(err.into());
        }
    };
    let mut summary = LogEntry::new(EventType::CycleComplete, Severity::Info);
    summary.evaluated = Some(report.rows.len());
    summary.alerts = Some(report.alerts.len());
    activity.write_entry(&summary);

    emit_cycle_report(cli, &report)
}

fn emit_cycle_report(cli: &Cli, report: &CycleReport) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            println!(
                "Cycle complete: {} samples, {} rows evaluated, {} untouched, {} alerts",
                report.samples,
                report.rows.len(),
                report.untouched,
                report.alerts.len()
            );
            for alert in &report.alerts {
                let marker = if alert.first_time { "NEW" } else { "ONGOING" };
                println!(
                    "  {} uid {} {}",
                    marker.red().bold(),
                    alert.uid,
                    if alert.label.is_empty() { "-" } else { alert.label.as_str() }
                );
            }
            for uid in &report.cleared {
                println!("  {} uid {uid}", "CLEARED".green());
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": "cycle",
                "skipped": false,
                "report": report,
            }))?;
        }
    }
    Ok(())
}

// ──────────────────── apps ────────────────────

fn run_apps(cli: &Cli, args: &AppsArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let mut activity = activity_log(&config);

    match &args.command {
        AppsCommand::List { enabled } => {
            let apps = if *enabled {
                store.list_enabled()?
            } else {
                store.list_all()?
            };
            match output_mode(cli) {
                OutputMode::Human => {
                    println!(
                        "  {:>8}  {:<28}  {:<10}  {:>12}  {:>12}  {:>5}",
                        "UID", "LABEL", "STATE", "SLOW AVG", "FAST AVG", "N"
                    );
                    println!("  {}", "-".repeat(84));
                    for app in &apps {
                        print_app_row(app);
                    }
                    if apps.is_empty() {
                        println!("  (no tracked applications)");
                    }
                }
                OutputMode::Json => {
                    let rows: Vec<Value> = apps.iter().map(app_json).collect();
                    write_json_line(&json!({ "command": "apps list", "apps": rows }))?;
                }
            }
            Ok(())
        }
        AppsCommand::Show(arg) => {
            let app = store
                .get(arg.uid)?
                .ok_or_else(|| CliError::User(format!("uid {} is not tracked", arg.uid)))?;
            match output_mode(cli) {
                OutputMode::Human => {
                    println!("uid {} ({})", app.uid, app.label);
                    println!("  enabled:      {}", app.enabled);
                    println!("  alert active: {}", app.alert_active);
                    println!("  total bytes:  {}", app.total_bytes);
                    println!("  slow avg:     {} ({} samples)", app.slow_avg, app.slow_samples);
                    println!("  fast avg:     {} ({} samples)", app.fast_avg, app.fast_samples);
                    println!(
                        "  fast vs slow: {:+.1}%",
                        exceed_percentage(app.slow_avg, app.fast_avg)
                    );
                    if !app.extra.is_empty() {
                        println!("  diagnostics:  {}", app.extra);
                    }
                }
                OutputMode::Json => {
                    let mut value = app_json(&app);
                    value["extra"] = Value::String(app.extra.clone());
                    write_json_line(&json!({ "command": "apps show", "app": value }))?;
                }
            }
            Ok(())
        }
        AppsCommand::Add { uid, label } => {
            let label = label.clone().unwrap_or_default();
            store.add_app(*uid, &label)?;
            let mut entry = LogEntry::for_uid(EventType::AppAdded, *uid);
            entry.label = Some(label);
            activity.write_entry(&entry);
            emit_ack(cli, "apps add", *uid)
        }
        AppsCommand::Remove(arg) => {
            let existed = store.remove(arg.uid)?;
            activity.write_entry(&LogEntry::for_uid(EventType::AppRemoved, arg.uid));
            if !existed {
                tracing::info!(uid = arg.uid, "uid was not tracked");
            }
            emit_ack(cli, "apps remove", arg.uid)
        }
        AppsCommand::Enable { uid, label } => {
            store.set_enabled(*uid, true, label.as_deref())?;
            activity.write_entry(&LogEntry::for_uid(EventType::AppEnabled, *uid));
            emit_ack(cli, "apps enable", *uid)
        }
        AppsCommand::Disable(arg) => {
            store.set_enabled(arg.uid, false, None)?;
            activity.write_entry(&LogEntry::for_uid(EventType::AppDisabled, arg.uid));
            emit_ack(cli, "apps disable", arg.uid)
        }
    }
}

fn emit_ack(cli: &Cli, command: &str, uid: i32) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => println!("{command}: ok (uid {uid})"),
        OutputMode::Json => write_json_line(&json!({ "command": command, "uid": uid, "ok": true }))?,
    }
    Ok(())
}

// ──────────────────── package / user actions ────────────────────

fn run_package(cli: &Cli, args: &PackageArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let collaborators = linux::collaborators(&config);

    let effect = actions::handle_package_event(
        &store,
        collaborators.labels.as_ref(),
        args.event,
        args.uid,
    )?;

    let mut activity = activity_log(&config);
    match &effect {
        PackageEffect::Tracked { label } => {
            let mut entry = LogEntry::for_uid(EventType::AppAdded, args.uid);
            entry.label = Some(label.clone());
            activity.write_entry(&entry);
        }
        PackageEffect::Untracked { .. } => {
            activity.write_entry(&LogEntry::for_uid(EventType::AppRemoved, args.uid));
        }
        PackageEffect::Unchanged => {}
    }

    match output_mode(cli) {
        OutputMode::Human => println!("package {:?} uid {}: {:?}", args.event, args.uid, effect),
        OutputMode::Json => write_json_line(&json!({
            "command": "package",
            "event": args.event,
            "uid": args.uid,
            "result": effect,
        }))?,
    }
    Ok(())
}

fn run_user_action(cli: &Cli, action: UserAction, uid: i32) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = open_store(&config)?;
    let collaborators = linux::collaborators(&config);

    actions::apply_user_action(&store, collaborators.policy.as_ref(), action, uid)?;
    activity_log(&config).write_entry(
        &LogEntry::for_uid(EventType::UserAction, uid).with_details(action.to_string()),
    );
    emit_ack(cli, &action.to_string(), uid)
}

// ──────────────────── service ────────────────────

fn run_service(cli: &Cli, command: ServiceCommand) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let store = Arc::new(open_store(&config)?);
    let collaborators = linux::collaborators(&config);
    let gate = ServiceGate::new(
        store,
        collaborators.network,
        config.sampling.require_metered,
    );

    match command {
        ServiceCommand::Enable => gate.set_enabled(true)?,
        ServiceCommand::Disable => gate.set_enabled(false)?,
        ServiceCommand::Status => {}
    }
    let status = gate.status()?;

    match output_mode(cli) {
        OutputMode::Human => {
            let flag = if status.service_enabled {
                "enabled".green()
            } else {
                "disabled".yellow()
            };
            println!("Service: {flag}");
            println!(
                "  Metered link: {}{}",
                if status.metered { "up" } else { "down" },
                if status.require_metered { "" } else { " (not required)" }
            );
            println!("  Sampling: {}", if status.is_open() { "active" } else { "paused" });
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "service",
            "status": status,
            "sampling": status.is_open(),
        }))?,
    }
    Ok(())
}

// ──────────────────── config / version ────────────────────

fn run_config(cli: &Cli, command: ConfigCommand) -> Result<(), CliError> {
    match command {
        ConfigCommand::Path => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();
            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "config path",
                    "path": path.to_string_lossy(),
                    "exists": exists,
                }))?,
            }
            Ok(())
        }
        ConfigCommand::Show => {
            let config = load_config(cli)?;
            match output_mode(cli) {
                OutputMode::Human => {
                    let raw = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{raw}");
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "config show",
                    "config": serde_json::to_value(&config)?,
                }))?,
            }
            Ok(())
        }
        ConfigCommand::Validate => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => write_json_line(&json!({
                        "command": "config validate",
                        "valid": true,
                        "path": config.paths.config_file.to_string_lossy(),
                        "hash": hash,
                    }))?,
                }
                Ok(())
            }
            Err(err) => {
                if output_mode(cli) == OutputMode::Json {
                    write_json_line(&json!({
                        "command": "config validate",
                        "valid": false,
                        "code": err.code(),
                        "error": err.to_string(),
                    }))?;
                }
                Err(err.into())
            }
        },
    }
}

fn emit_version(cli: &Cli, args: &VersionArgs) -> Result<(), CliError> {
    let version = env!("CARGO_PKG_VERSION");
    let package = env!("CARGO_PKG_NAME");
    let profile = if cfg!(debug_assertions) { "debug" } else { "release" };

    match output_mode(cli) {
        OutputMode::Human => {
            println!("meterwatch {version}");
            if args.verbose {
                println!("package: {package}");
                println!("profile: {profile}");
                println!("os: {}", std::env::consts::OS);
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "binary": "meterwatch",
            "version": version,
            "package": package,
            "build": { "profile": profile, "os": std::env::consts::OS },
        }))?,
    }
    Ok(())
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("MW_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }
    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };
    match env_mode.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_before_and_after_subcommand() {
        let before = Cli::try_parse_from([
            "meterwatch",
            "--config",
            "/tmp/mw.toml",
            "--json",
            "--no-color",
            "-v",
            "apps",
            "list",
        ]);
        assert!(before.is_ok());

        let after = Cli::try_parse_from(["meterwatch", "service", "status", "--json", "-q"]);
        assert!(after.is_ok());
    }

    #[test]
    fn parses_every_subcommand() {
        let cases = [
            vec!["meterwatch", "daemon", "--no-start-delay", "--max-ticks", "3"],
            vec!["meterwatch", "cycle", "--respect-gate"],
            vec!["meterwatch", "apps", "list", "--enabled"],
            vec!["meterwatch", "apps", "show", "10057"],
            vec!["meterwatch", "apps", "add", "10057", "--label", "Mail"],
            vec!["meterwatch", "apps", "remove", "10057"],
            vec!["meterwatch", "apps", "enable", "10057"],
            vec!["meterwatch", "apps", "disable", "10057"],
            vec!["meterwatch", "package", "fully-removed", "10057"],
            vec!["meterwatch", "ack", "10057"],
            vec!["meterwatch", "suppress", "10057"],
            vec!["meterwatch", "restrict", "10057"],
            vec!["meterwatch", "service", "enable"],
            vec!["meterwatch", "config", "validate"],
            vec!["meterwatch", "version", "--verbose"],
            vec!["meterwatch", "completions", "bash"],
        ];
        for case in cases {
            assert!(Cli::try_parse_from(&case).is_ok(), "failed to parse {case:?}");
        }
    }

    #[test]
    fn rejects_unknown_package_event() {
        assert!(Cli::try_parse_from(["meterwatch", "package", "upgraded", "10057"]).is_err());
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["meterwatch", "-v", "-q", "version"]).is_err());
    }

    #[test]
    fn output_mode_resolution_honors_precedence() {
        assert_eq!(resolve_output_mode(true, Some("human"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("json"), true), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some("human"), false), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, Some("auto"), true), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, None, false), OutputMode::Json);
    }

    #[test]
    fn user_errors_map_to_exit_code_one() {
        let err: CliError = MwError::InvalidUid {
            uid: 0,
            reason: "uid must be positive",
        }
        .into();
        assert_eq!(err.exit_code(), 1);
        let err: CliError = MwError::transport("xt_qtaguid", "gone").into();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn long_labels_are_truncated() {
        assert_eq!(truncate("Mail", 8), "Mail");
        assert_eq!(truncate("com.example.verylong", 8), "com.exa~");
    }
}
