mod apt;
mod capability;
mod config;
mod error;
mod exec;
#[cfg(test)]
mod fake;
mod identity;
mod provision;
mod runner;
mod runtime;
mod session_log;
mod ui;

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use crate::apt::SystemClock;
use crate::config::{
    ensure_parent, expand_path, load_config, read_config_from_str, resolve_config_path, Config,
    DEFAULT_CONFIG_YAML,
};
use crate::error::ProvisionError;
use crate::exec::SystemExecutor;
use crate::identity::InvocationEnv;
use crate::provision::{
    ProvisionOptions, ProvisionOutcome, ProvisionSummary, Provisioner, StatusReport,
    TerminalConfirmer,
};
use crate::session_log::SessionLog;
use crate::ui::Ui;

const LOG_FILTER_ENV: &str = "WEBVERSE_PROVISION_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "webverse-provision",
    version,
    about = "Prepare a Debian/Ubuntu host for WebVerse"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install packages, reconcile the container runtime and open low ports.
    Provision {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Report the observed state without changing anything.
    Status,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<FailureDetails>,
}

#[derive(Debug, Clone, Serialize)]
struct FailureDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_step: Option<String>,
    session_log: String,
    log_tail: Vec<String>,
}

struct Context {
    config_path: PathBuf,
    json: bool,
    ui: Ui,
}

fn main() -> Result<(), ProvisionError> {
    let cli = Cli::parse();
    let ctx = Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
        ui: Ui::new(cli.json),
    };

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Provision { dry_run, yes } => handle_provision(&ctx, dry_run, yes),
        Commands::Status => handle_status(&ctx),
    };

    if let Err(failure) = result {
        report_failure(&ctx, &failure)?;
        std::process::exit(1);
    }
    Ok(())
}

/// A fatal error plus the session log it was recorded in, when one exists.
struct Failure {
    error: ProvisionError,
    details: Option<FailureDetails>,
}

impl From<ProvisionError> for Failure {
    fn from(error: ProvisionError) -> Self {
        Self {
            error,
            details: None,
        }
    }
}

impl Failure {
    fn logged(error: ProvisionError, log: &SessionLog, tail_lines: usize) -> Self {
        let failed_step = error.failed_step().map(str::to_string);
        log.append_line(&format!("FATAL: {error}"));
        Self {
            details: Some(FailureDetails {
                failed_step,
                session_log: log.path().display().to_string(),
                log_tail: log.tail(tail_lines),
            }),
            error,
        }
    }
}

fn report_failure(ctx: &Context, failure: &Failure) -> Result<(), ProvisionError> {
    if ctx.json {
        let payload = JsonResult::<serde_json::Value> {
            ok: false,
            result: None,
            error: Some(failure.error.to_string()),
            error_details: failure.details.clone(),
        };
        return print_json(&payload);
    }
    let Some(details) = &failure.details else {
        eprintln!("{}", failure.error);
        return Ok(());
    };
    if let Some(step) = &details.failed_step {
        ctx.ui.fail(step);
    }
    ctx.ui.fail(&failure.error.to_string());
    ctx.ui
        .raw_err(&format!("---- last {} log lines ----", details.log_tail.len()));
    for line in &details.log_tail {
        ctx.ui.raw_err(line);
    }
    ctx.ui.raw_err("----");
    ctx.ui
        .raw_err(&format!("full log: {}", details.session_log));
    Ok(())
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), Failure> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML).map_err(ProvisionError::from)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let content = fs::read_to_string(&ctx.config_path).map_err(|err| {
                ProvisionError::Config(format!(
                    "cannot read {}: {err}",
                    ctx.config_path.display()
                ))
            })?;
            read_config_from_str(&content)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let cfg = load_config(&ctx.config_path)?;
            if ctx.json {
                output(ctx, serde_json::to_value(&cfg).map_err(ProvisionError::from)?)
            } else {
                print!("{}", serde_yaml::to_string(&cfg).map_err(ProvisionError::from)?);
                Ok(())
            }
        }
    }
}

/// Opens this run's session log and points tracing at it.
fn open_session(cfg: &Config) -> Result<SessionLog, ProvisionError> {
    let log = SessionLog::create(&expand_path(&cfg.session_log.dir))?;
    let writer = log.try_clone_file()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(Mutex::new(writer))
        .with_ansi(false)
        .with_target(false)
        .init();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "session started");
    Ok(log)
}

fn handle_provision(ctx: &Context, dry_run: bool, yes: bool) -> Result<(), Failure> {
    let cfg = load_config(&ctx.config_path)?;
    let log = open_session(&cfg)?;
    if !ctx.json {
        ctx.ui.note(&format!("session log: {}", log.path().display()));
    }
    let executor = SystemExecutor;
    let clock = SystemClock;
    let confirmer = TerminalConfirmer {
        assume_yes: yes,
        json: ctx.json,
    };
    let outcome = Provisioner::new(&executor, &clock, &cfg, &log, &ctx.ui)
        .run(
            &InvocationEnv::from_process(),
            ProvisionOptions { dry_run },
            &confirmer,
        )
        .map_err(|err| Failure::logged(err, &log, cfg.session_log.tail_lines))?;

    if ctx.json {
        return output(ctx, serde_json::to_value(&outcome).map_err(ProvisionError::from)?);
    }
    match &outcome {
        ProvisionOutcome::Applied(summary) => print_summary(ctx, summary),
        ProvisionOutcome::Planned(_) => ctx.ui.ok("dry run complete; nothing was changed"),
    }
    Ok(())
}

fn print_summary(ctx: &Context, summary: &ProvisionSummary) {
    ctx.ui.ok(&format!("{} is ready for WebVerse", summary.target_user));
    if !summary.deferred_steps.is_empty() {
        println!("Next steps:");
        for step in &summary.deferred_steps {
            println!("  - {step}");
        }
    }
    ctx.ui.note(&format!("session log: {}", summary.session_log));
}

fn handle_status(ctx: &Context) -> Result<(), Failure> {
    let cfg = load_config(&ctx.config_path)?;
    let log = open_session(&cfg)?;
    let executor = SystemExecutor;
    let clock = SystemClock;
    let report = Provisioner::new(&executor, &clock, &cfg, &log, &ctx.ui)
        .status(&InvocationEnv::from_process())
        .map_err(|err| Failure::logged(err, &log, cfg.session_log.tail_lines))?;
    if ctx.json {
        return output(ctx, serde_json::to_value(&report).map_err(ProvisionError::from)?);
    }
    print_status(&report);
    Ok(())
}

fn print_status(report: &StatusReport) {
    println!("target user:   {} ({})", report.target_user, report.target_home);
    println!("runtime:       {}", report.runtime_state);
    if !report.runtime_version.is_empty() {
        println!("version:       {}", report.runtime_version);
    }
    println!("group member:  {}", report.group_member);
    match &report.capability.executable {
        Some(executable) => println!(
            "capability:    {} on {executable}",
            if report.capability.present { "present" } else { "missing" }
        ),
        None => println!("capability:    executable not found"),
    }
    println!("port fallback: {}", report.capability.fallback_active);
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), Failure> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), ProvisionError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
