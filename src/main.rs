mod command;
mod config;
mod dispatch;
mod distro;
mod exec;
mod protocol;
mod tool_registry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{ConfigResolver, FileConfig, RuntimeConfig};
use dispatch::ToolDispatcher;
use distro::{BridgeListing, DistributionDetector, EnvironmentInfo};
use exec::ExecutionEngine;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(
    author,
    version,
    about = "Tool gateway that runs bash inside a WSL Linux environment"
)]
struct Cli {
    /// Path to the JSON (or .toml) config file.
    #[arg(
        long,
        global = true,
        env = "LINUX_BASH_CONFIG",
        default_value = "config.json"
    )]
    config: PathBuf,

    /// Bridge binary used to list and enter Linux environments.
    #[arg(long, global = true, env = "LINUX_BASH_BRIDGE", default_value = "wsl")]
    bridge: String,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "LINUX_BASH_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Serve tool calls as JSON-RPC over stdin/stdout.
    Serve,
    /// Run non-interactive diagnostics.
    Doctor(DoctorArgs),
    /// Dispatch a single tool call and print the response envelope.
    Call(CallArgs),
    /// List the available tools.
    Tools(ToolsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct CallArgs {
    /// Tool name, e.g. execute-command.
    tool: String,
    /// Tool arguments as a JSON object.
    #[arg(long, default_value = "{}")]
    args: String,
}

#[derive(Debug, Clone, Args, Default)]
struct ToolsArgs {
    /// Emit the full tool descriptors as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Serve);
    match command {
        CliCommand::Serve => run_server(&cli).await,
        CliCommand::Doctor(args) => run_doctor(&cli, args).await,
        CliCommand::Call(args) => run_call(&cli, args).await,
        CliCommand::Tools(args) => {
            run_tools(args);
            Ok(())
        }
    }
}

async fn run_server(cli: &Cli) -> Result<()> {
    let dispatcher = Arc::new(build_dispatcher(cli).await?);
    info!(
        "serving tools over stdio for environment {}",
        dispatcher.config().target_environment
    );
    tokio::select! {
        result = protocol::serve_stdio(dispatcher) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed listening for ctrl-c")?;
            info!("ctrl-c received, shutting down");
            Ok(())
        }
    }
}

async fn run_call(cli: &Cli, args: CallArgs) -> Result<()> {
    let arguments: Value = serde_json::from_str(&args.args)
        .with_context(|| format!("--args is not valid JSON: {}", args.args))?;
    let dispatcher = build_dispatcher(cli).await?;
    let envelope = dispatcher
        .dispatch(&args.tool, &arguments)
        .await
        .map_err(|err| anyhow!("{} ({})", err.message, err.code.as_str()))?;
    println!("{}", envelope.to_pretty_json());
    if envelope.success {
        return Ok(());
    }
    Err(anyhow!("tool `{}` reported failure", args.tool))
}

fn run_tools(args: ToolsArgs) {
    let tools = tool_registry::list_tools();
    if args.json {
        print_json_value(&json!({ "tools": tools }));
        return;
    }
    for tool in &tools {
        println!(
            "{:<26} {}",
            tool.get("name").and_then(Value::as_str).unwrap_or_default(),
            tool.get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
        );
    }
}

async fn run_doctor(cli: &Cli, args: DoctorArgs) -> Result<()> {
    let config_result = FileConfig::load(&cli.config).map_err(|err| format!("{err:#}"));
    let detector = new_detector(cli);
    let listing = detector
        .list_environments()
        .await
        .map_err(|err| err.to_string());
    let resolved = ConfigResolver::new(&cli.config, cli.bridge.clone())
        .with_process_env()
        .resolve(&detector)
        .await
        .map_err(|err| err.to_string());
    let report = build_doctor_report(&cli.config, config_result, listing, resolved);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

async fn build_dispatcher(cli: &Cli) -> Result<ToolDispatcher> {
    let detector = new_detector(cli);
    let config = ConfigResolver::new(&cli.config, cli.bridge.clone())
        .with_process_env()
        .resolve(&detector)
        .await
        .context("failed resolving runtime configuration")?;
    let engine = ExecutionEngine::new(config.max_concurrent_processes);
    Ok(ToolDispatcher::new(
        Arc::new(config),
        Arc::new(engine),
        detector,
    ))
}

fn new_detector(cli: &Cli) -> DistributionDetector {
    DistributionDetector::new(Arc::new(BridgeListing::new(cli.bridge.clone())))
}

fn print_json_value(value: &Value) {
    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    println!("{rendered}");
}

fn build_doctor_report(
    config_path: &Path,
    config_result: std::result::Result<Option<FileConfig>, String>,
    listing: std::result::Result<Vec<EnvironmentInfo>, String>,
    resolved: std::result::Result<RuntimeConfig, String>,
) -> DoctorReport {
    let mut checks = Vec::new();

    checks.push(match config_result {
        Ok(Some(cfg)) => DoctorCheck {
            id: "config.load".to_owned(),
            status: "pass".to_owned(),
            message: format!("loaded {}", config_path.display()),
            detail: Some(format!(
                "quotingMode={} maxConcurrentProcesses={}",
                cfg.quoting_mode.as_str(),
                cfg.max_concurrent_processes
            )),
        },
        Ok(None) => DoctorCheck {
            id: "config.load".to_owned(),
            status: "warn".to_owned(),
            message: format!("{} not found", config_path.display()),
            detail: Some("defaults will be used".to_owned()),
        },
        Err(err) => DoctorCheck {
            id: "config.load".to_owned(),
            status: "warn".to_owned(),
            message: format!("failed to load {}", config_path.display()),
            detail: Some(format!("{err}; defaults will be used")),
        },
    });

    checks.push(match listing {
        Ok(environments) if !environments.is_empty() => DoctorCheck {
            id: "bridge.listing".to_owned(),
            status: "pass".to_owned(),
            message: format!("{} environment(s) listed", environments.len()),
            detail: Some(
                environments
                    .iter()
                    .map(|env| {
                        let marker = if env.is_default { "*" } else { "" };
                        let state = if env.running { "running" } else { "stopped" };
                        format!("{marker}{} ({state})", env.name)
                    })
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
        },
        Ok(_) => DoctorCheck {
            id: "bridge.listing".to_owned(),
            status: "warn".to_owned(),
            message: "bridge listed no environments".to_owned(),
            detail: None,
        },
        Err(err) => DoctorCheck {
            id: "bridge.listing".to_owned(),
            status: "warn".to_owned(),
            message: "bridge listing failed".to_owned(),
            detail: Some(err),
        },
    });

    checks.push(match resolved {
        Ok(cfg) => DoctorCheck {
            id: "target.resolve".to_owned(),
            status: if cfg.target_source == config::TargetSource::Fallback {
                "warn"
            } else {
                "pass"
            }
            .to_owned(),
            message: cfg.target_environment.clone(),
            detail: Some(format!("source={}", cfg.target_source.as_str())),
        },
        Err(err) => DoctorCheck {
            id: "target.resolve".to_owned(),
            status: "fail".to_owned(),
            message: "no target environment".to_owned(),
            detail: Some(err),
        },
    });

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    // stdout carries protocol frames.
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}
