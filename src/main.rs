//! # Chime: scheduled fan-out notifier
//!
//! One request, one message, many delivery times.
//!
//! Usage:
//!   chime serve                          # Start the HTTP gateway (default port 3000)
//!   chime run request.json               # Run a request file in the foreground
//!   chime run request.json --mode express
//!   chime validate request.json          # Check a request without publishing
//!   chime init                           # Write a default config file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chime_core::config::{ChimeConfig, RunMode};
use chime_scheduler::workflow::matched_rule;
use chime_scheduler::{EntryPlan, Evaluator, FanoutEngine, Submission, TopicRegistry, validate};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "chime",
    version,
    about = "⏰ Chime: scheduled fan-out notifier"
)]
struct Cli {
    /// Config file (defaults to $CHIME_CONFIG or ~/.chime/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run a request file and print the outcome
    Run {
        file: PathBuf,
        /// standard or express
        #[arg(short, long)]
        mode: Option<RunMode>,
        /// Standard-mode entries in flight
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Validate a request file and show each entry's plan
    Validate { file: PathBuf },
    /// Write a default config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(verbose: bool, json_logs: bool) {
    let filter = if verbose {
        "chime=debug,chime_scheduler=debug,chime_gateway=debug,tower_http=debug"
    } else {
        "chime=info,chime_scheduler=info,chime_gateway=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn config_path(cli_path: Option<&str>) -> PathBuf {
    cli_path
        .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
        .unwrap_or_else(ChimeConfig::resolve_path)
}

fn load_config(path: &Path) -> Result<ChimeConfig> {
    if path.exists() {
        tracing::info!("📄 Config: {}", path.display());
        Ok(ChimeConfig::load_from(path)?)
    } else {
        tracing::info!("📄 No config at {}, using defaults", path.display());
        Ok(ChimeConfig::default())
    }
}

fn read_request(file: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    serde_json::from_str(&content).with_context(|| format!("{} is not valid JSON", file.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let path = config_path(cli.config.as_deref());

    match cli.command {
        Command::Init { force } => init(&path, force),
        Command::Serve { host, port } => {
            let mut config = load_config(&path)?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            chime_gateway::start(config).await
        }
        Command::Run {
            file,
            mode,
            concurrency,
        } => {
            let mut config = load_config(&path)?;
            if let Some(mode) = mode {
                config.workflow.mode = mode;
            }
            if let Some(concurrency) = concurrency {
                config.workflow.concurrency = concurrency.max(1);
            }
            run(config, &read_request(&file)?).await
        }
        Command::Validate { file } => {
            let config = load_config(&path)?;
            validate_file(&config, &read_request(&file)?)
        }
    }
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    let mut config = ChimeConfig::default();
    config.topics = config.effective_topics();
    config.save_to(path)?;
    println!("✅ Wrote {}", path.display());
    Ok(())
}

async fn run(config: ChimeConfig, request: &Value) -> Result<()> {
    let registry = Arc::new(TopicRegistry::from_config(&config.effective_topics())?);
    let engine = FanoutEngine::from_config(&config, registry);
    let mode = config.workflow.mode;

    let submitted = tokio::select! {
        submitted = engine.submit(request, mode) => submitted,
        _ = tokio::signal::ctrl_c() => {
            engine.shutdown().await;
            anyhow::bail!("interrupted before the request finished");
        }
    };

    match submitted {
        Ok(Submission::Completed(report)) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.has_invalid_entries() || report.has_publish_failures() {
                anyhow::bail!("{} of {} entries rejected", report.rejected(), report.outcomes.len());
            }
            Ok(())
        }
        Ok(Submission::Dispatched(receipt)) => {
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            tokio::select! {
                _ = engine.drain() => {}
                _ = tokio::signal::ctrl_c() => engine.shutdown().await,
            }
            Ok(())
        }
        Err(e) => anyhow::bail!("invalid '{}': {}", e.field(), e),
    }
}

fn validate_file(config: &ChimeConfig, request: &Value) -> Result<()> {
    let request = validate(request).map_err(|e| anyhow::anyhow!("invalid '{}': {}", e.field(), e))?;
    let evaluator = Evaluator::new(std::time::Duration::from_secs(config.workflow.max_wait_secs));
    let now = chrono::Utc::now();

    let entries: Vec<Value> = request
        .schedule
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let plan = match evaluator.plan(entry, now) {
                EntryPlan::Reject(e) => json!({"reject": e.to_string()}),
                EntryPlan::Immediate => json!({"publish": "immediately"}),
                EntryPlan::WaitSeconds(secs) => json!({"wait_secs": secs}),
                EntryPlan::WaitUntil(at) => json!({"wait_until": at.to_rfc3339()}),
            };
            json!({"index": index, "rule": matched_rule(entry, now), "plan": plan})
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "topic": request.topic,
            "message": request.message,
            "entries": entries,
        }))?
    );
    Ok(())
}
