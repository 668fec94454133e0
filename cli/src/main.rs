//! bimlink CLI - headless host for the tool-dispatch engine.
//!
//! Opens an in-memory building model on the document thread and runs batches
//! of agent tool calls against it, one batch per agent turn:
//!
//! ```text
//! main() -> DocumentThread::spawn(MemoryModel) -> Dispatcher::dispatch_batch() per turn
//!                                                      |
//!                                                      v
//!                                         JSON report on stdout
//! ```
//!
//! Confirmation prompts go to stderr and are answered on stdin. Ctrl-C cancels
//! the batch in flight.

mod approval;
mod batch;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use std::{
    fs::{self, OpenOptions},
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use bimlink_engine::{BimlinkConfig, Dispatcher, DocumentThread, EngineSettings, SafetyGate};
use bimlink_model::MemoryModel;
use bimlink_types::Document;
use bimlink_tools::{ToolRegistry, builtins::register_builtins};

use crate::approval::TerminalApprover;
use crate::batch::{TurnReport, parse_turns};

#[derive(Parser)]
#[command(
    name = "bimlink",
    version,
    about = "Run agent tool batches against a transactional building model"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run tool-call batches from a JSON file against an in-memory model
    Run(RunArgs),
    /// Print the tool definitions advertised to the agent
    Tools,
}

#[derive(Args)]
struct RunArgs {
    /// JSON file holding an array of tool calls, or an array of turns
    batch: PathBuf,
    /// Describe mutating calls instead of running them
    #[arg(long)]
    dry_run: bool,
    /// Approve every confirmation prompt
    #[arg(long, short = 'y')]
    yes: bool,
    /// Title of the in-memory model
    #[arg(long, default_value = "Untitled Model")]
    title: String,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_bimlink_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // stdout carries the JSON report, so logs fall back to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_bimlink_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in bimlink_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn bimlink_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.bimlink/logs/bimlink.log
    if let Some(config_path) = BimlinkConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("bimlink.log"));
    }

    candidates.push(PathBuf::from(".bimlink").join("logs").join("bimlink.log"));

    candidates
}

fn load_settings() -> EngineSettings {
    let config = match BimlinkConfig::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(path = %e.path().display(), "{e}; using defaults");
            BimlinkConfig::default()
        }
    };
    EngineSettings::from_config(Some(&config.with_env_overrides()))
}

fn builtin_registry() -> Result<Arc<ToolRegistry>> {
    let registry = ToolRegistry::default();
    register_builtins(&registry)?;
    Ok(Arc::new(registry))
}

async fn run_batches(args: RunArgs, settings: EngineSettings) -> Result<()> {
    let raw = fs::read_to_string(&args.batch)
        .with_context(|| format!("failed to read {}", args.batch.display()))?;
    let turns = parse_turns(&raw)?;

    let flags = settings.safety_flags();
    if args.dry_run {
        flags.set_dry_run(true);
    }
    if args.yes {
        flags.set_skip_confirmations(true);
    }

    let mut thread = DocumentThread::spawn(
        Some(Box::new(MemoryModel::new(args.title))),
        settings.marshal,
    )
    .context("failed to start the document thread")?;
    let gate = Arc::new(SafetyGate::new(flags, Arc::new(TerminalApprover)));
    let dispatcher = Dispatcher::new(builtin_registry()?, gate, thread.marshal(), settings.tools);

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; cancelling the running batch");
                cancel.cancel();
            }
        })
    };

    let mut reports = Vec::with_capacity(turns.len());
    for (index, calls) in turns.into_iter().enumerate() {
        let turn = index + 1;
        let outcome = dispatcher.dispatch_batch(calls, &cancel).await;
        tracing::info!(turn, disposition = ?outcome.disposition, "turn finished");
        reports.push(TurnReport::new(turn, outcome));
    }
    ctrl_c.abort();

    let model = thread
        .marshal()
        .run(&CancellationToken::new(), |ctx| {
            let session = ctx.session().ok_or_else(|| anyhow!("no document open"))?;
            let model = session
                .document
                .as_any()
                .downcast_ref::<MemoryModel>()
                .ok_or_else(|| anyhow!("open document is not an in-memory model"))?;
            Ok(serde_json::json!({
                "title": model.title(),
                "elements": model.elements().collect::<Vec<_>>(),
                "undo": model.undo_labels(),
            }))
        })
        .await?;
    thread.shutdown();

    let report = serde_json::json!({ "turns": reports, "model": model });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_tools() -> Result<()> {
    let definitions = builtin_registry()?.definitions();
    println!("{}", serde_json::to_string_pretty(&definitions)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let settings = load_settings();
    match cli.command {
        Command::Run(args) => run_batches(args, settings).await,
        Command::Tools => print_tools(),
    }
}
