//! Hive CLI - queue jobs, inspect queues, and run and control workers.

mod commands;
mod output;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::{job, queue, worker, Context};
use hive_core::config::Config;
use hive_core::jobs::CancelSignal;
use hive_core::HiveError;
use hive_core::telemetry::{init_logging, init_telemetry, TelemetryConfig};
use output::OutputFormat;

/// Hive - background job queue CLI
#[derive(Parser)]
#[command(
    name = "hive",
    author = "Aezi <aezi.zhu@icloud.com>",
    version = "0.1.0",
    about = "Hive - distributed background job queue",
    long_about = "CLI tool for queueing jobs, inspecting queues, and running and controlling workers.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file
    #[arg(long, global = true, env = "HIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Job operations
    #[command(subcommand)]
    Job(job::JobCommands),

    /// Queue operations
    #[command(subcommand)]
    Queue(queue::QueueCommands),

    /// Worker operations
    #[command(subcommand)]
    Worker(worker::WorkerCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        let suggestion = e
            .downcast_ref::<HiveError>()
            .and_then(|h| h.details().suggested_action.as_deref());
        if let Some(suggestion) = suggestion {
            output::print_info(suggestion);
        }
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    // SIGUSR1 is fatal to a job child until this listener exists.
    let cancel = match &cli.command {
        Commands::Worker(cmd) if cmd.is_job_child() => Some(CancelSignal::install()?),
        _ => None,
    };

    let config = match &cli.config {
        Some(path) => Config::from_file(&path.display().to_string())
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::load()?,
    };

    let long_running = matches!(&cli.command, Commands::Worker(cmd) if cmd.is_long_running());
    if long_running {
        init_telemetry(&TelemetryConfig::from_config(&config, "hive-worker"))?;
    } else {
        init_logging(&config.logging)?;
    }

    let ctx = Context::connect(config, cli.config).await?;
    let format = cli.output;

    match cli.command {
        Commands::Job(cmd) => job::execute(cmd, &ctx, format).await,
        Commands::Queue(cmd) => queue::execute(cmd, &ctx, format).await,
        Commands::Worker(cmd) => worker::execute(cmd, &ctx, format, cancel).await,
    }
}
