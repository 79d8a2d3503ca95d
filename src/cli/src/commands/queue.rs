//! Queue inspection and maintenance commands.

use anyhow::Result;
use clap::Subcommand;
use hive_core::jobs::{Queue, QueueStats};
use serde::Serialize;
use tabled::Tabled;

use super::Context;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum QueueCommands {
    /// List known queues with their counters
    List,

    /// Show global counters
    Stats,

    /// Delete every key in the configured namespace
    Clear {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct QueueRow {
    #[tabled(rename = "Queue")]
    queue: String,
    #[tabled(rename = "Queued")]
    queued: i64,
    #[tabled(rename = "Delayed")]
    delayed: i64,
    #[tabled(rename = "Processed")]
    processed: i64,
    #[tabled(rename = "Failed")]
    failed: i64,
    #[tabled(rename = "Cancelled")]
    cancelled: i64,
    #[tabled(rename = "Total")]
    total: i64,
}

impl From<QueueStats> for QueueRow {
    fn from(stats: QueueStats) -> Self {
        Self {
            queue: stats.queue,
            queued: stats.queued,
            delayed: stats.delayed,
            processed: stats.processed,
            failed: stats.failed,
            cancelled: stats.cancelled,
            total: stats.total,
        }
    }
}

pub async fn execute(cmd: QueueCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    let queue = Queue::new(ctx.store.clone());

    match cmd {
        QueueCommands::List => {
            let rows: Vec<QueueRow> = queue
                .all_stats()
                .await?
                .into_iter()
                .map(QueueRow::from)
                .collect();
            output::print_list(&rows, format);
        }

        QueueCommands::Stats => {
            let stats = queue.global_stats().await?;
            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Namespace: {}", ctx.store.namespace()));
                    output::print_detail("Total", &stats.total.to_string());
                    output::print_detail("Processed", &stats.processed.to_string());
                    output::print_detail("Failed", &stats.failed.to_string());
                    output::print_detail("Cancelled", &stats.cancelled.to_string());
                    output::print_detail("Zombie", &stats.zombie.to_string());
                }
                _ => output::print_item(&stats, format),
            }
        }

        QueueCommands::Clear { force } => {
            if !force {
                output::print_info(&format!(
                    "This will delete every key under \"{}\". Use --force to confirm.",
                    ctx.store.namespace()
                ));
                return Ok(());
            }

            let removed = ctx.store.clear_all().await?;
            output::print_success(&format!("Removed {} keys", removed));
        }
    }

    Ok(())
}
