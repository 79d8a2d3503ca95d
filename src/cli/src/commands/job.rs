//! Producer commands.

use anyhow::{Context as _, Result};
use clap::Subcommand;
use hive_core::jobs::{unix_now, Delay, Job, Queue};

use super::Context;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobCommands {
    /// Add a job to a queue
    Queue {
        /// Handler class name
        class: String,

        /// Target queue (defaults to queue.default)
        #[arg(short, long)]
        queue: Option<String>,

        /// Seconds from now, or an absolute Unix timestamp
        #[arg(short, long)]
        delay: Option<String>,

        /// Handler arguments as JSON
        #[arg(short, long, default_value = "null")]
        args: String,
    },
}

pub async fn execute(cmd: JobCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::Queue {
            class,
            queue,
            delay,
            args,
        } => {
            let args: serde_json::Value =
                serde_json::from_str(&args).with_context(|| "Failed to parse --args as JSON")?;
            let delay = delay.as_deref().map(Delay::parse).transpose()?;
            let queue_name = queue.unwrap_or_else(|| ctx.config.queue.default.clone());

            let job = Queue::new(ctx.store.clone())
                .enqueue(Job::new(queue_name, class, args), delay, unix_now())
                .await?;

            match format {
                OutputFormat::Table => {
                    output::print_success("Job queued");
                    output::print_detail("ID", &job.id);
                    output::print_detail("Queue", &job.queue);
                    output::print_detail("Class", &job.class);
                    output::print_detail("Status", job.status.as_str());
                    if let Some(due) = job.delayed {
                        output::print_detail("Due", &format_timestamp(due));
                    }
                }
                _ => output::print_item(&job, format),
            }
        }
    }

    Ok(())
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}
