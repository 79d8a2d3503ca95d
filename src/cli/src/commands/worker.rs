//! Worker lifecycle and host control commands.

use anyhow::Result;
use clap::Subcommand;
use hive_core::jobs::{
    listen_for_signals, unix_now, CancelSignal, CommandLauncher, ControlReport, ControlStatus,
    Controller, Job, JobRegistry, ProcessExecutor, Target, Worker, WorkerInfo,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;
use tracing::info;

use super::Context;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum WorkerCommands {
    /// Run a worker in the foreground
    Start {
        /// Comma-separated queue names, or `*` for every queue
        #[arg(short, long)]
        queue: Option<String>,

        /// Block on the store while queues are empty
        #[arg(short, long)]
        blocking: Option<bool>,

        /// Poll interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,

        /// Job timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Memory limit in megabytes (0 disables the check)
        #[arg(short, long)]
        memory: Option<u64>,

        /// Write the worker PID to this file
        #[arg(long)]
        pid_file: Option<PathBuf>,
    },

    /// List live workers on this host
    List,

    /// List hosts with registered workers
    Hosts,

    /// Remove dead workers, empty hosts and expired jobs
    Cleanup,

    /// Cancel the running job of one or all workers
    Cancel {
        /// Worker ID (all workers on this host if omitted)
        id: Option<String>,
    },

    /// Pause one or all workers
    Pause { id: Option<String> },

    /// Resume one or all paused workers
    Resume { id: Option<String> },

    /// Stop one or all workers and start replacements
    Restart { id: Option<String> },

    /// Stop one or all workers
    Stop {
        id: Option<String>,

        /// Kill the running job instead of waiting for it
        #[arg(short, long)]
        force: bool,
    },

    /// Run one job (used by workers)
    #[command(hide = true)]
    Perform {
        /// Job ID
        job_id: String,
    },
}

impl WorkerCommands {
    /// Whether this command runs long enough to serve metrics.
    pub fn is_long_running(&self) -> bool {
        matches!(self, Self::Start { .. })
    }

    /// Whether this command runs inside a job child process.
    pub fn is_job_child(&self) -> bool {
        matches!(self, Self::Perform { .. })
    }
}

// ── Rows ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Tabled)]
struct WorkerRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Running for")]
    running_for: String,
    #[tabled(rename = "Running job")]
    running_job: String,
    #[tabled(rename = "P")]
    processed: u64,
    #[tabled(rename = "C")]
    cancelled: u64,
    #[tabled(rename = "F")]
    failed: u64,
    #[tabled(rename = "Interval")]
    interval: String,
    #[tabled(rename = "Timeout")]
    timeout: String,
    #[tabled(rename = "Memory (Limit)")]
    memory: String,
}

impl WorkerRow {
    fn new(index: usize, worker: &WorkerInfo, now: i64) -> Self {
        let packet = &worker.packet;
        let running_job = match (&packet.job_id, packet.job_started) {
            (Some(id), Some(started)) => {
                format!("{} for {}", id, output::format_duration(now - started))
            }
            (Some(id), None) => id.clone(),
            _ => "-".to_string(),
        };
        let limit = if packet.memory_limit == 0 {
            "none".to_string()
        } else {
            format!("{}MB", packet.memory_limit)
        };

        Self {
            index,
            status: packet.status.label().to_string(),
            id: worker.id.clone(),
            running_for: output::format_duration(packet.uptime(now)),
            running_job,
            processed: packet.processed,
            cancelled: packet.cancelled,
            failed: packet.failed,
            interval: format!("{}s", packet.interval),
            timeout: format!("{}s", packet.timeout),
            memory: format!("{} ({})", output::format_megabytes(packet.memory), limit),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct HostRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Hostname")]
    hostname: String,
    #[tabled(rename = "# workers")]
    workers: u64,
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(
    cmd: WorkerCommands,
    ctx: &Context,
    format: OutputFormat,
    cancel: Option<CancelSignal>,
) -> Result<()> {
    match cmd {
        WorkerCommands::Start {
            queue,
            blocking,
            interval,
            timeout,
            memory,
            pid_file,
        } => {
            let mut config = ctx.config.worker.clone();
            if let Some(queue) = queue {
                config.queues = queue;
            }
            if let Some(blocking) = blocking {
                config.blocking = blocking;
            }
            if let Some(secs) = interval {
                config.interval = Duration::from_secs(secs);
            }
            if let Some(secs) = timeout {
                config.timeout = Duration::from_secs(secs);
            }
            if let Some(mb) = memory {
                config.memory_limit_mb = mb;
            }
            if pid_file.is_some() {
                config.pid_file = pid_file;
            }

            let executor = ProcessExecutor::current_exe()?.with_args(ctx.child_args());
            let worker = Worker::new(
                ctx.store.clone(),
                config,
                ctx.config.queue.clone(),
                Arc::new(executor),
            )?;
            let signals = listen_for_signals(worker.control())?;
            info!(worker_id = %worker.id(), "Worker starting");

            let summary = worker.work().await;
            signals.abort();
            let summary = summary?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Worker {} stopped", summary.worker_id));
                    output::print_detail("Reason", &format!("{:?}", summary.reason));
                    output::print_detail("Processed", &summary.processed.to_string());
                    output::print_detail("Failed", &summary.failed.to_string());
                    output::print_detail("Cancelled", &summary.cancelled.to_string());
                }
                _ => output::print_item(&summary, format),
            }
        }

        WorkerCommands::List => {
            let controller = controller(ctx)?;
            controller.cleanup().await?;
            let workers = controller.host_workers().await?;
            if workers.is_empty() {
                output::print_warning("There are no workers on this host");
                return Ok(());
            }

            let now = unix_now();
            let rows: Vec<WorkerRow> = workers
                .iter()
                .enumerate()
                .map(|(i, w)| WorkerRow::new(i + 1, w, now))
                .collect();
            output::print_list(&rows, format);
        }

        WorkerCommands::Hosts => {
            let rows: Vec<HostRow> = controller(ctx)?
                .hosts()
                .await?
                .into_iter()
                .enumerate()
                .map(|(i, (hostname, workers))| HostRow {
                    index: i + 1,
                    hostname,
                    workers,
                })
                .collect();
            output::print_list(&rows, format);
        }

        WorkerCommands::Cleanup => {
            let report = controller(ctx)?.full_cleanup().await?;
            match format {
                OutputFormat::Table => {
                    output::print_success("Cleanup finished");
                    output::print_detail("Hosts removed", &report.hosts.len().to_string());
                    output::print_detail("Workers removed", &report.workers.len().to_string());
                    output::print_detail("Zombie jobs", &report.zombie_jobs.to_string());
                    output::print_detail("Expired jobs", &report.processed_jobs.to_string());
                    for error in &report.errors {
                        output::print_warning(error);
                    }
                }
                _ => output::print_item(&report, format),
            }
        }

        WorkerCommands::Cancel { id } => {
            let report = controller(ctx)?.cancel(&Target::from_option(id)).await?;
            print_report(&report, format);
        }

        WorkerCommands::Pause { id } => {
            let report = controller(ctx)?.pause(&Target::from_option(id)).await?;
            print_report(&report, format);
        }

        WorkerCommands::Resume { id } => {
            let report = controller(ctx)?.resume(&Target::from_option(id)).await?;
            print_report(&report, format);
        }

        WorkerCommands::Restart { id } => {
            let report = controller(ctx)?.restart(&Target::from_option(id)).await?;
            print_report(&report, format);
        }

        WorkerCommands::Stop { id, force } => {
            let report = controller(ctx)?.stop(&Target::from_option(id), force).await?;
            print_report(&report, format);
        }

        WorkerCommands::Perform { job_id } => {
            let cancel = match cancel {
                Some(cancel) => cancel,
                None => CancelSignal::install()?,
            };
            let registry = JobRegistry::with_builtins();
            let outcome =
                Job::perform(&ctx.store, &registry, &job_id, &ctx.config.queue, cancel).await?;
            std::process::exit(outcome.exit_code());
        }
    }

    Ok(())
}

fn controller(ctx: &Context) -> Result<Controller> {
    let launcher = CommandLauncher::current_exe()?.with_args(ctx.child_args());
    Ok(Controller::new(
        ctx.store.clone(),
        Arc::new(launcher),
        ctx.config.worker.stale_after,
    ))
}

fn print_report(report: &ControlReport, format: OutputFormat) {
    if report.is_empty() {
        output::print_warning("There are no workers on this host");
        return;
    }

    match format {
        OutputFormat::Table => {
            for outcome in &report.outcomes {
                let line = format!("{}: {}", outcome.worker_id, outcome.message);
                match outcome.status {
                    ControlStatus::Sent => output::print_success(&line),
                    ControlStatus::Skipped => output::print_info(&line),
                    ControlStatus::Failed => output::print_error(&line),
                }
            }
        }
        _ => output::print_item(report, format),
    }
}
