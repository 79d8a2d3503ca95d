//! Operator-side control of workers on this host.
//!
//! The controller never talks to a worker directly. It reads the registry,
//! checks liveness, and sends signals to the PIDs it finds:
//!
//! | Action  | Target       | Signal                      |
//! |---------|--------------|-----------------------------|
//! | cancel  | job process  | `SIGUSR1`                   |
//! | pause   | worker       | `SIGUSR2`                   |
//! | resume  | worker       | `SIGCONT`                   |
//! | restart | worker       | `SIGQUIT`, then a new worker |
//! | stop    | worker       | `SIGQUIT`, or `SIGTERM` when forced |
//!
//! Every action first reconciles this host's stale entries, and reports
//! per-worker outcomes instead of failing on the first problem.

use async_trait::async_trait;
use serde::Serialize;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::host::{packet_alive, Host, HostCleanupReport};
use super::job::{Job, JobCleanupReport};
use super::process::{self, Signal};
use super::unix_now;
use super::worker::{WorkerConfig, WorkerId, WorkerPacket};
use crate::error::{ErrorCode, HiveError, Result};
use crate::store::Store;

// ═══════════════════════════════════════════════════════════════════════════════
// Targets and Reports
// ═══════════════════════════════════════════════════════════════════════════════

/// Which workers an action applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    One(String),
    All,
}

impl Target {
    /// `None` means every worker on this host.
    pub fn from_option(id: Option<String>) -> Self {
        match id {
            Some(id) => Self::One(id),
            None => Self::All,
        }
    }
}

/// A live worker as seen through the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    pub packet: WorkerPacket,
}

impl WorkerInfo {
    /// The worker's PID, from its ID or its packet.
    pub fn pid(&self) -> u32 {
        self.id
            .parse::<WorkerId>()
            .map(|id| id.pid)
            .unwrap_or(self.packet.pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
    Sent,
    Skipped,
    Failed,
}

/// Result of one action on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlOutcome {
    pub worker_id: String,
    pub status: ControlStatus,
    pub message: String,
}

impl ControlOutcome {
    fn new(worker_id: &str, status: ControlStatus, message: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ControlReport {
    pub outcomes: Vec<ControlOutcome>,
}

impl ControlReport {
    pub fn count(&self, status: ControlStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Combined result of [`Controller::full_cleanup`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub hosts: Vec<String>,
    pub workers: Vec<String>,
    pub zombie_jobs: u64,
    pub processed_jobs: u64,
    pub errors: Vec<String>,
}

impl CleanupReport {
    fn absorb(&mut self, hosts: HostCleanupReport) {
        self.hosts.extend(hosts.hosts);
        self.workers.extend(hosts.workers);
        self.errors.extend(hosts.errors);
    }

    fn absorb_jobs(&mut self, jobs: JobCleanupReport) {
        self.zombie_jobs += jobs.zombie;
        self.processed_jobs += jobs.processed;
        self.errors.extend(jobs.errors);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Launcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Starts a new worker process. Returns its PID.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, config: &WorkerConfig) -> Result<u32>;
}

/// Launches `program [args..] --queue .. --blocking .. ...` detached from the
/// caller's process group.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// The running binary's `worker start` command.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?).with_args(["worker", "start"]))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn worker_args(config: &WorkerConfig) -> Vec<String> {
        vec![
            "--queue".into(),
            config.queues.clone(),
            "--blocking".into(),
            config.blocking.to_string(),
            "--interval".into(),
            config.interval.as_secs().max(1).to_string(),
            "--timeout".into(),
            config.timeout.as_secs().max(1).to_string(),
            "--memory".into(),
            config.memory_limit_mb.to_string(),
        ]
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, config: &WorkerConfig) -> Result<u32> {
        let child = std::process::Command::new(&self.program)
            .args(&self.args)
            .args(Self::worker_args(config))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| {
                HiveError::new(ErrorCode::ProcessSpawnFailed, "Failed to start a new worker")
                    .with_context("program", self.program.display().to_string())
                    .with_source(e)
            })?;

        Ok(child.id())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Controller
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Controller {
    store: Store,
    host: Host,
    launcher: Arc<dyn WorkerLauncher>,
    stale_after: Duration,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("host", &self.host.name())
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

impl Controller {
    /// A controller for the local host.
    pub fn new(store: Store, launcher: Arc<dyn WorkerLauncher>, stale_after: Duration) -> Self {
        Self {
            host: Host::local(store.clone()),
            store,
            launcher,
            stale_after,
        }
    }

    /// Act as if running on `hostname`. PIDs are still probed locally.
    pub fn with_host(mut self, hostname: impl Into<String>) -> Self {
        self.host = Host::new(self.store.clone(), hostname);
        self
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lookup
    // ─────────────────────────────────────────────────────────────────────────

    /// Live workers on this host, sorted by ID.
    ///
    /// Workers whose packet cannot be read are logged and left out.
    pub async fn host_workers(&self) -> Result<Vec<WorkerInfo>> {
        let now = unix_now();
        let mut live = Vec::new();

        for id in self.host.workers().await? {
            let packet = match WorkerPacket::load(&self.store, &id).await {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker_id = %id, error = %e, "Skipping unreadable worker packet");
                    continue;
                }
            };
            if packet_alive(&packet, &id, true, self.stale_after, now) {
                live.push(WorkerInfo { id, packet });
            }
        }
        Ok(live)
    }

    /// A live worker on this host.
    pub async fn host_worker(&self, id: &str) -> Result<WorkerInfo> {
        self.host_workers()
            .await?
            .into_iter()
            .find(|w| w.id == id)
            .ok_or_else(|| HiveError::worker_not_found(id))
    }

    /// Remove this host's dead worker entries.
    pub async fn cleanup(&self) -> Result<HostCleanupReport> {
        self.host
            .cleanup_host(true, self.stale_after, unix_now())
            .await
    }

    /// Known hosts and their registered worker counts.
    pub async fn hosts(&self) -> Result<Vec<(String, u64)>> {
        let mut hosts = Vec::new();
        for host in Host::all(&self.store).await? {
            let count = host.worker_count().await?;
            hosts.push((host.name().to_string(), count));
        }
        Ok(hosts)
    }

    async fn targets(&self, target: &Target) -> Result<Vec<WorkerInfo>> {
        self.cleanup().await?;
        match target {
            Target::One(id) => Ok(vec![self.host_worker(id).await?]),
            Target::All => self.host_workers().await,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Actions
    // ─────────────────────────────────────────────────────────────────────────

    /// Cancel the running job of each target worker.
    pub async fn cancel(&self, target: &Target) -> Result<ControlReport> {
        let mut report = ControlReport::default();
        for worker in self.targets(target).await? {
            let outcome = match worker.packet.job_pid.filter(|pid| process::pid_alive(*pid)) {
                Some(pid) => signal_outcome(
                    &worker.id,
                    pid,
                    Signal::Usr1,
                    format!("running job {} signal sent", Signal::Usr1),
                ),
                None => ControlOutcome::new(&worker.id, ControlStatus::Skipped, "has no running job"),
            };
            report.outcomes.push(outcome);
        }
        Ok(report)
    }

    pub async fn pause(&self, target: &Target) -> Result<ControlReport> {
        self.signal_workers(target, Signal::Usr2, "paused").await
    }

    pub async fn resume(&self, target: &Target) -> Result<ControlReport> {
        self.signal_workers(target, Signal::Cont, "resumed").await
    }

    /// Stop gracefully, or immediately when `force` is set.
    pub async fn stop(&self, target: &Target, force: bool) -> Result<ControlReport> {
        let signal = if force { Signal::Term } else { Signal::Quit };
        self.signal_workers(target, signal, "stopping").await
    }

    /// Stop each target gracefully and start a replacement with its configuration.
    pub async fn restart(&self, target: &Target) -> Result<ControlReport> {
        let mut report = ControlReport::default();
        for worker in self.targets(target).await? {
            let stopped = signal_outcome(&worker.id, worker.pid(), Signal::Quit, "stopping");
            if stopped.status != ControlStatus::Sent {
                report.outcomes.push(stopped);
                continue;
            }

            let outcome = match self.launcher.launch(&worker.packet.to_config()).await {
                Ok(pid) => {
                    info!(worker_id = %worker.id, new_pid = pid, "Worker restarted");
                    ControlOutcome::new(
                        &worker.id,
                        ControlStatus::Sent,
                        format!("restarted as pid {}", pid),
                    )
                }
                Err(e) => {
                    e.log();
                    ControlOutcome::new(
                        &worker.id,
                        ControlStatus::Failed,
                        format!("stopped, but restart failed: {}", e.user_message()),
                    )
                }
            };
            report.outcomes.push(outcome);
        }
        Ok(report)
    }

    async fn signal_workers(
        &self,
        target: &Target,
        signal: Signal,
        action: &str,
    ) -> Result<ControlReport> {
        let mut report = ControlReport::default();
        for worker in self.targets(target).await? {
            let message = format!("{} ({} sent)", action, signal);
            report
                .outcomes
                .push(signal_outcome(&worker.id, worker.pid(), signal, message));
        }
        Ok(report)
    }

    /// Host cleanup, local cleanup, host cleanup again, then job cleanup.
    pub async fn full_cleanup(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let local = self.host.name().to_string();

        report.absorb(Host::cleanup(&self.store, &local, self.stale_after, unix_now()).await?);
        report.absorb(self.cleanup().await?);
        report.absorb(Host::cleanup(&self.store, &local, self.stale_after, unix_now()).await?);

        report.absorb_jobs(Job::cleanup(&self.store, unix_now()).await?);

        info!(
            hosts = report.hosts.len(),
            workers = report.workers.len(),
            zombie_jobs = report.zombie_jobs,
            processed_jobs = report.processed_jobs,
            "Cleanup finished"
        );
        Ok(report)
    }
}

fn signal_outcome(worker_id: &str, pid: u32, signal: Signal, message: impl Into<String>) -> ControlOutcome {
    match process::send_signal(pid, signal) {
        Ok(()) => ControlOutcome::new(worker_id, ControlStatus::Sent, message),
        Err(e) => {
            warn!(worker_id, pid, signal = signal.name(), error = %e, "Signal delivery failed");
            ControlOutcome::new(worker_id, ControlStatus::Failed, e.user_message().to_string())
        }
    }
}
