//! Worker process lifecycle.
//!
//! A worker registers itself under its host, polls its queues, runs each job
//! in a child process and reports through its packet (`worker:<id>`).
//!
//! ```text
//! STARTED → WAITING ⇄ RUNNING → SHUTTING_DOWN → STOPPED
//!              ⇅
//!            PAUSED
//! ```
//!
//! Control requests arrive through [`WorkerControl`] and are acted on at safe
//! points: the top of each loop iteration, and while supervising a child only
//! for cancellation and forced stop.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, error, info, warn};

use super::executor::{ChildExit, JobExecutor};
use super::host::Host;
use super::job::{Job, JobOutcome, EXIT_CANCELLED};
use super::process::{self, PidFile, Signal};
use super::queue::Queue;
use super::signals::{StopMode, WorkerControl};
use super::unix_now;
use crate::config::QueueConfig;
use crate::error::{ErrorCode, HiveError, Result};
use crate::store::{Store, StoreKey};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for one worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// `*` for every known queue, or a comma-separated list in poll order
    #[serde(default = "default_queues")]
    pub queues: String,

    /// Use the store's blocking pop instead of sleeping between polls
    #[serde(default = "default_blocking")]
    pub blocking: bool,

    /// Poll interval, and the blocking pop timeout
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Maximum run time of one job
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Stop after a job once resident memory exceeds this. 0 disables the check.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,

    #[serde(default)]
    pub pid_file: Option<PathBuf>,

    /// Heartbeat refresh while a job runs
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Remote workers with an older heartbeat are considered dead
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            blocking: default_blocking(),
            interval: default_interval(),
            timeout: default_timeout(),
            memory_limit_mb: default_memory_limit_mb(),
            pid_file: None,
            heartbeat_interval: default_heartbeat_interval(),
            stale_after: default_stale_after(),
        }
    }
}

fn default_queues() -> String { "*".to_string() }
fn default_blocking() -> bool { true }
fn default_interval() -> Duration { Duration::from_secs(10) }
fn default_timeout() -> Duration { Duration::from_secs(60) }
fn default_memory_limit_mb() -> u64 { 128 }
fn default_heartbeat_interval() -> Duration { Duration::from_secs(15) }
fn default_stale_after() -> Duration { Duration::from_secs(120) }

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(HiveError::new(
                ErrorCode::InvalidConfiguration,
                format!("worker: {}", message),
            ))
        };

        if self.interval.is_zero() {
            return invalid("interval must be greater than zero");
        }
        if self.timeout.is_zero() {
            return invalid("timeout must be greater than zero");
        }
        if self.heartbeat_interval.is_zero() {
            return invalid("heartbeat_interval must be greater than zero");
        }
        if self.stale_after.is_zero() {
            return invalid("stale_after must be greater than zero");
        }
        self.queue_selection().map(|_| ())
    }

    pub fn queue_selection(&self) -> Result<QueueSelection> {
        QueueSelection::parse(&self.queues)
    }

    fn memory_limit_bytes(&self) -> Option<u64> {
        (self.memory_limit_mb > 0).then(|| self.memory_limit_mb * 1024 * 1024)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue Selection
// ═══════════════════════════════════════════════════════════════════════════════

/// Which queues a worker polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueSelection {
    /// Every known queue, re-resolved on each poll
    All,
    /// These queues, polled in order
    Named(Vec<String>),
}

impl QueueSelection {
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed == "*" {
            return Ok(Self::All);
        }

        let names: Vec<String> = trimmed
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect();

        if names.is_empty() {
            return Err(HiveError::new(
                ErrorCode::InvalidConfiguration,
                "worker: queue list must name at least one queue or be \"*\"",
            ));
        }
        if names.iter().any(|name| name == "*" || name.contains(':')) {
            return Err(HiveError::new(
                ErrorCode::InvalidConfiguration,
                format!("worker: invalid queue list \"{}\"", trimmed),
            ));
        }
        Ok(Self::Named(names))
    }
}

impl fmt::Display for QueueSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Named(names) => f.write_str(&names.join(",")),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Identity
// ═══════════════════════════════════════════════════════════════════════════════

/// `{hostname}:{pid}:{queues}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub hostname: String,
    pub pid: u32,
    pub queues: String,
}

impl WorkerId {
    pub fn new(hostname: impl Into<String>, pid: u32, queues: &QueueSelection) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
            queues: queues.to_string(),
        }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.hostname, self.pid, self.queues)
    }
}

impl FromStr for WorkerId {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || HiveError::validation(format!("\"{}\" is not a valid worker id", s));

        let mut parts = s.splitn(3, ':');
        let hostname = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let pid = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(invalid)?;
        let queues = parts.next().filter(|q| !q.is_empty()).ok_or_else(invalid)?;

        Ok(Self {
            hostname: hostname.to_string(),
            pid,
            queues: queues.to_string(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Status and Packet
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Started,
    Waiting,
    Running,
    Paused,
    ShuttingDown,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }

    /// Human-readable label for listings.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Started => "Started",
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::ShuttingDown => "Shutting down",
            Self::Stopped => "Stopped",
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(Self::Started),
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "shutting_down" => Ok(Self::ShuttingDown),
            "stopped" => Ok(Self::Stopped),
            other => Err(HiveError::new(
                ErrorCode::DeserializationError,
                format!("Unknown worker status \"{}\"", other),
            )),
        }
    }
}

/// The worker's self-reported state, stored under `worker:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerPacket {
    pub status: WorkerStatus,
    pub hostname: String,
    pub pid: u32,
    pub started: i64,
    pub heartbeat: i64,
    pub job_id: Option<String>,
    pub job_pid: Option<u32>,
    pub job_started: Option<i64>,
    pub processed: u64,
    pub cancelled: u64,
    pub failed: u64,
    /// Poll interval in seconds
    pub interval: u64,
    /// Job timeout in seconds
    pub timeout: u64,
    /// Resident memory in bytes, sampled at the last heartbeat
    pub memory: u64,
    /// Memory limit in megabytes
    pub memory_limit: u64,
    pub queues: String,
    pub blocking: bool,
}

impl WorkerPacket {
    fn new(id: &WorkerId, config: &WorkerConfig, now: i64) -> Self {
        Self {
            status: WorkerStatus::Started,
            hostname: id.hostname.clone(),
            pid: id.pid,
            started: now,
            heartbeat: now,
            job_id: None,
            job_pid: None,
            job_started: None,
            processed: 0,
            cancelled: 0,
            failed: 0,
            interval: config.interval.as_secs(),
            timeout: config.timeout.as_secs(),
            memory: process::resident_memory_bytes(),
            memory_limit: config.memory_limit_mb,
            queues: id.queues.clone(),
            blocking: config.blocking,
        }
    }

    /// Hash fields. Job fields are written empty when no job runs.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let optional = |value: Option<String>| value.unwrap_or_default();
        vec![
            ("status".into(), self.status.as_str().into()),
            ("hostname".into(), self.hostname.clone()),
            ("pid".into(), self.pid.to_string()),
            ("started".into(), self.started.to_string()),
            ("heartbeat".into(), self.heartbeat.to_string()),
            ("job_id".into(), optional(self.job_id.clone())),
            ("job_pid".into(), optional(self.job_pid.map(|p| p.to_string()))),
            ("job_started".into(), optional(self.job_started.map(|t| t.to_string()))),
            ("processed".into(), self.processed.to_string()),
            ("cancelled".into(), self.cancelled.to_string()),
            ("failed".into(), self.failed.to_string()),
            ("interval".into(), self.interval.to_string()),
            ("timeout".into(), self.timeout.to_string()),
            ("memory".into(), self.memory.to_string()),
            ("memory_limit".into(), self.memory_limit.to_string()),
            ("queues".into(), self.queues.clone()),
            ("blocking".into(), self.blocking.to_string()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let text = |name: &str| fields.get(name).map(String::as_str).unwrap_or_default();
        let number = |name: &str| text(name).parse::<u64>().unwrap_or(0);
        let timestamp = |name: &str| text(name).parse::<i64>().ok();

        Ok(Self {
            status: text("status").parse()?,
            hostname: text("hostname").to_string(),
            pid: text("pid").parse().unwrap_or(0),
            started: timestamp("started").unwrap_or(0),
            heartbeat: timestamp("heartbeat").unwrap_or(0),
            job_id: Some(text("job_id")).filter(|v| !v.is_empty()).map(String::from),
            job_pid: text("job_pid").parse().ok(),
            job_started: timestamp("job_started"),
            processed: number("processed"),
            cancelled: number("cancelled"),
            failed: number("failed"),
            interval: number("interval"),
            timeout: number("timeout"),
            memory: number("memory"),
            memory_limit: number("memory_limit"),
            queues: text("queues").to_string(),
            blocking: text("blocking") == "true",
        })
    }

    /// Load a packet. A hash without a status is no packet at all.
    pub async fn load(store: &Store, worker_id: &str) -> Result<Option<Self>> {
        let fields = store.hgetall(&StoreKey::Worker(worker_id).build()).await?;
        if fields.get("status").map_or(true, String::is_empty) {
            return Ok(None);
        }
        Self::from_fields(&fields).map(Some)
    }

    async fn save(&self, store: &Store, worker_id: &str) -> Result<()> {
        store
            .hset_multiple(&StoreKey::Worker(worker_id).build(), &self.to_fields())
            .await
    }

    /// The configuration this worker was started with, for a restart.
    pub fn to_config(&self) -> WorkerConfig {
        let defaults = WorkerConfig::default();
        let secs = |value: u64, fallback: Duration| {
            if value == 0 {
                fallback
            } else {
                Duration::from_secs(value)
            }
        };

        WorkerConfig {
            queues: self.queues.clone(),
            blocking: self.blocking,
            interval: secs(self.interval, defaults.interval),
            timeout: secs(self.timeout, defaults.timeout),
            memory_limit_mb: self.memory_limit,
            ..defaults
        }
    }

    /// Seconds since the worker started.
    pub fn uptime(&self, now: i64) -> i64 {
        (now - self.started).max(0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Summary
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Graceful,
    Forced,
    /// Resident memory exceeded the configured limit
    MemoryLimit,
}

impl From<StopMode> for StopReason {
    fn from(mode: StopMode) -> Self {
        match mode {
            StopMode::Graceful => Self::Graceful,
            StopMode::Force => Self::Forced,
        }
    }
}

/// Returned by [`Worker::work`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub processed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub reason: StopReason,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Worker {
    store: Store,
    queue: Queue,
    host: Host,
    config: WorkerConfig,
    retention: QueueConfig,
    selection: QueueSelection,
    executor: Arc<dyn JobExecutor>,
    control: WorkerControl,
    id: WorkerId,
    key: String,
    packet: WorkerPacket,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.key)
            .field("config", &self.config)
            .finish()
    }
}

impl Worker {
    /// Create a worker for this process on this host.
    pub fn new(
        store: Store,
        config: WorkerConfig,
        retention: QueueConfig,
        executor: Arc<dyn JobExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        let selection = config.queue_selection()?;
        let id = WorkerId::new(process::hostname(), std::process::id(), &selection);
        let packet = WorkerPacket::new(&id, &config, unix_now());

        Ok(Self {
            queue: Queue::new(store.clone()),
            host: Host::new(store.clone(), &id.hostname),
            key: id.to_string(),
            store,
            config,
            retention,
            selection,
            executor,
            control: WorkerControl::new(),
            id,
            packet,
        })
    }

    /// Register under a different hostname and PID.
    pub fn with_identity(mut self, hostname: impl Into<String>, pid: u32) -> Self {
        self.id = WorkerId::new(hostname, pid, &self.selection);
        self.key = self.id.to_string();
        self.host = Host::new(self.store.clone(), &self.id.hostname);
        self.packet.hostname = self.id.hostname.clone();
        self.packet.pid = pid;
        self
    }

    /// Share an existing control handle.
    pub fn with_control(mut self, control: WorkerControl) -> Self {
        self.control = control;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    pub fn packet(&self) -> &WorkerPacket {
        &self.packet
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Register, run until stopped, then deregister.
    ///
    /// A store failure during registration aborts before anything is left
    /// behind for cleanup.
    pub async fn work(mut self) -> Result<WorkerSummary> {
        let _pid_file = match &self.config.pid_file {
            Some(path) => Some(PidFile::create(path)?),
            None => None,
        };

        self.register().await?;
        info!(
            worker_id = %self.key,
            queues = %self.selection,
            blocking = self.config.blocking,
            interval_secs = self.config.interval.as_secs_f64(),
            timeout_secs = self.config.timeout.as_secs_f64(),
            "Worker started"
        );

        let reason = self.run().await;

        if let Err(e) = self.deregister().await {
            e.log();
            warn!(worker_id = %self.key, "Worker exited without clean deregistration");
        }
        self.control.close();

        let summary = WorkerSummary {
            worker_id: self.key.clone(),
            processed: self.packet.processed,
            failed: self.packet.failed,
            cancelled: self.packet.cancelled,
            reason,
        };
        info!(
            worker_id = %summary.worker_id,
            processed = summary.processed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            reason = ?summary.reason,
            "Worker stopped"
        );
        Ok(summary)
    }

    async fn register(&mut self) -> Result<()> {
        let now = unix_now();
        self.packet.started = now;
        self.packet.heartbeat = now;
        self.packet.status = WorkerStatus::Started;
        self.packet.save(&self.store, &self.key).await?;
        self.host.register_worker(&self.key).await
    }

    async fn deregister(&mut self) -> Result<()> {
        self.set_status(WorkerStatus::ShuttingDown).await?;
        self.host.unregister_worker(&self.key).await?;
        self.store.del(&[StoreKey::Worker(&self.key).build()]).await?;
        self.packet.status = WorkerStatus::Stopped;
        Ok(())
    }

    async fn run(&mut self) -> StopReason {
        loop {
            if let Some(mode) = self.control.stop_mode() {
                return mode.into();
            }

            match self.iteration().await {
                Ok(Some(reason)) => return reason,
                Ok(None) => {}
                Err(e) => {
                    e.log();
                    error!(worker_id = %self.key, error = %e, "Worker iteration failed");
                    self.idle().await;
                }
            }
        }
    }

    async fn iteration(&mut self) -> Result<Option<StopReason>> {
        if self.control.take_cancel() {
            debug!(worker_id = %self.key, "Ignoring cancel request with no running job");
        }

        self.beat().await?;

        if self.control.is_paused() {
            if self.packet.status != WorkerStatus::Paused {
                info!(worker_id = %self.key, "Worker paused");
            }
            self.set_status(WorkerStatus::Paused).await?;
            self.idle().await;
            return Ok(None);
        }

        let queues = self.resolve_queues().await?;
        let now = unix_now();
        for queue in &queues {
            self.queue.promote_due(queue, now).await?;
        }

        self.set_status(WorkerStatus::Waiting).await?;

        let job = if queues.is_empty() {
            None
        } else if self.config.blocking {
            self.queue.pop_blocking(&queues, self.config.interval).await?
        } else {
            let mut popped = None;
            for queue in &queues {
                if let Some(job) = self.queue.pop(queue).await? {
                    popped = Some(job);
                    break;
                }
            }
            popped
        };

        match job {
            Some(job) => {
                self.process(job).await?;
                if self.over_memory_limit() {
                    return Ok(Some(StopReason::MemoryLimit));
                }
            }
            None if queues.is_empty() || !self.config.blocking => self.idle().await,
            None => {}
        }
        Ok(None)
    }

    async fn resolve_queues(&self) -> Result<Vec<String>> {
        match &self.selection {
            QueueSelection::All => self.queue.known_queues().await,
            QueueSelection::Named(names) => Ok(names.clone()),
        }
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.interval) => {}
            _ = self.control.changed() => {}
        }
    }

    /// Refresh heartbeat and memory. The whole packet is written so a
    /// concurrently deleted packet never comes back partial.
    async fn beat(&mut self) -> Result<()> {
        self.packet.heartbeat = unix_now();
        self.packet.memory = process::resident_memory_bytes();
        self.packet.save(&self.store, &self.key).await
    }

    async fn set_status(&mut self, status: WorkerStatus) -> Result<()> {
        self.packet.status = status;
        self.packet.save(&self.store, &self.key).await
    }

    fn over_memory_limit(&self) -> bool {
        match self.config.memory_limit_bytes() {
            Some(limit) if self.packet.memory > limit => {
                warn!(
                    worker_id = %self.key,
                    memory_bytes = self.packet.memory,
                    limit_bytes = limit,
                    "Memory limit exceeded, stopping"
                );
                true
            }
            _ => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Job Execution
    // ─────────────────────────────────────────────────────────────────────────

    async fn process(&mut self, mut job: Job) -> Result<()> {
        let started = unix_now();
        job.start(&self.store, &self.key, started).await?;

        let outcome = match self.executor.spawn(&job).await {
            Ok(child) => {
                self.packet.job_id = Some(job.id.clone());
                self.packet.job_pid = child.id();
                self.packet.job_started = Some(started);
                self.set_status(WorkerStatus::Running).await?;
                info!(worker_id = %self.key, job_id = %job.id, pid = ?child.id(), "Running job");

                let exit = self.supervise(child, &job).await;
                self.settle(&mut job, &exit).await?
            }
            Err(e) => {
                e.log();
                let outcome = JobOutcome::failed(e.user_message());
                job.finish(&self.store, &outcome, &self.retention, unix_now()).await?;
                outcome
            }
        };

        match outcome {
            JobOutcome::Processed => self.packet.processed += 1,
            JobOutcome::Failed { .. } => self.packet.failed += 1,
            JobOutcome::Cancelled => self.packet.cancelled += 1,
        }
        self.packet.job_id = None;
        self.packet.job_pid = None;
        self.packet.job_started = None;
        self.packet.memory = process::resident_memory_bytes();
        self.set_status(WorkerStatus::Waiting).await
    }

    /// Wait for the child, enforcing the timeout and forwarding control.
    async fn supervise(&mut self, mut child: Child, job: &Job) -> ChildExit {
        let control = self.control.clone();
        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                status = child.wait() => {
                    let exit = match status {
                        Ok(status) => ChildExit::from_status(status),
                        Err(e) => ChildExit::Error(e.to_string()),
                    };
                    return exit;
                }
                _ = &mut deadline => {
                    warn!(worker_id = %self.key, job_id = %job.id, "Job exceeded timeout, killing");
                    if let Err(e) = child.kill().await {
                        warn!(job_id = %job.id, error = %e, "Failed to kill job process");
                    }
                    return ChildExit::TimedOut;
                }
                _ = control.changed() => {
                    if control.stop_mode() == Some(StopMode::Force) {
                        warn!(worker_id = %self.key, job_id = %job.id, "Forced stop, killing job");
                        if let Err(e) = child.kill().await {
                            warn!(job_id = %job.id, error = %e, "Failed to kill job process");
                        }
                        return ChildExit::ForceStopped;
                    }
                    if control.take_cancel() {
                        match child.id() {
                            Some(pid) => {
                                info!(worker_id = %self.key, job_id = %job.id, pid, "Cancelling job");
                                if let Err(e) = process::send_signal(pid, Signal::Usr1) {
                                    e.log();
                                }
                            }
                            None => debug!(job_id = %job.id, "Cancel arrived after job exit"),
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!(worker_id = %self.key, error = %e, "Heartbeat failed");
                    }
                }
            }
        }
    }

    /// Determine the outcome after the child is gone.
    ///
    /// The child normally writes its own terminal state. When it did not, the
    /// worker writes one based on how the child ended. SIGUSR1 is only ever
    /// sent to cancel, so a child it killed counts as cancelled whoever sent it.
    async fn settle(&self, job: &mut Job, exit: &ChildExit) -> Result<JobOutcome> {
        let record = Job::load(&self.store, &job.id).await?;
        if let Some(outcome) = record.as_ref().and_then(JobOutcome::from_record) {
            return Ok(outcome);
        }

        let cancelled = matches!(
            exit,
            ChildExit::Exited(EXIT_CANCELLED) | ChildExit::Signaled(libc::SIGUSR1)
        );
        let outcome = if cancelled {
            JobOutcome::Cancelled
        } else {
            JobOutcome::failed(format!("Job process {}", exit.describe()))
        };

        if record.is_none() {
            warn!(job_id = %job.id, "Job record disappeared while running");
            return Ok(outcome);
        }

        job.finish(&self.store, &outcome, &self.retention, unix_now()).await?;
        Ok(outcome)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_selection() {
        assert_eq!(QueueSelection::parse("*").unwrap(), QueueSelection::All);
        assert_eq!(
            QueueSelection::parse("mail, sms").unwrap(),
            QueueSelection::Named(vec!["mail".into(), "sms".into()])
        );
        assert_eq!(QueueSelection::parse("mail,sms").unwrap().to_string(), "mail,sms");
        assert!(QueueSelection::parse(" , ").is_err());
        assert!(QueueSelection::parse("a:b").is_err());
    }

    #[test]
    fn test_worker_id_round_trip() {
        let id = WorkerId::new("h1", 42, &QueueSelection::parse("mail,sms").unwrap());
        assert_eq!(id.to_string(), "h1:42:mail,sms");
        assert_eq!(id.to_string().parse::<WorkerId>().unwrap(), id);

        assert!("h1:x:mail".parse::<WorkerId>().is_err());
        assert!("h1:42".parse::<WorkerId>().is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(WorkerConfig::default().validate().is_ok());

        let zero = WorkerConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(zero.validate().unwrap_err().code(), ErrorCode::InvalidConfiguration);

        let empty = WorkerConfig {
            queues: "".into(),
            ..Default::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_packet_fields_round_trip() {
        let config = WorkerConfig::default();
        let id = WorkerId::new("h1", 7, &QueueSelection::All);
        let mut packet = WorkerPacket::new(&id, &config, 1000);
        packet.job_id = Some("j1".into());
        packet.job_pid = Some(99);
        packet.processed = 3;

        let map: HashMap<String, String> = packet.to_fields().into_iter().collect();
        assert_eq!(map["job_started"], "");
        assert_eq!(WorkerPacket::from_fields(&map).unwrap(), packet);
    }

    #[tokio::test]
    async fn test_statusless_packet_loads_as_missing() {
        let store = Store::in_memory("hive");
        let key = StoreKey::Worker("h1:7:*").build();
        store
            .hset_multiple(&key, &[("heartbeat".to_string(), "10".to_string())])
            .await
            .unwrap();
        assert_eq!(WorkerPacket::load(&store, "h1:7:*").await.unwrap(), None);

        store
            .hset_multiple(&key, &[("status".to_string(), "waiting".to_string())])
            .await
            .unwrap();
        let packet = WorkerPacket::load(&store, "h1:7:*").await.unwrap().unwrap();
        assert_eq!(packet.status, WorkerStatus::Waiting);
        assert_eq!(packet.heartbeat, 10);
    }

    #[test]
    fn test_packet_to_config() {
        let config = WorkerConfig {
            queues: "mail".into(),
            blocking: false,
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(30),
            memory_limit_mb: 256,
            ..Default::default()
        };
        let id = WorkerId::new("h1", 7, &config.queue_selection().unwrap());
        let restored = WorkerPacket::new(&id, &config, 0).to_config();
        assert_eq!(restored, config);
    }
}
