//! Job records, states and handlers.
//!
//! This module provides:
//!
//! - **Job**: the persisted record (`job:<id>` hash) and its state transitions
//! - **JobStatus**: `queued → (delayed →) running → processed | failed | cancelled`
//! - **JobHandler**: the trait implemented by job classes
//! - **Cleanup**: reclaiming zombie and expired job records

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::JobRegistry;
use super::unix_now;
use crate::config::QueueConfig;
use crate::error::{ErrorCode, HiveError, Result};
use crate::store::{Store, StoreKey};
use crate::telemetry::{CleanupMetrics, JobMetrics};

/// Child exit code for a processed job.
pub const EXIT_PROCESSED: i32 = 0;
/// Child exit code for a failed job.
pub const EXIT_FAILED: i32 = 1;
/// Child exit code for a cancelled job.
pub const EXIT_CANCELLED: i32 = 2;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| HiveError::validation(format!("\"{}\" is not a valid job id", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in a pending list
    Queued,
    /// Waiting in the delayed set for its due time
    Delayed,
    /// Owned by a worker and executing
    Running,
    /// Handler returned without error
    Processed,
    /// Handler failed or exceeded the timeout
    Failed,
    /// Cancelled while running
    Cancelled,
    /// Running, but the owning worker is gone. Detected by cleanup, never stored.
    Zombie,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Delayed => "delayed",
            Self::Running => "running",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Zombie => "zombie",
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "delayed" => Ok(Self::Delayed),
            "running" => Ok(Self::Running),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "zombie" => Ok(Self::Zombie),
            other => Err(HiveError::new(
                ErrorCode::DeserializationError,
                format!("Unknown job status \"{}\"", other),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error returned by a job handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Optional error code
    pub code: Option<String>,
    /// Additional context
    pub context: Option<serde_json::Value>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            context: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<HiveError> for JobError {
    fn from(error: HiveError) -> Self {
        Self {
            message: error.user_message().to_string(),
            code: Some(error.code().to_string()),
            context: None,
        }
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Processed,
    Failed {
        error: String,
        backtrace: Option<String>,
    },
    Cancelled,
}

impl JobOutcome {
    /// A failure without a backtrace.
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            backtrace: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Self::Processed => JobStatus::Processed,
            Self::Failed { .. } => JobStatus::Failed,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }

    /// Counter field and metric label for this outcome.
    pub fn label(&self) -> &'static str {
        self.status().as_str()
    }

    /// Exit code of a child process that finished with this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Processed => EXIT_PROCESSED,
            Self::Failed { .. } => EXIT_FAILED,
            Self::Cancelled => EXIT_CANCELLED,
        }
    }

    /// The outcome already written to a terminal record.
    pub fn from_record(job: &Job) -> Option<Self> {
        match job.status {
            JobStatus::Processed => Some(Self::Processed),
            JobStatus::Cancelled => Some(Self::Cancelled),
            JobStatus::Failed => Some(Self::Failed {
                error: job.error.clone().unwrap_or_default(),
                backtrace: job.backtrace.clone(),
            }),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// A job as stored under `job:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    /// Handler class name
    pub class: String,
    pub args: serde_json::Value,
    pub status: JobStatus,
    pub created: i64,
    /// Due time for delayed jobs
    pub delayed: Option<i64>,
    /// Owning worker while running
    pub worker: Option<String>,
    pub started: Option<i64>,
    pub finished: Option<i64>,
    pub error: Option<String>,
    pub backtrace: Option<String>,
}

impl Job {
    /// Create a new queued job with a fresh ID.
    pub fn new(queue: impl Into<String>, class: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: JobId::new().to_string(),
            queue: queue.into(),
            class: class.into(),
            args,
            status: JobStatus::Queued,
            created: unix_now(),
            delayed: None,
            worker: None,
            started: None,
            finished: None,
            error: None,
            backtrace: None,
        }
    }

    pub fn key(&self) -> String {
        StoreKey::Job(&self.id).build()
    }

    /// Hash fields for the record. Unset optional fields are omitted.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("id".to_string(), self.id.clone()),
            ("queue".to_string(), self.queue.clone()),
            ("class".to_string(), self.class.clone()),
            ("args".to_string(), self.args.to_string()),
            ("status".to_string(), self.status.to_string()),
            ("created".to_string(), self.created.to_string()),
        ];

        let optional = [
            ("delayed", self.delayed.map(|v| v.to_string())),
            ("worker", self.worker.clone()),
            ("started", self.started.map(|v| v.to_string())),
            ("finished", self.finished.map(|v| v.to_string())),
            ("error", self.error.clone()),
            ("backtrace", self.backtrace.clone()),
        ];
        fields.extend(
            optional
                .into_iter()
                .filter_map(|(name, value)| value.map(|v| (name.to_string(), v))),
        );
        fields
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let required = |name: &str| {
            fields.get(name).cloned().ok_or_else(|| {
                HiveError::new(
                    ErrorCode::DeserializationError,
                    format!("Job record is missing field \"{}\"", name),
                )
            })
        };
        let timestamp = |name: &str| fields.get(name).and_then(|v| v.parse::<i64>().ok());

        let args = match fields.get("args") {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => serde_json::Value::Null,
        };

        Ok(Self {
            id: required("id")?,
            queue: required("queue")?,
            class: required("class")?,
            args,
            status: required("status")?.parse()?,
            created: timestamp("created").unwrap_or_default(),
            delayed: timestamp("delayed"),
            worker: fields.get("worker").filter(|v| !v.is_empty()).cloned(),
            started: timestamp("started"),
            finished: timestamp("finished"),
            error: fields.get("error").cloned(),
            backtrace: fields.get("backtrace").cloned(),
        })
    }

    /// Write the whole record.
    pub async fn save(&self, store: &Store) -> Result<()> {
        store.hset_multiple(&self.key(), &self.to_fields()).await
    }

    pub async fn load(store: &Store, id: &str) -> Result<Option<Self>> {
        let fields = store.hgetall(&StoreKey::Job(id).build()).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Self::from_fields(&fields).map(Some)
    }

    pub async fn exists(store: &Store, id: &str) -> Result<bool> {
        store.exists(&StoreKey::Job(id).build()).await
    }

    /// Seconds between start and finish, if both are known.
    pub fn duration_secs(&self) -> Option<i64> {
        match (self.started, self.finished) {
            (Some(started), Some(finished)) => Some((finished - started).max(0)),
            _ => None,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Mark the job as running under `worker_id` and add its running marker.
    pub async fn start(&mut self, store: &Store, worker_id: &str, now: i64) -> Result<()> {
        self.status = JobStatus::Running;
        self.worker = Some(worker_id.to_string());
        self.started = Some(now);

        store
            .hset_multiple(
                &self.key(),
                &[
                    ("status".to_string(), self.status.to_string()),
                    ("worker".to_string(), worker_id.to_string()),
                    ("started".to_string(), now.to_string()),
                ],
            )
            .await?;
        store
            .zadd(&StoreKey::Running(&self.queue).build(), &self.id, now as f64)
            .await?;

        debug!(job_id = %self.id, queue = %self.queue, worker_id, "Job started");
        Ok(())
    }

    /// Write a terminal state.
    ///
    /// The claim and every write it guards happen in one atomic store step:
    /// only the writer that removes the running marker (or finds the record
    /// still `running` without one) updates the record, the counters and the
    /// retention set. Returns `false` when another writer (the child, the
    /// parent fallback or a cleanup sweep) got there first.
    pub async fn finish(
        &mut self,
        store: &Store,
        outcome: &JobOutcome,
        retention: &QueueConfig,
        now: i64,
    ) -> Result<bool> {
        let status = outcome.status();
        let mut fields = vec![
            ("status".to_string(), status.to_string()),
            ("finished".to_string(), now.to_string()),
        ];
        if let JobOutcome::Failed { error, backtrace } = outcome {
            fields.push(("error".to_string(), error.clone()));
            if let Some(trace) = backtrace {
                fields.push(("backtrace".to_string(), trace.clone()));
            }
        }

        let counter = outcome.label();
        let ttl = match outcome {
            JobOutcome::Failed { .. } => retention.failed_ttl,
            _ => retention.processed_ttl,
        };
        let expires = now + ttl.as_secs() as i64;

        let claimed = store
            .finish_job(&self.queue, &self.id, &fields, counter, expires as f64)
            .await?;
        if !claimed {
            debug!(job_id = %self.id, "Job already finalized elsewhere");
            return Ok(false);
        }

        self.status = status;
        self.finished = Some(now);
        if let JobOutcome::Failed { error, backtrace } = outcome {
            self.error = Some(error.clone());
            if backtrace.is_some() {
                self.backtrace = backtrace.clone();
            }
        }

        let duration = self.duration_secs().unwrap_or(0);
        JobMetrics::record_outcome(&self.queue, counter, duration as f64);

        match outcome {
            JobOutcome::Failed { error, .. } => {
                warn!(job_id = %self.id, queue = %self.queue, class = %self.class, error = %error, "Job failed")
            }
            _ => info!(
                job_id = %self.id,
                queue = %self.queue,
                class = %self.class,
                status = %self.status,
                duration_secs = duration,
                "Job finished"
            ),
        }
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Child Process Entry
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a job inside the child process.
    ///
    /// `cancel` cancels the handler; the terminal state is written here before
    /// returning, so the exit code is only informational for the parent.
    pub async fn perform(
        store: &Store,
        registry: &JobRegistry,
        id: &str,
        retention: &QueueConfig,
        cancel: CancelSignal,
    ) -> Result<JobOutcome> {
        Self::perform_until(store, registry, id, retention, cancel.recv()).await
    }

    /// Run a job's handler until it returns or `cancelled` resolves.
    pub async fn perform_until<F>(
        store: &Store,
        registry: &JobRegistry,
        id: &str,
        retention: &QueueConfig,
        cancelled: F,
    ) -> Result<JobOutcome>
    where
        F: Future<Output = ()> + Send,
    {
        let mut job = Self::load(store, id)
            .await?
            .ok_or_else(|| HiveError::job_not_found(id))?;

        let outcome = match registry.get(&job.class) {
            None => {
                let error = HiveError::handler_not_found(&job.class);
                JobOutcome::Failed {
                    error: error.user_message().to_string(),
                    backtrace: None,
                }
            }
            Some(handler) => {
                let ctx = JobContext::new(&job);
                let mut task = tokio::spawn(async move { handler.perform(&ctx).await });

                tokio::select! {
                    joined = &mut task => match joined {
                        Ok(Ok(())) => JobOutcome::Processed,
                        Ok(Err(error)) => JobOutcome::Failed {
                            error: error.to_string(),
                            backtrace: Some(format!("{:#?}", error)),
                        },
                        Err(join_error) => JobOutcome::failed(format!("Job handler panicked: {}", join_error)),
                    },
                    _ = cancelled => {
                        task.abort();
                        info!(job_id = %job.id, "Job cancelled");
                        JobOutcome::Cancelled
                    }
                }
            }
        };

        job.finish(store, &outcome, retention, unix_now()).await?;
        Ok(outcome)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cleanup
    // ─────────────────────────────────────────────────────────────────────────

    /// Reclaim zombie and processed job records across all known queues.
    ///
    /// Removal is conditional on `ZREM` succeeding, so concurrent sweeps never
    /// count the same job twice. A job or queue that fails is recorded in
    /// `errors` and the sweep continues.
    pub async fn cleanup(store: &Store, now: i64) -> Result<JobCleanupReport> {
        let mut report = JobCleanupReport::default();

        for queue in store.smembers(&StoreKey::Queues.build()).await? {
            if let Err(e) = Self::cleanup_queue(store, &queue, now, &mut report).await {
                warn!(queue = %queue, error = %e, "Job cleanup failed for queue");
                report.errors.push(format!("{}: {}", queue, e));
            }
        }

        CleanupMetrics::record_removed("zombie", report.zombie);
        CleanupMetrics::record_removed("processed", report.processed);
        Ok(report)
    }

    async fn cleanup_queue(
        store: &Store,
        queue: &str,
        now: i64,
        report: &mut JobCleanupReport,
    ) -> Result<()> {
        let running_key = StoreKey::Running(queue).build();
        for (id, _) in store
            .zrangebyscore(&running_key, f64::NEG_INFINITY, f64::INFINITY)
            .await?
        {
            match Self::reclaim_running(store, queue, &id).await {
                Ok(Reclaimed::Kept) => {}
                Ok(Reclaimed::Zombie) => report.zombie += 1,
                Ok(Reclaimed::Marker) => report.processed += 1,
                Err(e) => {
                    warn!(job_id = %id, queue, error = %e, "Running job cleanup failed");
                    report.errors.push(format!("{}: {}", id, e));
                }
            }
        }

        let processed_key = StoreKey::Processed(queue).build();
        for (id, _) in store
            .zrangebyscore(&processed_key, f64::NEG_INFINITY, now as f64)
            .await?
        {
            match Self::expire(store, &processed_key, &id).await {
                Ok(true) => report.processed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(job_id = %id, queue, error = %e, "Expired job cleanup failed");
                    report.errors.push(format!("{}: {}", id, e));
                }
            }
        }
        Ok(())
    }

    async fn reclaim_running(store: &Store, queue: &str, id: &str) -> Result<Reclaimed> {
        let running_key = StoreKey::Running(queue).build();
        let zombie = match Self::load(store, id).await? {
            // Record gone or already terminal: only the marker is stale.
            None => false,
            Some(job) if job.status.is_terminal() => false,
            Some(job) => match &job.worker {
                Some(worker) => {
                    if store.exists(&StoreKey::Worker(worker).build()).await? {
                        return Ok(Reclaimed::Kept);
                    }
                    true
                }
                None => true,
            },
        };

        if !store.zrem(&running_key, id).await? {
            return Ok(Reclaimed::Kept);
        }
        if !zombie {
            return Ok(Reclaimed::Marker);
        }

        store.del(&[StoreKey::Job(id).build()]).await?;
        store.hincrby(&StoreKey::Stats.build(), "zombie", 1).await?;
        warn!(job_id = %id, queue, "Removed zombie job");
        Ok(Reclaimed::Zombie)
    }

    async fn expire(store: &Store, processed_key: &str, id: &str) -> Result<bool> {
        if !store.zrem(processed_key, id).await? {
            return Ok(false);
        }
        store.del(&[StoreKey::Job(id).build()]).await?;
        Ok(true)
    }
}

enum Reclaimed {
    /// Still owned by a live worker, or swept by someone else
    Kept,
    Zombie,
    /// Stale marker of a finished or deleted job
    Marker,
}

/// Result of [`Job::cleanup`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCleanupReport {
    /// Running jobs whose worker no longer exists
    pub zombie: u64,
    /// Stale running markers and expired terminal records
    pub processed: u64,
    /// Per-job and per-queue failures that did not stop the sweep
    pub errors: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cancellation
// ═══════════════════════════════════════════════════════════════════════════════

/// SIGUSR1 listener of a job child process.
///
/// SIGUSR1 terminates the process until this is installed. Signals that
/// arrive between installing and awaiting [`CancelSignal::recv`] are kept.
#[derive(Debug)]
pub struct CancelSignal(tokio::signal::unix::Signal);

impl CancelSignal {
    pub fn install() -> Result<Self> {
        let signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())?;
        Ok(Self(signal))
    }

    /// Resolve on the first SIGUSR1.
    pub async fn recv(mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to handlers during execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub queue: String,
    pub class: String,
    pub args: serde_json::Value,
    pub worker: Option<String>,
}

impl JobContext {
    pub fn new(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            class: job.class.clone(),
            args: job.args.clone(),
            worker: job.worker.clone(),
        }
    }

    /// Deserialize the argument payload.
    pub fn args<T: DeserializeOwned>(&self) -> std::result::Result<T, JobError> {
        serde_json::from_value(self.args.clone()).map_err(|e| {
            JobError::new(format!("Invalid arguments for {}: {}", self.class, e))
                .with_code(ErrorCode::ValidationError.to_string())
        })
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(job_id = %self.job_id, queue = %self.queue, class = %self.class, message);
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(job_id = %self.job_id, queue = %self.queue, class = %self.class, message);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Implemented by every job class.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The class name producers use to address this handler.
    fn name(&self) -> &'static str;

    /// Execute the job.
    ///
    /// Returning an error marks the job `failed`; there is no automatic retry.
    async fn perform(&self, ctx: &JobContext) -> JobResult;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
