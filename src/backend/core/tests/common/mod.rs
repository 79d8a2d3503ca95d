//! Shared fixtures for the scenario tests.
//!
//! Workers run inside the test process against an in-memory store. Job
//! children are real OS processes so timeouts and cancellation go through
//! real signals.

#![allow(dead_code)]

use async_trait::async_trait;
use hive_core::config::QueueConfig;
use hive_core::error::Result;
use hive_core::jobs::{
    Job, JobContext, JobExecutor, JobHandler, JobRegistry, JobResult, WorkerConfig,
    WorkerLauncher,
};
use hive_core::store::Store;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};

// ============================================================================
// Executors
// ============================================================================

/// What the test executor does with a popped job.
#[derive(Debug, Clone)]
pub enum Mode {
    /// Run the handler in this process, then hand back an exited child.
    InProcess,
    /// Spawn `sh -c <script>` and never write the job's state.
    Script(&'static str),
}

pub struct TestExecutor {
    store: Store,
    registry: JobRegistry,
    retention: QueueConfig,
    mode: Mode,
}

impl TestExecutor {
    pub fn new(store: &Store, mode: Mode) -> Self {
        Self {
            store: store.clone(),
            registry: registry(),
            retention: QueueConfig::default(),
            mode,
        }
    }

    pub fn shared(store: &Store, mode: Mode) -> Arc<dyn JobExecutor> {
        Arc::new(Self::new(store, mode))
    }
}

#[async_trait]
impl JobExecutor for TestExecutor {
    async fn spawn(&self, job: &Job) -> Result<Child> {
        match self.mode {
            Mode::InProcess => {
                Job::perform_until(
                    &self.store,
                    &self.registry,
                    &job.id,
                    &self.retention,
                    std::future::pending(),
                )
                .await?;
                Ok(Command::new("true").spawn()?)
            }
            Mode::Script(script) => Ok(Command::new("sh")
                .arg("-c")
                .arg(script)
                .kill_on_drop(true)
                .spawn()?),
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Stand-in for an application job class.
pub struct SendJob;

#[async_trait]
impl JobHandler for SendJob {
    fn name(&self) -> &'static str {
        "Send"
    }

    async fn perform(&self, ctx: &JobContext) -> JobResult {
        let to = ctx.args.get("to").and_then(|v| v.as_str()).unwrap_or_default();
        ctx.log_info(&format!("sending to {}", to));
        Ok(())
    }
}

pub fn registry() -> JobRegistry {
    let mut registry = JobRegistry::with_builtins();
    registry.register(SendJob);
    registry
}

// ============================================================================
// Launcher
// ============================================================================

/// Records launch requests instead of starting processes.
#[derive(Default)]
pub struct RecordingLauncher {
    pub launched: Mutex<Vec<WorkerConfig>>,
}

#[async_trait]
impl WorkerLauncher for RecordingLauncher {
    async fn launch(&self, config: &WorkerConfig) -> Result<u32> {
        self.launched.lock().push(config.clone());
        Ok(4242)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// A fast-polling worker configuration for `queues`.
pub fn worker_config(queues: &str) -> WorkerConfig {
    WorkerConfig {
        queues: queues.to_string(),
        blocking: false,
        interval: Duration::from_millis(50),
        timeout: Duration::from_secs(10),
        memory_limit_mb: 0,
        pid_file: None,
        heartbeat_interval: Duration::from_secs(1),
        stale_after: Duration::from_secs(60),
    }
}

/// Poll `check` until it holds, failing the test after ten seconds.
pub async fn eventually<F, Fut>(store: &Store, what: &str, check: F)
where
    F: Fn(Store) -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check(store.clone()).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// A live process to stand in for a worker.
pub fn spawn_sleeper() -> std::process::Child {
    std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleep")
}

/// A PID that belonged to a process which has already exited.
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("wait true");
    pid
}
