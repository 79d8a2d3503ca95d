//! Spawning the child process that runs a job.

use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};

use super::job::Job;
use crate::error::{ErrorCode, HiveError, Result};

/// Starts a child process that performs one job.
///
/// The child is responsible for writing the job's terminal state; the worker
/// only supervises it.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn spawn(&self, job: &Job) -> Result<Child>;
}

/// Runs `program [args..] <job-id>`.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// The running binary's `worker perform` entry point.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(exe).with_args(["worker", "perform"]))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn spawn(&self, job: &Job) -> Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .arg(&job.id)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HiveError::new(
                    ErrorCode::ProcessSpawnFailed,
                    format!("Failed to start job process for {}", job.id),
                )
                .with_context("program", self.program.display().to_string())
                .with_source(e)
            })
    }
}

/// How a supervised child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    /// Terminated by this signal number
    Signaled(i32),
    /// Killed after exceeding the job timeout
    TimedOut,
    /// Killed by a forced worker stop
    ForceStopped,
    /// Waiting on the child failed
    Error(String),
}

impl ChildExit {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::Signaled(signal),
            (None, None) => Self::Error(format!("unknown exit status {}", status)),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(signal) => format!("terminated by signal {}", signal),
            Self::TimedOut => "exceeded timeout".to_string(),
            Self::ForceStopped => "killed by forced worker stop".to_string(),
            Self::Error(message) => message.clone(),
        }
    }
}
