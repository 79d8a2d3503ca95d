//! Built-in job handlers.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;

use super::job::{JobContext, JobError, JobHandler, JobResult};

/// Job: log the argument payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoJob;

#[async_trait]
impl JobHandler for EchoJob {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn perform(&self, ctx: &JobContext) -> JobResult {
        ctx.log_info(&ctx.args.to_string());
        Ok(())
    }
}

/// Job: sleep for `{"seconds": n}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepJob;

#[derive(Debug, Deserialize)]
struct SleepArgs {
    seconds: f64,
}

#[async_trait]
impl JobHandler for SleepJob {
    fn name(&self) -> &'static str {
        "sleep"
    }

    async fn perform(&self, ctx: &JobContext) -> JobResult {
        let args: SleepArgs = ctx.args()?;
        if !args.seconds.is_finite() || args.seconds < 0.0 {
            return Err(JobError::new("seconds must be a non-negative number"));
        }
        tokio::time::sleep(Duration::from_secs_f64(args.seconds)).await;
        Ok(())
    }
}

/// Job: always fail with `{"message": ".."}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailJob;

#[derive(Debug, Default, Deserialize)]
struct FailArgs {
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl JobHandler for FailJob {
    fn name(&self) -> &'static str {
        "fail"
    }

    async fn perform(&self, ctx: &JobContext) -> JobResult {
        let args: FailArgs = if ctx.args.is_null() {
            FailArgs::default()
        } else {
            ctx.args()?
        };
        Err(JobError::new(
            args.message.unwrap_or_else(|| "Job failed on request".to_string()),
        ))
    }
}

/// Job: run `{"command": ".."}` through `sh -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellJob;

#[derive(Debug, Deserialize)]
struct ShellArgs {
    command: String,
}

#[async_trait]
impl JobHandler for ShellJob {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn perform(&self, ctx: &JobContext) -> JobResult {
        let args: ShellArgs = ctx.args()?;

        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&args.command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| JobError::new(format!("Failed to run shell command: {}", e)))?;

        if status.success() {
            Ok(())
        } else {
            Err(JobError::new(format!("Command exited with {}", status))
                .with_context(serde_json::json!({ "command": args.command })))
        }
    }
}
