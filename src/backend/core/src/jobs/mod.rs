//! Background job system for Hive.
//!
//! Producers push jobs onto named queues; worker processes pop them and run
//! each one in a child process, reporting through the shared store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            Shared store                                   │
//! │  queues  queue:<q>  queue:<q>:delayed  queue:<q>:stats  job:<id>          │
//! │  hosts   host:<h>   worker:<id>        stats                              │
//! └──────────────────────────────────────────────────────────────────────────┘
//!        ▲                    ▲                         ▲
//!        │ push / delay       │ pop / finish            │ lookup + signals
//! ┌─────────────┐     ┌──────────────────┐      ┌──────────────────┐
//! │  Producer   │     │  Worker process  │      │    Controller    │
//! │  (Queue)    │     │  ├─ child: job   │◀─────│ (operator tools) │
//! └─────────────┘     └──────────────────┘ SIG* └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use hive_core::jobs::{Queue, Worker, ProcessExecutor};
//!
//! let queue = Queue::new(store.clone());
//! queue.push("mail", "echo", serde_json::json!({"to": "x"})).await?;
//!
//! let worker = Worker::new(store, config.worker, config.queue, Arc::new(ProcessExecutor::current_exe()?))?;
//! let summary = worker.work().await?;
//! ```

pub mod control;
pub mod executor;
pub mod host;
pub mod job;
pub mod process;
pub mod queue;
pub mod registry;
pub mod signals;
pub mod worker;

mod builtin;

pub use builtin::{EchoJob, FailJob, ShellJob, SleepJob};
pub use control::{
    CleanupReport, CommandLauncher, ControlOutcome, ControlReport, ControlStatus, Controller,
    Target, WorkerInfo, WorkerLauncher,
};
pub use executor::{ChildExit, JobExecutor, ProcessExecutor};
pub use host::{Host, HostCleanupReport};
pub use job::{
    CancelSignal, Job, JobCleanupReport, JobContext, JobError, JobHandler, JobId, JobOutcome,
    JobResult, JobStatus,
};
pub use process::{PidFile, Signal};
pub use queue::{Delay, GlobalStats, Queue, QueueStats};
pub use registry::JobRegistry;
pub use signals::{listen_for_signals, StopMode, WorkerControl};
pub use worker::{
    QueueSelection, StopReason, Worker, WorkerConfig, WorkerId, WorkerPacket, WorkerStatus,
    WorkerSummary,
};

/// Current Unix time in whole seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
