#![allow(clippy::result_large_err)]
//! # Hive Core
//!
//! A background job queue coordinated entirely through a shared Redis store.
//!
//! ## Architecture
//!
//! - **Store**: namespaced, enumerated command interface over Redis (or memory)
//! - **Queue**: FIFO lists, a delayed set and per-queue counters
//! - **Job**: the job record and its state machine, handlers and cleanup
//! - **Host**: which workers are registered on which machine
//! - **Worker**: the polling process that runs each job in a child process
//! - **Control**: operator-side lookup, signalling and cleanup
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod config;
pub mod error;
pub mod jobs;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, HiveError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, QueueConfig, RedisConfig};
    pub use crate::error::{ErrorCode, ErrorContext, HiveError, Result};
    pub use crate::jobs::{
        Controller, Delay, Job, JobContext, JobError, JobHandler, JobOutcome, JobRegistry,
        JobResult, JobStatus, ProcessExecutor, Queue, Target, Worker, WorkerConfig,
    };
    pub use crate::store::{Store, StoreKey};
}
