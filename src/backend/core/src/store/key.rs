//! Store key layout and namespacing.
//!
//! Every key the system touches is built from a [`StoreKey`] and prefixed by
//! a [`Namespace`] before it reaches the backend, so several deployments can
//! share one store instance.

use std::fmt;

// ═══════════════════════════════════════════════════════════════════════════════
// Namespace
// ═══════════════════════════════════════════════════════════════════════════════

/// A key prefix. Always stored with a single trailing `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    pub fn new(namespace: &str) -> Self {
        let trimmed = namespace.trim_end_matches(':');
        Self {
            prefix: format!("{}:", trimmed),
        }
    }

    /// The prefix including the trailing separator.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The namespace name without the separator.
    pub fn name(&self) -> &str {
        &self.prefix[..self.prefix.len() - 1]
    }

    /// Prefix a key. Keys that already carry the prefix are returned unchanged.
    pub fn add(&self, key: &str) -> String {
        if key.starts_with(&self.prefix) {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    /// Strip the prefix from a key. Foreign keys are returned unchanged.
    pub fn remove(&self, key: &str) -> String {
        key.strip_prefix(&self.prefix).unwrap_or(key).to_string()
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new("hive")
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Key Layout
// ═══════════════════════════════════════════════════════════════════════════════

/// Every key in the store, before namespacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKey<'a> {
    /// Set of known queue names
    Queues,
    /// Pending list of job IDs
    Queue(&'a str),
    /// Delayed job IDs scored by due time
    Delayed(&'a str),
    /// Per-queue counters hash
    QueueStats(&'a str),
    /// Running job IDs scored by start time
    Running(&'a str),
    /// Terminal job IDs scored by retention expiry
    Processed(&'a str),
    /// Job record hash
    Job(&'a str),
    /// Worker packet hash
    Worker(&'a str),
    /// Set of host names
    Hosts,
    /// Set of worker IDs on a host
    Host(&'a str),
    /// Global counters hash
    Stats,
}

impl StoreKey<'_> {
    /// Prefix shared by all job record keys.
    pub const JOB_PREFIX: &'static str = "job:";

    pub fn build(&self) -> String {
        match self {
            Self::Queues => "queues".to_string(),
            Self::Queue(name) => format!("queue:{}", name),
            Self::Delayed(name) => format!("queue:{}:delayed", name),
            Self::QueueStats(name) => format!("queue:{}:stats", name),
            Self::Running(name) => format!("queue:{}:running", name),
            Self::Processed(name) => format!("queue:{}:processed", name),
            Self::Job(id) => format!("{}{}", Self::JOB_PREFIX, id),
            Self::Worker(id) => format!("worker:{}", id),
            Self::Hosts => "hosts".to_string(),
            Self::Host(name) => format!("host:{}", name),
            Self::Stats => "stats".to_string(),
        }
    }

    /// Recover the queue name from a pending-list key (`queue:<name>`).
    pub fn queue_name(key: &str) -> Option<&str> {
        key.strip_prefix("queue:").filter(|rest| !rest.is_empty())
    }
}

impl fmt::Display for StoreKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
