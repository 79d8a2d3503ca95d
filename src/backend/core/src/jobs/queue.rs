//! Named FIFO queues with a delayed set and per-queue counters.
//!
//! Layout per queue `q`:
//!
//! - `queue:q` list of pending job IDs
//! - `queue:q:delayed` sorted set of job IDs scored by due time
//! - `queue:q:stats` hash of counters
//!
//! Counters are bumped before the reference is inserted, so an observer that
//! can see a reference can also see it counted.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::job::{Job, JobStatus};
use super::unix_now;
use crate::error::{HiveError, Result};
use crate::store::{Store, StoreKey};
use crate::telemetry::JobMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Delay
// ═══════════════════════════════════════════════════════════════════════════════

/// When a delayed job becomes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Relative seconds, or an absolute timestamp if not earlier than now.
    Seconds(i64),
    /// Absolute Unix timestamp.
    At(i64),
}

impl Delay {
    /// Parse an operator-supplied delay.
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        match trimmed.parse::<i64>() {
            Ok(seconds) if seconds >= 0 => Ok(Self::Seconds(seconds)),
            _ => Err(HiveError::invalid_delay(trimmed)),
        }
    }

    /// Resolve to an absolute due time. `None` means push immediately.
    pub fn resolve(&self, now: i64) -> Option<i64> {
        match *self {
            Self::Seconds(n) if n <= 0 => None,
            Self::Seconds(n) if n >= now => Some(n),
            Self::Seconds(n) => Some(now + n),
            Self::At(ts) => Some(ts),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Counters of one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    pub queued: i64,
    pub delayed: i64,
    pub processed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

impl QueueStats {
    fn from_hash(queue: &str, hash: &HashMap<String, String>) -> Self {
        let field = |name: &str| hash.get(name).and_then(|v| v.parse().ok()).unwrap_or(0);
        Self {
            queue: queue.to_string(),
            queued: field("queued"),
            delayed: field("delayed"),
            processed: field("processed"),
            failed: field("failed"),
            cancelled: field("cancelled"),
            total: field("total"),
        }
    }
}

/// Aggregates kept in the global `stats` hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalStats {
    pub total: i64,
    pub processed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub zombie: i64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// Producer and consumer operations on queues.
#[derive(Debug, Clone)]
pub struct Queue {
    store: Store,
}

impl Queue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Producer
    // ─────────────────────────────────────────────────────────────────────────

    /// Enqueue a job for immediate execution.
    pub async fn push(&self, queue: &str, class: &str, args: serde_json::Value) -> Result<Job> {
        self.enqueue(Job::new(queue, class, args), None, unix_now()).await
    }

    /// Enqueue a job that becomes due after `delay`.
    pub async fn delay(
        &self,
        queue: &str,
        class: &str,
        args: serde_json::Value,
        delay: Delay,
    ) -> Result<Job> {
        self.enqueue(Job::new(queue, class, args), Some(delay), unix_now()).await
    }

    /// Store a prepared job and insert its reference.
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue))]
    pub async fn enqueue(&self, mut job: Job, delay: Option<Delay>, now: i64) -> Result<Job> {
        if job.queue.trim().is_empty() {
            return Err(HiveError::validation("Queue name must not be empty"));
        }
        if job.class.trim().is_empty() {
            return Err(HiveError::validation("Job class must not be empty"));
        }

        let due = delay.and_then(|d| d.resolve(now));
        job.status = if due.is_some() {
            JobStatus::Delayed
        } else {
            JobStatus::Queued
        };
        job.delayed = due;
        job.save(&self.store).await?;

        self.store.sadd(&StoreKey::Queues.build(), &job.queue).await?;

        let stats = StoreKey::QueueStats(&job.queue).build();
        self.store.hincrby(&stats, "total", 1).await?;
        self.store.hincrby(&StoreKey::Stats.build(), "total", 1).await?;

        match due {
            Some(at) => {
                self.store.hincrby(&stats, "delayed", 1).await?;
                self.store
                    .zadd(&StoreKey::Delayed(&job.queue).build(), &job.id, at as f64)
                    .await?;
                JobMetrics::record_enqueued(&job.queue, "delayed");
                info!(class = %job.class, due = at, "Job delayed");
            }
            None => {
                self.store.hincrby(&stats, "queued", 1).await?;
                self.store.rpush(&StoreKey::Queue(&job.queue).build(), &job.id).await?;
                JobMetrics::record_enqueued(&job.queue, "immediate");
                info!(class = %job.class, "Job queued");
            }
        }

        Ok(job)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Consumer
    // ─────────────────────────────────────────────────────────────────────────

    /// Pop the head of `queue` without blocking.
    pub async fn pop(&self, queue: &str) -> Result<Option<Job>> {
        match self.store.lpop(&StoreKey::Queue(queue).build()).await? {
            Some(id) => self.claimed(queue, &id).await,
            None => Ok(None),
        }
    }

    /// Pop from the first non-empty queue, waiting up to `timeout`.
    ///
    /// A zero timeout waits indefinitely.
    pub async fn pop_blocking(&self, queues: &[String], timeout: Duration) -> Result<Option<Job>> {
        if queues.is_empty() {
            return Ok(None);
        }
        let keys: Vec<String> = queues.iter().map(|q| StoreKey::Queue(q).build()).collect();

        match self.store.blpop(&keys, timeout).await? {
            Some((key, id)) => {
                let queue = StoreKey::queue_name(&key).unwrap_or(&key).to_string();
                self.claimed(&queue, &id).await
            }
            None => Ok(None),
        }
    }

    async fn claimed(&self, queue: &str, id: &str) -> Result<Option<Job>> {
        self.store
            .hincrby(&StoreKey::QueueStats(queue).build(), "queued", -1)
            .await?;

        match Job::load(&self.store, id).await? {
            Some(job) => {
                debug!(job_id = %id, queue, "Job popped");
                Ok(Some(job))
            }
            None => {
                warn!(job_id = %id, queue, "Popped a reference without a job record");
                Ok(None)
            }
        }
    }

    /// Move due delayed jobs into the pending list. Returns promoted IDs.
    pub async fn promote_due(&self, queue: &str, now: i64) -> Result<Vec<String>> {
        let promoted = self.store.promote_delayed(queue, now as f64).await?;
        if !promoted.is_empty() {
            info!(queue, count = promoted.len(), "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────────

    /// Known queue names, sorted.
    pub async fn known_queues(&self) -> Result<Vec<String>> {
        let mut queues = self.store.smembers(&StoreKey::Queues.build()).await?;
        queues.sort();
        Ok(queues)
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let hash = self.store.hgetall(&StoreKey::QueueStats(queue).build()).await?;
        Ok(QueueStats::from_hash(queue, &hash))
    }

    pub async fn all_stats(&self) -> Result<Vec<QueueStats>> {
        let mut all = Vec::new();
        for queue in self.known_queues().await? {
            all.push(self.stats(&queue).await?);
        }
        Ok(all)
    }

    pub async fn global_stats(&self) -> Result<GlobalStats> {
        let hash = self.store.hgetall(&StoreKey::Stats.build()).await?;
        let field = |name: &str| hash.get(name).and_then(|v| v.parse().ok()).unwrap_or(0);
        Ok(GlobalStats {
            total: field("total"),
            processed: field("processed"),
            failed: field("failed"),
            cancelled: field("cancelled"),
            zombie: field("zombie"),
        })
    }

    /// Number of pending references.
    pub async fn len(&self, queue: &str) -> Result<u64> {
        self.store.llen(&StoreKey::Queue(queue).build()).await
    }

    pub async fn delayed_len(&self, queue: &str) -> Result<u64> {
        self.store.zcard(&StoreKey::Delayed(queue).build()).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn queue() -> Queue {
        Queue::new(Store::in_memory("hive"))
    }

    #[test]
    fn test_delay_parse() {
        assert_eq!(Delay::parse("5").unwrap(), Delay::Seconds(5));
        assert_eq!(Delay::parse(" 0 ").unwrap(), Delay::Seconds(0));
        assert_eq!(Delay::parse("-3").unwrap_err().code(), ErrorCode::InvalidDelay);
        assert_eq!(Delay::parse("soon").unwrap_err().code(), ErrorCode::InvalidDelay);
        assert!(Delay::parse("1.5").is_err());
    }

    #[test]
    fn test_delay_resolve() {
        assert_eq!(Delay::Seconds(0).resolve(1000), None);
        assert_eq!(Delay::Seconds(5).resolve(1000), Some(1005));
        assert_eq!(Delay::Seconds(2000).resolve(1000), Some(2000));
        assert_eq!(Delay::Seconds(1000).resolve(1000), Some(1000));
        assert_eq!(Delay::At(900).resolve(1000), Some(900));
    }

    #[tokio::test]
    async fn test_push_and_pop_fifo() {
        let q = queue();
        let a = q.push("mail", "echo", json!(1)).await.unwrap();
        let b = q.push("mail", "echo", json!(2)).await.unwrap();

        assert_eq!(q.len("mail").await.unwrap(), 2);
        assert_eq!(q.pop("mail").await.unwrap().unwrap().id, a.id);
        assert_eq!(q.pop("mail").await.unwrap().unwrap().id, b.id);
        assert!(q.pop("mail").await.unwrap().is_none());

        let stats = q.stats("mail").await.unwrap();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.total, 2);
        assert_eq!(q.global_stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_class() {
        let q = queue();
        let err = q.push("mail", " ", json!(null)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert!(q.known_queues().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_delay_is_immediate() {
        let q = queue();
        let job = q
            .enqueue(Job::new("mail", "echo", json!(null)), Some(Delay::Seconds(0)), 1000)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(q.len("mail").await.unwrap(), 1);
        assert_eq!(q.delayed_len("mail").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pop_blocking_reports_queue() {
        let q = queue();
        q.push("b", "echo", json!(null)).await.unwrap();

        let job = q
            .pop_blocking(&["a".into(), "b".into()], Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.queue, "b");
        assert_eq!(q.stats("b").await.unwrap().queued, 0);

        let none = q
            .pop_blocking(&["a".into()], Duration::from_millis(20))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_known_queues_sorted() {
        let q = queue();
        q.push("zeta", "echo", json!(null)).await.unwrap();
        q.push("alpha", "echo", json!(null)).await.unwrap();
        assert_eq!(q.known_queues().await.unwrap(), vec!["alpha", "zeta"]);
        assert_eq!(q.all_stats().await.unwrap().len(), 2);
    }
}
