//! Namespaced access to the coordination store.
//!
//! [`Store`] is the handle every other module receives. It owns a backend
//! and a [`Namespace`]; key arguments are prefixed on the way in and
//! key-valued results are stripped on the way out, so callers only ever see
//! the logical layout described by [`StoreKey`].
//!
//! # Example
//!
//! ```rust,ignore
//! use hive_core::store::{Store, StoreKey};
//!
//! let store = Store::connect(&config.redis).await?;
//! let queues = store.smembers(&StoreKey::Queues.build()).await?;
//! ```

pub mod backend;
pub mod key;

pub use backend::{FinishKeys, InMemoryBackend, PromoteKeys, RedisBackend, StoreBackend};
pub use key::{Namespace, StoreKey};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RedisConfig;
use crate::error::{HiveError, Result};

/// A cloneable, namespaced store handle.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StoreBackend>,
    namespace: Namespace,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.backend.name())
            .field("namespace", &self.namespace.name())
            .finish()
    }
}

impl Store {
    /// Wrap an existing backend.
    pub fn new(backend: Arc<dyn StoreBackend>, namespace: &str) -> Self {
        Self {
            backend,
            namespace: Namespace::new(namespace),
        }
    }

    /// Connect to Redis and verify it answers before returning.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let url = config.connection_url();
        let backend = RedisBackend::new(&url)
            .await
            .map_err(|e| HiveError::store_unreachable(config.redacted_url(), e.to_string()))?;

        tracing::debug!(url = %config.redacted_url(), namespace = %config.namespace, "Store connected");
        Ok(Self::new(Arc::new(backend), &config.namespace))
    }

    /// A store backed by process memory.
    pub fn in_memory(namespace: &str) -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), namespace)
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn ns(&self, key: &str) -> String {
        self.namespace.add(key)
    }

    fn ns_all(&self, keys: &[String]) -> Vec<String> {
        keys.iter().map(|k| self.ns(k)).collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keys and strings
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.backend.get(&self.ns(key)).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.backend.set(&self.ns(key), value).await
    }

    pub async fn del(&self, keys: &[String]) -> Result<u64> {
        self.backend.del(&self.ns_all(keys)).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.backend.exists(&self.ns(key)).await
    }

    /// Keys under this namespace matching `pattern`, without the prefix.
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let keys = self.backend.keys(&self.ns(pattern)).await?;
        Ok(keys.iter().map(|k| self.namespace.remove(k)).collect())
    }

    /// Delete every key under this namespace. Returns the number removed.
    pub async fn clear_all(&self) -> Result<u64> {
        let keys = self.backend.keys(&format!("{}*", self.namespace.prefix())).await?;
        let mut removed = 0;
        for chunk in keys.chunks(500) {
            removed += self.backend.del(chunk).await?;
        }

        tracing::info!(namespace = %self.namespace, removed, "Cleared store namespace");
        Ok(removed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Hashes
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.backend.hget(&self.ns(key), field).await
    }

    pub async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.backend.hset_multiple(&self.ns(key), fields).await
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.backend.hgetall(&self.ns(key)).await
    }

    pub async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.backend.hincrby(&self.ns(key), field, delta).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sets
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.backend.sadd(&self.ns(key), member).await
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.backend.srem(&self.ns(key), member).await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.backend.smembers(&self.ns(key)).await
    }

    pub async fn scard(&self, key: &str) -> Result<u64> {
        self.backend.scard(&self.ns(key)).await
    }

    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.backend.sismember(&self.ns(key), member).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lists
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        self.backend.rpush(&self.ns(key), value).await
    }

    pub async fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.backend.lpop(&self.ns(key)).await
    }

    /// Blocking pop across `keys`; the returned key is de-namespaced.
    pub async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        let popped = self.backend.blpop(&self.ns_all(keys), timeout).await?;
        Ok(popped.map(|(key, value)| (self.namespace.remove(&key), value)))
    }

    pub async fn llen(&self, key: &str) -> Result<u64> {
        self.backend.llen(&self.ns(key)).await
    }

    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.backend.lrange(&self.ns(key), start, stop).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sorted sets
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        self.backend.zadd(&self.ns(key), member, score).await
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.backend.zrem(&self.ns(key), member).await
    }

    pub async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>> {
        self.backend.zrangebyscore(&self.ns(key), min, max).await
    }

    pub async fn zcard(&self, key: &str) -> Result<u64> {
        self.backend.zcard(&self.ns(key)).await
    }

    /// Move due delayed jobs of `queue` into its pending list.
    pub async fn promote_delayed(&self, queue: &str, now: f64) -> Result<Vec<String>> {
        let delayed = self.ns(&StoreKey::Delayed(queue).build());
        let pending = self.ns(&StoreKey::Queue(queue).build());
        let stats = self.ns(&StoreKey::QueueStats(queue).build());
        let job_prefix = self.ns(StoreKey::JOB_PREFIX);

        self.backend
            .promote_delayed(
                PromoteKeys {
                    delayed: &delayed,
                    queue: &pending,
                    stats: &stats,
                    job_prefix: &job_prefix,
                },
                now,
            )
            .await
    }

    /// Claim running job `id` of `queue` and write its terminal state.
    pub async fn finish_job(
        &self,
        queue: &str,
        id: &str,
        fields: &[(String, String)],
        counter: &str,
        expires: f64,
    ) -> Result<bool> {
        let running = self.ns(&StoreKey::Running(queue).build());
        let job = self.ns(&StoreKey::Job(id).build());
        let queue_stats = self.ns(&StoreKey::QueueStats(queue).build());
        let stats = self.ns(&StoreKey::Stats.build());
        let processed = self.ns(&StoreKey::Processed(queue).build());

        self.backend
            .finish_job(
                FinishKeys {
                    running: &running,
                    job: &job,
                    queue_stats: &queue_stats,
                    stats: &stats,
                    processed: &processed,
                },
                id,
                fields,
                counter,
                expires,
            )
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
