//! Store backend implementations.
//!
//! Backends receive fully namespaced keys and implement an enumerated set of
//! typed commands:
//! - **RedisBackend**: the shared store used by every host
//! - **InMemoryBackend**: single-process store for tests and local runs

use crate::error::{ErrorCode, ErrorContext, HiveError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, info_span, Instrument};

// ═══════════════════════════════════════════════════════════════════════════════
// Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Keys touched by the atomic delayed-job promotion.
#[derive(Debug, Clone, Copy)]
pub struct PromoteKeys<'a> {
    /// Sorted set of delayed job IDs
    pub delayed: &'a str,
    /// Pending list the due jobs move to
    pub queue: &'a str,
    /// Queue counters hash
    pub stats: &'a str,
    /// Namespaced prefix of job record keys
    pub job_prefix: &'a str,
}

/// Keys touched by the atomic terminal write of one job.
#[derive(Debug, Clone, Copy)]
pub struct FinishKeys<'a> {
    /// Sorted set of running job IDs
    pub running: &'a str,
    /// The job record hash
    pub job: &'a str,
    /// Queue counters hash
    pub queue_stats: &'a str,
    /// Global counters hash
    pub stats: &'a str,
    /// Retention sorted set scored by expiry
    pub processed: &'a str,
}

/// Typed command interface over the coordination store.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Check connectivity.
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Enumerate keys matching a glob pattern (`*` and `?`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    /// Add a member, returning whether it was new.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove a member, returning whether it was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn scard(&self, key: &str) -> Result<u64>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    /// Append to a list, returning its new length.
    async fn rpush(&self, key: &str, value: &str) -> Result<u64>;

    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    /// Pop the head of the first non-empty list, waiting up to `timeout`.
    ///
    /// A zero timeout waits indefinitely. Returns the list key and the value.
    async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>>;

    async fn llen(&self, key: &str) -> Result<u64>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    /// Add or rescore a member, returning whether it was new.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool>;

    /// Remove a member, returning whether it was present.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Members with `min <= score <= max`, ordered by score then member.
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>>;

    async fn zcard(&self, key: &str) -> Result<u64>;

    /// Atomically move every delayed job due at `now` into the pending list.
    ///
    /// For each moved ID: the counters hash gets `delayed -1` and `queued +1`,
    /// and the job record's `status` becomes `queued`. Returns the moved IDs
    /// in due order.
    async fn promote_delayed(&self, keys: PromoteKeys<'_>, now: f64) -> Result<Vec<String>>;

    /// Atomically claim job `id` and write its terminal state.
    ///
    /// The claim succeeds when the running marker is removed, or when the
    /// marker is already gone but the record still reads `running`. A missing
    /// record is never recreated. On success `fields` are written to the
    /// record, `counter` is bumped in both counters hashes and `id` joins the
    /// retention set scored by `expires`.
    async fn finish_job(
        &self,
        keys: FinishKeys<'_>,
        id: &str,
        fields: &[(String, String)],
        counter: &str,
        expires: f64,
    ) -> Result<bool>;

    /// Get the backend name.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local moved = {}
for _, id in ipairs(due) do
    if redis.call('ZREM', KEYS[1], id) == 1 then
        redis.call('RPUSH', KEYS[2], id)
        redis.call('HINCRBY', KEYS[3], 'delayed', -1)
        redis.call('HINCRBY', KEYS[3], 'queued', 1)
        redis.call('HSET', ARGV[2] .. id, 'status', 'queued')
        moved[#moved + 1] = id
    end
end
return moved
"#;

const FINISH_SCRIPT: &str = r#"
local claimed = redis.call('ZREM', KEYS[1], ARGV[1])
local status = redis.call('HGET', KEYS[2], 'status')
if not status then
    return 0
end
if claimed == 0 and status ~= 'running' then
    return 0
end
for i = 4, #ARGV, 2 do
    redis.call('HSET', KEYS[2], ARGV[i], ARGV[i + 1])
end
redis.call('HINCRBY', KEYS[3], ARGV[2], 1)
redis.call('HINCRBY', KEYS[4], ARGV[2], 1)
redis.call('ZADD', KEYS[5], ARGV[3], ARGV[1])
return 1
"#;

/// Redis store backend.
///
/// Ordinary commands share a reconnecting [`ConnectionManager`]; blocking pops
/// run on a dedicated connection so they never stall other commands.
pub struct RedisBackend {
    client: redis::Client,
    manager: ConnectionManager,
    blocking: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    promote: redis::Script,
    finish: redis::Script,
}

impl RedisBackend {
    /// Connect and verify the server answers `PING`.
    pub async fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .context_code(ErrorCode::StoreConnectionFailed, "Failed to create store client")?;

        let manager = ConnectionManager::new(client.clone())
            .await
            .context_code(ErrorCode::StoreConnectionFailed, "Failed to connect to the store")?;

        let backend = Self {
            client,
            manager,
            blocking: tokio::sync::Mutex::new(None),
            promote: redis::Script::new(PROMOTE_SCRIPT),
            finish: redis::Script::new(FINISH_SCRIPT),
        };

        backend
            .ping()
            .await
            .context_code(ErrorCode::StoreConnectionFailed, "Store ping failed")?;

        info!("Redis store backend connected");
        Ok(backend)
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    async fn blocking_conn(&self) -> Result<MultiplexedConnection> {
        let mut slot = self.blocking.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context_code(
                ErrorCode::StoreConnectionFailed,
                "Failed to open blocking store connection",
            )?;
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("SET").arg(key).arg(value).query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        Ok(redis::cmd("DEL").arg(keys).query_async(&mut conn).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        Ok(redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut found = HashSet::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;

            found.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut keys: Vec<String> = found.into_iter().collect();
        keys.sort();
        Ok(keys)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("HGET").arg(key).arg(field).query_async(&mut conn).await?)
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        redis::cmd("HSET")
            .arg(key)
            .arg(fields)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        Ok(redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let added: u64 = redis::cmd("SADD").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: u64 = redis::cmd("SREM").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        members.sort();
        Ok(members)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(redis::cmd("SCARD").arg(key).query_async(&mut conn).await?)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        Ok(redis::cmd("SISMEMBER").arg(key).arg(member).query_async(&mut conn).await?)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(redis::cmd("RPUSH").arg(key).arg(value).query_async(&mut conn).await?)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("LPOP").arg(key).query_async(&mut conn).await?)
    }

    async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        if keys.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }

        let mut conn = self.blocking_conn().await?;
        // BLPOP takes whole seconds on older servers; zero blocks forever.
        let secs = if timeout.is_zero() {
            0
        } else {
            timeout.as_secs().max(1)
        };

        let span = info_span!("store.blpop", keys = keys.len(), timeout_secs = secs);
        let result = redis::cmd("BLPOP")
            .arg(keys)
            .arg(secs)
            .query_async::<_, Option<(String, String)>>(&mut conn)
            .instrument(span)
            .await;

        match result {
            Ok(popped) => Ok(popped),
            Err(e) => {
                // Drop the dedicated connection so the next pop reconnects.
                *self.blocking.lock().await = None;
                Err(e.into())
            }
        }
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(redis::cmd("LLEN").arg(key).query_async(&mut conn).await?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        let mut conn = self.conn();
        let added: u64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score_arg(score))
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(added > 0)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: u64 = redis::cmd("ZREM").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn();
        Ok(redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(score_arg(min))
            .arg(score_arg(max))
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?)
    }

    async fn promote_delayed(&self, keys: PromoteKeys<'_>, now: f64) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let span = info_span!("store.promote_delayed", queue = %keys.queue);

        let moved: Vec<String> = self
            .promote
            .key(keys.delayed)
            .key(keys.queue)
            .key(keys.stats)
            .arg(score_arg(now))
            .arg(keys.job_prefix)
            .invoke_async(&mut conn)
            .instrument(span)
            .await?;

        if !moved.is_empty() {
            debug!(queue = %keys.queue, count = moved.len(), "Promoted delayed jobs");
        }
        Ok(moved)
    }

    async fn finish_job(
        &self,
        keys: FinishKeys<'_>,
        id: &str,
        fields: &[(String, String)],
        counter: &str,
        expires: f64,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let span = info_span!("store.finish_job", job_id = %id);

        let mut invocation = self.finish.prepare_invoke();
        invocation
            .key(keys.running)
            .key(keys.job)
            .key(keys.queue_stats)
            .key(keys.stats)
            .key(keys.processed)
            .arg(id)
            .arg(counter)
            .arg(score_arg(expires));
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }

        let claimed: i64 = invocation.invoke_async(&mut conn).instrument(span).await?;
        Ok(claimed == 1)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
    ZSet(HashMap<String, f64>),
}

impl Value {
    fn is_empty_container(&self) -> bool {
        match self {
            Self::Str(_) => false,
            Self::Hash(h) => h.is_empty(),
            Self::Set(s) => s.is_empty(),
            Self::List(l) => l.is_empty(),
            Self::ZSet(z) => z.is_empty(),
        }
    }
}

fn wrong_type(key: &str) -> HiveError {
    HiveError::with_internal(
        ErrorCode::StoreError,
        "A store error occurred",
        format!("WRONGTYPE operation against key {}", key),
    )
}

type Data = HashMap<String, Value>;

/// Mutable access to a typed value, creating it when absent.
macro_rules! entry_mut {
    ($data:expr, $key:expr, $variant:ident, $init:expr) => {
        match $data
            .entry($key.to_string())
            .or_insert_with(|| Value::$variant($init))
        {
            Value::$variant(inner) => inner,
            _ => return Err(wrong_type($key)),
        }
    };
}

/// Shared access to a typed value; `None` when absent.
macro_rules! entry_ref {
    ($data:expr, $key:expr, $variant:ident) => {
        match $data.get($key) {
            None => None,
            Some(Value::$variant(inner)) => Some(inner),
            Some(_) => return Err(wrong_type($key)),
        }
    };
}

fn prune(data: &mut Data, key: &str) {
    if data.get(key).is_some_and(Value::is_empty_container) {
        data.remove(key);
    }
}

fn bump(hash: &mut HashMap<String, String>, field: &str, delta: i64) {
    let current: i64 = hash.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
    hash.insert(field.to_string(), (current + delta).to_string());
}

fn sorted_zset(zset: &HashMap<String, f64>, min: f64, max: f64) -> Vec<(String, f64)> {
    let mut members: Vec<(String, f64)> = zset
        .iter()
        .filter(|(_, score)| **score >= min && **score <= max)
        .map(|(member, score)| (member.clone(), *score))
        .collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    members
}

/// Glob match supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

/// In-process store backend with the same command semantics as Redis.
#[derive(Default)]
pub struct InMemoryBackend {
    data: Mutex<Data>,
    pushed: Notify,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn pop_front(&self, key: &str) -> Result<Option<String>> {
        let mut data = self.data.lock();
        let value = match data.get_mut(key) {
            None => None,
            Some(Value::List(list)) => list.pop_front(),
            Some(_) => return Err(wrong_type(key)),
        };
        prune(&mut data, key);
        Ok(value)
    }
}

#[async_trait]
impl StoreBackend for InMemoryBackend {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let data = self.data.lock();
        Ok(entry_ref!(data, key, Str).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.data.lock().insert(key.to_string(), Value::Str(value.to_string()));
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let mut data = self.data.lock();
        Ok(keys.iter().filter(|k| data.remove(k.as_str()).is_some()).count() as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.lock().contains_key(key))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let data = self.data.lock();
        let mut keys: Vec<String> = data.keys().filter(|k| glob_match(pattern, k)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let data = self.data.lock();
        Ok(entry_ref!(data, key, Hash).and_then(|h| h.get(field).cloned()))
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut data = self.data.lock();
        let hash = entry_mut!(data, key, Hash, HashMap::new());
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let data = self.data.lock();
        Ok(entry_ref!(data, key, Hash).cloned().unwrap_or_default())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut data = self.data.lock();
        let hash = entry_mut!(data, key, Hash, HashMap::new());
        let current = match hash.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                HiveError::with_internal(
                    ErrorCode::StoreError,
                    "A store error occurred",
                    format!("hash value {}.{} is not an integer", key, field),
                )
            })?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut data = self.data.lock();
        let set = entry_mut!(data, key, Set, BTreeSet::new());
        Ok(set.insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut data = self.data.lock();
        let removed = match data.get_mut(key) {
            None => false,
            Some(Value::Set(set)) => set.remove(member),
            Some(_) => return Err(wrong_type(key)),
        };
        prune(&mut data, key);
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let data = self.data.lock();
        Ok(entry_ref!(data, key, Set)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let data = self.data.lock();
        Ok(entry_ref!(data, key, Set).map_or(0, |s| s.len() as u64))
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let data = self.data.lock();
        Ok(entry_ref!(data, key, Set).is_some_and(|s| s.contains(member)))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let len = {
            let mut data = self.data.lock();
            let list = entry_mut!(data, key, List, VecDeque::new());
            list.push_back(value.to_string());
            list.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        self.pop_front(key)
    }

    async fn blpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);

        loop {
            // Register interest before checking so a push in between is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            for key in keys {
                if let Some(value) = self.pop_front(key)? {
                    return Ok(Some((key.clone(), value)));
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let data = self.data.lock();
        Ok(entry_ref!(data, key, List).map_or(0, |l| l.len() as u64))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let data = self.data.lock();
        let Some(list) = entry_ref!(data, key, List) else {
            return Ok(Vec::new());
        };

        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }

        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        let mut data = self.data.lock();
        let zset = entry_mut!(data, key, ZSet, HashMap::new());
        Ok(zset.insert(member.to_string(), score).is_none())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut data = self.data.lock();
        let removed = match data.get_mut(key) {
            None => false,
            Some(Value::ZSet(zset)) => zset.remove(member).is_some(),
            Some(_) => return Err(wrong_type(key)),
        };
        prune(&mut data, key);
        Ok(removed)
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>> {
        let data = self.data.lock();
        Ok(entry_ref!(data, key, ZSet)
            .map(|z| sorted_zset(z, min, max))
            .unwrap_or_default())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let data = self.data.lock();
        Ok(entry_ref!(data, key, ZSet).map_or(0, |z| z.len() as u64))
    }

    async fn promote_delayed(&self, keys: PromoteKeys<'_>, now: f64) -> Result<Vec<String>> {
        let moved = {
            let mut data = self.data.lock();

            let due: Vec<String> = match entry_ref!(data, keys.delayed, ZSet) {
                None => return Ok(Vec::new()),
                Some(zset) => sorted_zset(zset, f64::NEG_INFINITY, now)
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect(),
            };
            if due.is_empty() {
                return Ok(Vec::new());
            }

            if let Some(Value::ZSet(zset)) = data.get_mut(keys.delayed) {
                for id in &due {
                    zset.remove(id);
                }
            }
            prune(&mut data, keys.delayed);

            let list = entry_mut!(data, keys.queue, List, VecDeque::new());
            list.extend(due.iter().cloned());

            let stats = entry_mut!(data, keys.stats, Hash, HashMap::new());
            let count = due.len() as i64;
            bump(stats, "delayed", -count);
            bump(stats, "queued", count);

            for id in &due {
                let job_key = format!("{}{}", keys.job_prefix, id);
                let record = entry_mut!(data, job_key.as_str(), Hash, HashMap::new());
                record.insert("status".to_string(), "queued".to_string());
            }

            due
        };

        self.pushed.notify_waiters();
        Ok(moved)
    }

    async fn finish_job(
        &self,
        keys: FinishKeys<'_>,
        id: &str,
        fields: &[(String, String)],
        counter: &str,
        expires: f64,
    ) -> Result<bool> {
        let mut data = self.data.lock();

        let claimed = match data.get_mut(keys.running) {
            None => false,
            Some(Value::ZSet(zset)) => zset.remove(id).is_some(),
            Some(_) => return Err(wrong_type(keys.running)),
        };
        prune(&mut data, keys.running);

        let status = entry_ref!(data, keys.job, Hash).and_then(|h| h.get("status").cloned());
        match status.as_deref() {
            None => return Ok(false),
            Some(status) if !claimed && status != "running" => return Ok(false),
            Some(_) => {}
        }

        let record = entry_mut!(data, keys.job, Hash, HashMap::new());
        for (field, value) in fields {
            record.insert(field.clone(), value.clone());
        }
        for key in [keys.queue_stats, keys.stats] {
            bump(entry_mut!(data, key, Hash, HashMap::new()), counter, 1);
        }
        let retained = entry_mut!(data, keys.processed, ZSet, HashMap::new());
        retained.insert(id.to_string(), expires);

        Ok(true)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
