//! Host registry: which workers run where.
//!
//! `hosts` holds every host name; `host:<name>` holds the IDs of the workers
//! registered on it. Membership is only a hint. A worker counts as alive
//! when its packet exists and, for this machine, its PID answers a probe, or
//! for other machines, its heartbeat is recent.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::process;
use super::worker::{WorkerId, WorkerPacket};
use crate::error::Result;
use crate::store::{Store, StoreKey};
use crate::telemetry::CleanupMetrics;

/// Result of a host cleanup sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostCleanupReport {
    /// Hosts removed because no worker remained
    pub hosts: Vec<String>,
    /// Worker IDs removed as dead
    pub workers: Vec<String>,
    /// Per-host failures that did not stop the sweep
    pub errors: Vec<String>,
}

impl HostCleanupReport {
    pub fn merge(&mut self, other: HostCleanupReport) {
        self.hosts.extend(other.hosts);
        self.workers.extend(other.workers);
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.workers.is_empty() && self.errors.is_empty()
    }
}

/// One host's worker set.
#[derive(Debug, Clone)]
pub struct Host {
    store: Store,
    name: String,
}

impl Host {
    pub fn new(store: Store, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    /// The host this process runs on.
    pub fn local(store: Store) -> Self {
        Self::new(store, process::hostname())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self) -> String {
        StoreKey::Host(&self.name).build()
    }

    pub async fn register_worker(&self, worker_id: &str) -> Result<()> {
        self.store.sadd(&StoreKey::Hosts.build(), &self.name).await?;
        self.store.sadd(&self.key(), worker_id).await?;
        debug!(host = %self.name, worker_id, "Worker registered");
        Ok(())
    }

    /// Remove a worker; the host itself goes once its set is empty.
    pub async fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        self.store.srem(&self.key(), worker_id).await?;
        if self.store.scard(&self.key()).await? == 0 {
            self.store.srem(&StoreKey::Hosts.build(), &self.name).await?;
        }
        debug!(host = %self.name, worker_id, "Worker unregistered");
        Ok(())
    }

    /// Registered worker IDs, sorted. Not liveness-checked.
    pub async fn workers(&self) -> Result<Vec<String>> {
        self.store.smembers(&self.key()).await
    }

    pub async fn worker_count(&self) -> Result<u64> {
        self.store.scard(&self.key()).await
    }

    /// Every known host.
    pub async fn all(store: &Store) -> Result<Vec<Host>> {
        let names = store.smembers(&StoreKey::Hosts.build()).await?;
        Ok(names
            .into_iter()
            .map(|name| Host::new(store.clone(), name))
            .collect())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Liveness
    // ─────────────────────────────────────────────────────────────────────────

    /// Whether `worker_id` on this host looks alive.
    pub async fn is_alive(
        &self,
        worker_id: &str,
        local: bool,
        stale_after: Duration,
        now: i64,
    ) -> Result<bool> {
        let Some(packet) = WorkerPacket::load(&self.store, worker_id).await? else {
            return Ok(false);
        };
        Ok(packet_alive(&packet, worker_id, local, stale_after, now))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cleanup
    // ─────────────────────────────────────────────────────────────────────────

    /// Remove dead workers from every host and drop empty hosts.
    ///
    /// `local_host` names the machine whose PIDs can be probed directly.
    pub async fn cleanup(
        store: &Store,
        local_host: &str,
        stale_after: Duration,
        now: i64,
    ) -> Result<HostCleanupReport> {
        let mut report = HostCleanupReport::default();

        for host in Host::all(store).await? {
            let local = host.name == local_host;
            match host.cleanup_host(local, stale_after, now).await {
                Ok(host_report) => report.merge(host_report),
                Err(e) => {
                    warn!(host = %host.name, error = %e, "Host cleanup failed");
                    report.errors.push(format!("{}: {}", host.name, e));
                }
            }
        }

        CleanupMetrics::record_removed("worker", report.workers.len() as u64);
        CleanupMetrics::record_removed("host", report.hosts.len() as u64);
        if !report.workers.is_empty() || !report.hosts.is_empty() {
            info!(
                hosts = report.hosts.len(),
                workers = report.workers.len(),
                "Host cleanup removed stale registrations"
            );
        }
        Ok(report)
    }

    /// Clean this host's set only.
    ///
    /// A worker that cannot be checked or removed is recorded in `errors` and
    /// the sweep moves on to the next one.
    pub async fn cleanup_host(
        &self,
        local: bool,
        stale_after: Duration,
        now: i64,
    ) -> Result<HostCleanupReport> {
        let mut report = HostCleanupReport::default();

        for worker_id in self.workers().await? {
            match self.remove_if_dead(&worker_id, local, stale_after, now).await {
                Ok(true) => report.workers.push(worker_id),
                Ok(false) => {}
                Err(e) => {
                    warn!(host = %self.name, worker_id = %worker_id, error = %e, "Worker cleanup failed");
                    report.errors.push(format!("{}: {}", worker_id, e));
                }
            }
        }

        if local {
            self.prune_orphan_packets(&mut report).await;
        }

        match self.remove_if_empty().await {
            Ok(true) => report.hosts.push(self.name.clone()),
            Ok(false) => {}
            Err(e) => {
                warn!(host = %self.name, error = %e, "Host removal failed");
                report.errors.push(format!("{}: {}", self.name, e));
            }
        }
        Ok(report)
    }

    async fn remove_if_dead(
        &self,
        worker_id: &str,
        local: bool,
        stale_after: Duration,
        now: i64,
    ) -> Result<bool> {
        if self.is_alive(worker_id, local, stale_after, now).await? {
            return Ok(false);
        }
        self.store.srem(&self.key(), worker_id).await?;
        self.store.del(&[StoreKey::Worker(worker_id).build()]).await?;
        warn!(host = %self.name, worker_id, "Removed stale worker");
        Ok(true)
    }

    async fn remove_if_empty(&self) -> Result<bool> {
        if self.worker_count().await? > 0 {
            return Ok(false);
        }
        let removed = self.store.srem(&StoreKey::Hosts.build(), &self.name).await?;
        if removed {
            info!(host = %self.name, "Removed empty host");
        }
        Ok(removed)
    }

    /// Delete packets of this host's dead processes that never made it into
    /// (or already left) the host set.
    async fn prune_orphan_packets(&self, report: &mut HostCleanupReport) {
        let listed = async {
            let members = self.workers().await?;
            let keys = self.store.keys(&format!("worker:{}:*", self.name)).await?;
            Result::Ok((members, keys))
        };
        let (members, keys) = match listed.await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(host = %self.name, error = %e, "Listing worker packets failed");
                report.errors.push(format!("{}: {}", self.name, e));
                return;
            }
        };

        for key in keys {
            let Some(worker_id) = key.strip_prefix("worker:") else {
                continue;
            };
            if members.iter().any(|m| m == worker_id) {
                continue;
            }
            let Ok(id) = worker_id.parse::<WorkerId>() else {
                continue;
            };
            if id.hostname != self.name || process::pid_alive(id.pid) {
                continue;
            }
            match self.store.del(&[key.clone()]).await {
                Ok(0) => {}
                Ok(_) => {
                    warn!(host = %self.name, worker_id, "Removed orphan worker packet");
                    report.workers.push(worker_id.to_string());
                }
                Err(e) => {
                    warn!(host = %self.name, worker_id, error = %e, "Orphan packet removal failed");
                    report.errors.push(format!("{}: {}", worker_id, e));
                }
            }
        }
    }
}

/// Whether a loaded packet belongs to a live worker.
///
/// Local workers are checked by PID, remote ones by heartbeat age.
pub(crate) fn packet_alive(
    packet: &WorkerPacket,
    worker_id: &str,
    local: bool,
    stale_after: Duration,
    now: i64,
) -> bool {
    if local {
        let pid = match worker_id.parse::<WorkerId>() {
            Ok(id) => id.pid,
            Err(_) => packet.pid,
        };
        return process::pid_alive(pid);
    }
    now - packet.heartbeat <= stale_after.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_packet(store: &Store, worker_id: &str, heartbeat: i64) {
        store
            .hset_multiple(
                &StoreKey::Worker(worker_id).build(),
                &[
                    ("status".to_string(), "waiting".to_string()),
                    ("heartbeat".to_string(), heartbeat.to_string()),
                ],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let store = Store::in_memory("hive");
        let host = Host::new(store.clone(), "h1");

        host.register_worker("h1:1:*").await.unwrap();
        host.register_worker("h1:2:*").await.unwrap();
        assert_eq!(host.worker_count().await.unwrap(), 2);
        assert_eq!(Host::all(&store).await.unwrap().len(), 1);

        host.unregister_worker("h1:1:*").await.unwrap();
        assert_eq!(host.workers().await.unwrap(), vec!["h1:2:*"]);
        host.unregister_worker("h1:2:*").await.unwrap();
        assert!(Host::all(&store).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_liveness_uses_heartbeat() {
        let store = Store::in_memory("hive");
        let host = Host::new(store.clone(), "remote");
        let stale = Duration::from_secs(120);

        host.register_worker("remote:10:*").await.unwrap();
        host.register_worker("remote:11:*").await.unwrap();
        write_packet(&store, "remote:10:*", 1000).await;
        write_packet(&store, "remote:11:*", 700).await;

        let report = Host::cleanup(&store, "local", stale, 1050).await.unwrap();
        assert_eq!(report.workers, vec!["remote:11:*"]);
        assert!(report.hosts.is_empty());
        assert_eq!(host.workers().await.unwrap(), vec!["remote:10:*"]);
    }

    #[tokio::test]
    async fn test_missing_packet_is_dead() {
        let store = Store::in_memory("hive");
        let host = Host::new(store.clone(), "remote");
        host.register_worker("remote:10:*").await.unwrap();

        let report = Host::cleanup(&store, "local", Duration::from_secs(60), 0)
            .await
            .unwrap();
        assert_eq!(report.workers, vec!["remote:10:*"]);
        assert_eq!(report.hosts, vec!["remote"]);

        let again = Host::cleanup(&store, "local", Duration::from_secs(60), 0)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_packets_do_not_stop_sweep() {
        let store = Store::in_memory("hive");
        let host = Host::new(store.clone(), "remote");
        let stale = Duration::from_secs(120);

        for id in ["remote:10:*", "remote:11:*", "remote:12:*"] {
            host.register_worker(id).await.unwrap();
        }
        write_packet(&store, "remote:10:*", 700).await;
        // Heartbeat fields only, as left by a beat after the packet was deleted.
        store
            .hset_multiple(
                &StoreKey::Worker("remote:11:*").build(),
                &[
                    ("heartbeat".to_string(), "1040".to_string()),
                    ("memory".to_string(), "1024".to_string()),
                ],
            )
            .await
            .unwrap();
        store
            .hset_multiple(
                &StoreKey::Worker("remote:12:*").build(),
                &[
                    ("status".to_string(), "bogus".to_string()),
                    ("heartbeat".to_string(), "1040".to_string()),
                ],
            )
            .await
            .unwrap();

        let report = Host::cleanup(&store, "local", stale, 1050).await.unwrap();
        assert_eq!(report.workers, vec!["remote:10:*", "remote:11:*"]);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("remote:12:*"));
        assert!(report.hosts.is_empty());

        assert_eq!(host.workers().await.unwrap(), vec!["remote:12:*"]);
        assert!(!store.exists(&StoreKey::Worker("remote:10:*").build()).await.unwrap());
        assert!(!store.exists(&StoreKey::Worker("remote:11:*").build()).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_orphan_packet_pruned() {
        let store = Store::in_memory("hive");
        let host = Host::new(store.clone(), "h1");

        let live = format!("h1:{}:*", std::process::id());
        host.register_worker(&live).await.unwrap();
        write_packet(&store, &live, 0).await;

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        let orphan = format!("h1:{}:*", dead_pid);
        write_packet(&store, &orphan, 0).await;

        let report = host
            .cleanup_host(true, Duration::from_secs(60), 0)
            .await
            .unwrap();
        assert_eq!(report.workers, vec![orphan.clone()]);
        assert!(!store.exists(&StoreKey::Worker(&orphan).build()).await.unwrap());
        assert!(store.exists(&StoreKey::Worker(&live).build()).await.unwrap());
    }
}
