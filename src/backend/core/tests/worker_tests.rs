//! Worker lifecycle: polling, timeouts, cancellation, pause and stop.

mod common;

use common::{eventually, worker_config, Mode, TestExecutor};
use hive_core::config::QueueConfig;
use hive_core::jobs::{
    Job, JobStatus, Queue, StopMode, StopReason, Worker, WorkerConfig, WorkerPacket,
    WorkerStatus,
};
use hive_core::store::{Store, StoreKey};
use serde_json::json;
use std::time::Duration;

const TRAP_USR1: &str = "trap 'exit 2' USR1; while :; do sleep 0.1; done";

fn start(store: &Store, config: WorkerConfig, mode: Mode) -> (Worker, String) {
    let worker = Worker::new(
        store.clone(),
        config,
        QueueConfig::default(),
        TestExecutor::shared(store, mode),
    )
    .unwrap();
    let id = worker.id().to_string();
    (worker, id)
}

async fn job_status(store: &Store, id: &str) -> Option<JobStatus> {
    Job::load(store, id).await.unwrap().map(|job| job.status)
}

async fn packet(store: &Store, worker_id: &str) -> Option<WorkerPacket> {
    WorkerPacket::load(store, worker_id).await.unwrap()
}

// ============================================================================
// Scenario A: a worker processes a pushed job
// ============================================================================

#[tokio::test]
async fn test_worker_processes_job() {
    let store = Store::in_memory("hive");
    let queue = Queue::new(store.clone());
    let job = queue.push("mail", "Send", json!({"to": "x"})).await.unwrap();

    let (worker, worker_id) = start(&store, worker_config("mail"), Mode::InProcess);
    let control = worker.control();
    let handle = tokio::spawn(worker.work());

    eventually(&store, "job processed", |s| async move {
        Queue::new(s).stats("mail").await.unwrap().processed == 1
    })
    .await;

    let stats = queue.stats("mail").await.unwrap();
    assert_eq!((stats.queued, stats.processed, stats.total), (0, 1, 1));
    let record = Job::load(&store, &job.id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Processed);
    assert_eq!(record.worker.as_deref(), Some(worker_id.as_str()));

    control.stop(StopMode::Graceful);
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.reason, StopReason::Graceful);
}

#[tokio::test]
async fn test_worker_registers_and_deregisters() {
    let store = Store::in_memory("hive");
    let (worker, worker_id) = start(&store, worker_config("mail"), Mode::InProcess);
    let hostname = worker.id().hostname.clone();
    let control = worker.control();
    let handle = tokio::spawn(worker.work());

    eventually(&store, "registration", |s| {
        let id = worker_id.clone();
        async move { WorkerPacket::load(&s, &id).await.unwrap().is_some() }
    })
    .await;
    assert!(store
        .sismember(&StoreKey::Host(&hostname).build(), &worker_id)
        .await
        .unwrap());
    assert!(store.sismember(&StoreKey::Hosts.build(), &hostname).await.unwrap());

    control.stop(StopMode::Graceful);
    handle.await.unwrap().unwrap();

    assert!(packet(&store, &worker_id).await.is_none());
    assert!(!store.sismember(&StoreKey::Hosts.build(), &hostname).await.unwrap());
}

#[tokio::test]
async fn test_failed_handler_counts_failure() {
    let store = Store::in_memory("hive");
    let queue = Queue::new(store.clone());
    let job = queue.push("mail", "fail", json!({"message": "boom"})).await.unwrap();
    let unknown = queue.push("mail", "NoSuchClass", json!(null)).await.unwrap();

    let (worker, _) = start(&store, worker_config("mail"), Mode::InProcess);
    let control = worker.control();
    let handle = tokio::spawn(worker.work());

    eventually(&store, "two failures", |s| async move {
        Queue::new(s).stats("mail").await.unwrap().failed == 2
    })
    .await;

    let record = Job::load(&store, &job.id).await.unwrap().unwrap();
    assert_eq!(record.error.as_deref(), Some("boom"));
    let record = Job::load(&store, &unknown.id).await.unwrap().unwrap();
    assert!(record.error.unwrap().contains("NoSuchClass"));

    control.stop(StopMode::Graceful);
    let summary = handle.await.unwrap().unwrap();
    assert_eq!((summary.processed, summary.failed), (0, 2));
}

#[tokio::test]
async fn test_wildcard_picks_up_new_queues() {
    let store = Store::in_memory("hive");
    let (worker, _) = start(&store, worker_config("*"), Mode::InProcess);
    let control = worker.control();
    let handle = tokio::spawn(worker.work());

    tokio::time::sleep(Duration::from_millis(100)).await;
    Queue::new(store.clone()).push("late", "echo", json!(1)).await.unwrap();

    eventually(&store, "job on new queue", |s| async move {
        Queue::new(s).stats("late").await.unwrap().processed == 1
    })
    .await;

    control.stop(StopMode::Graceful);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_blocking_worker_wakes_on_push() {
    let store = Store::in_memory("hive");
    let config = WorkerConfig {
        blocking: true,
        interval: Duration::from_secs(5),
        ..worker_config("mail")
    };
    let (worker, _) = start(&store, config, Mode::InProcess);
    let control = worker.control();
    let handle = tokio::spawn(worker.work());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let pushed = tokio::time::Instant::now();
    Queue::new(store.clone()).push("mail", "echo", json!(1)).await.unwrap();

    eventually(&store, "blocking pop", |s| async move {
        Queue::new(s).stats("mail").await.unwrap().processed == 1
    })
    .await;
    assert!(pushed.elapsed() < Duration::from_secs(4));

    control.stop(StopMode::Graceful);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_worker_promotes_delayed_jobs() {
    let store = Store::in_memory("hive");
    let queue = Queue::new(store.clone());
    let job = queue
        .enqueue(
            Job::new("mail", "echo", json!(null)),
            Some(hive_core::jobs::Delay::At(hive_core::jobs::unix_now() - 1)),
            hive_core::jobs::unix_now(),
        )
        .await
        .unwrap();

    let (worker, _) = start(&store, worker_config("mail"), Mode::InProcess);
    let control = worker.control();
    let handle = tokio::spawn(worker.work());

    let id = job.id.clone();
    eventually(&store, "delayed job processed", move |s| {
        let id = id.clone();
        async move { job_status(&s, &id).await == Some(JobStatus::Processed) }
    })
    .await;
    assert_eq!(queue.stats("mail").await.unwrap().delayed, 0);

    control.stop(StopMode::Graceful);
    handle.await.unwrap().unwrap();
}

// ============================================================================
// Scenario D: timeout
// ============================================================================

#[tokio::test]
async fn test_timeout_kills_child_and_fails_job() {
    let store = Store::in_memory("hive");
    let queue = Queue::new(store.clone());
    let job = queue.push("mail", "Send", json!(null)).await.unwrap();

    let config = WorkerConfig {
        timeout: Duration::from_secs(1),
        ..worker_config("mail")
    };
    let (worker, worker_id) = start(&store, config, Mode::Script("sleep 30"));
    let control = worker.control();
    let handle = tokio::spawn(worker.work());

    eventually(&store, "timeout failure", |s| async move {
        Queue::new(s).stats("mail").await.unwrap().failed == 1
    })
    .await;

    let record = Job::load(&store, &job.id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().contains("timeout"));

    let packet = packet(&store, &worker_id).await.unwrap();
    assert_eq!(packet.failed, 1);
    assert_eq!(packet.job_pid, None);

    control.stop(StopMode::Graceful);
    handle.await.unwrap().unwrap();
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_forwards_to_child() {
    let store = Store::in_memory("hive");
    let queue = Queue::new(store.clone());
    let job = queue.push("mail", "Send", json!(null)).await.unwrap();

    let (worker, worker_id) = start(&store, worker_config("mail"), Mode::Script(TRAP_USR1));
    let control = worker.control();
    let handle = tokio::spawn(worker.work());

    let id = worker_id.clone();
    eventually(&store, "job running", move |s| {
        let id = id.clone();
        async move {
            WorkerPacket::load(&s, &id)
                .await
                .unwrap()
                .and_then(|p| p.job_pid)
                .is_some()
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    control.cancel_job();

    eventually(&store, "job cancelled", |s| async move {
        Queue::new(s).stats("mail").await.unwrap().cancelled == 1
    })
    .await;
    assert_eq!(job_status(&store, &job.id).await, Some(JobStatus::Cancelled));

    let packet = packet(&store, &worker_id).await.unwrap();
    assert_eq!(packet.cancelled, 1);
    assert_ne!(packet.status, WorkerStatus::Running);

    control.stop(StopMode::Graceful);
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.cancelled, 1);
}

#[tokio::test]
async fn test_cancel_without_job_is_ignored() {
    let store = Store::in_memory("hive");
    let (worker, _) = start(&store, worker_config("mail"), Mode::InProcess);
    let control = worker.control();
    let handle = tokio::spawn(worker.work());

    control.cancel_job();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let job = Queue::new(store.clone()).push("mail", "echo", json!(null)).await.unwrap();
    let id = job.id.clone();
    eventually(&store, "later job processed", move |s| {
        let id = id.clone();
        async move { job_status(&s, &id).await == Some(JobStatus::Processed) }
    })
    .await;

    control.stop(StopMode::Graceful);
    handle.await.unwrap().unwrap();
}

// ============================================================================
// Scenario E: pause and resume
// ============================================================================

#[tokio::test]
async fn test_pause_lets_running_job_finish() {
    let store = Store::in_memory("hive");
    let queue = Queue::new(store.clone());
    let first = queue.push("mail", "sleep", json!({"seconds": 0.5})).await.unwrap();

    let (worker, worker_id) = start(&store, worker_config("mail"), Mode::InProcess);
    let control = worker.control();
    let handle = tokio::spawn(worker.work());

    let id = first.id.clone();
    eventually(&store, "first job running", move |s| {
        let id = id.clone();
        async move { job_status(&s, &id).await == Some(JobStatus::Running) }
    })
    .await;

    control.pause();
    let second = queue.push("mail", "echo", json!(null)).await.unwrap();

    let id = first.id.clone();
    eventually(&store, "first job processed", move |s| {
        let id = id.clone();
        async move { job_status(&s, &id).await == Some(JobStatus::Processed) }
    })
    .await;

    let id = worker_id.clone();
    eventually(&store, "worker paused", move |s| {
        let id = id.clone();
        async move {
            WorkerPacket::load(&s, &id).await.unwrap().map(|p| p.status) == Some(WorkerStatus::Paused)
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(queue.len("mail").await.unwrap(), 1);
    assert_eq!(job_status(&store, &second.id).await, Some(JobStatus::Queued));

    control.resume();
    let id = second.id.clone();
    eventually(&store, "second job processed", move |s| {
        let id = id.clone();
        async move { job_status(&s, &id).await == Some(JobStatus::Processed) }
    })
    .await;

    control.stop(StopMode::Graceful);
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.processed, 2);
}

// ============================================================================
// Stopping
// ============================================================================

#[tokio::test]
async fn test_graceful_stop_finishes_current_job() {
    let store = Store::in_memory("hive");
    let queue = Queue::new(store.clone());
    let job = queue.push("mail", "sleep", json!({"seconds": 0.3})).await.unwrap();
    queue.push("mail", "echo", json!(null)).await.unwrap();

    let (worker, _) = start(&store, worker_config("mail"), Mode::InProcess);
    let control = worker.control();
    let handle = tokio::spawn(worker.work());

    let id = job.id.clone();
    eventually(&store, "job running", move |s| {
        let id = id.clone();
        async move { job_status(&s, &id).await == Some(JobStatus::Running) }
    })
    .await;
    control.stop(StopMode::Graceful);

    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.reason, StopReason::Graceful);
    assert_eq!(summary.processed, 1);
    assert_eq!(job_status(&store, &job.id).await, Some(JobStatus::Processed));
    assert_eq!(queue.len("mail").await.unwrap(), 1);
}

#[tokio::test]
async fn test_force_stop_kills_child() {
    let store = Store::in_memory("hive");
    let queue = Queue::new(store.clone());
    let job = queue.push("mail", "Send", json!(null)).await.unwrap();

    let (worker, worker_id) = start(&store, worker_config("mail"), Mode::Script("sleep 30"));
    let hostname = worker.id().hostname.clone();
    let control = worker.control();
    let handle = tokio::spawn(worker.work());

    let id = worker_id.clone();
    eventually(&store, "job running", move |s| {
        let id = id.clone();
        async move {
            WorkerPacket::load(&s, &id)
                .await
                .unwrap()
                .and_then(|p| p.job_pid)
                .is_some()
        }
    })
    .await;
    let started = tokio::time::Instant::now();
    control.stop(StopMode::Force);

    let summary = handle.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(summary.reason, StopReason::Forced);
    assert_eq!(summary.failed, 1);
    assert_eq!(job_status(&store, &job.id).await, Some(JobStatus::Failed));
    assert!(packet(&store, &worker_id).await.is_none());
    assert_eq!(
        store.scard(&StoreKey::Host(&hostname).build()).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_memory_limit_stops_after_job() {
    let store = Store::in_memory("hive");
    let queue = Queue::new(store.clone());
    queue.push("mail", "echo", json!(1)).await.unwrap();
    queue.push("mail", "echo", json!(2)).await.unwrap();

    let config = WorkerConfig {
        memory_limit_mb: 1,
        ..worker_config("mail")
    };
    let (worker, _) = start(&store, config, Mode::InProcess);

    let summary = tokio::time::timeout(Duration::from_secs(10), worker.work())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.reason, StopReason::MemoryLimit);
    assert_eq!(summary.processed, 1);
    assert_eq!(queue.len("mail").await.unwrap(), 1);
}

#[tokio::test]
async fn test_pid_file_written_and_removed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hive-worker.pid");

    let store = Store::in_memory("hive");
    let config = WorkerConfig {
        pid_file: Some(path.clone()),
        ..worker_config("mail")
    };
    let (worker, worker_id) = start(&store, config, Mode::InProcess);
    let control = worker.control();
    let handle = tokio::spawn(worker.work());

    let id = worker_id.clone();
    eventually(&store, "registration", move |s| {
        let id = id.clone();
        async move { WorkerPacket::load(&s, &id).await.unwrap().is_some() }
    })
    .await;
    let written = std::fs::read_to_string(&path).unwrap();
    assert_eq!(written.trim(), std::process::id().to_string());

    control.stop(StopMode::Graceful);
    handle.await.unwrap().unwrap();
    assert!(!path.exists());
}
