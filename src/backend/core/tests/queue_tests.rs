//! Queue behaviour: ordering, counters, delayed promotion and namespacing.

mod common;

use hive_core::config::QueueConfig;
use hive_core::jobs::{Delay, Job, JobOutcome, JobStatus, Queue};
use hive_core::store::{InMemoryBackend, Namespace, Store, StoreKey};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

fn queue() -> Queue {
    Queue::new(Store::in_memory("hive"))
}

// ============================================================================
// Scenario A: push, pop, process
// ============================================================================

#[tokio::test]
async fn test_push_pop_process_counters() {
    let q = queue();
    let store = q.store().clone();

    let job = q.push("mail", "Send", json!({"to": "x"})).await.unwrap();
    let stats = q.stats("mail").await.unwrap();
    assert_eq!((stats.queued, stats.total), (1, 1));
    assert_eq!(q.known_queues().await.unwrap(), vec!["mail"]);

    let mut popped = q.pop("mail").await.unwrap().unwrap();
    assert_eq!(popped.id, job.id);
    assert_eq!(popped.args, json!({"to": "x"}));
    assert_eq!(q.stats("mail").await.unwrap().queued, 0);

    popped.start(&store, "h1:1:mail", 1000).await.unwrap();
    let stored = Job::load(&store, &job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.worker.as_deref(), Some("h1:1:mail"));

    popped
        .finish(&store, &JobOutcome::Processed, &QueueConfig::default(), 1001)
        .await
        .unwrap();
    let stats = q.stats("mail").await.unwrap();
    assert_eq!((stats.queued, stats.processed, stats.total), (0, 1, 1));
    assert_eq!(q.global_stats().await.unwrap().processed, 1);
}

#[tokio::test]
async fn test_failed_job_keeps_error_record() {
    let q = queue();
    let store = q.store().clone();
    q.push("mail", "Send", json!(null)).await.unwrap();

    let mut job = q.pop("mail").await.unwrap().unwrap();
    job.start(&store, "h1:1:mail", 10).await.unwrap();
    let outcome = JobOutcome::Failed {
        error: "smtp down".into(),
        backtrace: Some("trace".into()),
    };
    job.finish(&store, &outcome, &QueueConfig::default(), 12).await.unwrap();

    let stored = Job::load(&store, &job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("smtp down"));
    assert_eq!(stored.backtrace.as_deref(), Some("trace"));
    assert_eq!(q.stats("mail").await.unwrap().failed, 1);
}

#[tokio::test]
async fn test_finish_after_lost_marker_still_counts() {
    let q = queue();
    let store = q.store().clone();
    let retention = QueueConfig::default();
    q.push("mail", "Send", json!(null)).await.unwrap();

    let mut job = q.pop("mail").await.unwrap().unwrap();
    job.start(&store, "h1:1:mail", 10).await.unwrap();
    // Marker removed with no terminal write behind it.
    store
        .zrem(&StoreKey::Running("mail").build(), &job.id)
        .await
        .unwrap();

    let outcome = JobOutcome::failed("Job process killed after exceeding timeout");
    assert!(job.finish(&store, &outcome, &retention, 12).await.unwrap());
    assert!(!job.clone().finish(&store, &outcome, &retention, 13).await.unwrap());

    let stored = Job::load(&store, &job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    let stats = q.stats("mail").await.unwrap();
    assert_eq!((stats.failed, stats.total), (1, 1));

    let expiry = 12 + retention.failed_ttl.as_secs() as i64;
    let report = Job::cleanup(&store, expiry).await.unwrap();
    assert_eq!(report.processed, 1);
    assert!(!Job::exists(&store, &job.id).await.unwrap());
}

// ============================================================================
// Scenario B and P3: delayed promotion
// ============================================================================

#[tokio::test]
async fn test_delay_promotion_timeline() {
    let q = queue();
    let store = q.store().clone();

    let job = q
        .enqueue(Job::new("mail", "Send", json!({"to": "x"})), Some(Delay::Seconds(5)), 1000)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Delayed);

    let delayed = store
        .zrangebyscore(&StoreKey::Delayed("mail").build(), f64::NEG_INFINITY, f64::INFINITY)
        .await
        .unwrap();
    assert_eq!(delayed, vec![(job.id.clone(), 1005.0)]);
    let stats = q.stats("mail").await.unwrap();
    assert_eq!((stats.delayed, stats.queued, stats.total), (1, 0, 1));

    assert!(q.promote_due("mail", 1003).await.unwrap().is_empty());
    assert_eq!(q.len("mail").await.unwrap(), 0);
    assert_eq!(q.delayed_len("mail").await.unwrap(), 1);

    assert_eq!(q.promote_due("mail", 1006).await.unwrap(), vec![job.id.clone()]);
    assert_eq!(q.len("mail").await.unwrap(), 1);
    assert_eq!(q.delayed_len("mail").await.unwrap(), 0);

    let stats = q.stats("mail").await.unwrap();
    assert_eq!((stats.delayed, stats.queued), (0, 1));
    let stored = Job::load(&store, &job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
}

#[tokio::test]
async fn test_repeated_promotion_never_duplicates() {
    let q = queue();
    for i in 0..5 {
        q.enqueue(Job::new("mail", "Send", json!(i)), Some(Delay::At(1000 + i)), 900)
            .await
            .unwrap();
    }

    let mut promoted = Vec::new();
    for now in [999, 1002, 1002, 1010, 1010, 2000] {
        promoted.extend(q.promote_due("mail", now).await.unwrap());
    }

    assert_eq!(promoted.len(), 5);
    assert_eq!(promoted.iter().collect::<HashSet<_>>().len(), 5);
    assert_eq!(q.len("mail").await.unwrap(), 5);
}

#[tokio::test]
async fn test_promotion_keeps_due_order() {
    let q = queue();
    let late = q
        .enqueue(Job::new("mail", "Send", json!("late")), Some(Delay::At(1010)), 900)
        .await
        .unwrap();
    let early = q
        .enqueue(Job::new("mail", "Send", json!("early")), Some(Delay::At(1005)), 900)
        .await
        .unwrap();

    q.promote_due("mail", 1020).await.unwrap();
    assert_eq!(q.pop("mail").await.unwrap().unwrap().id, early.id);
    assert_eq!(q.pop("mail").await.unwrap().unwrap().id, late.id);
}

#[tokio::test]
async fn test_concurrent_promotion_sweeps() {
    let q = queue();
    for i in 0..20 {
        q.enqueue(Job::new("mail", "Send", json!(i)), Some(Delay::At(1000)), 900)
            .await
            .unwrap();
    }

    let sweeps: Vec<_> = (0..4)
        .map(|_| {
            let q = q.clone();
            tokio::spawn(async move { q.promote_due("mail", 1000).await.unwrap() })
        })
        .collect();

    let mut total = 0;
    for sweep in futures::future::join_all(sweeps).await {
        total += sweep.unwrap().len();
    }
    assert_eq!(total, 20);
    assert_eq!(q.len("mail").await.unwrap(), 20);
    assert_eq!(q.stats("mail").await.unwrap().queued, 20);
}

// ============================================================================
// P1: exclusive pop
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pop_is_exclusive() {
    let q = queue();
    let mut pushed = HashSet::new();
    for i in 0..50 {
        pushed.insert(q.push("mail", "Send", json!(i)).await.unwrap().id);
    }

    let poppers: Vec<_> = (0..8)
        .map(|_| {
            let q = q.clone();
            tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(job) = q.pop("mail").await.unwrap() {
                    mine.push(job.id);
                    tokio::task::yield_now().await;
                }
                mine
            })
        })
        .collect();

    let mut seen = Vec::new();
    for popper in futures::future::join_all(poppers).await {
        seen.extend(popper.unwrap());
    }

    assert_eq!(seen.len(), 50);
    assert_eq!(seen.into_iter().collect::<HashSet<_>>(), pushed);
}

// ============================================================================
// P2: counter conservation
// ============================================================================

#[tokio::test]
async fn test_counter_conservation() {
    let q = queue();
    let store = q.store().clone();
    let retention = QueueConfig::default();

    for i in 0..10 {
        q.push("mail", "Send", json!(i)).await.unwrap();
    }

    let outcomes = [
        JobOutcome::Processed,
        JobOutcome::Processed,
        JobOutcome::failed("x"),
        JobOutcome::Cancelled,
    ];
    for outcome in &outcomes {
        let mut job = q.pop("mail").await.unwrap().unwrap();
        job.start(&store, "h1:1:mail", 1).await.unwrap();
        job.finish(&store, outcome, &retention, 2).await.unwrap();
    }

    // Two more in flight.
    for _ in 0..2 {
        let mut job = q.pop("mail").await.unwrap().unwrap();
        job.start(&store, "h1:1:mail", 1).await.unwrap();
    }

    let stats = q.stats("mail").await.unwrap();
    let running = store.zcard(&StoreKey::Running("mail").build()).await.unwrap() as i64;
    assert_eq!(running, 2);
    assert_eq!(
        stats.total,
        stats.processed + stats.failed + stats.cancelled + stats.queued + running
    );
    assert_eq!(stats.queued, q.len("mail").await.unwrap() as i64);
}

// ============================================================================
// P4: namespace round trip
// ============================================================================

#[test]
fn test_namespace_round_trip_property() {
    let ns = Namespace::new("hive");
    let samples = [
        "a",
        "queues",
        "queue:mail:delayed",
        "worker:host-1:123:mail,sms",
        "job:5f0c",
        ":leading",
        "trailing:",
        "ünïcode",
    ];
    for s in samples {
        let added = ns.add(s);
        assert_eq!(ns.remove(&added), s);
        assert_eq!(ns.add(&added), added);
    }
}

#[tokio::test]
async fn test_namespaces_are_isolated() {
    let backend = Arc::new(InMemoryBackend::new());
    let a = Queue::new(Store::new(backend.clone(), "a"));
    let b = Queue::new(Store::new(backend, "b"));

    a.push("mail", "Send", json!(null)).await.unwrap();
    assert!(b.pop("mail").await.unwrap().is_none());
    assert!(b.known_queues().await.unwrap().is_empty());
    assert!(a.pop("mail").await.unwrap().is_some());
}
