// Worker loop: bounded concurrency, outcome accounting, graceful shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobq_core::config::{QueueConfig, WorkerConfig};
use chrono::{TimeZone, Utc};
use jobq_queue::{
    DispatchOptions, HandlerError, HandlerRegistry, JobStatus, ManualClock, QueueEngine,
    SqliteJobStore, Worker,
};
use serde_json::json;
use tokio::sync::watch;

fn worker_config(concurrency: usize) -> WorkerConfig {
    WorkerConfig {
        concurrency,
        poll_interval_ms: 10,
        max_idle_ms: 50,
        ..WorkerConfig::default()
    }
}

fn engine(registry: Arc<HandlerRegistry>) -> Arc<QueueEngine> {
    Arc::new(QueueEngine::new(
        Arc::new(SqliteJobStore::in_memory().unwrap()),
        registry,
        QueueConfig {
            default_max_attempts: 1,
            ..QueueConfig::default()
        },
    ))
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn worker_drains_queue_and_reports_summary() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.register_fn("ok", |_payload| async { Ok(()) });
    registry.register_fn("bad", |_payload| async {
        Err(HandlerError::new("always fails"))
    });
    let engine = engine(registry);
    for _ in 0..5 {
        engine
            .dispatch("ok", json!({}), DispatchOptions::default())
            .unwrap();
    }
    for _ in 0..2 {
        engine
            .dispatch("bad", json!({}), DispatchOptions::default())
            .unwrap();
    }

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Worker::new(engine.clone(), worker_config(3)).run(rx));

    let watched = engine.clone();
    wait_until(move || {
        let stats = watched.get_stats().unwrap();
        stats.count(JobStatus::Completed) == 5 && stats.count(JobStatus::Failed) == 2
    })
    .await;

    tx.send(true).unwrap();
    let summary = task.await.unwrap();
    assert_eq!(summary.processed, 7);
    assert_eq!(summary.succeeded, 5);
    assert_eq!(summary.failed, 2);
}

#[tokio::test]
async fn worker_never_exceeds_concurrency() {
    let registry = Arc::new(HandlerRegistry::new());
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let running = running.clone();
        let peak = peak.clone();
        registry.register_fn("slow", move |_payload| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
    }
    let engine = engine(registry);
    for _ in 0..8 {
        engine
            .dispatch("slow", json!({}), DispatchOptions::default())
            .unwrap();
    }

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Worker::new(engine.clone(), worker_config(2)).run(rx));
    let watched = engine.clone();
    wait_until(move || watched.get_stats().unwrap().count(JobStatus::Completed) == 8).await;
    tx.send(true).unwrap();

    assert_eq!(task.await.unwrap().succeeded, 8);
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_jobs() {
    let registry = Arc::new(HandlerRegistry::new());
    let started = Arc::new(AtomicUsize::new(0));
    {
        let started = started.clone();
        registry.register_fn("long", move |_payload| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            }
        });
    }
    let engine = engine(registry);
    let job = engine
        .dispatch("long", json!({}), DispatchOptions::default())
        .unwrap();

    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Worker::new(engine.clone(), worker_config(1)).run(rx));
    let watched = started.clone();
    wait_until(move || watched.load(Ordering::SeqCst) == 1).await;

    tx.send(true).unwrap();
    let summary = task.await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(
        engine.get_job(&job.id).unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn dropped_sender_stops_idle_worker() {
    let engine = engine(Arc::new(HandlerRegistry::new()));
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Worker::new(engine, worker_config(1)).run(rx));
    drop(tx);
    let summary = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert_eq!(summary.processed, 0);
}

#[tokio::test]
async fn worker_requeues_job_stuck_past_lease() {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    ));
    let registry = Arc::new(HandlerRegistry::new());
    registry.register_fn("ok", |_payload| async { Ok(()) });
    let engine = Arc::new(
        QueueEngine::new(
            Arc::new(SqliteJobStore::in_memory().unwrap()),
            registry,
            QueueConfig::default(),
        )
        .with_clock(clock.clone()),
    );

    let job = engine
        .dispatch("ok", json!({}), DispatchOptions::default())
        .unwrap();
    // claimed by a worker that never reports back
    let abandoned = engine.get_next_job().unwrap().unwrap();
    assert_eq!(abandoned.attempts, 1);
    clock.advance(chrono::Duration::seconds(61));

    let config = WorkerConfig {
        lease_timeout_secs: Some(60),
        ..worker_config(1)
    };
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Worker::new(engine.clone(), config).run(rx));

    let watched = engine.clone();
    let id = job.id.clone();
    wait_until(move || watched.get_job(&id).unwrap().status == JobStatus::Completed).await;

    tx.send(true).unwrap();
    let summary = task.await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(engine.get_job(&job.id).unwrap().attempts, 2);
}
