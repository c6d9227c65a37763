use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde_json::json;
use tokio::time::sleep;

use bullpen::{
    handler_fn, BackoffOptions, BullpenError, JobHandler, JobId, JobOptions, JobState, JobStore, MemoryStore, Queue,
    Registry, ShutdownMode, WorkerConfig, WorkerPool,
};

fn fast_config(concurrency: usize) -> WorkerConfig {
    WorkerConfig {
        concurrency,
        poll_interval: Duration::from_millis(20),
        lease_duration: Duration::from_secs(5),
        reclaim_interval: Some(Duration::from_millis(20)),
        error_backoff: Duration::from_millis(20),
    }
}

async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_for_state(queue: &Queue, id: JobId, state: JobState) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if queue.get_job(id).await.unwrap().map(|job| job.state) == Some(state) {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

fn counting_handler(calls: Arc<AtomicUsize>) -> Arc<dyn JobHandler> {
    handler_fn(move |_ctx, _job| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_single_slot_runs_jobs_in_enqueue_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let handler = handler_fn(move |_ctx, job| {
        let recorder = recorder.clone();
        async move {
            recorder.lock().unwrap().push(job.data["n"].as_u64().unwrap());
            Ok(())
        }
    });

    let registry = Registry::builder()
        .store(Arc::new(MemoryStore::new()))
        .queue("test", handler)
        .build()
        .unwrap();
    for n in 0..10 {
        registry.enqueue("test", json!({ "n": n }), None).await.unwrap();
    }

    let pool = WorkerPool::start(&registry, fast_config(1)).unwrap();
    assert!(wait_until(|| seen.lock().unwrap().len() == 10).await);
    pool.shutdown(ShutdownMode::Graceful).await;

    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_successful_job_completes_without_failure_hook() {
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let calls = Arc::new(AtomicUsize::new(0));

    let registry = Registry::builder()
        .store(Arc::new(MemoryStore::new()))
        .queue("test", counting_handler(calls.clone()))
        .on_job_failed(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    let pool = WorkerPool::start(&registry, fast_config(1)).unwrap();

    let queue = registry.queue("test").unwrap();
    let id = queue.enqueue(json!({ "x": 1 }), None).await.unwrap();
    assert!(wait_for_state(&queue, id, JobState::Completed).await);
    pool.shutdown(ShutdownMode::Graceful).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    assert_eq!(queue.counts().await.unwrap().completed, 1);
}

#[tokio::test]
async fn test_handler_exceeding_lease_is_redelivered() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_ctx, _job| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                sleep(Duration::from_secs(30)).await;
            }
            Ok(())
        }
    });

    let registry = Registry::builder()
        .store(Arc::new(MemoryStore::new()))
        .queue("test", handler)
        .build()
        .unwrap();
    let config = WorkerConfig {
        lease_duration: Duration::from_millis(100),
        ..fast_config(1)
    };
    let pool = WorkerPool::start(&registry, config).unwrap();

    let queue = registry.queue("test").unwrap();
    let id = queue.enqueue(json!({}), None).await.unwrap();
    assert!(wait_for_state(&queue, id, JobState::Completed).await);
    pool.shutdown(ShutdownMode::Graceful).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.attempts_made, 0);
    assert_eq!(job.lease_expirations, 1);
}

#[tokio::test]
async fn test_failing_job_retries_until_attempts_exhausted() {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let recorder = attempts.clone();
    let handler = handler_fn(move |ctx, _job| {
        let recorder = recorder.clone();
        async move {
            recorder.lock().unwrap().push(ctx.attempt);
            Err(anyhow!("boom"))
        }
    });

    let failures = Arc::new(Mutex::new(Vec::new()));
    let failed = failures.clone();
    let registry = Registry::builder()
        .store(Arc::new(MemoryStore::new()))
        .queue_with_options(
            "test",
            handler,
            JobOptions::default()
                .with_attempts(3)
                .with_backoff(BackoffOptions::fixed(10)),
        )
        .on_job_failed(move |_, job, err| {
            failed.lock().unwrap().push((job.attempts_made, job.state, err.to_string()));
        })
        .build()
        .unwrap();
    let pool = WorkerPool::start(&registry, fast_config(1)).unwrap();

    let queue = registry.queue("test").unwrap();
    let id = queue.enqueue(json!({}), None).await.unwrap();
    assert!(wait_for_state(&queue, id, JobState::Failed).await);
    pool.shutdown(ShutdownMode::Graceful).await;

    assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3]);

    let failures = failures.lock().unwrap();
    let states: Vec<_> = failures.iter().map(|(n, state, _)| (*n, *state)).collect();
    assert_eq!(
        states,
        vec![(1, JobState::Waiting), (2, JobState::Waiting), (3, JobState::Failed)]
    );
    assert!(failures[2].2.contains("boom"));

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.attempts_made, job.max_attempts);
    assert!(job.last_error.unwrap().contains("boom"));
}

#[tokio::test]
async fn test_one_job_goes_to_exactly_one_slot() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_ctx, _job| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(50)).await;
            Ok(())
        }
    });

    let registry = Registry::builder()
        .store(Arc::new(MemoryStore::new()))
        .queue("test", handler)
        .build()
        .unwrap();
    let pool = WorkerPool::start(&registry, fast_config(4)).unwrap();

    let queue = registry.queue("test").unwrap();
    let id = queue.enqueue(json!({}), None).await.unwrap();
    assert!(wait_for_state(&queue, id, JobState::Completed).await);
    sleep(Duration::from_millis(100)).await;
    pool.shutdown(ShutdownMode::Graceful).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_the_pool() {
    let handler = handler_fn(|_ctx, job| async move {
        if job.data["panic"].as_bool().unwrap_or(false) {
            panic!("handler blew up");
        }
        Ok(())
    });

    let failures = Arc::new(Mutex::new(Vec::new()));
    let failed = failures.clone();
    let registry = Registry::builder()
        .store(Arc::new(MemoryStore::new()))
        .queue("test", handler)
        .on_job_failed(move |_, job, err| {
            failed.lock().unwrap().push((job.id, err.to_string()));
        })
        .build()
        .unwrap();
    let pool = WorkerPool::start(&registry, fast_config(1)).unwrap();

    let queue = registry.queue("test").unwrap();
    let bad = queue.enqueue(json!({ "panic": true }), None).await.unwrap();
    let good = queue.enqueue(json!({}), None).await.unwrap();
    assert!(wait_for_state(&queue, good, JobState::Completed).await);
    pool.shutdown(ShutdownMode::Graceful).await;

    assert_eq!(queue.get_job(bad).await.unwrap().unwrap().state, JobState::Failed);
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, bad);
    assert!(failures[0].1.contains("panicked"));
}

#[tokio::test]
async fn test_store_outage_reports_errors_and_recovers() {
    let store = Arc::new(MemoryStore::new());
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    let calls = Arc::new(AtomicUsize::new(0));

    let registry = Registry::builder()
        .store(store.clone())
        .queue("test", counting_handler(calls.clone()))
        .on_error(move |queue, err| {
            assert_eq!(queue, "test");
            assert!(err.is_store_error());
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    store.set_available(false);
    let pool = WorkerPool::start(&registry, fast_config(2)).unwrap();
    assert!(wait_until(|| errors.load(Ordering::SeqCst) >= 3).await);
    assert!(matches!(
        registry.enqueue("test", json!({}), None).await,
        Err(BullpenError::StoreUnavailable(_))
    ));

    store.set_available(true);
    registry.enqueue("test", json!({}), None).await.unwrap();
    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1).await);
    pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_delayed_job_waits_for_due_time() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Registry::builder()
        .store(Arc::new(MemoryStore::new()))
        .queue("test", counting_handler(calls.clone()))
        .build()
        .unwrap();
    let pool = WorkerPool::start(&registry, fast_config(1)).unwrap();

    let queue = registry.queue("test").unwrap();
    let id = queue.enqueue(json!({}), Some(JobOptions::delayed(300))).await.unwrap();
    assert_eq!(queue.get_job(id).await.unwrap().unwrap().state, JobState::Delayed);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1).await);
    pool.shutdown(ShutdownMode::Graceful).await;
}

#[tokio::test]
async fn test_graceful_shutdown_waits_for_in_flight_jobs() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_ctx, _job| {
        let counter = counter.clone();
        async move {
            sleep(Duration::from_millis(200)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let registry = Registry::builder()
        .store(Arc::new(MemoryStore::new()))
        .queue("test", handler)
        .build()
        .unwrap();
    let pool = WorkerPool::start(&registry, fast_config(1)).unwrap();

    let queue = registry.queue("test").unwrap();
    let id = queue.enqueue(json!({}), None).await.unwrap();
    assert!(wait_until(|| pool.in_flight() == 1).await);

    pool.shutdown(ShutdownMode::Graceful).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue.get_job(id).await.unwrap().unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn test_hard_shutdown_abandons_in_flight_jobs() {
    let handler = handler_fn(|_ctx, _job| async {
        sleep(Duration::from_secs(30)).await;
        Ok(())
    });

    let registry = Registry::builder()
        .store(Arc::new(MemoryStore::new()))
        .queue("test", handler)
        .build()
        .unwrap();
    let pool = WorkerPool::start(&registry, fast_config(1)).unwrap();

    let queue = registry.queue("test").unwrap();
    let id = queue.enqueue(json!({}), None).await.unwrap();
    assert!(wait_until(|| pool.in_flight() == 1).await);

    let started = Instant::now();
    pool.shutdown(ShutdownMode::Hard {
        timeout: Duration::from_millis(50),
    })
    .await;
    assert!(started.elapsed() < Duration::from_secs(5));

    // Still leased; the lease expiry hands it to the next pool
    assert_eq!(queue.get_job(id).await.unwrap().unwrap().state, JobState::Active);
}

#[tokio::test]
async fn test_closed_and_producer_queues_are_not_dispatched() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Registry::builder()
        .store(Arc::new(MemoryStore::new()))
        .queue("closed", counting_handler(calls.clone()))
        .producer_queue("outbox", JobOptions::default())
        .queue("open", counting_handler(calls.clone()))
        .build()
        .unwrap();

    let closed = registry.enqueue("closed", json!({}), None).await.unwrap();
    let outbox = registry.enqueue("outbox", json!({}), None).await.unwrap();
    registry.queue("closed").unwrap().close();

    let pool = WorkerPool::start(&registry, fast_config(2)).unwrap();
    registry.enqueue("open", json!({}), None).await.unwrap();
    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1).await);
    sleep(Duration::from_millis(100)).await;
    pool.shutdown(ShutdownMode::Graceful).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let store = registry.store();
    assert_eq!(store.get_job("closed", closed).await.unwrap().unwrap().state, JobState::Waiting);
    assert_eq!(store.get_job("outbox", outbox).await.unwrap().unwrap().state, JobState::Waiting);
}

#[tokio::test]
async fn test_host_context_reaches_handlers() {
    struct App {
        greeting: String,
    }

    let seen = Arc::new(Mutex::new(None));
    let recorder = seen.clone();
    let handler = handler_fn(move |ctx, _job| {
        let recorder = recorder.clone();
        async move {
            let app = ctx.host::<App>().ok_or_else(|| anyhow!("no host"))?;
            *recorder.lock().unwrap() = Some(app.greeting.clone());
            Ok(())
        }
    });

    let registry = Registry::builder()
        .store(Arc::new(MemoryStore::new()))
        .host(App {
            greeting: "hello".to_string(),
        })
        .queue("test", handler)
        .build()
        .unwrap();
    let pool = WorkerPool::start(&registry, fast_config(1)).unwrap();

    registry.enqueue("test", json!({}), None).await.unwrap();
    assert!(wait_until(|| seen.lock().unwrap().is_some()).await);
    pool.shutdown(ShutdownMode::Graceful).await;

    assert_eq!(seen.lock().unwrap().as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_completed_jobs_can_be_dropped_from_the_store() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Registry::builder()
        .store(Arc::new(MemoryStore::new()))
        .queue_with_options(
            "test",
            counting_handler(calls.clone()),
            JobOptions::default().with_remove_on_complete(true),
        )
        .build()
        .unwrap();
    let pool = WorkerPool::start(&registry, fast_config(1)).unwrap();

    let queue = registry.queue("test").unwrap();
    let dropped = queue.enqueue(json!({}), None).await.unwrap();
    let kept = queue
        .enqueue(json!({}), Some(JobOptions::default().with_remove_on_complete(false)))
        .await
        .unwrap();
    assert!(wait_for_state(&queue, kept, JobState::Completed).await);
    pool.shutdown(ShutdownMode::Graceful).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(queue.get_job(dropped).await.unwrap().is_none());
    assert_eq!(queue.counts().await.unwrap().completed, 1);
}
