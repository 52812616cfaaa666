#![cfg(feature = "memory")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use dog_jobs::{
    backend::memory::MemoryStore, payload::Payload, Cycle, JobHandle, JobHandler, JobRegistry, ManualClock,
    Queue, QueueError, StopReason, Worker, WorkerEvent, WorkerOptions,
};

/// Fails until it has been fired `fail_times` times, recording every attempt
#[derive(Default)]
struct Flaky {
    fail_times: usize,
    attempts: Mutex<Vec<u32>>,
    failed_hook: AtomicUsize,
}

#[async_trait]
impl JobHandler for Flaky {
    async fn fire(&self, job: &mut JobHandle, _data: Value) -> anyhow::Result<()> {
        let seen = {
            let mut attempts = self.attempts.lock();
            attempts.push(job.attempts());
            attempts.len()
        };

        if seen <= self.fail_times {
            anyhow::bail!("attempt {} failed", job.attempts());
        }
        Ok(())
    }

    async fn failed(&self, _payload: &Payload, _error: Arc<anyhow::Error>) -> anyhow::Result<()> {
        self.failed_hook.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn setup(handler: Arc<Flaky>) -> (Worker, Queue, Arc<MemoryStore>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let store = Arc::new(MemoryStore::new().with_clock(clock));
    let queue = Queue::new(store.clone());

    let mut registry = JobRegistry::new();
    registry.register("Flaky", handler).unwrap();

    let worker = Worker::new(queue.clone(), Arc::new(registry)).with_memory_probe(|| 0);
    (worker, queue, store)
}

fn options() -> WorkerOptions {
    WorkerOptions {
        sleep: Duration::from_millis(10),
        ..WorkerOptions::default()
    }
}

/// B1. Failed Job Is Retried With The Next Attempt Number
#[tokio::test]
async fn test_failed_job_retried_with_next_attempt() {
    let handler = Arc::new(Flaky {
        fail_times: 1,
        ..Flaky::default()
    });
    let (worker, queue, _) = setup(handler.clone());

    // Arrange
    let id = queue.push_plain("Flaky", json!({}), None).await.unwrap();

    // Act: first cycle fails and releases, second succeeds
    let first = worker.run_next_job(&["default"], &options()).await;
    let second = worker.run_next_job(&["default"], &options()).await.unwrap();

    // Assert
    assert!(matches!(first, Err(QueueError::JobFailed { job_id, .. }) if job_id == id));
    assert_eq!(second, Cycle::Processed { job_id: id });
    assert_eq!(*handler.attempts.lock(), vec![1, 2]);
    assert_eq!(queue.size(None).await.unwrap(), 0);
    assert_eq!(handler.failed_hook.load(Ordering::SeqCst), 0);
}

/// B2. Job Fails Permanently At Max Tries
#[test_log::test(tokio::test)]
async fn test_job_fails_permanently_at_max_tries() {
    let handler = Arc::new(Flaky {
        fail_times: usize::MAX,
        ..Flaky::default()
    });
    let (worker, queue, _) = setup(handler.clone());
    let mut events = worker.subscribe();
    let options = WorkerOptions {
        max_tries: Some(2),
        ..options()
    };

    // Arrange
    queue.push_plain("Flaky", json!({}), None).await.unwrap();

    // Act
    assert!(worker.run_next_job(&["default"], &options).await.is_err());
    assert!(worker.run_next_job(&["default"], &options).await.is_err());

    // Assert: deleted, hook ran once, and a Failed event went out
    assert_eq!(queue.size(None).await.unwrap(), 0);
    assert_eq!(handler.failed_hook.load(Ordering::SeqCst), 1);

    let mut failed_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, WorkerEvent::Failed { .. }) {
            failed_events += 1;
        }
    }
    assert_eq!(failed_events, 1);
}

/// B3. Queues Are Polled In Priority Order
#[tokio::test]
async fn test_queues_polled_in_order() {
    let handler = Arc::new(Flaky::default());
    let (worker, queue, _) = setup(handler.clone());

    // Arrange
    let low = queue.push_plain("Flaky", json!({}), Some("low")).await.unwrap();
    let high = queue.push_plain("Flaky", json!({}), Some("high")).await.unwrap();

    // Act
    let first = worker.run_next_job(&["high", "low"], &options()).await.unwrap();
    let second = worker.run_next_job(&["high", "low"], &options()).await.unwrap();

    // Assert
    assert_eq!(first, Cycle::Processed { job_id: high });
    assert_eq!(second, Cycle::Processed { job_id: low });
}

/// B4. Daemon Stops When Empty
#[tokio::test]
async fn test_daemon_stops_when_empty() {
    let handler = Arc::new(Flaky::default());
    let (worker, queue, _) = setup(handler.clone());
    let options = WorkerOptions {
        stop_when_empty: true,
        ..options()
    };

    // Arrange
    queue.push_plain("Flaky", json!({}), None).await.unwrap();
    queue.push_plain("Flaky", json!({}), None).await.unwrap();

    // Act
    let (_tx, rx) = tokio::sync::oneshot::channel();
    let reason = worker.daemon(&["default".to_string()], &options, rx).await.unwrap();

    // Assert
    assert_eq!(reason, StopReason::QueueEmpty);
    assert_eq!(handler.attempts.lock().len(), 2);
}

/// B5. Spawned Daemon Honors Shutdown
#[tokio::test]
async fn test_spawned_daemon_honors_shutdown() {
    let handler = Arc::new(Flaky::default());
    let (worker, _, _) = setup(handler);
    let options = WorkerOptions {
        sleep: Duration::from_secs(30),
        ..WorkerOptions::default()
    };

    // Act: the daemon is idle, sleeping between polls
    let handle = Arc::new(worker).spawn(vec!["default".to_string()], options);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let reason = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .expect("shutdown should interrupt the idle sleep")
        .unwrap();

    // Assert
    assert_eq!(reason, StopReason::Shutdown);
}

/// B6. Daemon Stops After Max Time
#[tokio::test(start_paused = true)]
async fn test_daemon_stops_after_max_time() {
    let (worker, _, _) = setup(Arc::new(Flaky::default()));
    let options = WorkerOptions {
        sleep: Duration::from_secs(3),
        max_time: Some(Duration::from_secs(10)),
        ..WorkerOptions::default()
    };

    // Act
    let (_tx, rx) = tokio::sync::oneshot::channel();
    let reason = worker.daemon(&["default".to_string()], &options, rx).await.unwrap();

    // Assert
    assert_eq!(reason, StopReason::MaxTimeReached);
}

/// B7. Daemon Stops When Memory Is Exceeded
#[tokio::test]
async fn test_daemon_stops_on_memory_limit() {
    let handler = Arc::new(Flaky::default());
    let (worker, queue, _) = setup(handler.clone());
    let worker = worker.with_memory_probe(|| 512 * 1024 * 1024);
    let mut events = worker.subscribe();

    // Arrange
    queue.push_plain("Flaky", json!({}), None).await.unwrap();
    queue.push_plain("Flaky", json!({}), None).await.unwrap();

    // Act
    let (_tx, rx) = tokio::sync::oneshot::channel();
    let reason = worker.daemon(&["default".to_string()], &options(), rx).await.unwrap();

    // Assert: one job ran, then the limit stopped the loop
    assert_eq!(reason, StopReason::MemoryExceeded);
    assert_eq!(handler.attempts.lock().len(), 1);
    assert_eq!(queue.size(None).await.unwrap(), 1);

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    assert_eq!(
        last,
        Some(WorkerEvent::Stopping {
            reason: StopReason::MemoryExceeded
        })
    );
}
