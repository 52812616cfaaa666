#![cfg(feature = "memory")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use dog_jobs::{
    backend::memory::MemoryStore, Batch, BatchCallbacks, CallQueuedHandler, Clock, Command, Dispatched,
    Dispatcher, HandlerContainer, HandlerRoute, JobRegistry, MemoryBatchRepository, Queue, QueueBehavior,
    QueueError, QueueResult, QueueStore, QueuedCommand, Worker, WorkerOptions,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImportRow {
    row: u32,
    fail: bool,
}

impl Command for ImportRow {
    const NAME: &'static str = "import_row";

    fn behavior(&self) -> QueueBehavior {
        QueueBehavior::Queued
    }
}

fn row(row: u32) -> ImportRow {
    ImportRow { row, fail: false }
}

fn bad_row(row: u32) -> ImportRow {
    ImportRow { row, fail: true }
}

#[derive(Default)]
struct Counters {
    handled: AtomicUsize,
    then: AtomicUsize,
    catch: AtomicUsize,
    finally: AtomicUsize,
}

/// Memory store whose pushes fail once `allowed` of them have gone through
struct FlakyPushes {
    inner: MemoryStore,
    allowed: AtomicUsize,
}

impl FlakyPushes {
    fn new(allowed: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            allowed: AtomicUsize::new(allowed),
        }
    }
}

#[async_trait]
impl QueueStore for FlakyPushes {
    async fn push_raw(&self, queue: &str, payload: &str) -> QueueResult<()> {
        let admitted = self
            .allowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if admitted.is_err() {
            return Err(QueueError::Connectivity("connection reset".to_string()));
        }
        self.inner.push_raw(queue, payload).await
    }

    async fn later_raw(&self, queue: &str, available_at: i64, payload: &str) -> QueueResult<()> {
        self.inner.later_raw(queue, available_at, payload).await
    }

    async fn pop(&self, queue: &str) -> QueueResult<Option<String>> {
        self.inner.pop(queue).await
    }

    async fn release(&self, queue: &str, reserved: &str, delay: i64, attempts: u32) -> QueueResult<()> {
        self.inner.release(queue, reserved, delay, attempts).await
    }

    async fn delete_reserved(&self, queue: &str, reserved: &str) -> QueueResult<()> {
        self.inner.delete_reserved(queue, reserved).await
    }

    async fn size(&self, queue: &str) -> QueueResult<usize> {
        self.inner.size(queue).await
    }

    async fn clear(&self, queue: &str) -> QueueResult<usize> {
        self.inner.clear(queue).await
    }

    fn default_queue(&self) -> &str {
        self.inner.default_queue()
    }

    fn clock(&self) -> &dyn Clock {
        self.inner.clock()
    }

    fn driver(&self) -> &'static str {
        "flaky"
    }
}

struct Harness {
    dispatcher: Arc<Dispatcher>,
    worker: Worker,
    queue: Queue,
    counters: Arc<Counters>,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    fn with_store(store: Arc<dyn QueueStore>) -> Self {
        let counters = Arc::new(Counters::default());
        let queue = Queue::new(store);

        let container = Arc::new(HandlerContainer::new());
        let handled = counters.clone();
        container.method("Importer", "handle", move |cmd: ImportRow| {
            let counters = handled.clone();
            async move {
                counters.handled.fetch_add(1, Ordering::SeqCst);
                if cmd.fail {
                    anyhow::bail!("row {} is invalid", cmd.row);
                }
                Ok(cmd.row)
            }
        });

        let callbacks = Arc::new(BatchCallbacks::new());
        for name in ["then", "catch", "finally"] {
            let counters = counters.clone();
            callbacks.register(name, move |_batch: Batch, _error: Option<Arc<anyhow::Error>>| {
                let counters = counters.clone();
                async move {
                    let counter = match name {
                        "then" => &counters.then,
                        "catch" => &counters.catch,
                        _ => &counters.finally,
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        let dispatcher = Dispatcher::new(container)
            .with_queue_resolver(Arc::new(queue.clone()))
            .with_batches(Arc::new(MemoryBatchRepository::new()), callbacks);
        dispatcher.register::<ImportRow>(HandlerRoute::new("Importer", "handle"));
        let dispatcher = Arc::new(dispatcher);

        let mut registry = JobRegistry::new();
        CallQueuedHandler::new(dispatcher.clone()).register(&mut registry).unwrap();
        let worker = Worker::new(queue.clone(), Arc::new(registry)).with_memory_probe(|| 0);

        Self {
            dispatcher,
            worker,
            queue,
            counters,
        }
    }

    /// Run one job; every job gets a single attempt
    async fn work_one(&self) {
        let options = WorkerOptions {
            max_tries: Some(1),
            sleep: Duration::from_millis(1),
            ..WorkerOptions::default()
        };
        let _ = self.worker.run_next_job(&["default"], &options).await;
    }

    async fn batch(&self, id: &str) -> Batch {
        self.dispatcher.find_batch(id).await.unwrap().unwrap()
    }

    fn count(&self, counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// C1. Queued Command Runs Through The Worker
#[tokio::test]
async fn test_queued_command_runs_through_worker() {
    let h = Harness::new();

    // Act: dispatch a command that asks to be queued
    let outcome = h.dispatcher.dispatch(&row(7)).await.unwrap();

    // Assert: queued, not handled in process
    let Dispatched::Queued(id) = outcome else {
        panic!("expected the command to be queued");
    };
    assert_eq!(h.count(&h.counters.handled), 0);

    // Act: work it
    let job = h.queue.pop(None).await.unwrap().unwrap();
    assert_eq!(job.id(), id);
    assert_eq!(job.name(), "import_row");
    h.worker.process(job, &WorkerOptions::default()).await.unwrap();

    // Assert
    assert_eq!(h.count(&h.counters.handled), 1);
    assert_eq!(h.queue.size(None).await.unwrap(), 0);
}

/// C2. Then And Finally Fire Once On The Last Success
#[tokio::test]
async fn test_then_and_finally_fire_once_on_last_success() {
    let h = Harness::new();

    // Arrange
    let batch = h
        .dispatcher
        .batch(vec![])
        .unwrap()
        .name("import")
        .add(&row(1))
        .unwrap()
        .add(&row(2))
        .unwrap()
        .add(&row(3))
        .unwrap()
        .then("then")
        .finally("finally")
        .dispatch()
        .await
        .unwrap();
    assert_eq!(batch.total_jobs(), 3);
    assert_eq!(batch.pending_jobs(), 3);

    // Act: two of three
    h.work_one().await;
    h.work_one().await;

    // Assert: nothing yet
    assert_eq!(h.count(&h.counters.then), 0);
    assert_eq!(h.count(&h.counters.finally), 0);
    assert_eq!(h.batch(batch.id()).await.progress(), 67);

    // Act: the last one
    h.work_one().await;

    // Assert
    let done = h.batch(batch.id()).await;
    assert_eq!(h.count(&h.counters.then), 1);
    assert_eq!(h.count(&h.counters.finally), 1);
    assert_eq!(done.pending_jobs(), 0);
    assert_eq!(done.progress(), 100);
    assert!(done.finished());
    assert!(!done.cancelled());
}

/// C3. First Failure Cancels And Catches Once
#[tokio::test]
async fn test_first_failure_cancels_and_catches_once() {
    let h = Harness::new();

    // Arrange: the first row fails
    let batch = h
        .dispatcher
        .batch(vec![])
        .unwrap()
        .add(&bad_row(1))
        .unwrap()
        .add(&bad_row(2))
        .unwrap()
        .add(&row(3))
        .unwrap()
        .then("then")
        .catch("catch")
        .finally("finally")
        .dispatch()
        .await
        .unwrap();

    // Act
    h.work_one().await;

    // Assert: cancelled, catch ran once
    let after_first = h.batch(batch.id()).await;
    assert!(after_first.cancelled());
    assert_eq!(after_first.failed_jobs(), 1);
    assert_eq!(h.count(&h.counters.catch), 1);

    // Act: the rest are skipped because the batch is cancelled
    h.work_one().await;
    h.work_one().await;

    // Assert
    let after_all = h.batch(batch.id()).await;
    assert!(after_all.cancelled());
    assert_eq!(after_all.cancelled_at(), after_first.cancelled_at());
    assert_eq!(h.count(&h.counters.handled), 1);
    assert_eq!(h.count(&h.counters.catch), 1);
    assert_eq!(h.count(&h.counters.then), 0);
    assert_eq!(h.count(&h.counters.finally), 1);
    assert_eq!(h.queue.size(None).await.unwrap(), 0);
}

/// C4. Allowed Failures Keep The Batch Running
#[tokio::test]
async fn test_allowed_failures_keep_batch_running() {
    let h = Harness::new();

    // Arrange
    let batch = h
        .dispatcher
        .batch(vec![])
        .unwrap()
        .add(&bad_row(1))
        .unwrap()
        .add(&bad_row(2))
        .unwrap()
        .add(&row(3))
        .unwrap()
        .allow_failures(true)
        .catch("catch")
        .finally("finally")
        .dispatch()
        .await
        .unwrap();

    // Act
    h.work_one().await;
    h.work_one().await;
    h.work_one().await;

    // Assert: every command ran, catch only on the first failure
    let done = h.batch(batch.id()).await;
    assert!(!done.cancelled());
    assert_eq!(done.failed_jobs(), 2);
    assert_eq!(done.failed_job_ids().len(), 2);
    assert!(done.has_failures());
    assert_eq!(h.count(&h.counters.handled), 3);
    assert_eq!(h.count(&h.counters.catch), 1);
    assert_eq!(h.count(&h.counters.finally), 1);
}

/// C5. Empty Batch Is Finished On Dispatch
#[tokio::test]
async fn test_empty_batch_is_finished_on_dispatch() {
    let h = Harness::new();

    // Act
    let batch = h.dispatcher.batch(vec![]).unwrap().name("nothing").dispatch().await.unwrap();

    // Assert
    assert!(batch.finished());
    assert_eq!(batch.total_jobs(), 0);
    assert_eq!(h.queue.size(None).await.unwrap(), 0);
}

/// C6. Unknown Callbacks Are Rejected Before Queueing
#[tokio::test]
async fn test_unknown_callbacks_are_rejected() {
    let h = Harness::new();

    // Act
    let result = h
        .dispatcher
        .batch(vec![])
        .unwrap()
        .add(&row(1))
        .unwrap()
        .then("missing")
        .dispatch()
        .await;

    // Assert
    assert!(matches!(result, Err(QueueError::UnresolvedHandler(name)) if name == "missing"));
    assert_eq!(h.queue.size(None).await.unwrap(), 0);
}

/// C7. Batching Without A Repository Is A Configuration Error
#[tokio::test]
async fn test_batching_requires_repository() {
    let dispatcher = Dispatcher::new(Arc::new(HandlerContainer::new()));

    let result = dispatcher.batch(vec![]);

    assert!(matches!(result, Err(QueueError::RuntimeConfiguration(_))));
}

/// C8. Repeated Success Reports Do Not Refire Callbacks
#[tokio::test]
async fn test_repeated_success_reports_do_not_refire_callbacks() {
    let h = Harness::new();

    // Arrange: a one-job batch, worked to completion
    let batch = h
        .dispatcher
        .batch(vec![])
        .unwrap()
        .add(&row(1))
        .unwrap()
        .then("then")
        .finally("finally")
        .dispatch()
        .await
        .unwrap();
    let job = h.queue.pop(None).await.unwrap().unwrap();
    let job_id = job.id().to_string();
    h.worker.process(job, &WorkerOptions::default()).await.unwrap();
    assert_eq!(h.count(&h.counters.then), 1);

    // Act: the same job reports success again, as after a lost acknowledgement
    let done = h.batch(batch.id()).await;
    done.record_successful_job(&job_id).await.unwrap();
    done.record_successful_job(&job_id).await.unwrap();

    // Assert
    assert_eq!(h.count(&h.counters.then), 1);
    assert_eq!(h.count(&h.counters.finally), 1);
    let after = h.batch(batch.id()).await;
    assert_eq!(after.pending_jobs(), 0);
    assert_eq!(after.finished_at(), done.finished_at());
}

/// C9. Jobs That Could Not Be Queued Are Taken Back Out Of The Batch
#[tokio::test]
async fn test_unqueued_jobs_are_taken_back() {
    let h = Harness::with_store(Arc::new(FlakyPushes::new(2)));

    // Arrange: one job on dispatch, then an add whose second push fails
    let batch = h
        .dispatcher
        .batch(vec![])
        .unwrap()
        .add(&row(1))
        .unwrap()
        .then("then")
        .finally("finally")
        .dispatch()
        .await
        .unwrap();

    // Act
    let commands = vec![
        QueuedCommand::new(&row(2)).unwrap(),
        QueuedCommand::new(&row(3)).unwrap(),
    ];
    let added = batch.add(commands).await;

    // Assert: only the queued job is counted
    assert!(matches!(added, Err(QueueError::Connectivity(_))));
    let counted = h.batch(batch.id()).await;
    assert_eq!(counted.total_jobs(), 2);
    assert_eq!(counted.pending_jobs(), 2);
    assert_eq!(h.queue.size(None).await.unwrap(), 2);

    // Act: work both queued jobs
    h.work_one().await;
    h.work_one().await;

    // Assert
    let done = h.batch(batch.id()).await;
    assert!(done.finished());
    assert_eq!(done.pending_jobs(), 0);
    assert_eq!(h.count(&h.counters.then), 1);
    assert_eq!(h.count(&h.counters.finally), 1);
}
