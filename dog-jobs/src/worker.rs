//! The poll / fire / acknowledge loop.
//!
//! One cycle reserves at most one job from the first non-empty queue, fires
//! it, and deletes it on success or hands it to the [`FailurePolicy`] on
//! error. [`Worker::daemon`] repeats cycles until told to stop.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::{job::JobHandle, job::JobRegistry, queue::Queue, QueueError, QueueResult};

/// Options for one worker run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOptions {
    /// Seconds before a failed job becomes available again
    pub delay: i64,
    /// Memory ceiling in megabytes
    pub memory_mb: u64,
    /// Pause between polls when every queue is empty
    pub sleep: Duration,
    /// Attempt ceiling for jobs that carry no `maxTries` of their own
    pub max_tries: Option<u32>,
    /// Stop the daemon after running this long
    pub max_time: Option<Duration>,
    /// Stop the daemon as soon as every queue is empty
    pub stop_when_empty: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            delay: 0,
            memory_mb: 128,
            sleep: Duration::from_secs(3),
            max_tries: None,
            max_time: None,
            stop_when_empty: false,
        }
    }
}

/// Outcome of one poll cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    Processed { job_id: String },
    Idle,
}

/// Why the daemon loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    MemoryExceeded,
    MaxTimeReached,
    QueueEmpty,
}

/// What to do with a job whose handler returned an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Put it back on the queue after the configured delay
    Release,
    /// Delete it and run its `failed` hook
    Fail,
}

/// Decides between retry and permanent failure
pub trait FailurePolicy: Send + Sync {
    fn after_error(&self, job: &JobHandle, options: &WorkerOptions) -> FailureAction;

    /// Whether a freshly reserved job has used up its attempts already
    fn exhausted(&self, _job: &JobHandle, _options: &WorkerOptions) -> bool {
        false
    }
}

/// Fails jobs once `attempts()` reaches `maxTries` (payload first, then options)
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxAttempts;

impl MaxAttempts {
    fn limit(job: &JobHandle, options: &WorkerOptions) -> Option<u32> {
        job.max_tries().or(options.max_tries).filter(|max| *max > 0)
    }
}

impl FailurePolicy for MaxAttempts {
    fn after_error(&self, job: &JobHandle, options: &WorkerOptions) -> FailureAction {
        match Self::limit(job, options) {
            Some(max) if job.attempts() >= max => FailureAction::Fail,
            _ => FailureAction::Release,
        }
    }

    fn exhausted(&self, job: &JobHandle, options: &WorkerOptions) -> bool {
        matches!(Self::limit(job, options), Some(max) if job.attempts() > max)
    }
}

/// Lifecycle notifications, for logging and monitoring subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Processing { connection: String, queue: String, job_id: String, name: String },
    Processed { connection: String, queue: String, job_id: String, name: String },
    ExceptionOccurred { connection: String, queue: String, job_id: String, error: String },
    Failed { connection: String, queue: String, job_id: String, error: String },
    Stopping { reason: StopReason },
}

type MemoryProbe = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Handle for managing a spawned daemon
pub struct WorkerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<QueueResult<StopReason>>,
}

impl WorkerHandle {
    /// Ask the daemon to stop after its current cycle and wait for it
    pub async fn shutdown(self) -> QueueResult<StopReason> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| QueueError::Internal(format!("Worker join error: {}", e)))?
    }
}

pub struct Worker {
    queue: Queue,
    registry: Arc<JobRegistry>,
    policy: Arc<dyn FailurePolicy>,
    memory_probe: MemoryProbe,
    events: broadcast::Sender<WorkerEvent>,
}

impl Worker {
    pub fn new(queue: Queue, registry: Arc<JobRegistry>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            queue,
            registry,
            policy: Arc::new(MaxAttempts),
            memory_probe: Arc::new(resident_memory_bytes),
            events,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn FailurePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the memory probe (bytes in use)
    pub fn with_memory_probe(mut self, probe: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.memory_probe = Arc::new(probe);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run one cycle: process the next job, or sleep when there is none
    #[instrument(skip(self, options), fields(connection = %self.queue.connection_name()))]
    pub async fn run_next_job(&self, queues: &[&str], options: &WorkerOptions) -> QueueResult<Cycle> {
        match self.get_next_job(queues).await? {
            Some(job) => {
                let job_id = job.id().to_string();
                self.process(job, options).await?;
                Ok(Cycle::Processed { job_id })
            }
            None => {
                self.sleep(options.sleep).await;
                Ok(Cycle::Idle)
            }
        }
    }

    /// Reserve from the first queue that has work, in the given order
    pub async fn get_next_job(&self, queues: &[&str]) -> QueueResult<Option<JobHandle>> {
        if queues.is_empty() {
            return self.queue.pop(None).await;
        }

        for queue in queues {
            if let Some(job) = self.queue.pop(Some(queue)).await? {
                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    /// Fire a reserved job and acknowledge it.
    ///
    /// Handler errors are returned as [`QueueError::JobFailed`] after the job
    /// was released or failed.
    pub async fn process(&self, mut job: JobHandle, options: &WorkerOptions) -> QueueResult<()> {
        let connection = self.queue.connection_name().to_string();
        let queue = job.queue().to_string();
        let job_id = job.id().to_string();

        if self.policy.exhausted(&job, options) {
            let error = Arc::new(anyhow::anyhow!(
                "{} has been attempted too many times ({})",
                job.name(),
                job.attempts()
            ));
            self.fail_job(&mut job, error.clone()).await?;
            return Err(QueueError::job_failed(job_id, error));
        }

        self.emit(WorkerEvent::Processing {
            connection: connection.clone(),
            queue: queue.clone(),
            job_id: job_id.clone(),
            name: job.name().to_string(),
        });

        match job.fire(&self.registry).await {
            Ok(()) => {
                if job.auto_delete(&self.registry) && !job.is_deleted_or_released() {
                    job.delete().await?;
                }

                info!(job_id = %job_id, queue = %queue, "job processed");
                self.emit(WorkerEvent::Processed {
                    connection,
                    queue,
                    job_id,
                    name: job.name().to_string(),
                });
                Ok(())
            }
            Err(error) => {
                let error = Arc::new(error);
                warn!(job_id = %job_id, queue = %queue, attempts = job.attempts(), error = %error, "job raised an error");
                self.emit(WorkerEvent::ExceptionOccurred {
                    connection,
                    queue,
                    job_id: job_id.clone(),
                    error: error.to_string(),
                });

                match self.policy.after_error(&job, options) {
                    FailureAction::Fail => self.fail_job(&mut job, error.clone()).await?,
                    FailureAction::Release => {
                        if !job.is_deleted_or_released() {
                            job.release(options.delay).await?;
                        }
                    }
                }

                Err(QueueError::job_failed(job_id, error))
            }
        }
    }

    async fn fail_job(&self, job: &mut JobHandle, error: Arc<anyhow::Error>) -> QueueResult<()> {
        error!(job_id = %job.id(), attempts = job.attempts(), error = %error, "job failed permanently");
        job.fail(error.clone(), &self.registry).await?;
        self.emit(WorkerEvent::Failed {
            connection: self.queue.connection_name().to_string(),
            queue: job.queue().to_string(),
            job_id: job.id().to_string(),
            error: error.to_string(),
        });
        Ok(())
    }

    /// Run cycles until shutdown is requested or a limit is hit
    #[instrument(skip(self, options, shutdown), fields(connection = %self.queue.connection_name(), queues = ?queues))]
    pub async fn daemon(
        &self,
        queues: &[String],
        options: &WorkerOptions,
        mut shutdown: oneshot::Receiver<()>,
    ) -> QueueResult<StopReason> {
        let queue_refs: Vec<&str> = queues.iter().map(String::as_str).collect();
        let started = tokio::time::Instant::now();

        info!("Worker started");

        let reason = loop {
            if shutdown_requested(&mut shutdown) {
                break StopReason::Shutdown;
            }

            match self.get_next_job(&queue_refs).await {
                Ok(Some(job)) => {
                    if let Err(e) = self.process(job, options).await {
                        debug!(error = %e, "cycle ended with an error");
                    }
                }
                Ok(None) => {
                    if options.stop_when_empty {
                        break StopReason::QueueEmpty;
                    }
                    tokio::select! {
                        _ = &mut shutdown => break StopReason::Shutdown,
                        _ = self.sleep(options.sleep) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Error fetching next job");
                    tokio::select! {
                        _ = &mut shutdown => break StopReason::Shutdown,
                        _ = self.sleep(Duration::from_secs(1)) => {}
                    }
                }
            }

            if self.memory_exceeded(options.memory_mb) {
                break StopReason::MemoryExceeded;
            }

            if let Some(max_time) = options.max_time {
                if started.elapsed() >= max_time {
                    break StopReason::MaxTimeReached;
                }
            }
        };

        info!(reason = ?reason, "Worker stopping");
        self.emit(WorkerEvent::Stopping { reason });
        Ok(reason)
    }

    /// Run [`Worker::daemon`] on a background task
    pub fn spawn(self: Arc<Self>, queues: Vec<String>, options: WorkerOptions) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let join_handle = tokio::spawn(async move { self.daemon(&queues, &options, shutdown_rx).await });

        WorkerHandle {
            shutdown_tx,
            join_handle,
        }
    }

    pub fn memory_exceeded(&self, limit_mb: u64) -> bool {
        (self.memory_probe)() / 1024 / 1024 >= limit_mb
    }

    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

fn shutdown_requested(shutdown: &mut oneshot::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(oneshot::error::TryRecvError::Empty))
}

/// Resident set size from `VmRSS` in procfs; zero where unavailable
fn resident_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_vm_rss(&status))
        .unwrap_or(0)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}
