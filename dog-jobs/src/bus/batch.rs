//! Batches: cohorts of queued commands with aggregate callbacks.
//!
//! A [`Batch`] is a snapshot. Every counter change goes through the
//! [`BatchRepository`], which serializes concurrent updates, and callbacks are
//! always handed a freshly read snapshot.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    bus::{dispatcher::QueueResolver, BatchRepository, Command},
    payload::QueuedCommand,
    queue::Queue,
    time::{Clock, SystemClock},
    types::BatchId,
    QueueError, QueueResult,
};

/// Batch options as persisted; callbacks are referenced by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOptions {
    #[serde(default)]
    pub then: Vec<String>,
    #[serde(default)]
    pub catch: Vec<String>,
    #[serde(default)]
    pub finally: Vec<String>,
    #[serde(default)]
    pub allow_failures: bool,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub connection: Option<String>,
}

/// Persisted state of one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub id: String,
    pub name: String,
    pub total_jobs: u64,
    pub pending_jobs: u64,
    pub failed_jobs: u64,
    pub failed_job_ids: Vec<String>,
    pub options: BatchOptions,
    pub created_at: i64,
    pub cancelled_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl BatchRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, options: BatchOptions, created_at: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            total_jobs: 0,
            pending_jobs: 0,
            failed_jobs: 0,
            failed_job_ids: Vec::new(),
            options,
            created_at,
            cancelled_at: None,
            finished_at: None,
        }
    }
}

/// Counters returned by an atomic batch update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatedBatchJobCounts {
    pub pending_jobs: u64,
    pub failed_jobs: u64,
}

impl UpdatedBatchJobCounts {
    /// Every job reported exactly one terminal outcome
    pub fn all_jobs_have_ran_exactly_once(&self) -> bool {
        self.pending_jobs == self.failed_jobs
    }
}

/// Future returned by a batch callback
pub type BatchCallbackFuture = BoxFuture<'static, anyhow::Result<()>>;

type CallbackFn = Arc<dyn Fn(Batch, Option<Arc<anyhow::Error>>) -> BatchCallbackFuture + Send + Sync>;

/// Process-local table of named batch callbacks
#[derive(Default)]
pub struct BatchCallbacks {
    callbacks: RwLock<HashMap<String, CallbackFn>>,
}

impl BatchCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback; `then` callbacks receive no error
    pub fn register<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn(Batch, Option<Arc<anyhow::Error>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: CallbackFn = Arc::new(
            move |batch: Batch, error: Option<Arc<anyhow::Error>>| -> BatchCallbackFuture {
                Box::pin(callback(batch, error))
            },
        );
        self.callbacks.write().insert(name.into(), callback);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.callbacks.read().contains_key(name)
    }

    async fn invoke(&self, name: &str, batch: Batch, error: Option<Arc<anyhow::Error>>) -> anyhow::Result<()> {
        let callback = self
            .callbacks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnresolvedHandler(name.to_string()))?;
        callback(batch, error).await
    }
}

/// Shared collaborators of every batch handed out by a dispatcher
#[derive(Clone)]
pub struct Batches {
    repository: Arc<dyn BatchRepository>,
    callbacks: Arc<BatchCallbacks>,
    queue_resolver: Option<Arc<dyn QueueResolver>>,
    clock: Arc<dyn Clock>,
}

impl Batches {
    pub fn new(
        repository: Arc<dyn BatchRepository>,
        callbacks: Arc<BatchCallbacks>,
        queue_resolver: Option<Arc<dyn QueueResolver>>,
    ) -> Self {
        Self {
            repository,
            callbacks,
            queue_resolver,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn with_queue_resolver(&self, queue_resolver: Arc<dyn QueueResolver>) -> Self {
        Self {
            queue_resolver: Some(queue_resolver),
            ..self.clone()
        }
    }

    pub fn repository(&self) -> &Arc<dyn BatchRepository> {
        &self.repository
    }

    pub async fn find(self: &Arc<Self>, batch_id: &str) -> QueueResult<Option<Batch>> {
        Ok(self.repository.find(batch_id).await?.map(|record| self.make(record)))
    }

    fn make(self: &Arc<Self>, record: BatchRecord) -> Batch {
        Batch {
            record,
            batches: self.clone(),
        }
    }

    async fn queue(&self, connection: Option<&str>) -> QueueResult<Queue> {
        let resolver = self.queue_resolver.as_ref().ok_or_else(|| {
            QueueError::RuntimeConfiguration("Batching requires a queue resolver.".to_string())
        })?;

        resolver.resolve(connection).await?.ok_or_else(|| {
            QueueError::RuntimeConfiguration("Queue resolver did not return a Queue implementation.".to_string())
        })
    }
}

/// Snapshot of a batch plus the operations that mutate it
#[derive(Clone)]
pub struct Batch {
    record: BatchRecord,
    batches: Arc<Batches>,
}

impl Batch {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn total_jobs(&self) -> u64 {
        self.record.total_jobs
    }

    pub fn pending_jobs(&self) -> u64 {
        self.record.pending_jobs
    }

    pub fn failed_jobs(&self) -> u64 {
        self.record.failed_jobs
    }

    pub fn failed_job_ids(&self) -> &[String] {
        &self.record.failed_job_ids
    }

    pub fn options(&self) -> &BatchOptions {
        &self.record.options
    }

    pub fn created_at(&self) -> i64 {
        self.record.created_at
    }

    pub fn cancelled_at(&self) -> Option<i64> {
        self.record.cancelled_at
    }

    pub fn finished_at(&self) -> Option<i64> {
        self.record.finished_at
    }

    pub fn record(&self) -> &BatchRecord {
        &self.record
    }

    /// Jobs that completed successfully
    pub fn processed_jobs(&self) -> u64 {
        self.record.total_jobs.saturating_sub(self.record.pending_jobs)
    }

    /// Completion percentage, 0 to 100
    pub fn progress(&self) -> u32 {
        if self.record.total_jobs == 0 {
            return 0;
        }
        ((self.processed_jobs() as f64 / self.record.total_jobs as f64) * 100.0).round() as u32
    }

    pub fn finished(&self) -> bool {
        self.record.finished_at.is_some()
    }

    pub fn has_failures(&self) -> bool {
        self.record.failed_jobs > 0
    }

    pub fn allows_failures(&self) -> bool {
        self.record.options.allow_failures
    }

    pub fn cancelled(&self) -> bool {
        self.record.cancelled_at.is_some()
    }

    /// Re-read this batch from the repository
    pub async fn fresh(&self) -> QueueResult<Batch> {
        self.batches
            .find(self.id())
            .await?
            .ok_or_else(|| QueueError::BatchNotFound(self.id().to_string()))
    }

    /// Queue more commands as part of this batch.
    ///
    /// When a push fails, the jobs that were counted but never queued are
    /// taken back out of the counters before the error is returned.
    #[instrument(skip(self, commands), fields(batch_id = %self.id(), count = commands.len()))]
    pub async fn add(&self, commands: Vec<QueuedCommand>) -> QueueResult<Batch> {
        let queue = self.batches.queue(self.record.options.connection.as_deref()).await?;
        let repository = self.batches.repository.clone();
        let batch_id = self.id().to_string();
        let default_queue = self.record.options.queue.clone();
        let count = commands.len() as u64;
        let mut taken_back = None;

        let added = repository
            .transaction(
                &batch_id,
                Box::pin(async {
                    repository.increment_total_jobs(&batch_id, count).await?;

                    let mut pushed = 0;
                    for mut command in commands {
                        if command.queue.is_none() {
                            command.queue = default_queue.clone();
                        }
                        if let Err(e) = queue.push_queued(&command, Some(&batch_id)).await {
                            let counts = repository.decrement_total_jobs(&batch_id, count - pushed).await?;
                            taken_back = Some((pushed, counts));
                            return Err(e);
                        }
                        pushed += 1;
                    }
                    Ok(())
                }),
            )
            .await;

        if let Some((pushed, counts)) = taken_back {
            warn!(pushed, not_queued = count - pushed, "push failed, unqueued jobs taken back");
            // The jobs that did get queued may all have finished already.
            if pushed > 0 {
                self.settle(counts, None).await?;
            }
        }
        added?;

        debug!("added jobs to batch");
        self.fresh().await
    }

    /// Report one job as successfully completed; repeated reports are ignored
    #[instrument(skip(self), fields(batch_id = %self.id()))]
    pub async fn record_successful_job(&self, job_id: &str) -> QueueResult<()> {
        let Some(counts) = self.batches.repository.decrement_pending_jobs(self.id(), job_id).await? else {
            debug!(job_id, "success already recorded");
            return Ok(());
        };

        self.settle(counts, None).await
    }

    /// Run completion callbacks for the update that produced `counts`
    async fn settle(&self, counts: UpdatedBatchJobCounts, error: Option<Arc<anyhow::Error>>) -> QueueResult<()> {
        if counts.pending_jobs == 0 {
            self.batches
                .repository
                .mark_as_finished(self.id(), self.batches.clock.now())
                .await?;
        }

        if counts.pending_jobs == 0 && !self.record.options.then.is_empty() {
            let batch = self.fresh().await?;
            info!("batch finished, running then callbacks");
            self.run_callbacks(&self.record.options.then, batch, None).await;
        }

        if counts.all_jobs_have_ran_exactly_once() && !self.record.options.finally.is_empty() {
            let batch = self.fresh().await?;
            self.run_callbacks(&self.record.options.finally, batch, error).await;
        }

        Ok(())
    }

    /// Report one job as permanently failed; repeated reports are ignored
    #[instrument(skip(self, error), fields(batch_id = %self.id()))]
    pub async fn record_failed_job(&self, job_id: &str, error: Arc<anyhow::Error>) -> QueueResult<()> {
        let Some(counts) = self.batches.repository.increment_failed_jobs(self.id(), job_id).await? else {
            debug!(job_id, "failure already recorded");
            return Ok(());
        };

        if counts.failed_jobs == 1 && !self.allows_failures() {
            self.cancel().await?;
        }

        if counts.failed_jobs == 1 && !self.record.options.catch.is_empty() {
            let batch = self.fresh().await?;
            warn!(job_id, "first failure in batch, running catch callbacks");
            self.run_callbacks(&self.record.options.catch, batch, Some(error.clone())).await;
        }

        if counts.all_jobs_have_ran_exactly_once() && !self.record.options.finally.is_empty() {
            let batch = self.fresh().await?;
            self.run_callbacks(&self.record.options.finally, batch, Some(error)).await;
        }

        Ok(())
    }

    pub async fn cancel(&self) -> QueueResult<()> {
        self.batches.repository.cancel(self.id(), self.batches.clock.now()).await
    }

    pub async fn delete(&self) -> QueueResult<()> {
        self.batches.repository.delete(self.id()).await
    }

    async fn run_callbacks(&self, names: &[String], batch: Batch, error: Option<Arc<anyhow::Error>>) {
        for name in names {
            if let Err(e) = self.batches.callbacks.invoke(name, batch.clone(), error.clone()).await {
                error!(callback = %name, batch_id = %self.id(), error = %e, "batch callback failed");
            }
        }
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.record, f)
    }
}

impl Serialize for Batch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.record.serialize(serializer)
    }
}

/// Builder for a batch that has not been stored yet
pub struct PendingBatch {
    batches: Arc<Batches>,
    commands: Vec<QueuedCommand>,
    name: String,
    options: BatchOptions,
}

impl PendingBatch {
    pub fn new(batches: Arc<Batches>, commands: Vec<QueuedCommand>) -> Self {
        Self {
            batches,
            commands,
            name: String::new(),
            options: BatchOptions::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a typed command
    pub fn add<C: Command>(mut self, command: &C) -> QueueResult<Self> {
        self.commands.push(QueuedCommand::new(command)?);
        Ok(self)
    }

    /// Callback run once every job has succeeded
    pub fn then(mut self, callback: impl Into<String>) -> Self {
        self.options.then.push(callback.into());
        self
    }

    /// Callback run on the first failure
    pub fn catch(mut self, callback: impl Into<String>) -> Self {
        self.options.catch.push(callback.into());
        self
    }

    /// Callback run once every job has reported an outcome
    pub fn finally(mut self, callback: impl Into<String>) -> Self {
        self.options.finally.push(callback.into());
        self
    }

    pub fn allow_failures(mut self, allow: bool) -> Self {
        self.options.allow_failures = allow;
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.options.queue = Some(queue.into());
        self
    }

    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.options.connection = Some(connection.into());
        self
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Store the batch and queue its commands
    #[instrument(skip(self), fields(name = %self.name, count = self.commands.len()))]
    pub async fn dispatch(self) -> QueueResult<Batch> {
        let options = &self.options;
        for name in options.then.iter().chain(&options.catch).chain(&options.finally) {
            if !self.batches.callbacks.contains(name) {
                return Err(QueueError::UnresolvedHandler(name.clone()));
            }
        }

        let record = BatchRecord::new(
            BatchId::new().0,
            self.name,
            self.options,
            self.batches.clock.now(),
        );
        self.batches.repository.store(record.clone()).await?;
        let batch = self.batches.make(record);

        if self.commands.is_empty() {
            self.batches
                .repository
                .mark_as_finished(batch.id(), self.batches.clock.now())
                .await?;
            return batch.fresh().await;
        }

        match batch.add(self.commands).await {
            Ok(batch) => {
                info!(batch_id = %batch.id(), total = batch.total_jobs(), "dispatched batch");
                Ok(batch)
            }
            Err(e) => {
                if let Err(delete_error) = batch.delete().await {
                    warn!(batch_id = %batch.id(), error = %delete_error, "could not remove batch after failed dispatch");
                }
                Err(e)
            }
        }
    }
}
