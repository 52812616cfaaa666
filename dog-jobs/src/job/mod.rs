pub mod registry;

pub use registry::{FnJobHandler, JobHandler, JobRegistry};

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::{
    backend::QueueStore,
    payload::{self, Payload},
    QueueResult,
};

/// A reserved job, as returned by `pop`.
///
/// The handle keeps the exact reserved payload string because that string is
/// the member the store has to remove. `delete` and `release` are terminal:
/// once either has run, further terminal calls are ignored.
pub struct JobHandle {
    store: Arc<dyn QueueStore>,
    queue: String,
    raw: String,
    payload: Payload,
    deleted: bool,
    released: bool,
    failed: bool,
}

impl JobHandle {
    /// Bind a reserved payload to its store and queue
    pub fn new(store: Arc<dyn QueueStore>, queue: impl Into<String>, raw: String) -> QueueResult<Self> {
        let payload = payload::decode(&raw)?;
        Ok(Self {
            store,
            queue: queue.into(),
            raw,
            payload,
            deleted: false,
            released: false,
            failed: false,
        })
    }

    /// Number of times this job has been reserved, this reservation included
    pub fn attempts(&self) -> u32 {
        self.payload.attempts
    }

    pub fn id(&self) -> &str {
        &self.payload.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The reserved payload exactly as stored
    pub fn raw_body(&self) -> &str {
        &self.raw
    }

    /// Command name for object payloads, the handler locator otherwise
    pub fn name(&self) -> &str {
        self.payload.display_name()
    }

    pub fn max_tries(&self) -> Option<u32> {
        self.payload.max_tries
    }

    pub fn timeout(&self) -> Option<u64> {
        self.payload.timeout
    }

    /// Resolve the handler for this job's locator and run it
    pub async fn fire(&mut self, registry: &JobRegistry) -> anyhow::Result<()> {
        let handler = registry.handler(&self.payload.job)?;
        let data = self.payload.data.clone();

        debug!(job_id = %self.id(), job = %self.payload.job, attempts = self.attempts(), "firing job");
        handler.fire(self, data).await
    }

    /// Remove the job from the store
    pub async fn delete(&mut self) -> QueueResult<()> {
        if self.is_deleted_or_released() {
            warn!(job_id = %self.id(), "job already deleted or released, ignoring delete");
            return Ok(());
        }

        self.store.delete_reserved(&self.queue, &self.raw).await?;
        self.deleted = true;
        Ok(())
    }

    /// Put the job back onto the queue after `delay` seconds.
    ///
    /// The current attempt count is persisted; the next reservation bumps it,
    /// so the next handle observes `attempts() + 1`.
    pub async fn release(&mut self, delay: i64) -> QueueResult<()> {
        if self.is_deleted_or_released() {
            warn!(job_id = %self.id(), "job already deleted or released, ignoring release");
            return Ok(());
        }

        self.store
            .release(&self.queue, &self.raw, delay, self.attempts())
            .await?;
        self.released = true;
        Ok(())
    }

    /// Permanently fail the job: delete it and run the handler's `failed` hook
    pub async fn fail(&mut self, error: Arc<anyhow::Error>, registry: &JobRegistry) -> QueueResult<()> {
        self.failed = true;

        if self.deleted {
            return Ok(());
        }

        if !self.released {
            self.delete().await?;
        }

        match registry.handler(&self.payload.job) {
            Ok(handler) => {
                if let Err(hook_error) = handler.failed(&self.payload, error).await {
                    error!(job_id = %self.id(), error = %hook_error, "failed hook returned an error");
                }
            }
            Err(e) => debug!(job_id = %self.id(), error = %e, "no failed hook to run"),
        }

        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn is_deleted_or_released(&self) -> bool {
        self.deleted || self.released
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Whether the worker should delete this job after a successful run
    pub fn auto_delete(&self, registry: &JobRegistry) -> bool {
        registry
            .handler(&self.payload.job)
            .map(|handler| handler.auto_delete())
            .unwrap_or(true)
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("queue", &self.queue)
            .field("id", &self.payload.id)
            .field("job", &self.payload.job)
            .field("attempts", &self.payload.attempts)
            .field("deleted", &self.deleted)
            .field("released", &self.released)
            .finish()
    }
}
