//! Producer / consumer facade over a [`QueueStore`].

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::{
    backend::QueueStore,
    bus::Command,
    job::JobHandle,
    payload::{PayloadCodec, QueuedCommand},
    time::{self, Delay},
    QueueResult,
};

/// One queue connection: a store plus the codec that builds its payloads
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn QueueStore>,
    codec: PayloadCodec,
    connection: String,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl Queue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            codec: PayloadCodec::default(),
            connection: "default".to_string(),
        }
    }

    pub fn with_codec(mut self, codec: PayloadCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection = name.into();
        self
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    pub fn connection_name(&self) -> &str {
        &self.connection
    }

    pub fn default_queue(&self) -> &str {
        self.store.default_queue()
    }

    fn resolve<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        queue.unwrap_or_else(|| self.store.default_queue())
    }

    /// Push a command onto its own queue (or the default one), returning the payload id
    pub async fn push<C: Command>(&self, command: &C) -> QueueResult<String> {
        self.push_on(command.queue(), command).await
    }

    #[instrument(skip(self, command), fields(command = C::NAME, connection = %self.connection))]
    pub async fn push_on<C: Command>(&self, queue: Option<&str>, command: &C) -> QueueResult<String> {
        let encoded = self.codec.encode_command(command, None)?;
        let queue = self.resolve(queue);

        self.store.push_raw(queue, &encoded.raw).await?;
        info!(queue, job_id = %encoded.id, "pushed job");
        Ok(encoded.id)
    }

    /// Push a plain `locator + data` job
    #[instrument(skip(self, data), fields(connection = %self.connection))]
    pub async fn push_plain(&self, locator: &str, data: Value, queue: Option<&str>) -> QueueResult<String> {
        let encoded = self.codec.encode_plain(locator, data)?;
        let queue = self.resolve(queue);

        self.store.push_raw(queue, &encoded.raw).await?;
        info!(queue, job_id = %encoded.id, "pushed job");
        Ok(encoded.id)
    }

    /// Push an already-encoded payload untouched
    pub async fn push_raw(&self, payload: &str, queue: Option<&str>) -> QueueResult<()> {
        self.store.push_raw(self.resolve(queue), payload).await
    }

    /// Push a pre-serialized command, optionally tagged with a batch id
    pub async fn push_queued(&self, queued: &QueuedCommand, batch_id: Option<&str>) -> QueueResult<String> {
        let encoded = self.codec.encode_queued(queued, batch_id)?;
        let queue = self.resolve(queued.queue.as_deref());

        self.store.push_raw(queue, &encoded.raw).await?;
        debug!(queue, job_id = %encoded.id, command = %queued.name, "pushed queued command");
        Ok(encoded.id)
    }

    /// Push a command to become available after `delay`
    pub async fn later<C: Command>(&self, delay: impl Into<Delay>, command: &C) -> QueueResult<String> {
        self.later_on(command.queue(), delay, command).await
    }

    #[instrument(skip(self, delay, command), fields(command = C::NAME, connection = %self.connection))]
    pub async fn later_on<C: Command>(
        &self,
        queue: Option<&str>,
        delay: impl Into<Delay>,
        command: &C,
    ) -> QueueResult<String> {
        let encoded = self.codec.encode_command(command, None)?;
        let queue = self.resolve(queue);
        let available_at = time::available_at(self.store.clock(), delay.into());

        self.store.later_raw(queue, available_at, &encoded.raw).await?;
        info!(queue, job_id = %encoded.id, available_at, "scheduled job");
        Ok(encoded.id)
    }

    pub async fn later_plain(
        &self,
        delay: impl Into<Delay>,
        locator: &str,
        data: Value,
        queue: Option<&str>,
    ) -> QueueResult<String> {
        let encoded = self.codec.encode_plain(locator, data)?;
        let queue = self.resolve(queue);
        let available_at = time::available_at(self.store.clock(), delay.into());

        self.store.later_raw(queue, available_at, &encoded.raw).await?;
        info!(queue, job_id = %encoded.id, available_at, "scheduled job");
        Ok(encoded.id)
    }

    /// Push several commands onto the same queue
    pub async fn bulk<C: Command>(&self, commands: &[C], queue: Option<&str>) -> QueueResult<Vec<String>> {
        let mut ids = Vec::with_capacity(commands.len());
        for command in commands {
            ids.push(self.push_on(queue.or(command.queue()), command).await?);
        }
        Ok(ids)
    }

    /// Reserve the next job of a queue
    #[instrument(skip(self), fields(connection = %self.connection, driver = self.store.driver()))]
    pub async fn pop(&self, queue: Option<&str>) -> QueueResult<Option<JobHandle>> {
        let queue = self.resolve(queue);

        match self.store.pop(queue).await? {
            Some(reserved) => {
                let job = JobHandle::new(self.store.clone(), queue, reserved)?;
                debug!(queue, job_id = %job.id(), attempts = job.attempts(), "reserved job");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    pub async fn size(&self, queue: Option<&str>) -> QueueResult<usize> {
        self.store.size(self.resolve(queue)).await
    }

    pub async fn clear(&self, queue: Option<&str>) -> QueueResult<usize> {
        let queue = self.resolve(queue);
        let removed = self.store.clear(queue).await?;
        info!(queue, removed, "cleared queue");
        Ok(removed)
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::{backend::memory::MemoryStore, time::ManualClock};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Command for Ping {
        const NAME: &'static str = "ping";

        fn queue(&self) -> Option<&str> {
            Some("pings")
        }
    }

    fn queue_at(now: i64) -> (Queue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new().with_clock(Arc::new(ManualClock::new(now))));
        (Queue::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_push_uses_command_queue() {
        let (queue, store) = queue_at(100);

        let id = queue.push(&Ping { n: 1 }).await.unwrap();

        let snapshot = store.snapshot("pings");
        assert_eq!(snapshot.ready.len(), 1);
        assert!(snapshot.ready[0].contains(&id));
        assert_eq!(queue.size(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_later_scores_by_clock() {
        let (queue, store) = queue_at(100);

        queue.later_plain(30, "x@y", json!({}), None).await.unwrap();

        assert_eq!(store.snapshot("default").delayed[0].0, 130);
    }

    #[tokio::test]
    async fn test_pop_binds_handle_to_queue() {
        let (queue, _store) = queue_at(100);
        let id = queue.push_plain("x@y", json!({"a": 1}), Some("low")).await.unwrap();

        let job = queue.pop(Some("low")).await.unwrap().unwrap();
        assert_eq!(job.id(), id);
        assert_eq!(job.queue(), "low");
        assert_eq!(job.attempts(), 1);
        assert_eq!(job.payload().data["a"], 1);
    }
}
