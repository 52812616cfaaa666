use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    bus::batch::{BatchRecord, UpdatedBatchJobCounts},
    QueueError, QueueResult,
};

/// Unit of work run inside [`BatchRepository::transaction`]
pub type BatchWork<'a> = Pin<Box<dyn Future<Output = QueueResult<()>> + Send + 'a>>;

/// Storage for batch records.
///
/// Counter updates are atomic per batch; each returns the counters as they
/// were right after the update. Outcome reports are idempotent per job id: a
/// repeated report leaves the counters alone and returns `None`.
#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn find(&self, batch_id: &str) -> QueueResult<Option<BatchRecord>>;

    async fn store(&self, record: BatchRecord) -> QueueResult<()>;

    /// Add `amount` to both the total and pending counters; clears `finishedAt`
    async fn increment_total_jobs(&self, batch_id: &str, amount: u64) -> QueueResult<()>;

    /// Take back `amount` jobs that were counted but never queued
    async fn decrement_total_jobs(&self, batch_id: &str, amount: u64) -> QueueResult<UpdatedBatchJobCounts>;

    /// One job succeeded: decrement pending and forget any earlier failure of it
    async fn decrement_pending_jobs(&self, batch_id: &str, job_id: &str)
        -> QueueResult<Option<UpdatedBatchJobCounts>>;

    /// One job failed permanently
    async fn increment_failed_jobs(&self, batch_id: &str, job_id: &str)
        -> QueueResult<Option<UpdatedBatchJobCounts>>;

    /// Set `finishedAt` unless it is set already
    async fn mark_as_finished(&self, batch_id: &str, at: i64) -> QueueResult<()>;

    /// Set `cancelledAt` unless it is set already
    async fn cancel(&self, batch_id: &str, at: i64) -> QueueResult<()>;

    async fn delete(&self, batch_id: &str) -> QueueResult<()>;

    /// Run `work` with no other transaction on the same batch in progress
    async fn transaction<'a>(&'a self, batch_id: &'a str, work: BatchWork<'a>) -> QueueResult<()>;
}

struct StoredBatch {
    record: BatchRecord,
    succeeded: HashSet<String>,
}

/// In-process repository; one mutex serializes every update
#[derive(Default)]
pub struct MemoryBatchRepository {
    records: Mutex<HashMap<String, StoredBatch>>,
    transactions: tokio::sync::Mutex<()>,
}

impl MemoryBatchRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<T>(&self, batch_id: &str, apply: impl FnOnce(&mut StoredBatch) -> T) -> QueueResult<T> {
        let mut records = self.records.lock();
        let stored = records
            .get_mut(batch_id)
            .ok_or_else(|| QueueError::BatchNotFound(batch_id.to_string()))?;
        Ok(apply(stored))
    }
}

fn counts(record: &BatchRecord) -> UpdatedBatchJobCounts {
    UpdatedBatchJobCounts {
        pending_jobs: record.pending_jobs,
        failed_jobs: record.failed_jobs,
    }
}

#[async_trait]
impl BatchRepository for MemoryBatchRepository {
    async fn find(&self, batch_id: &str) -> QueueResult<Option<BatchRecord>> {
        Ok(self.records.lock().get(batch_id).map(|stored| stored.record.clone()))
    }

    async fn store(&self, record: BatchRecord) -> QueueResult<()> {
        let stored = StoredBatch {
            record,
            succeeded: HashSet::new(),
        };
        self.records.lock().insert(stored.record.id.clone(), stored);
        Ok(())
    }

    async fn increment_total_jobs(&self, batch_id: &str, amount: u64) -> QueueResult<()> {
        self.update(batch_id, |stored| {
            let record = &mut stored.record;
            record.total_jobs += amount;
            record.pending_jobs += amount;
            record.finished_at = None;
        })
    }

    async fn decrement_total_jobs(&self, batch_id: &str, amount: u64) -> QueueResult<UpdatedBatchJobCounts> {
        self.update(batch_id, |stored| {
            let record = &mut stored.record;
            record.total_jobs = record.total_jobs.saturating_sub(amount);
            record.pending_jobs = record.pending_jobs.saturating_sub(amount);
            counts(record)
        })
    }

    async fn decrement_pending_jobs(
        &self,
        batch_id: &str,
        job_id: &str,
    ) -> QueueResult<Option<UpdatedBatchJobCounts>> {
        self.update(batch_id, |stored| {
            if !stored.succeeded.insert(job_id.to_string()) {
                return None;
            }
            let record = &mut stored.record;
            record.pending_jobs = record.pending_jobs.saturating_sub(1);
            record.failed_job_ids.retain(|id| id != job_id);
            Some(counts(record))
        })
    }

    async fn increment_failed_jobs(
        &self,
        batch_id: &str,
        job_id: &str,
    ) -> QueueResult<Option<UpdatedBatchJobCounts>> {
        self.update(batch_id, |stored| {
            let record = &mut stored.record;
            if record.failed_job_ids.iter().any(|id| id == job_id) {
                return None;
            }
            record.failed_jobs += 1;
            record.failed_job_ids.push(job_id.to_string());
            Some(counts(record))
        })
    }

    async fn mark_as_finished(&self, batch_id: &str, at: i64) -> QueueResult<()> {
        self.update(batch_id, |stored| {
            stored.record.finished_at.get_or_insert(at);
        })
    }

    async fn cancel(&self, batch_id: &str, at: i64) -> QueueResult<()> {
        self.update(batch_id, |stored| {
            stored.record.cancelled_at.get_or_insert(at);
        })
    }

    async fn delete(&self, batch_id: &str) -> QueueResult<()> {
        self.records.lock().remove(batch_id);
        Ok(())
    }

    async fn transaction<'a>(&'a self, _batch_id: &'a str, work: BatchWork<'a>) -> QueueResult<()> {
        let _guard = self.transactions.lock().await;
        work.await
    }
}
