use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use tracing::warn;
use uuid::Uuid;

use crate::{
    bus::{BatchOptions, BatchRecord, BatchRepository, BatchWork, UpdatedBatchJobCounts},
    QueueError, QueueResult,
};

const DECREMENT_PENDING_LUA: &str = include_str!("lua/batch_decrement_pending.lua");
const DECREMENT_TOTAL_LUA: &str = include_str!("lua/batch_decrement_total.lua");
const INCREMENT_FAILED_LUA: &str = include_str!("lua/batch_increment_failed.lua");
const INCREMENT_TOTAL_LUA: &str = include_str!("lua/batch_increment_total.lua");
const SET_ONCE_LUA: &str = include_str!("lua/batch_set_once.lua");
const RELEASE_IF_OWNER_LUA: &str = include_str!("lua/release_if_owner.lua");

/// Key prefix of batch hashes
pub const BATCH_KEY_PREFIX: &str = "batches:";

const LOCK_SECONDS: u64 = 10;
const LOCK_RETRY: Duration = Duration::from_millis(50);

struct BatchKeys {
    record: String,
    failed: String,
    succeeded: String,
    lock: String,
}

impl BatchKeys {
    fn for_batch(batch_id: &str) -> Self {
        let record = format!("{BATCH_KEY_PREFIX}{batch_id}");
        Self {
            failed: format!("{record}:failed"),
            succeeded: format!("{record}:succeeded"),
            lock: format!("{record}:lock"),
            record,
        }
    }
}

/// Batches as a hash per batch plus sets of failed and succeeded job ids
#[derive(Clone)]
pub struct RedisBatchRepository {
    conn: ConnectionManager,
    decrement_pending_script: Script,
    decrement_total_script: Script,
    increment_failed_script: Script,
    increment_total_script: Script,
    set_once_script: Script,
    release_lock_script: Script,
}

impl RedisBatchRepository {
    pub async fn connect(url: &str) -> QueueResult<Self> {
        Ok(Self::with_connection(super::connect(url).await?))
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            decrement_pending_script: Script::new(DECREMENT_PENDING_LUA),
            decrement_total_script: Script::new(DECREMENT_TOTAL_LUA),
            increment_failed_script: Script::new(INCREMENT_FAILED_LUA),
            increment_total_script: Script::new(INCREMENT_TOTAL_LUA),
            set_once_script: Script::new(SET_ONCE_LUA),
            release_lock_script: Script::new(RELEASE_IF_OWNER_LUA),
        }
    }

    async fn set_once(&self, batch_id: &str, field: &str, at: i64) -> QueueResult<()> {
        let keys = BatchKeys::for_batch(batch_id);
        let mut conn = self.conn.clone();

        let set: i64 = self
            .set_once_script
            .key(&keys.record)
            .arg(field)
            .arg(at)
            .invoke_async(&mut conn)
            .await?;

        if set < 0 {
            return Err(QueueError::BatchNotFound(batch_id.to_string()));
        }
        Ok(())
    }

    async fn report_outcome(
        &self,
        script: &Script,
        batch_id: &str,
        job_id: &str,
    ) -> QueueResult<Option<UpdatedBatchJobCounts>> {
        let keys = BatchKeys::for_batch(batch_id);
        let mut conn = self.conn.clone();

        let counts: Option<(i64, i64, i64)> = script
            .key(&keys.record)
            .key(&keys.failed)
            .key(&keys.succeeded)
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;

        let (pending, failed, applied) =
            counts.ok_or_else(|| QueueError::BatchNotFound(batch_id.to_string()))?;
        Ok((applied == 1).then(|| job_counts(pending, failed)))
    }
}

fn job_counts(pending: i64, failed: i64) -> UpdatedBatchJobCounts {
    UpdatedBatchJobCounts {
        pending_jobs: pending.max(0) as u64,
        failed_jobs: failed.max(0) as u64,
    }
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> QueueResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| QueueError::Internal(format!("batch record is missing [{name}]")))
}

fn number<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> QueueResult<T> {
    field(fields, name)?
        .parse()
        .map_err(|_| QueueError::Internal(format!("batch record field [{name}] is not a number")))
}

fn optional_number(fields: &HashMap<String, String>, name: &str) -> QueueResult<Option<i64>> {
    match fields.get(name) {
        Some(_) => number(fields, name).map(Some),
        None => Ok(None),
    }
}

fn record_from(fields: HashMap<String, String>, mut failed_job_ids: Vec<String>) -> QueueResult<BatchRecord> {
    let options: BatchOptions = serde_json::from_str(field(&fields, "options")?)?;
    failed_job_ids.sort();

    Ok(BatchRecord {
        id: field(&fields, "id")?.to_string(),
        name: fields.get("name").cloned().unwrap_or_default(),
        total_jobs: number(&fields, "total_jobs")?,
        pending_jobs: number(&fields, "pending_jobs")?,
        failed_jobs: number(&fields, "failed_jobs")?,
        failed_job_ids,
        options,
        created_at: number(&fields, "created_at")?,
        cancelled_at: optional_number(&fields, "cancelled_at")?,
        finished_at: optional_number(&fields, "finished_at")?,
    })
}

#[async_trait]
impl BatchRepository for RedisBatchRepository {
    async fn find(&self, batch_id: &str) -> QueueResult<Option<BatchRecord>> {
        let keys = BatchKeys::for_batch(batch_id);
        let mut conn = self.conn.clone();

        let (fields, failed): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .hgetall(&keys.record)
            .smembers(&keys.failed)
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        record_from(fields, failed).map(Some)
    }

    async fn store(&self, record: BatchRecord) -> QueueResult<()> {
        let keys = BatchKeys::for_batch(&record.id);
        let mut fields = vec![
            ("id", record.id.clone()),
            ("name", record.name.clone()),
            ("total_jobs", record.total_jobs.to_string()),
            ("pending_jobs", record.pending_jobs.to_string()),
            ("failed_jobs", record.failed_jobs.to_string()),
            ("options", serde_json::to_string(&record.options)?),
            ("created_at", record.created_at.to_string()),
        ];
        if let Some(at) = record.cancelled_at {
            fields.push(("cancelled_at", at.to_string()));
        }
        if let Some(at) = record.finished_at {
            fields.push(("finished_at", at.to_string()));
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&keys.record)
            .del(&keys.failed)
            .del(&keys.succeeded)
            .hset_multiple(&keys.record, &fields);
        if !record.failed_job_ids.is_empty() {
            pipe.sadd(&keys.failed, &record.failed_job_ids);
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn increment_total_jobs(&self, batch_id: &str, amount: u64) -> QueueResult<()> {
        let keys = BatchKeys::for_batch(batch_id);
        let mut conn = self.conn.clone();

        let found: i64 = self
            .increment_total_script
            .key(&keys.record)
            .arg(amount)
            .invoke_async(&mut conn)
            .await?;

        if found == 0 {
            return Err(QueueError::BatchNotFound(batch_id.to_string()));
        }
        Ok(())
    }

    async fn decrement_total_jobs(&self, batch_id: &str, amount: u64) -> QueueResult<UpdatedBatchJobCounts> {
        let keys = BatchKeys::for_batch(batch_id);
        let mut conn = self.conn.clone();

        let counts: Option<(i64, i64)> = self
            .decrement_total_script
            .key(&keys.record)
            .arg(amount)
            .invoke_async(&mut conn)
            .await?;

        let (pending, failed) = counts.ok_or_else(|| QueueError::BatchNotFound(batch_id.to_string()))?;
        Ok(job_counts(pending, failed))
    }

    async fn decrement_pending_jobs(
        &self,
        batch_id: &str,
        job_id: &str,
    ) -> QueueResult<Option<UpdatedBatchJobCounts>> {
        self.report_outcome(&self.decrement_pending_script, batch_id, job_id).await
    }

    async fn increment_failed_jobs(
        &self,
        batch_id: &str,
        job_id: &str,
    ) -> QueueResult<Option<UpdatedBatchJobCounts>> {
        self.report_outcome(&self.increment_failed_script, batch_id, job_id).await
    }

    async fn mark_as_finished(&self, batch_id: &str, at: i64) -> QueueResult<()> {
        self.set_once(batch_id, "finished_at", at).await
    }

    async fn cancel(&self, batch_id: &str, at: i64) -> QueueResult<()> {
        self.set_once(batch_id, "cancelled_at", at).await
    }

    async fn delete(&self, batch_id: &str) -> QueueResult<()> {
        let keys = BatchKeys::for_batch(batch_id);
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(vec![keys.record, keys.failed, keys.succeeded]).await?;
        Ok(())
    }

    async fn transaction<'a>(&'a self, batch_id: &'a str, work: BatchWork<'a>) -> QueueResult<()> {
        let keys = BatchKeys::for_batch(batch_id);
        let owner = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let started = tokio::time::Instant::now();

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&keys.lock)
                .arg(&owner)
                .arg("NX")
                .arg("EX")
                .arg(LOCK_SECONDS)
                .query_async(&mut conn)
                .await?;

            if acquired.is_some() {
                break;
            }

            if started.elapsed() >= Duration::from_secs(LOCK_SECONDS) {
                return Err(QueueError::Internal(format!(
                    "timed out waiting for the lock of batch {batch_id}"
                )));
            }

            tokio::time::sleep(LOCK_RETRY).await;
        }

        let result = work.await;

        let released: QueueResult<i64> = self
            .release_lock_script
            .key(&keys.lock)
            .arg(&owner)
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::from);
        if let Err(e) = released {
            warn!(batch_id, error = %e, "could not release batch lock");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_hash() {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), "b1".to_string());
        fields.insert("name".to_string(), "import".to_string());
        fields.insert("total_jobs".to_string(), "3".to_string());
        fields.insert("pending_jobs".to_string(), "1".to_string());
        fields.insert("failed_jobs".to_string(), "1".to_string());
        fields.insert("options".to_string(), r#"{"allowFailures":true}"#.to_string());
        fields.insert("created_at".to_string(), "100".to_string());
        fields.insert("finished_at".to_string(), "150".to_string());

        let record = record_from(fields, vec!["j2".into(), "j1".into()]).unwrap();

        assert_eq!(record.total_jobs, 3);
        assert!(record.options.allow_failures);
        assert_eq!(record.failed_job_ids, vec!["j1", "j2"]);
        assert_eq!(record.cancelled_at, None);
        assert_eq!(record.finished_at, Some(150));
    }

    #[test]
    fn test_batch_keys() {
        let keys = BatchKeys::for_batch("b1");
        assert_eq!(keys.record, "batches:b1");
        assert_eq!(keys.failed, "batches:b1:failed");
        assert_eq!(keys.succeeded, "batches:b1:succeeded");
        assert_eq!(keys.lock, "batches:b1:lock");
    }
}
