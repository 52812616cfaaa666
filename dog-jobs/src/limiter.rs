//! Distributed counting semaphore.
//!
//! A limiter named `name` with `N` slots owns the keys `name1..nameN`. A slot
//! is claimed by writing an owner token with a lease; it is freed explicitly
//! when the guarded work succeeds, or by lease expiry otherwise.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, Rng};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::{
    job::{JobHandle, JobHandler},
    payload::Payload,
    time::{Clock, SystemClock},
    QueueError, QueueResult,
};

const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Backing store for limiter slots
#[async_trait]
pub trait LimiterStore: Send + Sync {
    /// Atomically claim the first free slot, returning its key
    async fn acquire(&self, name: &str, max_locks: u32, lease_seconds: u64, owner: &str) -> QueueResult<Option<String>>;

    /// Free a slot if `owner` still holds it
    async fn release(&self, slot: &str, owner: &str) -> QueueResult<()>;
}

/// Slot keys of a limiter
pub fn slot_keys(name: &str, max_locks: u32) -> Vec<String> {
    (1..=max_locks).map(|i| format!("{name}{i}")).collect()
}

/// In-process slots with clock-driven lease expiry
pub struct MemoryLimiterStore {
    slots: Mutex<HashMap<String, (String, i64)>>,
    clock: Arc<dyn Clock>,
}

impl MemoryLimiterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryLimiterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LimiterStore for MemoryLimiterStore {
    async fn acquire(&self, name: &str, max_locks: u32, lease_seconds: u64, owner: &str) -> QueueResult<Option<String>> {
        let now = self.clock.now();
        let mut slots = self.slots.lock();

        for key in slot_keys(name, max_locks) {
            let free = match slots.get(&key) {
                Some((_, expires_at)) => *expires_at <= now,
                None => true,
            };

            if free {
                let expires_at = now.saturating_add(lease_seconds as i64);
                slots.insert(key.clone(), (owner.to_string(), expires_at));
                return Ok(Some(key));
            }
        }

        Ok(None)
    }

    async fn release(&self, slot: &str, owner: &str) -> QueueResult<()> {
        let mut slots = self.slots.lock();
        if matches!(slots.get(slot), Some((holder, _)) if holder == owner) {
            slots.remove(slot);
        }
        Ok(())
    }
}

/// Bounds how many callers run a named section at once
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    store: Arc<dyn LimiterStore>,
    name: String,
    max_locks: u32,
    lease_seconds: u64,
}

impl ConcurrencyLimiter {
    pub fn new(store: Arc<dyn LimiterStore>, name: impl Into<String>, max_locks: u32, lease_seconds: u64) -> Self {
        Self {
            store,
            name: name.into(),
            max_locks,
            lease_seconds: lease_seconds.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `work` once a slot is free, waiting at most `max_wait`.
    ///
    /// The slot is released only when `work` returns `Ok`; after an error it
    /// stays held until its lease runs out. Errors from `work` pass through
    /// unchanged.
    #[instrument(skip(self, work), fields(limiter = %self.name))]
    pub async fn block<F, Fut, T, E>(&self, max_wait: Duration, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<QueueError>,
    {
        let owner = random_owner();
        let started = tokio::time::Instant::now();

        let slot = loop {
            if let Some(slot) = self.acquire(&owner).await? {
                break slot;
            }

            if started.elapsed() >= max_wait {
                debug!(waited = ?started.elapsed(), "no slot available");
                return Err(QueueError::LimiterTimeout {
                    name: self.name.clone(),
                    waited: started.elapsed(),
                }
                .into());
            }

            tokio::time::sleep(RETRY_INTERVAL).await;
        };

        let value = work().await?;

        if let Err(e) = self.store.release(&slot, &owner).await {
            warn!(slot = %slot, error = %e, "could not release slot, lease will expire");
        }

        Ok(value)
    }

    async fn acquire(&self, owner: &str) -> QueueResult<Option<String>> {
        self.store
            .acquire(&self.name, self.max_locks, self.lease_seconds, owner)
            .await
    }
}

fn random_owner() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

/// Runs a job handler only while holding a limiter slot.
///
/// When no slot is free the job is released back onto its queue.
pub struct FunneledHandler {
    inner: Arc<dyn JobHandler>,
    limiter: ConcurrencyLimiter,
    release_after: i64,
}

impl FunneledHandler {
    pub fn new(inner: Arc<dyn JobHandler>, limiter: ConcurrencyLimiter, release_after: i64) -> Self {
        Self {
            inner,
            limiter,
            release_after,
        }
    }
}

#[async_trait]
impl JobHandler for FunneledHandler {
    async fn fire(&self, job: &mut JobHandle, data: Value) -> anyhow::Result<()> {
        let inner = self.inner.clone();
        let held = &mut *job;
        let outcome = self
            .limiter
            .block(Duration::ZERO, move || async move {
                Ok::<_, QueueError>(inner.fire(held, data).await)
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(QueueError::LimiterTimeout { .. }) => {
                debug!(job_id = %job.id(), limiter = %self.limiter.name(), "limiter busy, releasing job");
                job.release(self.release_after).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn failed(&self, payload: &Payload, error: Arc<anyhow::Error>) -> anyhow::Result<()> {
        self.inner.failed(payload, error).await
    }

    fn auto_delete(&self) -> bool {
        self.inner.auto_delete()
    }
}
