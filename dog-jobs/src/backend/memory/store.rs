use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{
    backend::QueueStore,
    payload::{attempts_of, rewrite_attempts},
    time::{Clock, SystemClock},
    QueueError, QueueResult,
};

/// Sorted set kept as `(score, member)` pairs in ascending score order.
/// Members with equal scores stay in insertion order.
#[derive(Debug, Default, Clone)]
pub(crate) struct ScoredSet {
    entries: Vec<(i64, String)>,
}

impl ScoredSet {
    fn add(&mut self, score: i64, member: String) {
        self.remove(&member);
        let at = self.entries.partition_point(|(existing, _)| *existing <= score);
        self.entries.insert(at, (score, member));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.entries.iter().position(|(_, m)| m == member) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove and return every member with `score <= until`, lowest first
    fn take_due(&mut self, until: i64) -> Vec<String> {
        let due = self.entries.partition_point(|(score, _)| *score <= until);
        self.entries.drain(..due).map(|(_, member)| member).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<String>,
    delayed: ScoredSet,
    reserved: ScoredSet,
}

/// Point-in-time copy of one queue, for inspection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub ready: Vec<String>,
    pub delayed: Vec<(i64, String)>,
    pub reserved: Vec<(i64, String)>,
}

/// In-process queue store with the same semantics as the Redis store.
///
/// A single mutex makes every operation atomic; time comes from the injected
/// clock so tests can move it at will.
pub struct MemoryStore {
    queues: Mutex<HashMap<String, QueueState>>,
    clock: Arc<dyn Clock>,
    default_queue: String,
    retry_after: Option<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            default_queue: "default".to_string(),
            retry_after: Some(60),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    /// Reservation expiry in seconds; `None` disables automatic recovery
    pub fn with_retry_after(mut self, retry_after: Option<u64>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Copy the current contents of a queue
    pub fn snapshot(&self, queue: &str) -> QueueSnapshot {
        let queues = self.queues.lock();
        match queues.get(queue) {
            Some(state) => QueueSnapshot {
                ready: state.ready.iter().cloned().collect(),
                delayed: state.delayed.entries.clone(),
                reserved: state.reserved.entries.clone(),
            },
            None => QueueSnapshot::default(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push_raw(&self, queue: &str, payload: &str) -> QueueResult<()> {
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(payload.to_string());
        Ok(())
    }

    async fn later_raw(&self, queue: &str, available_at: i64, payload: &str) -> QueueResult<()> {
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .delayed
            .add(available_at, payload.to_string());
        Ok(())
    }

    async fn pop(&self, queue: &str) -> QueueResult<Option<String>> {
        let now = self.clock.now();
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();

        let due = state.delayed.take_due(now);
        if !due.is_empty() {
            debug!(queue, count = due.len(), "migrated due delayed jobs");
        }
        state.ready.extend(due);

        if self.retry_after.is_some() {
            let expired = state.reserved.take_due(now);
            if !expired.is_empty() {
                debug!(queue, count = expired.len(), "recovered expired reservations");
            }
            state.ready.extend(expired);
        }

        let Some(job) = state.ready.pop_front() else {
            return Ok(None);
        };

        let reserved = match attempts_of(&job).and_then(|n| rewrite_attempts(&job, n + 1)) {
            Ok(reserved) => reserved,
            Err(e) => {
                error!(queue, error = %e, "discarding malformed payload");
                return Err(QueueError::InvalidPayload(format!("discarded malformed payload: {e}")));
            }
        };

        let score = match self.retry_after {
            Some(seconds) => now.saturating_add(seconds as i64),
            None => now,
        };
        state.reserved.add(score, reserved.clone());

        Ok(Some(reserved))
    }

    async fn release(&self, queue: &str, reserved: &str, delay: i64, attempts: u32) -> QueueResult<()> {
        let payload = rewrite_attempts(reserved, attempts)?;
        let available_at = self.clock.now().saturating_add(delay);

        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.reserved.remove(reserved);
        state.delayed.add(available_at, payload);
        Ok(())
    }

    async fn delete_reserved(&self, queue: &str, reserved: &str) -> QueueResult<()> {
        if let Some(state) = self.queues.lock().get_mut(queue) {
            state.reserved.remove(reserved);
        }
        Ok(())
    }

    async fn size(&self, queue: &str) -> QueueResult<usize> {
        Ok(self
            .queues
            .lock()
            .get(queue)
            .map(|state| state.ready.len() + state.delayed.len() + state.reserved.len())
            .unwrap_or(0))
    }

    async fn clear(&self, queue: &str) -> QueueResult<usize> {
        Ok(self
            .queues
            .lock()
            .remove(queue)
            .map(|state| state.ready.len() + state.delayed.len() + state.reserved.len())
            .unwrap_or(0))
    }

    fn default_queue(&self) -> &str {
        &self.default_queue
    }

    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn driver(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scored_set_orders_by_score_then_insertion() {
        let mut set = ScoredSet::default();
        set.add(10, "b".into());
        set.add(5, "a".into());
        set.add(10, "c".into());
        set.add(1, "z".into());

        assert_eq!(set.take_due(10), vec!["z", "a", "b", "c"]);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_scored_set_re_add_moves_member() {
        let mut set = ScoredSet::default();
        set.add(1, "a".into());
        set.add(2, "b".into());
        set.add(3, "a".into());

        assert_eq!(set.take_due(2), vec!["b"]);
        assert_eq!(set.take_due(3), vec!["a"]);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_discarded() {
        let store = MemoryStore::new();
        store.push_raw("default", "not json").await.unwrap();

        let result = store.pop("default").await;
        assert!(matches!(result, Err(QueueError::InvalidPayload(_))));
        assert_eq!(store.size("default").await.unwrap(), 0);
    }
}
