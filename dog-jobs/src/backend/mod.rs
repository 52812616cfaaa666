#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;

use crate::{time::Clock, QueueResult};

/// Key prefix shared by every queue structure
pub const QUEUE_KEY_PREFIX: &str = "queues:";

/// Storage keys of one named queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// FIFO list of payloads ready to run
    pub ready: String,
    /// Sorted set scored by release-at timestamp
    pub delayed: String,
    /// Sorted set scored by reservation expiry
    pub reserved: String,
}

impl QueueKeys {
    pub fn for_queue(queue: &str) -> Self {
        let ready = if queue.starts_with(QUEUE_KEY_PREFIX) {
            queue.to_string()
        } else {
            format!("{QUEUE_KEY_PREFIX}{queue}")
        };

        Self {
            delayed: format!("{ready}:delayed"),
            reserved: format!("{ready}:reserved"),
            ready,
        }
    }
}

/// Storage primitives for the ready / delayed / reserved life cycle.
///
/// Payloads are raw strings. Every method that moves a payload between
/// structures is a single atomic step as seen by all concurrent callers.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append a payload to the ready list
    async fn push_raw(&self, queue: &str, payload: &str) -> QueueResult<()>;

    /// Add a payload to the delayed set, available at `available_at`
    async fn later_raw(&self, queue: &str, available_at: i64, payload: &str) -> QueueResult<()>;

    /// Atomically migrate due delayed entries and expired reservations to the
    /// ready list, pop its head, bump its attempts and reserve it.
    ///
    /// Returns the reserved (rewritten) payload.
    async fn pop(&self, queue: &str) -> QueueResult<Option<String>>;

    /// Move a reserved payload to the delayed set with the given attempt count
    async fn release(&self, queue: &str, reserved: &str, delay: i64, attempts: u32) -> QueueResult<()>;

    /// Remove a reserved payload; absent payloads are ignored
    async fn delete_reserved(&self, queue: &str, reserved: &str) -> QueueResult<()>;

    /// Ready + delayed + reserved, read without a snapshot guarantee
    async fn size(&self, queue: &str) -> QueueResult<usize>;

    /// Empty all three structures, returning how many payloads were removed
    async fn clear(&self, queue: &str) -> QueueResult<usize>;

    /// Queue used when callers do not name one
    fn default_queue(&self) -> &str;

    fn clock(&self) -> &dyn Clock;

    /// Driver name, for logs
    fn driver(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keys_layout() {
        let keys = QueueKeys::for_queue("emails");
        assert_eq!(keys.ready, "queues:emails");
        assert_eq!(keys.delayed, "queues:emails:delayed");
        assert_eq!(keys.reserved, "queues:emails:reserved");

        assert_eq!(QueueKeys::for_queue("queues:emails"), keys);
    }
}
