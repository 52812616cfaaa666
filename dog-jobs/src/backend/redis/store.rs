use std::sync::Arc;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use tracing::error;

use crate::{
    backend::{QueueKeys, QueueStore},
    payload::{decode, rewrite_attempts},
    time::{Clock, SystemClock},
    QueueError, QueueResult,
};

const POP_LUA: &str = include_str!("lua/pop.lua");
const RELEASE_LUA: &str = include_str!("lua/release.lua");
const CLEAR_LUA: &str = include_str!("lua/clear.lua");

/// Queue store over a Redis list and two sorted sets per queue
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    pop_script: Script,
    release_script: Script,
    clear_script: Script,
    clock: Arc<dyn Clock>,
    default_queue: String,
    retry_after: Option<u64>,
}

impl RedisStore {
    pub async fn connect(url: &str) -> QueueResult<Self> {
        Ok(Self::with_connection(super::connect(url).await?))
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            pop_script: Script::new(POP_LUA),
            release_script: Script::new(RELEASE_LUA),
            clear_script: Script::new(CLEAR_LUA),
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
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push_raw(&self, queue: &str, payload: &str) -> QueueResult<()> {
        let keys = QueueKeys::for_queue(queue);
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&keys.ready, payload).await?;
        Ok(())
    }

    async fn later_raw(&self, queue: &str, available_at: i64, payload: &str) -> QueueResult<()> {
        let keys = QueueKeys::for_queue(queue);
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(&keys.delayed, payload, available_at).await?;
        Ok(())
    }

    async fn pop(&self, queue: &str) -> QueueResult<Option<String>> {
        let keys = QueueKeys::for_queue(queue);
        let expire = self.retry_after.map(|s| s.to_string()).unwrap_or_default();
        let mut conn = self.conn.clone();

        let popped: Option<(String, Option<String>)> = self
            .pop_script
            .key(&keys.ready)
            .key(&keys.delayed)
            .key(&keys.reserved)
            .arg(self.clock.now())
            .arg(expire)
            .invoke_async(&mut conn)
            .await?;

        match popped {
            None => Ok(None),
            Some((_, Some(reserved))) => match decode(&reserved) {
                Ok(_) => Ok(Some(reserved)),
                Err(e) => {
                    conn.zrem::<_, _, ()>(&keys.reserved, &reserved).await?;
                    error!(queue, payload = %reserved, error = %e, "discarding malformed payload");
                    Err(QueueError::InvalidPayload(format!("discarded malformed payload: {e}")))
                }
            },
            Some((job, None)) => {
                error!(queue, payload = %job, "discarding malformed payload");
                Err(QueueError::InvalidPayload(
                    "discarded malformed payload: not a JSON object".to_string(),
                ))
            }
        }
    }

    async fn release(&self, queue: &str, reserved: &str, delay: i64, attempts: u32) -> QueueResult<()> {
        let keys = QueueKeys::for_queue(queue);
        let payload = rewrite_attempts(reserved, attempts)?;
        let available_at = self.clock.now().saturating_add(delay);
        let mut conn = self.conn.clone();

        let _: bool = self
            .release_script
            .key(&keys.delayed)
            .key(&keys.reserved)
            .arg(reserved)
            .arg(payload)
            .arg(available_at)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_reserved(&self, queue: &str, reserved: &str) -> QueueResult<()> {
        let keys = QueueKeys::for_queue(queue);
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(&keys.reserved, reserved).await?;
        Ok(())
    }

    async fn size(&self, queue: &str) -> QueueResult<usize> {
        let keys = QueueKeys::for_queue(queue);
        let mut conn = self.conn.clone();

        let (ready, delayed, reserved): (usize, usize, usize) = redis::pipe()
            .llen(&keys.ready)
            .zcard(&keys.delayed)
            .zcard(&keys.reserved)
            .query_async(&mut conn)
            .await?;

        Ok(ready + delayed + reserved)
    }

    async fn clear(&self, queue: &str) -> QueueResult<usize> {
        let keys = QueueKeys::for_queue(queue);
        let mut conn = self.conn.clone();

        let removed: usize = self
            .clear_script
            .key(&keys.ready)
            .key(&keys.delayed)
            .key(&keys.reserved)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    fn default_queue(&self) -> &str {
        &self.default_queue
    }

    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn driver(&self) -> &'static str {
        "redis"
    }
}
