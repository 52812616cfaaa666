use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};

use crate::{
    limiter::{slot_keys, LimiterStore},
    QueueResult,
};

const ACQUIRE_SLOT_LUA: &str = include_str!("lua/acquire_slot.lua");
const RELEASE_IF_OWNER_LUA: &str = include_str!("lua/release_if_owner.lua");

/// Limiter slots as plain keys with `EX` leases
#[derive(Clone)]
pub struct RedisLimiterStore {
    conn: ConnectionManager,
    acquire_script: Script,
    release_script: Script,
}

impl RedisLimiterStore {
    pub async fn connect(url: &str) -> QueueResult<Self> {
        Ok(Self::with_connection(super::connect(url).await?))
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            acquire_script: Script::new(ACQUIRE_SLOT_LUA),
            release_script: Script::new(RELEASE_IF_OWNER_LUA),
        }
    }
}

#[async_trait]
impl LimiterStore for RedisLimiterStore {
    async fn acquire(&self, name: &str, max_locks: u32, lease_seconds: u64, owner: &str) -> QueueResult<Option<String>> {
        if max_locks == 0 {
            return Ok(None);
        }

        let mut invocation = self.acquire_script.prepare_invoke();
        for key in slot_keys(name, max_locks) {
            invocation.key(key);
        }
        invocation.arg(lease_seconds).arg(owner);

        let mut conn = self.conn.clone();
        let slot: Option<String> = invocation.invoke_async(&mut conn).await?;
        Ok(slot)
    }

    async fn release(&self, slot: &str, owner: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release_script
            .key(slot)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
