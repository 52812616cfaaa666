//! Redis-backed stores.
//!
//! Every multi-step transition runs as a Lua script so that concurrent
//! workers on different hosts observe it as a single step.

mod batches;
mod limiter;
mod store;

pub use batches::RedisBatchRepository;
pub use limiter::RedisLimiterStore;
pub use store::RedisStore;

use redis::aio::ConnectionManager;

use crate::QueueResult;

/// Open a managed connection (reconnects on failure)
pub async fn connect(url: &str) -> QueueResult<ConnectionManager> {
    let client = redis::Client::open(url)?;
    Ok(ConnectionManager::new(client).await?)
}
