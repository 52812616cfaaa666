//! # dog-jobs: Queue, Worker, Command Bus and Concurrency Limiter
//!
//! **Redis-backed background jobs with at-least-once delivery**
//!
//! dog-jobs moves serialized jobs through three structures per named queue:
//! a ready list, a delayed set and a reserved set. Every transition between
//! them is atomic, so concurrent producers and workers never lose or
//! duplicate a payload.
//!
//! ## Features
//!
//! - **Queue**: push now, push later, bulk push, pop with reservation,
//!   release with delay, delete, size and clear
//! - **Expiry recovery**: reservations older than `retry_after` go back to
//!   the ready list on the next pop
//! - **Worker**: a cooperative daemon with failure policy, memory and time
//!   limits, and a shutdown signal
//! - **Command bus**: run commands now or queue them, with batches and
//!   `then` / `catch` / `finally` callbacks
//! - **Limiter**: a distributed counting semaphore with leased slots
//! - **Backends**: an in-process store for tests and single nodes, and Redis
//!   with Lua scripts for the atomic steps
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_jobs::prelude::*;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let queue = Queue::new(store);
//!
//! let mut registry = JobRegistry::new();
//! registry.register_fn("SendWelcomeEmail", |data: serde_json::Value| async move {
//!     tracing::info!(to = %data["to"], "sending");
//!     Ok(())
//! })?;
//!
//! queue
//!     .push_plain("SendWelcomeEmail", serde_json::json!({"to": "ada@example.com"}), None)
//!     .await?;
//!
//! let worker = Worker::new(queue, Arc::new(registry));
//! worker.run_next_job(&["default"], &WorkerOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod job;
pub mod limiter;
pub mod manager;
pub mod payload;
pub mod queue;
pub mod time;
pub mod types;
pub mod worker;

#[cfg(feature = "tracing-basic")]
pub mod observability;

pub use error::{QueueError, QueueResult};
pub use types::{BatchId, JobId};
pub use codec::{json::JsonCodec, JobCodec};
pub use payload::{Payload, PayloadCodec, QueuedCommand};
pub use backend::{QueueKeys, QueueStore};
pub use queue::Queue;
pub use job::{FnJobHandler, JobHandle, JobHandler, JobRegistry};
pub use worker::{
    Cycle, FailureAction, FailurePolicy, MaxAttempts, StopReason, Worker, WorkerEvent, WorkerHandle,
    WorkerOptions,
};
pub use bus::{
    Batch, BatchCallbacks, BatchOptions, BatchRepository, CallQueuedHandler, Command, CommandHandler,
    Dispatched, Dispatcher, HandlerContainer, HandlerRoute, MemoryBatchRepository, PendingBatch,
    QueueBehavior,
};
pub use limiter::{ConcurrencyLimiter, FunneledHandler, LimiterStore, MemoryLimiterStore};
pub use manager::{Connector, QueueManager};
pub use config::{ConnectionSettings, JobsConfig, QueueSettings};
pub use time::{Clock, Delay, ManualClock, SystemClock};

#[cfg(feature = "memory")]
pub use backend::memory::MemoryStore;

#[cfg(feature = "redis")]
pub use backend::redis::{RedisBatchRepository, RedisLimiterStore, RedisStore};

/// Everything needed to push, work and dispatch jobs
pub mod prelude {
    pub use crate::{
        Command, Dispatcher, JobHandle, JobHandler, JobRegistry, Queue, QueueBehavior, QueueError,
        QueueResult, Worker, WorkerOptions,
    };

    pub use crate::{Batch, BatchCallbacks, ConcurrencyLimiter, PendingBatch, QueueManager};

    #[cfg(feature = "memory")]
    pub use crate::MemoryStore;

    #[cfg(feature = "redis")]
    pub use crate::RedisStore;

    pub use async_trait::async_trait;
}
