//! Command bus: routing commands to handlers, queueing them, and tracking
//! batches of queued commands.

pub mod batch;
pub mod command;
pub mod dispatcher;
pub mod handler;
pub mod repository;

pub use batch::{
    Batch, BatchCallbackFuture, BatchCallbacks, BatchOptions, BatchRecord, Batches, PendingBatch,
    UpdatedBatchJobCounts,
};
pub use command::{Command, QueueBehavior};
pub use dispatcher::{Dispatched, Dispatcher, QueueResolver};
pub use handler::{CallQueuedHandler, CommandHandler, HandlerContainer, HandlerResolver, HandlerRoute};
pub use repository::{BatchRepository, BatchWork, MemoryBatchRepository};
