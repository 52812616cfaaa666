use serde::{de::DeserializeOwned, Serialize};

/// How a command is dispatched by default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueBehavior {
    /// Run in the dispatching process
    #[default]
    Immediate,
    /// Push onto the queue and run in a worker
    Queued,
}

/// A command object routed by the bus.
///
/// Commands are plain serializable data. Retry and timeout metadata travel in
/// the payload envelope when the command is queued.
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Command name used for handler routing and in `data.commandName`
    const NAME: &'static str;

    fn behavior(&self) -> QueueBehavior {
        QueueBehavior::Immediate
    }

    /// Maximum number of attempts (`None` = unlimited)
    fn tries(&self) -> Option<u32> {
        None
    }

    /// Advisory execution timeout in seconds
    fn timeout(&self) -> Option<u64> {
        None
    }

    /// Queue to push onto instead of the connection default
    fn queue(&self) -> Option<&str> {
        None
    }

    /// Connection to push onto instead of the default connection
    fn connection(&self) -> Option<&str> {
        None
    }
}
