use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::{
    bus::{
        batch::{Batch, Batches, PendingBatch},
        handler::{HandlerResolver, HandlerRoute},
        BatchCallbacks, BatchRepository, Command, QueueBehavior,
    },
    payload::QueuedCommand,
    queue::Queue,
    QueueError, QueueResult,
};

/// Yields the queue connection a command should be pushed to
#[async_trait]
pub trait QueueResolver: Send + Sync {
    /// `None` for the default connection
    async fn resolve(&self, connection: Option<&str>) -> QueueResult<Option<Queue>>;
}

#[async_trait]
impl QueueResolver for Queue {
    async fn resolve(&self, _connection: Option<&str>) -> QueueResult<Option<Queue>> {
        Ok(Some(self.clone()))
    }
}

type HandlerMapper = Arc<dyn Fn(&str) -> Option<HandlerRoute> + Send + Sync>;

/// What [`Dispatcher::dispatch`] did with a command
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// Ran in this process, with the handler's result
    Handled(Value),
    /// Pushed onto a queue, with the payload id
    Queued(String),
}

/// Routes commands to their handlers, now or through a queue
pub struct Dispatcher {
    resolver: Arc<dyn HandlerResolver>,
    mappings: RwLock<HashMap<String, HandlerRoute>>,
    mapper: RwLock<Option<HandlerMapper>>,
    queue_resolver: Option<Arc<dyn QueueResolver>>,
    batches: Option<Arc<Batches>>,
}

impl Dispatcher {
    pub fn new(resolver: Arc<dyn HandlerResolver>) -> Self {
        Self {
            resolver,
            mappings: RwLock::new(HashMap::new()),
            mapper: RwLock::new(None),
            queue_resolver: None,
            batches: None,
        }
    }

    pub fn with_queue_resolver(mut self, queue_resolver: Arc<dyn QueueResolver>) -> Self {
        self.batches = self
            .batches
            .map(|batches| Arc::new(batches.with_queue_resolver(queue_resolver.clone())));
        self.queue_resolver = Some(queue_resolver);
        self
    }

    /// Enable batching, backed by `repository`
    pub fn with_batches(mut self, repository: Arc<dyn BatchRepository>, callbacks: Arc<BatchCallbacks>) -> Self {
        self.batches = Some(Arc::new(Batches::new(
            repository,
            callbacks,
            self.queue_resolver.clone(),
        )));
        self
    }

    /// Route a command name to a handler method
    pub fn maps(&self, command: impl Into<String>, route: HandlerRoute) -> &Self {
        self.mappings.write().insert(command.into(), route);
        self
    }

    /// Typed shorthand for [`Dispatcher::maps`]
    pub fn register<C: Command>(&self, route: HandlerRoute) -> &Self {
        self.maps(C::NAME, route)
    }

    /// Fallback consulted for commands without an explicit mapping
    pub fn map_using(&self, mapper: impl Fn(&str) -> Option<HandlerRoute> + Send + Sync + 'static) -> &Self {
        *self.mapper.write() = Some(Arc::new(mapper));
        self
    }

    pub fn has_route(&self, command: &str) -> bool {
        self.handler_route(command).is_ok()
    }

    /// Explicit mapping first, then the fallback mapper
    pub fn handler_route(&self, command: &str) -> QueueResult<HandlerRoute> {
        if let Some(route) = self.mappings.read().get(command) {
            return Ok(route.clone());
        }

        let mapper = self.mapper.read().clone();
        mapper
            .and_then(|mapper| mapper(command))
            .ok_or_else(|| QueueError::UnresolvedHandler(command.to_string()))
    }

    /// Queue the command when it asks for it and a queue is available, run it now otherwise
    pub async fn dispatch<C: Command>(&self, command: &C) -> anyhow::Result<Dispatched> {
        if command.behavior() == QueueBehavior::Queued && self.queue_resolver.is_some() {
            return Ok(Dispatched::Queued(self.dispatch_to_queue(command).await?));
        }

        Ok(Dispatched::Handled(self.dispatch_now(command).await?))
    }

    /// Run the command's handler in this process
    pub async fn dispatch_now<C: Command>(&self, command: &C) -> anyhow::Result<Value> {
        let value = serde_json::to_value(command).map_err(QueueError::from)?;
        self.dispatch_value(C::NAME, value).await
    }

    /// Run the handler for an already-serialized command
    #[instrument(skip(self, command))]
    pub async fn dispatch_value(&self, name: &str, command: Value) -> anyhow::Result<Value> {
        let route = self.handler_route(name)?;
        let handler = self.resolver.resolve(&route)?;

        debug!(route = %route, "dispatching command");
        handler.call(command).await
    }

    /// Push the command onto the queue resolved for it
    #[instrument(skip(self, command), fields(command = C::NAME))]
    pub async fn dispatch_to_queue<C: Command>(&self, command: &C) -> QueueResult<String> {
        let queue = self.resolve_queue(command.connection()).await?;
        queue.push(command).await
    }

    /// Push a pre-serialized command
    pub async fn dispatch_queued(&self, queued: &QueuedCommand) -> QueueResult<String> {
        let queue = self.resolve_queue(queued.connection.as_deref()).await?;
        queue.push_queued(queued, None).await
    }

    async fn resolve_queue(&self, connection: Option<&str>) -> QueueResult<Queue> {
        let resolver = self.queue_resolver.as_ref().ok_or_else(|| {
            QueueError::RuntimeConfiguration("No queue resolver configured.".to_string())
        })?;

        resolver.resolve(connection).await?.ok_or_else(|| {
            QueueError::RuntimeConfiguration("Queue resolver did not return a Queue implementation.".to_string())
        })
    }

    /// Start building a batch of commands
    pub fn batch(&self, commands: Vec<QueuedCommand>) -> QueueResult<PendingBatch> {
        let batches = self.batches.clone().ok_or_else(|| {
            QueueError::RuntimeConfiguration("Batching requires a batch repository.".to_string())
        })?;
        Ok(PendingBatch::new(batches, commands))
    }

    /// Look up a batch by id
    pub async fn find_batch(&self, batch_id: &str) -> QueueResult<Option<Batch>> {
        match &self.batches {
            Some(batches) => batches.find(batch_id).await,
            None => Ok(None),
        }
    }
}
