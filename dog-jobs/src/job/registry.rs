use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{job::JobHandle, payload::Payload, QueueError, QueueResult};

/// Handler bound to a job locator
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job with its `data` section
    async fn fire(&self, job: &mut JobHandle, data: Value) -> anyhow::Result<()>;

    /// Called once when the job is failed permanently
    async fn failed(&self, _payload: &Payload, _error: Arc<anyhow::Error>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether the worker deletes the job after a successful `fire`
    fn auto_delete(&self) -> bool {
        true
    }
}

/// Adapts an async function of the job data into a [`JobHandler`]
pub struct FnJobHandler<F, Fut> {
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnJobHandler<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnJobHandler<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn fire(&self, _job: &mut JobHandle, data: Value) -> anyhow::Result<()> {
        (self.func)(data).await
    }
}

/// Maps job locators to their handlers
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under a locator
    pub fn register(&mut self, locator: impl Into<String>, handler: Arc<dyn JobHandler>) -> QueueResult<()> {
        let locator = locator.into();

        if self.handlers.contains_key(&locator) {
            return Err(QueueError::Internal(format!("Job locator '{}' already registered", locator)));
        }

        self.handlers.insert(locator, handler);
        Ok(())
    }

    /// Register an async function of the job data
    pub fn register_fn<F, Fut>(&mut self, locator: impl Into<String>, func: F) -> QueueResult<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(locator, Arc::new(FnJobHandler::new(func)))
    }

    /// Resolve a locator
    pub fn handler(&self, locator: &str) -> QueueResult<Arc<dyn JobHandler>> {
        self.handlers
            .get(locator)
            .cloned()
            .ok_or_else(|| QueueError::UnresolvedHandler(locator.to_string()))
    }

    pub fn is_registered(&self, locator: &str) -> bool {
        self.handlers.contains_key(locator)
    }

    /// Get all registered locators
    pub fn registered_locators(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}
