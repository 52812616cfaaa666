//! Command handler resolution and the queued-command job handler.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    bus::{Command, Dispatcher},
    job::{JobHandle, JobHandler, JobRegistry},
    payload::{Payload, PayloadCodec, CALL_QUEUED_HANDLER},
    QueueError, QueueResult,
};

/// Handler type and method a command is routed to, fixed at registration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerRoute {
    pub handler: String,
    pub method: String,
}

impl HandlerRoute {
    pub fn new(handler: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for HandlerRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.handler, self.method)
    }
}

/// One invocable handler method
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, command: Value) -> anyhow::Result<Value>;
}

/// Turns a route into an invocable handler
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, route: &HandlerRoute) -> QueueResult<Arc<dyn CommandHandler>>;
}

struct TypedMethod<C, F, Fut, R> {
    func: F,
    _phantom: PhantomData<fn(C) -> (Fut, R)>,
}

#[async_trait]
impl<C, F, Fut, R> CommandHandler for TypedMethod<C, F, Fut, R>
where
    C: DeserializeOwned + Send + 'static,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    async fn call(&self, command: Value) -> anyhow::Result<Value> {
        let command: C = serde_json::from_value(command)?;
        let result = (self.func)(command).await?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Method table keyed by `(handler, method)`
#[derive(Default)]
pub struct HandlerContainer {
    methods: RwLock<HashMap<HandlerRoute, Arc<dyn CommandHandler>>>,
}

impl HandlerContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a route to an already type-erased handler
    pub fn bind(&self, route: HandlerRoute, handler: Arc<dyn CommandHandler>) {
        self.methods.write().insert(route, handler);
    }

    /// Bind a route to an async function of a typed command
    pub fn method<C, F, Fut, R>(&self, handler: &str, method: &str, func: F)
    where
        C: Command,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.bind(
            HandlerRoute::new(handler, method),
            Arc::new(TypedMethod {
                func,
                _phantom: PhantomData,
            }),
        );
    }
}

impl HandlerResolver for HandlerContainer {
    fn resolve(&self, route: &HandlerRoute) -> QueueResult<Arc<dyn CommandHandler>> {
        self.methods
            .read()
            .get(route)
            .cloned()
            .ok_or_else(|| QueueError::UnresolvedHandler(route.to_string()))
    }
}

/// Job handler for object payloads: decodes the command and dispatches it now
pub struct CallQueuedHandler {
    dispatcher: Arc<Dispatcher>,
    codec: PayloadCodec,
}

impl CallQueuedHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            codec: PayloadCodec::default(),
        }
    }

    pub fn with_codec(mut self, codec: PayloadCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Register under the generic locator used by object payloads
    pub fn register(self, registry: &mut JobRegistry) -> QueueResult<()> {
        registry.register(CALL_QUEUED_HANDLER, Arc::new(self))
    }
}

#[async_trait]
impl JobHandler for CallQueuedHandler {
    async fn fire(&self, job: &mut JobHandle, _data: Value) -> anyhow::Result<()> {
        let (data, command) = self.codec.decode_command(job.payload())?;

        let batch = match &data.batch_id {
            Some(batch_id) => self.dispatcher.find_batch(batch_id).await?,
            None => None,
        };

        match &batch {
            Some(batch) if batch.cancelled() => {
                debug!(job_id = %job.id(), batch_id = %batch.id(), "batch cancelled, skipping command");
            }
            _ => {
                self.dispatcher.dispatch_value(&data.command_name, command).await?;
            }
        }

        if let Some(batch) = batch {
            if !job.is_released() {
                batch.record_successful_job(job.id()).await?;
            }
        }

        if !job.is_deleted_or_released() {
            job.delete().await?;
        }

        Ok(())
    }

    async fn failed(&self, payload: &Payload, error: Arc<anyhow::Error>) -> anyhow::Result<()> {
        let Some(batch_id) = payload.batch_id() else {
            return Ok(());
        };

        match self.dispatcher.find_batch(batch_id).await? {
            Some(batch) => batch.record_failed_job(&payload.id, error).await?,
            None => warn!(batch_id, job_id = %payload.id, "failed job belongs to an unknown batch"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    impl Command for Add {
        const NAME: &'static str = "add";
    }

    #[tokio::test]
    async fn test_container_resolves_bound_method() {
        let container = HandlerContainer::new();
        container.method("Calculator", "add", |cmd: Add| async move { Ok(cmd.a + cmd.b) });

        let handler = container.resolve(&HandlerRoute::new("Calculator", "add")).unwrap();
        let result = handler.call(serde_json::json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(result, 5);
    }

    #[test]
    fn test_container_reports_missing_route() {
        let container = HandlerContainer::new();
        let result = container.resolve(&HandlerRoute::new("Calculator", "sub"));

        match result {
            Err(QueueError::UnresolvedHandler(route)) => assert_eq!(route, "Calculator@sub"),
            _ => panic!("expected unresolved handler"),
        }
    }
}
