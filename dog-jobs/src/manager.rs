//! Named queue connections, resolved lazily from [`QueueSettings`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::{
    backend::QueueStore,
    bus::QueueResolver,
    config::{ConnectionSettings, QueueSettings},
    job::JobRegistry,
    queue::Queue,
    time::{Clock, SystemClock},
    worker::Worker,
    QueueError, QueueResult,
};

/// Builds the store behind a connection for one driver name
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        settings: &ConnectionSettings,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Arc<dyn QueueStore>>;
}

/// The `memory` driver
#[cfg(feature = "memory")]
pub struct MemoryConnector;

#[cfg(feature = "memory")]
#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        _name: &str,
        settings: &ConnectionSettings,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Arc<dyn QueueStore>> {
        let store = crate::backend::memory::MemoryStore::new()
            .with_clock(clock)
            .with_default_queue(settings.queue.clone())
            .with_retry_after(settings.retry_after);
        Ok(Arc::new(store))
    }
}

/// The `redis` driver; needs `url`
#[cfg(feature = "redis")]
pub struct RedisConnector;

#[cfg(feature = "redis")]
#[async_trait]
impl Connector for RedisConnector {
    async fn connect(
        &self,
        name: &str,
        settings: &ConnectionSettings,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<Arc<dyn QueueStore>> {
        let url = settings.url.as_deref().ok_or_else(|| {
            QueueError::RuntimeConfiguration(format!("queue connection [{name}] has no url"))
        })?;

        let store = crate::backend::redis::RedisStore::connect(url)
            .await?
            .with_clock(clock)
            .with_default_queue(settings.queue.clone())
            .with_retry_after(settings.retry_after);
        Ok(Arc::new(store))
    }
}

/// Resolves connection names to [`Queue`]s, connecting each at most once
pub struct QueueManager {
    settings: QueueSettings,
    connectors: RwLock<HashMap<String, Arc<dyn Connector>>>,
    connections: RwLock<HashMap<String, Queue>>,
    clock: Arc<dyn Clock>,
}

impl QueueManager {
    /// A manager with the built-in drivers registered
    pub fn new(settings: QueueSettings) -> Self {
        let manager = Self {
            settings,
            connectors: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
        };

        #[cfg(feature = "memory")]
        manager.extend("memory", Arc::new(MemoryConnector));
        #[cfg(feature = "redis")]
        manager.extend("redis", Arc::new(RedisConnector));

        manager
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register (or replace) the connector for a driver name
    pub fn extend(&self, driver: impl Into<String>, connector: Arc<dyn Connector>) {
        self.connectors.write().insert(driver.into(), connector);
    }

    pub fn default_connection(&self) -> &str {
        &self.settings.default
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Has `name` been connected already
    pub fn connected(&self, name: &str) -> bool {
        self.connections.read().contains_key(name)
    }

    /// The queue for `name`, or the default connection
    pub async fn connection(&self, name: Option<&str>) -> QueueResult<Queue> {
        let name = name.unwrap_or(&self.settings.default);

        if let Some(queue) = self.connections.read().get(name) {
            return Ok(queue.clone());
        }

        let settings = self.settings.connections.get(name).ok_or_else(|| {
            QueueError::RuntimeConfiguration(format!("queue connection [{name}] is not defined"))
        })?;

        let connector = self
            .connectors
            .read()
            .get(&settings.driver)
            .cloned()
            .ok_or_else(|| {
                QueueError::RuntimeConfiguration(format!(
                    "no connector for driver [{}] of connection [{name}]",
                    settings.driver
                ))
            })?;

        debug!(connection = name, driver = %settings.driver, "connecting queue");
        let store = connector.connect(name, settings, self.clock.clone()).await?;
        let queue = Queue::new(store).with_connection_name(name);

        // A concurrent caller may have connected first; keep the earlier queue.
        let queue = self
            .connections
            .write()
            .entry(name.to_string())
            .or_insert(queue)
            .clone();

        info!(connection = name, driver = %settings.driver, "queue connection ready");
        Ok(queue)
    }

    /// A worker consuming the given connection
    pub async fn worker(&self, name: Option<&str>, registry: Arc<JobRegistry>) -> QueueResult<Worker> {
        Ok(Worker::new(self.connection(name).await?, registry))
    }
}

#[async_trait]
impl QueueResolver for QueueManager {
    async fn resolve(&self, connection: Option<&str>) -> QueueResult<Option<Queue>> {
        self.connection(connection).await.map(Some)
    }
}
