//! # Configuration
//!
//! Configuration is a plain string key/value store, layered however the
//! application likes. Typed views ([`QueueSettings`], [`WorkerOptions`]) are
//! read from a [`JobsConfigSnapshot`].
//!
//! ```rust
//! use dog_jobs::config::JobsConfig;
//!
//! let mut config = JobsConfig::new();
//! config.set("queue.default", "redis");
//! config.set("queue.connections.redis.driver", "redis");
//! config.set("queue.connections.redis.url", "redis://127.0.0.1/");
//! config.set("queue.connections.redis.retry_after", "90");
//!
//! let settings = config.snapshot().queue_settings();
//! assert_eq!(settings.default, "redis");
//! assert_eq!(settings.connections["redis"].retry_after, Some(90));
//! ```
//!
//! ## Environment overrides
//!
//! [`JobsConfig::load_env`] copies every variable starting with a prefix,
//! lower-cased, with `__` turned into `.`:
//!
//! ```bash
//! export JOBS__QUEUE__CONNECTIONS__REDIS__RETRY_AFTER=120
//! ```
//!
//! A `retry_after` of `never` (or an empty value) disables recovery of
//! expired reservations for that connection.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::worker::WorkerOptions;

#[derive(Debug, Default)]
pub struct JobsConfig {
    values: HashMap<String, String>,
}

impl JobsConfig {
    /// Create an empty config store.
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Set a configuration key to a string value.
    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    /// Get a configuration value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Copy in variables of the form `PREFIX__A__B` as `a.b`
    pub fn load_env(&mut self, prefix: &str) {
        self.load_vars(prefix, std::env::vars());
    }

    fn load_vars(&mut self, prefix: &str, vars: impl IntoIterator<Item = (String, String)>) {
        let prefix = format!("{prefix}__");
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(&prefix) {
                let normalized = stripped.to_lowercase().replace("__", ".");
                self.set(normalized, value);
            }
        }
    }

    pub fn snapshot(&self) -> JobsConfigSnapshot {
        JobsConfigSnapshot::new(self.values.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobsConfigSnapshot {
    map: HashMap<String, String>,
}

impl JobsConfigSnapshot {
    pub(crate) fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse::<u64>().ok())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse::<i64>().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.parse::<bool>().ok())
    }

    /// Queue connections under `queue.*`
    pub fn queue_settings(&self) -> QueueSettings {
        let mut names: Vec<&str> = self
            .map
            .keys()
            .filter_map(|key| key.strip_prefix("queue.connections."))
            .filter_map(|rest| rest.split('.').next())
            .collect();
        names.sort_unstable();
        names.dedup();

        let connections = names
            .into_iter()
            .map(|name| (name.to_string(), self.connection_settings(name)))
            .collect();

        QueueSettings {
            default: self.get_string("queue.default").unwrap_or_else(|| "default".to_string()),
            connections,
        }
    }

    fn connection_settings(&self, name: &str) -> ConnectionSettings {
        let key = |field: &str| format!("queue.connections.{name}.{field}");
        let defaults = ConnectionSettings::default();

        let retry_after = match self.get(&key("retry_after")) {
            None => defaults.retry_after,
            Some(value) if value.is_empty() || value == "never" => None,
            Some(value) => value.parse().ok().or(defaults.retry_after),
        };

        ConnectionSettings {
            driver: self.get_string(&key("driver")).unwrap_or(defaults.driver),
            queue: self.get_string(&key("queue")).unwrap_or(defaults.queue),
            url: self.get_string(&key("url")),
            retry_after,
        }
    }

    /// Worker options under `worker.*`
    pub fn worker_options(&self) -> WorkerOptions {
        let defaults = WorkerOptions::default();

        WorkerOptions {
            delay: self.get_i64("worker.delay").unwrap_or(defaults.delay),
            memory_mb: self.get_u64("worker.memory").unwrap_or(defaults.memory_mb),
            sleep: self
                .get_u64("worker.sleep")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sleep),
            max_tries: self
                .get_u64("worker.tries")
                .and_then(|tries| u32::try_from(tries).ok())
                .or(defaults.max_tries),
            max_time: self.get_u64("worker.max_time").map(Duration::from_secs).or(defaults.max_time),
            stop_when_empty: self.get_bool("worker.stop_when_empty").unwrap_or(defaults.stop_when_empty),
        }
    }
}

/// All configured queue connections
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueSettings {
    /// Connection used when none is named
    pub default: String,
    pub connections: BTreeMap<String, ConnectionSettings>,
}

/// One queue connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Connector name, e.g. `memory` or `redis`
    pub driver: String,
    /// Default queue name on this connection
    pub queue: String,
    pub url: Option<String>,
    /// Reservation expiry in seconds; `None` never recovers reservations
    pub retry_after: Option<u64>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            driver: "memory".to_string(),
            queue: "default".to_string(),
            url: None,
            retry_after: Some(60),
        }
    }
}
