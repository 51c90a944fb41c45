//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The operator's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,

    /// The Kubernetes namespace watched by the operator.
    ///
    /// When empty, resources of all namespaces are watched.
    #[serde(default)]
    pub namespace: String,

    /// The period in seconds after which every resource is reconciled again.
    #[serde(default = "Config::default_resync_seconds")]
    pub resync_seconds: u64,
    /// The delay in seconds before retrying a reconcile pass which failed.
    #[serde(default = "Config::default_error_requeue_seconds")]
    pub error_requeue_seconds: u64,
    /// The delay in seconds before retrying the dispatch of a backup whose shard has no
    /// read-only replica available.
    #[serde(default = "Config::default_no_replica_requeue_seconds")]
    pub no_replica_requeue_seconds: u64,

    /// The timeout in milliseconds applied to Redis connections and commands.
    #[serde(default = "Config::default_redis_timeout_ms")]
    pub redis_timeout_ms: u64,
    /// The capacity of the queue through which background workers request reconciles.
    #[serde(default = "Config::default_notification_queue_size")]
    pub notification_queue_size: usize,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_seconds)
    }

    pub fn no_replica_requeue(&self) -> Duration {
        Duration::from_secs(self.no_replica_requeue_seconds)
    }

    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }

    fn default_resync_seconds() -> u64 {
        60
    }

    fn default_error_requeue_seconds() -> u64 {
        5
    }

    fn default_no_replica_requeue_seconds() -> u64 {
        30
    }

    fn default_redis_timeout_ms() -> u64 {
        5000
    }

    fn default_notification_queue_size() -> usize {
        100
    }
}

#[cfg(test)]
impl Config {
    /// Create a config instance suitable for tests.
    pub fn new_test() -> Result<std::sync::Arc<Self>> {
        let config: Config = envy::from_iter(vec![("RUST_LOG".into(), "error".into()), ("NAMESPACE".into(), "default".into())])
            .context("error building test config")?;
        Ok(std::sync::Arc::new(config))
    }
}
