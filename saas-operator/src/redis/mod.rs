//! Redis & Sentinel topology.
//!
//! Servers are reached through the `Connector` & `RedisClient` abstractions, which are backed by
//! the `redis` crate at runtime and by in-memory fakes in tests.

mod client;
mod events;
#[cfg(test)]
mod events_test;
mod server;
mod sharded;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use client::RedisConnector;
pub use events::RedisEventMessage;
pub use server::{RedisServer, Role, ServerAddr};
pub use sharded::ShardedCluster;

/// The state of background saves of a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaveState {
    /// A background save is running (`rdb_bgsave_in_progress`).
    pub in_progress: bool,
    /// The last background save succeeded (`rdb_last_bgsave_status`).
    pub last_ok: bool,
}

/// A raw Sentinel notification as `(topic, payload)`.
pub type RawEvent = (String, String);

/// The commands the operator issues against Redis & Sentinel servers.
#[async_trait]
pub trait RedisClient: Send + Sync {
    /// The role reported by `ROLE`.
    async fn role(&self) -> Result<Role>;

    /// The value of the given parameter from `CONFIG GET`, if it exists.
    async fn config_get(&self, parameter: &str) -> Result<Option<String>>;

    /// Start a background save with `BGSAVE`.
    async fn bgsave(&self) -> Result<()>;

    /// The unix time of the last successful save from `LASTSAVE`.
    async fn lastsave(&self) -> Result<i64>;

    /// The state of background saves from `INFO persistence`.
    async fn save_state(&self) -> Result<SaveState>;

    /// The masters known to a Sentinel from `SENTINEL MASTERS`.
    async fn sentinel_masters(&self) -> Result<Vec<HashMap<String, String>>>;

    /// The replicas of a master known to a Sentinel from `SENTINEL REPLICAS`.
    async fn sentinel_replicas(&self, shard: &str) -> Result<Vec<HashMap<String, String>>>;

    /// Register a master with a Sentinel through `SENTINEL MONITOR`.
    async fn sentinel_monitor(&self, shard: &str, host: &str, port: u16, quorum: u32) -> Result<()>;

    /// Change a setting of a monitored master through `SENTINEL SET`.
    async fn sentinel_set(&self, shard: &str, key: &str, value: &str) -> Result<()>;

    /// Subscribe to all Sentinel notifications with `PSUBSCRIBE *`.
    ///
    /// The returned stream ends when the subscription connection is lost.
    async fn subscribe_events(&self) -> Result<BoxStream<'static, RawEvent>>;
}

/// A source of clients for server addresses.
pub trait Connector: Send + Sync {
    /// Get a client for the given address.
    ///
    /// This does not open a connection, which happens lazily on the first command.
    fn client(&self, addr: &ServerAddr) -> Result<Arc<dyn RedisClient>>;
}
