use std::collections::BTreeMap;

use anyhow::Result;
use futures::future::join_all;

use crate::redis::{Connector, RedisServer, ServerAddr};

/// The server parameters read during discovery.
pub const WATCHED_PARAMETERS: [&str; 2] = ["save", "slave-read-only"];

/// A logical shard, a set of servers replicating the same dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shard {
    pub name: String,
    pub servers: Vec<RedisServer>,
}

impl Shard {
    /// The current master of this shard, if any.
    ///
    /// There may transiently be none while a failover is in progress.
    pub fn master(&self) -> Option<&RedisServer> {
        self.servers.iter().find(|server| server.is_master())
    }

    /// The reachable replicas of this shard which do not accept writes.
    pub fn ro_replicas(&self) -> Vec<&RedisServer> {
        self.servers.iter().filter(|server| server.is_ro_replica()).collect()
    }

    /// Whether every server of this shard answered the last discovery.
    pub fn is_complete(&self) -> bool {
        self.servers.iter().all(|server| server.is_reachable())
    }
}

/// A set of shards along with the Sentinels monitoring them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShardedCluster {
    /// Shards ordered by name.
    pub shards: Vec<Shard>,
    pub sentinels: Vec<ServerAddr>,
}

impl ShardedCluster {
    /// Discover the role & settings of every server of the given shards.
    ///
    /// Servers are queried concurrently. A server which cannot be reached does not fail
    /// discovery, it is flagged unreachable & makes the cluster incomplete instead. An address
    /// which cannot be parsed is an error.
    #[tracing::instrument(level = "debug", skip(connector, shards, sentinels))]
    pub async fn discover(connector: &dyn Connector, shards: &BTreeMap<String, Vec<String>>, sentinels: Vec<ServerAddr>) -> Result<Self> {
        let mut cluster = Self { shards: Vec::with_capacity(shards.len()), sentinels };
        for (name, addrs) in shards {
            let mut pending = Vec::with_capacity(addrs.len());
            for addr in addrs {
                let addr = ServerAddr::parse(addr)?;
                let client = connector.client(&addr)?;
                pending.push(async move {
                    let mut server = RedisServer::new(addr);
                    server.discover(client.as_ref(), &WATCHED_PARAMETERS).await;
                    server
                });
            }
            let servers = join_all(pending).await;
            cluster.shards.push(Shard { name: name.clone(), servers });
        }
        tracing::debug!(shards = cluster.shards.len(), complete = cluster.is_complete(), "discovered sharded cluster");
        Ok(cluster)
    }

    /// Look up a shard by name.
    pub fn shard(&self, name: &str) -> Option<&Shard> {
        self.shards.iter().find(|shard| shard.name == name)
    }

    pub fn shard_names(&self) -> Vec<String> {
        self.shards.iter().map(|shard| shard.name.clone()).collect()
    }

    /// Look up a server of any shard by its `host:port` identifier.
    pub fn lookup_server(&self, id: &str) -> Option<&RedisServer> {
        self.shards.iter().flat_map(|shard| shard.servers.iter()).find(|server| server.id() == id)
    }

    /// Whether every expected server answered the last discovery.
    pub fn is_complete(&self) -> bool {
        self.shards.iter().all(|shard| shard.is_complete())
    }
}
