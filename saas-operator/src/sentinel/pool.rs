use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use saas_core::crd::{MonitoredServer, MonitoredShard, SentinelMonitorConfig};

use crate::redis::{Connector, RedisClient, ServerAddr, ShardedCluster};

/// The quorum used when registering shards with the Sentinels.
pub const DEFAULT_QUORUM: u32 = 2;

/// The fields of `SENTINEL MASTERS` & `SENTINEL REPLICAS` replies kept as server config.
const REPORTED_FIELDS: [&str; 3] = ["flags", "master-link-status", "slave-priority"];

/// A pool of Sentinels monitoring the same set of shards.
pub struct SentinelPool {
    sentinels: Vec<(ServerAddr, Arc<dyn RedisClient>)>,
}

impl SentinelPool {
    /// Create a new pool from the given Sentinel URIs.
    pub fn new(connector: &dyn Connector, uris: &[String]) -> Result<Self> {
        if uris.is_empty() {
            bail!("a sentinel pool needs at least one sentinel");
        }
        let mut sentinels = Vec::with_capacity(uris.len());
        for uri in uris {
            let addr = ServerAddr::parse(uri)?;
            let client = connector.client(&addr)?;
            sentinels.push((addr, client));
        }
        Ok(Self { sentinels })
    }

    /// The addresses of the Sentinels of this pool.
    pub fn addresses(&self) -> Vec<ServerAddr> {
        self.sentinels.iter().map(|(addr, _)| addr.clone()).collect()
    }

    /// Whether every Sentinel of the pool monitors every given shard.
    ///
    /// Any Sentinel which cannot be queried makes this an error.
    pub async fn is_monitoring_shards(&self, shards: &[String]) -> Result<bool> {
        let replies = join_all(self.sentinels.iter().map(|(addr, client)| async move {
            let masters = monitored_names(client.as_ref()).await.with_context(|| format!("error querying sentinel {}", addr))?;
            Ok::<_, anyhow::Error>(masters)
        }))
        .await;
        for masters in replies {
            let masters = masters?;
            if !shards.iter().all(|shard| masters.contains(shard)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Register the shards of the given cluster which are not yet monitored with every Sentinel.
    ///
    /// Registered shards get the given monitor settings applied. Sentinels which fail are
    /// tolerated as long as a majority of the pool succeeds. Returns the names of the shards
    /// newly registered with at least one Sentinel.
    #[tracing::instrument(level = "debug", skip(self, cluster, config))]
    pub async fn monitor(&self, cluster: &ShardedCluster, config: Option<&SentinelMonitorConfig>) -> Result<Vec<String>> {
        let mut masters = Vec::with_capacity(cluster.shards.len());
        for shard in cluster.shards.iter() {
            match shard.master() {
                Some(master) => masters.push((shard.name.as_str(), &master.addr)),
                None => bail!("shard {} has no master, can not register it for monitoring", shard.name),
            }
        }
        let settings = config.map(|config| config.settings()).unwrap_or_default();

        let results = join_all(
            self.sentinels
                .iter()
                .map(|(addr, client)| monitor_shards(addr, client.as_ref(), &masters, &settings)),
        )
        .await;

        let (mut registered, mut errors) = (BTreeSet::new(), vec![]);
        for res in results {
            match res {
                Ok(shards) => registered.extend(shards),
                Err(err) => errors.push(err),
            }
        }
        let (successes, quorum) = (self.sentinels.len() - errors.len(), self.sentinels.len() / 2 + 1);
        for err in errors.iter() {
            tracing::warn!(error = ?err, "error registering shards with sentinel");
        }
        if successes < quorum {
            bail!("only {} of {} sentinels registered the shards, {} needed", successes, self.sentinels.len(), quorum);
        }
        Ok(registered.into_iter().collect())
    }

    /// The shards monitored by the pool, with their servers as seen by the Sentinels.
    ///
    /// This is read from the first Sentinel which answers.
    pub async fn monitored_shards(&self) -> Result<Vec<MonitoredShard>> {
        let mut last_err = None;
        for (addr, client) in self.sentinels.iter() {
            match read_monitored_shards(client.as_ref()).await {
                Ok(shards) => return Ok(shards),
                Err(err) => {
                    tracing::warn!(error = ?err, sentinel = %addr, "error reading monitored shards from sentinel");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) => Err(err.context("no sentinel of the pool could be queried")),
            None => bail!("no sentinel of the pool could be queried"),
        }
    }
}

async fn monitored_names(client: &dyn RedisClient) -> Result<BTreeSet<String>> {
    let masters = client.sentinel_masters().await?;
    Ok(masters.into_iter().filter_map(|mut master| master.remove("name")).collect())
}

async fn monitor_shards(addr: &ServerAddr, client: &dyn RedisClient, masters: &[(&str, &ServerAddr)], settings: &[(&'static str, String)]) -> Result<Vec<String>> {
    let monitored = monitored_names(client).await.with_context(|| format!("error querying sentinel {}", addr))?;
    let mut registered = vec![];
    for (shard, master) in masters.iter().filter(|(shard, _)| !monitored.contains(*shard)) {
        client
            .sentinel_monitor(shard, &master.host, master.port, DEFAULT_QUORUM)
            .await
            .with_context(|| format!("error registering shard {} with sentinel {}", shard, addr))?;
        for (key, value) in settings {
            client
                .sentinel_set(shard, key, value)
                .await
                .with_context(|| format!("error setting {} of shard {} on sentinel {}", key, shard, addr))?;
        }
        tracing::info!(shard, sentinel = %addr, master = %master, "registered shard with sentinel");
        registered.push(shard.to_string());
    }
    Ok(registered)
}

async fn read_monitored_shards(client: &dyn RedisClient) -> Result<Vec<MonitoredShard>> {
    let mut masters = client.sentinel_masters().await.context("error listing sentinel masters")?;
    masters.sort_by(|a, b| a.get("name").cmp(&b.get("name")));
    let mut shards = Vec::with_capacity(masters.len());
    for master in masters {
        let name = match master.get("name") {
            Some(name) => name.clone(),
            None => continue,
        };
        let mut servers = BTreeMap::new();
        if let Some((id, server)) = monitored_server(&master, "master") {
            servers.insert(id, server);
        }
        let replicas = client.sentinel_replicas(&name).await.with_context(|| format!("error listing replicas of {}", name))?;
        for replica in replicas {
            if let Some((id, server)) = monitored_server(&replica, "slave") {
                servers.insert(id, server);
            }
        }
        shards.push(MonitoredShard { name, servers });
    }
    Ok(shards)
}

fn monitored_server(info: &HashMap<String, String>, role: &str) -> Option<(String, MonitoredServer)> {
    let (ip, port) = (info.get("ip")?, info.get("port")?);
    let config = REPORTED_FIELDS
        .iter()
        .filter_map(|field| info.get(*field).map(|val| (field.to_string(), val.clone())))
        .collect();
    Some((format!("{}:{}", ip, port), MonitoredServer { role: role.into(), config }))
}
