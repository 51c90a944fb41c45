use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use kube::client::Client;
use saas_core::crd::{Sentinel, SentinelSpec, SentinelStatus};

use crate::config::Config;
use crate::k8s::{patch_status, Action, ObjectKey, Reconciler};
use crate::redis::{Connector, ServerAddr, ShardedCluster};
use crate::sentinel::{EventWatcher, SentinelPool, RECONNECT_DELAY};
use crate::threads::ThreadManager;

/// The outcome of syncing a Sentinel pool with its shards.
#[derive(Debug, PartialEq)]
pub enum SentinelSync {
    /// Some servers of the shards could not be reached, nothing was changed.
    Incomplete,
    /// Every shard is monitored by the pool.
    Synced { status: SentinelStatus, sentinels: Vec<ServerAddr> },
}

/// Ensure the Sentinels of the given spec monitor all of its shards.
///
/// Shards are only registered once every one of their servers has been discovered.
#[tracing::instrument(level = "debug", skip(connector, spec))]
pub async fn sync_sentinels(connector: &dyn Connector, spec: &SentinelSpec) -> Result<SentinelSync> {
    let pool = SentinelPool::new(connector, &spec.sentinel_uris)?;
    let cluster = ShardedCluster::discover(connector, &spec.monitored_shards, pool.addresses()).await?;
    if !cluster.is_complete() {
        return Ok(SentinelSync::Incomplete);
    }

    let shards = cluster.shard_names();
    let monitoring = match pool.is_monitoring_shards(&shards).await {
        Ok(monitoring) => monitoring,
        Err(err) => {
            tracing::warn!(error = ?err, "error checking monitored shards");
            false
        }
    };
    if !monitoring {
        let registered = pool.monitor(&cluster, spec.monitor_config.as_ref()).await?;
        if !registered.is_empty() {
            tracing::info!(shards = ?registered, "shards registered with sentinels");
        }
    }

    let status = SentinelStatus {
        sentinels: cluster.sentinels.iter().map(|addr| addr.id()).collect(),
        monitored_shards: pool.monitored_shards().await?,
    };
    Ok(SentinelSync::Synced { status, sentinels: cluster.sentinels })
}

/// The reconciler of Sentinel objects.
pub struct SentinelReconciler {
    client: Client,
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    threads: ThreadManager<EventWatcher>,
}

impl SentinelReconciler {
    pub fn new(client: Client, config: Arc<Config>, connector: Arc<dyn Connector>, threads: ThreadManager<EventWatcher>) -> Self {
        Self { client, config, connector, threads }
    }
}

#[async_trait]
impl Reconciler for SentinelReconciler {
    type Resource = Sentinel;

    #[tracing::instrument(level = "debug", skip(self, obj), fields(key = %ObjectKey::from_object(obj.as_ref())))]
    async fn reconcile(&self, obj: Arc<Sentinel>) -> Result<Action> {
        let key = ObjectKey::from_object(obj.as_ref());
        let (status, sentinels) = match sync_sentinels(self.connector.as_ref(), &obj.spec).await? {
            SentinelSync::Synced { status, sentinels } => (status, sentinels),
            SentinelSync::Incomplete => {
                tracing::info!("shard discovery incomplete, retrying");
                return Ok(Action::Requeue(self.config.error_requeue()));
            }
        };

        let watchers = sentinels
            .into_iter()
            .map(|addr| Arc::new(EventWatcher::new(addr, self.connector.clone(), RECONNECT_DELAY)))
            .collect();
        self.threads.reconcile_threads(&key, watchers).await;

        if obj.status.as_ref() != Some(&status) {
            tracing::debug!("updating sentinel status");
            patch_status(self.client.clone(), obj.as_ref(), &status).await?;
        }
        Ok(Action::Requeue(self.config.resync()))
    }

    async fn cleanup(&self, key: &ObjectKey) {
        self.threads.cleanup_threads(key).await;
    }
}
