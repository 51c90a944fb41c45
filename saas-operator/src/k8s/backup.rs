use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::Api;
use kube::client::Client;
use saas_core::crd::{BackupState, RequiredMetadata, Sentinel, ShardedRedisBackup, ShardedRedisBackupSpec, ShardedRedisBackupStatus};
use tokio::time::timeout;

use crate::backup::{next_run, reconcile_backup_list, runner_id, BackupBackends, BackupOptions, BackupRunner, S3Store, SshShell};
use crate::config::Config;
use crate::error::AppError;
use crate::k8s::{fetch_latest, patch_status, read_secret_key, Action, ObjectKey, Reconciler, API_TIMEOUT};
use crate::redis::{Connector, ShardedCluster};
use crate::threads::ThreadManager;

/// The Secret key holding the SSH private key.
const KEY_PRIVATE_KEY: &str = "privateKey";
/// The Secret key holding the S3 access key ID.
const KEY_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
/// The Secret key holding the S3 secret access key.
const KEY_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";

/// The inputs of a single pass over the backups of an object.
pub struct BackupPass<'a> {
    pub owner: &'a ObjectKey,
    pub spec: &'a ShardedRedisBackupSpec,
    pub cluster: &'a ShardedCluster,
    pub threads: &'a ThreadManager<BackupRunner>,
    pub backends: &'a BackupBackends,
    pub now: DateTime<Utc>,
    /// The delay before retrying dispatches which found no read-only replica.
    pub no_replica_requeue: Duration,
}

/// The outcome of a pass over the backups of an object.
#[derive(Debug, Default, PartialEq)]
pub struct PassOutcome {
    /// Whether the status was modified.
    pub changed: bool,
    /// The delay after which the object needs to be reconciled again.
    pub requeue_after: Option<Duration>,
}

/// Advance the backups of an object.
///
/// Running backups are finalized from the status of their runners, due backups are dispatched to
/// a read-only replica of their shard, the next backups are scheduled, the history is truncated &
/// finally the set of runners is brought in line with the running backups.
#[tracing::instrument(level = "debug", skip(status, pass), fields(owner = %pass.owner))]
pub async fn reconcile_backup_status(status: &mut ShardedRedisBackupStatus, pass: &BackupPass<'_>) -> Result<PassOutcome> {
    let (spec, now) = (pass.spec, pass.now);
    let backups = &mut status.backups;
    let shards = pass.cluster.shard_names();
    let mut outcome = PassOutcome::default();
    // Runners of backups running when the pass started stay registered until a pass starts
    // without them, so an outdated status finalizes them from the same runner status.
    let started: Vec<String> = backups
        .iter()
        .filter(|backup| backup.state == BackupState::Running)
        .map(|backup| runner_id(&backup.shard, backup.scheduled_for))
        .collect();

    // Finalize running backups.
    for backup in backups.iter_mut().filter(|backup| backup.state == BackupState::Running) {
        let server_id = backup.server_id.clone().unwrap_or_default();
        if pass.cluster.lookup_server(&server_id).is_none() {
            tracing::warn!(shard = %backup.shard, server = %server_id, "server of running backup is gone");
            backup.state = BackupState::Unknown;
            backup.message = format!("server {} is no longer part of the cluster", server_id);
            outcome.changed = true;
            continue;
        }
        let runner = match pass.threads.get_thread(pass.owner, &runner_id(&backup.shard, backup.scheduled_for)).await {
            Some(runner) => runner,
            None => {
                tracing::warn!(shard = %backup.shard, "runner of running backup not found");
                backup.state = BackupState::Unknown;
                backup.message = "backup runner not found".into();
                outcome.changed = true;
                continue;
            }
        };
        let runner_status = runner.status();
        if !runner_status.finished {
            continue;
        }
        backup.finished_at = runner_status.finished_at;
        match runner_status.error.as_ref() {
            Some(err) => {
                backup.state = BackupState::Failed;
                backup.message = err.clone();
            }
            None => {
                backup.state = BackupState::Completed;
                backup.message = "backup completed".into();
                backup.backup_file = runner_status.backup_file.clone();
                backup.backup_size = runner_status.backup_size;
            }
        }
        tracing::info!(shard = %backup.shard, state = %backup.state, "backup finished");
        outcome.changed = true;
    }

    // Dispatch due backups.
    let mut awaiting = HashSet::new();
    if !spec.pause {
        for shard in pass.cluster.shards.iter() {
            if backups.find_last(&shard.name, BackupState::Running).is_some() {
                continue;
            }
            let idx = match backups.position_last(&shard.name, BackupState::Pending) {
                Some(idx) if backups[idx].scheduled_for <= now => idx,
                _ => continue,
            };
            let backup = &mut backups[idx];
            match shard.ro_replicas().first() {
                Some(server) => {
                    tracing::info!(shard = %shard.name, server = %server.addr, "dispatching backup");
                    backup.state = BackupState::Running;
                    backup.server_alias = Some(server.alias.clone());
                    backup.server_id = Some(server.id());
                    backup.started_at = Some(now);
                    backup.message = "backup running".into();
                    outcome.changed = true;
                }
                None => {
                    tracing::warn!(shard = %shard.name, "no read-only replica available for backup");
                    let message = "no read-only replica available, retrying";
                    if backup.message != message {
                        backup.message = message.into();
                        outcome.changed = true;
                    }
                    awaiting.insert(shard.name.clone());
                    outcome.requeue_after = Some(pass.no_replica_requeue);
                }
            }
        }
    }

    // Schedule the next backups. Shards awaiting a replica keep their due backup.
    if !spec.pause {
        let next = next_run(&spec.schedule, now)?;
        let scheduled: Vec<String> = shards.iter().filter(|shard| !awaiting.contains(*shard)).cloned().collect();
        if reconcile_backup_list(backups, next, &scheduled) {
            outcome.changed = true;
        }
        let until_next = (next - now).to_std().unwrap_or_default();
        outcome.requeue_after = Some(outcome.requeue_after.map_or(until_next, |delay| delay.min(until_next)));
    }

    if backups.apply_history_limit(spec.history_limit.max(1) as usize, &shards) {
        outcome.changed = true;
    }

    // Bring the runners in line with the running backups.
    let options = BackupOptions {
        db_file: spec.db_file.clone(),
        poll_interval: Duration::from_secs(spec.poll_interval_seconds),
        timeout: Duration::from_secs(spec.timeout_seconds),
        sudo: spec.ssh_options.sudo,
        s3_path: spec.s3_options.path.clone(),
    };
    let (mut runners, mut desired) = (vec![], HashSet::new());
    for id in started {
        if let Some(runner) = pass.threads.get_thread(pass.owner, &id).await {
            desired.insert(id);
            runners.push(runner);
        }
    }
    for backup in backups.iter().filter(|backup| backup.state == BackupState::Running) {
        let id = runner_id(&backup.shard, backup.scheduled_for);
        if !desired.insert(id.clone()) {
            continue;
        }
        if let Some(runner) = pass.threads.get_thread(pass.owner, &id).await {
            runners.push(runner);
            continue;
        }
        let server = match backup.server_id.as_deref().and_then(|id| pass.cluster.lookup_server(id)) {
            Some(server) => server.clone(),
            None => continue,
        };
        runners.push(Arc::new(BackupRunner::new(backup.shard.clone(), server, backup.scheduled_for, options.clone(), pass.backends.clone())));
    }
    pass.threads.reconcile_threads(pass.owner, runners).await;

    Ok(outcome)
}

/// The reconciler of ShardedRedisBackup objects.
pub struct BackupReconciler {
    client: Client,
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    threads: ThreadManager<BackupRunner>,
}

impl BackupReconciler {
    pub fn new(client: Client, config: Arc<Config>, connector: Arc<dyn Connector>, threads: ThreadManager<BackupRunner>) -> Self {
        Self { client, config, connector, threads }
    }

    /// Build the backends of the given object from its referenced Secrets.
    async fn backends(&self, obj: &ShardedRedisBackup) -> Result<BackupBackends> {
        let (ns, ssh, s3) = (obj.namespace(), &obj.spec.ssh_options, &obj.spec.s3_options);
        let private_key = read_secret_key(self.client.clone(), ns, &ssh.private_key_secret_ref, KEY_PRIVATE_KEY).await?;
        let access_key_id = read_secret_key(self.client.clone(), ns, &s3.credentials_secret_ref, KEY_ACCESS_KEY_ID).await?;
        let secret_access_key = read_secret_key(self.client.clone(), ns, &s3.credentials_secret_ref, KEY_SECRET_ACCESS_KEY).await?;
        let access_key_id = String::from_utf8(access_key_id).context("invalid S3 access key ID")?.trim().to_string();
        let secret_access_key = String::from_utf8(secret_access_key).context("invalid S3 secret access key")?.trim().to_string();
        Ok(BackupBackends {
            redis: self.connector.clone(),
            shell: Arc::new(SshShell::new(ssh, &private_key, self.config.redis_timeout())?),
            store: Arc::new(S3Store::new(s3, &access_key_id, &secret_access_key)),
        })
    }

    /// Discover the servers of the shards monitored by the referenced Sentinel.
    async fn discover_cluster(&self, obj: &ShardedRedisBackup) -> Result<ShardedCluster> {
        let api: Api<Sentinel> = Api::namespaced(self.client.clone(), obj.namespace());
        let res = timeout(API_TIMEOUT, api.get(&obj.spec.sentinel_ref))
            .await
            .context("timeout while fetching sentinel")?;
        let sentinel = match res {
            Ok(sentinel) => sentinel,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                return Err(AppError::ResourceNotFound(format!("Sentinel {}/{}", obj.namespace(), obj.spec.sentinel_ref)).into())
            }
            Err(err) => return Err(err).context("error fetching sentinel"),
        };
        let shards = sentinel
            .status
            .as_ref()
            .map(|status| status.shard_addresses())
            .ok_or_else(|| anyhow::anyhow!("sentinel {} has not reported its shards yet", obj.spec.sentinel_ref))?;
        ShardedCluster::discover(self.connector.as_ref(), &shards, vec![]).await
    }
}

#[async_trait]
impl Reconciler for BackupReconciler {
    type Resource = ShardedRedisBackup;

    #[tracing::instrument(level = "debug", skip(self, obj), fields(key = %ObjectKey::from_object(obj.as_ref())))]
    async fn reconcile(&self, obj: Arc<ShardedRedisBackup>) -> Result<Action> {
        let key = ObjectKey::from_object(obj.as_ref());
        // The cached object may predate the status written by the previous pass.
        let obj = fetch_latest(self.client.clone(), obj.as_ref()).await?;
        let backends = self.backends(&obj).await?;
        let cluster = self.discover_cluster(&obj).await?;

        let mut status = obj.status.clone().unwrap_or_default();
        let pass = BackupPass {
            owner: &key,
            spec: &obj.spec,
            cluster: &cluster,
            threads: &self.threads,
            backends: &backends,
            now: Utc::now(),
            no_replica_requeue: self.config.no_replica_requeue(),
        };
        let outcome = reconcile_backup_status(&mut status, &pass).await?;

        if outcome.changed || obj.status.is_none() {
            tracing::debug!("updating backup status");
            patch_status(self.client.clone(), &obj, &status).await?;
        }
        // Paused objects only need polling of their runners, which notify when they exit.
        if obj.spec.pause {
            return Ok(Action::AwaitChange);
        }
        let resync = self.config.resync();
        Ok(Action::Requeue(outcome.requeue_after.map_or(resync, |delay| delay.min(resync))))
    }

    async fn cleanup(&self, key: &ObjectKey) {
        self.threads.cleanup_threads(key).await;
    }
}
