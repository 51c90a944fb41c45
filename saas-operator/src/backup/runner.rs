use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::backup::BackupBackends;
use crate::redis::RedisServer;
use crate::threads::{Notifier, RunnableThread};

/// Settings of a single backup run.
#[derive(Clone, Debug)]
pub struct BackupOptions {
    /// The path of the database file on the replica host.
    pub db_file: String,
    /// The interval at which the completion of the save is checked.
    pub poll_interval: Duration,
    /// The max duration of the whole backup.
    pub timeout: Duration,
    /// Run the remote command through `sudo`.
    pub sudo: bool,
    /// The key prefix under which the artifact is stored.
    pub s3_path: String,
}

/// The observable status of a backup run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunnerStatus {
    pub finished: bool,
    pub error: Option<String>,
    pub backup_file: Option<String>,
    pub backup_size: Option<i64>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The ID of the runner of the backup of the given shard scheduled at the given time.
pub fn runner_id(shard: &str, scheduled_for: DateTime<Utc>) -> String {
    format!("backup-runner-{}-{}", shard, scheduled_for.timestamp())
}

/// A worker running a single backup of a shard from one of its replicas.
pub struct BackupRunner {
    shard: String,
    server: RedisServer,
    scheduled_for: DateTime<Utc>,
    options: BackupOptions,
    backends: BackupBackends,
    status: ArcSwap<RunnerStatus>,
}

impl BackupRunner {
    pub fn new(shard: String, server: RedisServer, scheduled_for: DateTime<Utc>, options: BackupOptions, backends: BackupBackends) -> Self {
        Self {
            shard,
            server,
            scheduled_for,
            options,
            backends,
            status: ArcSwap::from_pointee(RunnerStatus::default()),
        }
    }

    /// A snapshot of the status of this run.
    pub fn status(&self) -> Arc<RunnerStatus> {
        self.status.load_full()
    }

    /// The object key of the artifact produced at the given time.
    fn artifact_key(&self, at: DateTime<Utc>) -> String {
        let file = format!("redis-backup_{}_{}_{}.rdb.gz", self.shard, self.server.alias, at.format("%Y-%m-%dT%H:%M:%SZ"));
        match self.options.s3_path.trim_matches('/') {
            "" => file,
            path => format!("{}/{}", path, file),
        }
    }

    /// The remote command streaming the compressed database file to stdout.
    fn dump_command(&self) -> String {
        let cmd = format!("gzip -c '{}'", self.options.db_file.replace('\'', r"'\''"));
        if self.options.sudo {
            format!("sudo -n {}", cmd)
        } else {
            cmd
        }
    }

    /// Run the backup, returning the location & size of the artifact.
    async fn backup(&self) -> Result<(String, i64)> {
        let client = self.backends.redis.client(&self.server.addr)?;

        let last_save = client.lastsave().await.context("error reading last save time")?;
        client.bgsave().await.context("error triggering background save")?;
        tracing::debug!(last_save, "background save started");
        loop {
            tokio::time::sleep(self.options.poll_interval).await;
            let current = client.lastsave().await.context("error reading last save time")?;
            if current > last_save {
                tracing::debug!(last_save = current, "background save completed");
                break;
            }
            // LASTSAVE has a resolution of one second, so a save finishing within the second of
            // the previous one only shows in INFO.
            let state = client.save_state().await.context("error reading persistence info")?;
            if !state.in_progress {
                if !state.last_ok {
                    bail!("background save failed on {}", self.server.addr);
                }
                tracing::debug!(last_save = current, "background save completed within the second of the previous one");
                break;
            }
        }

        let artifact = self
            .backends
            .shell
            .exec(&self.server.addr.host, &self.dump_command())
            .await
            .context("error reading database file")?;
        if artifact.is_empty() {
            bail!("remote database file {} produced an empty artifact", self.options.db_file);
        }
        let size = artifact.len() as i64;
        // TODO: stream the artifact to the store through a multipart upload rather than buffering it.
        let location = self
            .backends
            .store
            .put(&self.artifact_key(Utc::now()), artifact)
            .await
            .context("error uploading backup artifact")?;
        Ok((location, size))
    }
}

#[async_trait]
impl RunnableThread for BackupRunner {
    fn id(&self) -> String {
        runner_id(&self.shard, self.scheduled_for)
    }

    /// Run the backup. The owner is notified by the thread manager once this returns.
    #[tracing::instrument(level = "debug", skip(self, shutdown, _notifier), fields(shard = %self.shard, server = %self.server.addr))]
    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>, _notifier: Notifier) -> Result<()> {
        tracing::info!(scheduled_for = %self.scheduled_for, "backup started");
        let res = tokio::select! {
            res = tokio::time::timeout(self.options.timeout, self.backup()) => match res {
                Ok(res) => res,
                Err(_) => Err(anyhow::anyhow!("backup timed out after {:?}", self.options.timeout)),
            },
            _ = shutdown.recv() => Err(anyhow::anyhow!("backup cancelled")),
        };

        let mut status = RunnerStatus {
            finished: true,
            finished_at: Some(Utc::now()),
            ..Default::default()
        };
        match res {
            Ok((location, size)) => {
                tracing::info!(backup_file = %location, backup_size = size, "backup completed");
                status.backup_file = Some(location);
                status.backup_size = Some(size);
            }
            Err(err) => {
                tracing::error!(error = ?err, "backup failed");
                status.error = Some(format!("{:#}", err));
            }
        }
        self.status.store(Arc::new(status));
        Ok(())
    }
}
