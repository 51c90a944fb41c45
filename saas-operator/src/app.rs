use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::backup::BackupRunner;
use crate::config::Config;
use crate::k8s::{BackupReconciler, Controller, SentinelReconciler};
use crate::redis::{Connector, RedisConnector};
use crate::sentinel::EventWatcher;
use crate::threads::ThreadManager;

/// The application object of the operator.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// The event watchers of all Sentinel objects.
    watchers: ThreadManager<EventWatcher>,
    /// The backup runners of all ShardedRedisBackup objects.
    runners: ThreadManager<BackupRunner>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the Sentinel controller.
    sentinel_handle: JoinHandle<Result<()>>,
    /// The join handle of the ShardedRedisBackup controller.
    backup_handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;
        let connector: Arc<dyn Connector> = Arc::new(RedisConnector::new(config.redis_timeout()));

        // Background workers request reconciles of their owner through these channels.
        let (sentinel_notify_tx, sentinel_notify_rx) = mpsc::channel(config.notification_queue_size);
        let (backup_notify_tx, backup_notify_rx) = mpsc::channel(config.notification_queue_size);
        let watchers = ThreadManager::new(sentinel_notify_tx);
        let runners = ThreadManager::new(backup_notify_tx);

        let sentinels = SentinelReconciler::new(client.clone(), config.clone(), connector.clone(), watchers.clone());
        let sentinel_handle = Controller::new(client.clone(), config.clone(), Arc::new(sentinels), sentinel_notify_rx, shutdown_tx.subscribe()).spawn();

        let backups = BackupReconciler::new(client.clone(), config.clone(), connector, runners.clone());
        let backup_handle = Controller::new(client, config.clone(), Arc::new(backups), backup_notify_rx, shutdown_tx.subscribe()).spawn();

        Ok(Self {
            _config: config,
            watchers,
            runners,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            sentinel_handle,
            backup_handle,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("SaaS operator is shutting down");
        if let Err(err) = self.sentinel_handle.await.context("error joining sentinel controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down sentinel controller");
        }
        if let Err(err) = self.backup_handle.await.context("error joining backup controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down backup controller");
        }
        let stopped = self.watchers.cleanup_all().await + self.runners.cleanup_all().await;
        if stopped > 0 {
            tracing::warn!(stopped, "stopped background threads left behind by controllers");
        }

        tracing::debug!("SaaS operator shutdown complete");
        Ok(())
    }
}
