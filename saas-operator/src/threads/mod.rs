//! Lifecycle management of long-lived background workers.
//!
//! Workers are owned by a reconciled object. On each reconcile pass the controller declares the
//! set of workers the object needs, and the `ThreadManager` starts the missing ones & stops the
//! ones no longer needed. Workers request a new reconcile of their owner through a `Notifier`,
//! which is also raised automatically when a worker exits.


use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::k8s::ObjectKey;

/// A long-lived background worker.
#[async_trait]
pub trait RunnableThread: Send + Sync + 'static {
    /// The identifier of this worker, unique among the workers of an owner.
    fn id(&self) -> String;

    /// Run this worker until it is done or a shutdown signal is received.
    async fn run(self: Arc<Self>, shutdown: broadcast::Receiver<()>, notifier: Notifier) -> Result<()>;
}

/// A handle used by workers to request a reconcile of their owner.
#[derive(Clone)]
pub struct Notifier {
    owner: ObjectKey,
    tx: mpsc::Sender<ObjectKey>,
}

impl Notifier {
    pub fn new(owner: ObjectKey, tx: mpsc::Sender<ObjectKey>) -> Self {
        Self { owner, tx }
    }

    /// Request a reconcile of the owner.
    ///
    /// When the queue is full a reconcile is already pending, so the request is dropped.
    pub fn notify(&self) {
        match self.tx.try_send(self.owner.clone()) {
            Ok(()) => (),
            Err(mpsc::error::TrySendError::Full(_)) => tracing::debug!(owner = %self.owner, "notification queue full, dropping notification"),
            Err(mpsc::error::TrySendError::Closed(_)) => tracing::debug!(owner = %self.owner, "notification queue closed"),
        }
    }
}

/// A worker along with its control handles.
struct ManagedThread<T> {
    thread: Arc<T>,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

type Registry<T> = Arc<Mutex<HashMap<ObjectKey, HashMap<String, ManagedThread<T>>>>>;

/// A supervisor of background workers keyed by owner & worker ID.
pub struct ThreadManager<T: RunnableThread> {
    registry: Registry<T>,
    notify_tx: mpsc::Sender<ObjectKey>,
}

impl<T: RunnableThread> Clone for ThreadManager<T> {
    fn clone(&self) -> Self {
        Self { registry: self.registry.clone(), notify_tx: self.notify_tx.clone() }
    }
}

impl<T: RunnableThread> ThreadManager<T> {
    /// Create a new instance publishing worker notifications on the given channel.
    pub fn new(notify_tx: mpsc::Sender<ObjectKey>) -> Self {
        Self { registry: Default::default(), notify_tx }
    }

    /// Bring the running workers of the given owner in line with the desired set.
    ///
    /// Workers whose ID is not yet running are started, running workers missing from the desired
    /// set are stopped & awaited, and all other workers are left untouched.
    #[tracing::instrument(level = "debug", skip(self, desired), fields(owner = %owner))]
    pub async fn reconcile_threads(&self, owner: &ObjectKey, desired: Vec<Arc<T>>) {
        let mut removed = vec![];
        {
            let mut registry = self.registry.lock().await;
            let threads = registry.entry(owner.clone()).or_default();

            let desired_ids: Vec<String> = desired.iter().map(|thread| thread.id()).collect();
            let stale: Vec<String> = threads.keys().filter(|id| !desired_ids.contains(id)).cloned().collect();
            for id in stale {
                if let Some(managed) = threads.remove(&id) {
                    removed.push((id, managed));
                }
            }

            for thread in desired {
                let id = thread.id();
                if threads.contains_key(&id) {
                    continue;
                }
                tracing::debug!(thread = %id, "starting background thread");
                let managed = self.start(owner, thread);
                threads.insert(id, managed);
            }

            if threads.is_empty() {
                registry.remove(owner);
            }
        }

        // Stopped workers are awaited after releasing the lock.
        for (id, managed) in removed {
            tracing::debug!(thread = %id, "stopping background thread");
            Self::stop(managed).await;
        }
    }

    /// Stop every worker of the given owner, awaiting their exit.
    #[tracing::instrument(level = "debug", skip(self), fields(owner = %owner))]
    pub async fn cleanup_threads(&self, owner: &ObjectKey) {
        let threads = self.registry.lock().await.remove(owner).unwrap_or_default();
        for (id, managed) in threads {
            tracing::debug!(thread = %id, "stopping background thread");
            Self::stop(managed).await;
        }
    }

    /// Stop every remaining worker of every owner, returning the number of workers stopped.
    pub async fn cleanup_all(&self) -> usize {
        let owners: Vec<_> = self.registry.lock().await.drain().collect();
        let mut stopped = 0;
        for (owner, threads) in owners {
            for (id, managed) in threads {
                tracing::debug!(%owner, thread = %id, "stopping background thread");
                Self::stop(managed).await;
                stopped += 1;
            }
        }
        stopped
    }

    /// Get a running worker of the given owner by ID.
    pub async fn get_thread(&self, owner: &ObjectKey, id: &str) -> Option<Arc<T>> {
        let registry = self.registry.lock().await;
        registry.get(owner).and_then(|threads| threads.get(id)).map(|managed| managed.thread.clone())
    }

    /// The IDs of the workers of the given owner.
    pub async fn thread_ids(&self, owner: &ObjectKey) -> Vec<String> {
        let registry = self.registry.lock().await;
        let mut ids: Vec<String> = registry.get(owner).map(|threads| threads.keys().cloned().collect()).unwrap_or_default();
        ids.sort();
        ids
    }

    fn start(&self, owner: &ObjectKey, thread: Arc<T>) -> ManagedThread<T> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let notifier = Notifier::new(owner.clone(), self.notify_tx.clone());
        let (worker, id) = (thread.clone(), thread.id());
        let handle = tokio::spawn(async move {
            if let Err(err) = worker.run(shutdown_rx, notifier.clone()).await {
                tracing::error!(error = ?err, thread = %id, "background thread exited with error");
            } else {
                tracing::debug!(thread = %id, "background thread exited");
            }
            notifier.notify();
        });
        ManagedThread { thread, shutdown_tx, handle }
    }

    async fn stop(managed: ManagedThread<T>) {
        let _ = managed.shutdown_tx.send(());
        if let Err(err) = managed.handle.await {
            tracing::error!(error = ?err, "error joining background thread");
        }
    }
}
