//! Kubernetes controllers.
//!
//! A `Controller` watches the objects of a single CRD, caches the latest version of each object
//! and drives a `Reconciler` over them. Reconcile passes are level triggered: they are requested
//! on object changes, on notifications from background workers & on the requeue delay returned by
//! the previous pass.

mod backup;
mod queue;
mod sentinel;

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::error::AppError;
use crate::k8s::queue::WorkQueue;
use saas_core::crd::RequiredMetadata;

pub use backup::BackupReconciler;
pub use sentinel::SentinelReconciler;

/// The timeout applied to K8s API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The delay before handling watch events again after a watcher error.
const WATCHER_ERROR_DELAY: Duration = Duration::from_secs(10);

/// The namespace & name identifying an object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn from_object<K: RequiredMetadata>(obj: &K) -> Self {
        Self::new(obj.namespace(), obj.name())
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The action to take once a reconcile pass is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Reconcile again after the given delay.
    Requeue(Duration),
    /// Reconcile again only on the next change or notification.
    AwaitChange,
}

/// The reconcile logic of a controller.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Resource: Resource<DynamicType = ()> + RequiredMetadata + Clone + Debug + DeserializeOwned + PartialEq + Send + Sync + 'static;

    /// Bring the world in line with the given object.
    async fn reconcile(&self, obj: Arc<Self::Resource>) -> Result<Action>;

    /// Release everything held for an object which no longer exists.
    async fn cleanup(&self, key: &ObjectKey);
}

/// A task delivered to the controller loop.
enum ControllerTask {
    /// A delayed reconcile request, valid only if the key is still at the given generation.
    Requeue(ObjectKey, u64),
    /// The result of a reconcile pass.
    PassDone(ObjectKey, Result<Action>),
}

/// A controller driving a reconciler over the objects of a CRD.
pub struct Controller<R: Reconciler> {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    reconciler: Arc<R>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// Reconcile requests from background workers.
    notifications: ReceiverStream<ObjectKey>,

    tasks_tx: mpsc::Sender<ControllerTask>,
    tasks_rx: ReceiverStream<ControllerTask>,

    /// All known objects of the CRD.
    objects: HashMap<ObjectKey, Arc<R::Resource>>,
    queue: WorkQueue,
    /// The handles of the passes in flight.
    passes: HashMap<ObjectKey, JoinHandle<()>>,
    /// Deleted objects whose cleanup waits for their pass in flight.
    deleting: HashSet<ObjectKey>,
}

impl<R: Reconciler> Controller<R> {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, reconciler: Arc<R>, notifications: mpsc::Receiver<ObjectKey>, shutdown: broadcast::Receiver<()>) -> Self {
        let (tasks_tx, tasks_rx) = mpsc::channel(1000);
        Self {
            client,
            config,
            reconciler,
            shutdown_rx: BroadcastStream::new(shutdown),
            notifications: ReceiverStream::new(notifications),
            tasks_tx,
            tasks_rx: ReceiverStream::new(tasks_rx),
            objects: Default::default(),
            queue: Default::default(),
            passes: Default::default(),
            deleting: Default::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let api: Api<R::Resource> = if self.config.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.config.namespace)
        };
        let objects_watcher = watcher(api, ListParams::default());
        tokio::pin!(objects_watcher);

        let kind = R::Resource::kind(&());
        tracing::info!(%kind, "k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = objects_watcher.next() => self.handle_k8s_event(k8s_event_res).await,
                Some(key) = self.notifications.next() => {
                    tracing::debug!(%key, "reconcile requested by background thread");
                    self.request_pass(&key);
                }
                Some(task) = self.tasks_rx.next() => self.handle_task(task).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!(%kind, "k8s controller shutting down");
        for (key, handle) in self.passes.drain() {
            if let Err(err) = handle.await {
                tracing::error!(error = ?err, %key, "error joining reconcile pass");
            }
        }
        for key in self.objects.keys().chain(self.deleting.iter()) {
            self.reconciler.cleanup(key).await;
        }

        tracing::debug!(%kind, "k8s controller shutdown");
        Ok(())
    }

    /// Handle watcher events coming from K8s.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_k8s_event(&mut self, res: std::result::Result<Event<R::Resource>, WatcherError>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from k8s watch stream");
                let _ = tokio::time::sleep(WATCHER_ERROR_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.object_applied(obj),
            Event::Deleted(obj) => self.object_deleted(ObjectKey::from_object(&obj)),
            Event::Restarted(objs) => {
                tracing::debug!("k8s watcher restarted");
                let keys: HashSet<ObjectKey> = objs.iter().map(ObjectKey::from_object).collect();
                let gone: Vec<ObjectKey> = self.objects.keys().filter(|key| !keys.contains(*key)).cloned().collect();
                for key in gone {
                    self.object_deleted(key);
                }
                for obj in objs {
                    self.object_applied(obj);
                }
            }
        }
    }

    fn object_applied(&mut self, obj: R::Resource) {
        let key = ObjectKey::from_object(&obj);
        if self.objects.get(&key).map(|old| old.as_ref() == &obj).unwrap_or(false) {
            return;
        }
        self.objects.insert(key.clone(), Arc::new(obj));
        self.request_pass(&key);
    }

    fn object_deleted(&mut self, key: ObjectKey) {
        if self.objects.remove(&key).is_none() {
            return;
        }
        tracing::info!(%key, "object deleted");
        self.queue.forget(&key);
        if self.queue.is_in_flight(&key) {
            self.deleting.insert(key);
            return;
        }
        self.spawn_cleanup(key);
    }

    async fn handle_task(&mut self, task: ControllerTask) {
        match task {
            ControllerTask::Requeue(key, generation) => {
                if self.queue.is_current(&key, generation) {
                    self.request_pass(&key);
                }
            }
            ControllerTask::PassDone(key, res) => {
                if let Some(handle) = self.passes.remove(&key) {
                    if let Err(err) = handle.await {
                        tracing::error!(error = ?err, %key, "error joining reconcile pass");
                    }
                }
                if self.deleting.remove(&key) {
                    self.spawn_cleanup(key.clone());
                    if self.queue.finish(&key) {
                        self.spawn_pass(key);
                    }
                    return;
                }
                match res {
                    Ok(Action::Requeue(delay)) => self.spawn_requeue(&key, delay),
                    Ok(Action::AwaitChange) => (),
                    Err(err) => {
                        tracing::error!(error = ?err, %key, "error reconciling object");
                        self.spawn_requeue(&key, self.config.error_requeue());
                    }
                }
                if self.queue.finish(&key) {
                    self.spawn_pass(key);
                }
            }
        }
    }

    fn request_pass(&mut self, key: &ObjectKey) {
        if !self.objects.contains_key(key) {
            return;
        }
        if self.queue.request(key) {
            self.spawn_pass(key.clone());
        }
    }

    fn spawn_pass(&mut self, key: ObjectKey) {
        let obj = match self.objects.get(&key) {
            Some(obj) => obj.clone(),
            None => {
                self.queue.finish(&key);
                return;
            }
        };
        let (reconciler, tx) = (self.reconciler.clone(), self.tasks_tx.clone());
        let pass_key = key.clone();
        let handle = tokio::spawn(async move {
            tracing::debug!(key = %pass_key, "reconciling object");
            let res = reconciler.reconcile(obj).await;
            let _res = tx.send(ControllerTask::PassDone(pass_key, res)).await;
        });
        self.passes.insert(key, handle);
    }

    /// Spawn a task which requests a new pass of the given key after the given delay.
    ///
    /// The request is dropped if another pass of the key starts in the meantime.
    fn spawn_requeue(&self, key: &ObjectKey, delay: Duration) {
        let (tx, generation, key) = (self.tasks_tx.clone(), self.queue.generation(key), key.clone());
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _res = tx.send(ControllerTask::Requeue(key, generation)).await;
        });
    }

    fn spawn_cleanup(&self, key: ObjectKey) {
        let reconciler = self.reconciler.clone();
        tokio::spawn(async move {
            reconciler.cleanup(&key).await;
            tracing::debug!(%key, "object cleanup complete");
        });
    }
}

/// Build the JSON merge patch replacing the status of the given object.
///
/// The patch carries the resource version of the object, so it is rejected with a conflict when
/// the object changed since it was read.
pub fn status_patch<K: Resource, S: Serialize>(obj: &K, status: &S) -> serde_json::Value {
    match obj.meta().resource_version.as_deref() {
        Some(version) => serde_json::json!({ "metadata": { "resourceVersion": version }, "status": status }),
        None => serde_json::json!({ "status": status }),
    }
}

/// Patch the status subresource of the given object, failing if the object changed since it was read.
#[tracing::instrument(level = "debug", skip(client, obj, status), fields(name = obj.name()))]
pub async fn patch_status<K, S>(client: Client, obj: &K, status: &S) -> Result<()>
where
    K: Resource<DynamicType = ()> + RequiredMetadata + Clone + Debug + DeserializeOwned,
    S: Serialize,
{
    let api: Api<K> = Api::namespaced(client, obj.namespace());
    let patch = status_patch(obj, status);
    let res = timeout(API_TIMEOUT, api.patch_status(obj.name(), &PatchParams::default(), &Patch::Merge(&patch)))
        .await
        .context("timeout while patching status")?;
    match res {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 409 => Err(anyhow::anyhow!("status of {} changed since it was read", obj.name())),
        Err(err) => Err(err).context("error patching status"),
    }
}

/// Fetch the latest version of the given object.
pub async fn fetch_latest<K>(client: Client, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + RequiredMetadata + Clone + Debug + DeserializeOwned,
{
    let api: Api<K> = Api::namespaced(client, obj.namespace());
    let res = timeout(API_TIMEOUT, api.get(obj.name())).await.context("timeout while fetching object")?;
    match res {
        Ok(latest) => Ok(latest),
        Err(kube::Error::Api(err)) if err.code == 404 => Err(AppError::ResourceNotFound(format!("{}/{}", obj.namespace(), obj.name())).into()),
        Err(err) => Err(err).context("error fetching object"),
    }
}

/// Fetch the given key of the given Secret.
pub async fn read_secret_key(client: Client, namespace: &str, secret: &str, key: &str) -> Result<Vec<u8>> {
    let api: Api<Secret> = Api::namespaced(client, namespace);
    let res = timeout(API_TIMEOUT, api.get(secret)).await.context("timeout while fetching secret")?;
    let obj = match res {
        Ok(obj) => obj,
        Err(kube::Error::Api(err)) if err.code == 404 => return Err(AppError::ResourceNotFound(format!("Secret {}/{}", namespace, secret)).into()),
        Err(err) => return Err(err).context("error fetching secret"),
    };
    Ok(secret_key(&obj, secret, key)?)
}

/// Extract the given key of the given Secret.
pub fn secret_key(obj: &Secret, secret: &str, key: &str) -> Result<Vec<u8>, AppError> {
    obj.data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|val| val.0.clone())
        .ok_or_else(|| AppError::MissingCredential { secret: secret.into(), key: key.into() })
}
