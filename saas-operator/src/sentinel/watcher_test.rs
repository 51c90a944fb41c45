use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};

use super::EventWatcher;
use crate::fixtures::{FakeConnector, FakeRedis};
use crate::k8s::ObjectKey;
use crate::redis::{Role, ServerAddr};
use crate::threads::{Notifier, RunnableThread};

const SENTINEL: &str = "sentinel-0:26379";

async fn wait_for_subscribers(sentinel: &FakeRedis, count: usize) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(1), async {
        while sentinel.subscribe_calls.load(Ordering::SeqCst) < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn watcher_notifies_on_topology_changes_only() -> Result<()> {
    let connector = FakeConnector::new();
    let sentinel = connector.add(SENTINEL, Role::Sentinel);
    let watcher = Arc::new(EventWatcher::new(ServerAddr::parse(SENTINEL)?, connector.clone(), Duration::from_millis(10)));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let (tx, mut rx) = mpsc::channel(10);
    let owner = ObjectKey::new("default", "sentinel");
    let handle = tokio::spawn(watcher.run(shutdown_rx, Notifier::new(owner.clone(), tx)));
    wait_for_subscribers(&sentinel, 1).await?;

    sentinel.publish("+new-epoch", "3").await;
    sentinel.publish("+monitor", "master shard01 10.244.0.24 6379").await;
    sentinel.publish("__sentinel__:hello", "10.0.0.9,26379,abc,3,shard01,10.0.0.1,6379,3").await;
    sentinel.publish("+switch-master", "shard01 10.244.0.36 6379 10.244.0.38 6379").await;

    let key = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
    assert_eq!(key, Some(owner), "expected a notification for the owner, got {:?}", key);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err(), "expected a single notification");

    let _ = shutdown_tx.send(());
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn watcher_resubscribes_after_connection_loss() -> Result<()> {
    let connector = FakeConnector::new();
    let sentinel = connector.add(SENTINEL, Role::Sentinel);
    let watcher = Arc::new(EventWatcher::new(ServerAddr::parse(SENTINEL)?, connector.clone(), Duration::from_millis(10)));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let (tx, mut rx) = mpsc::channel(10);
    let handle = tokio::spawn(watcher.run(shutdown_rx, Notifier::new(ObjectKey::new("default", "sentinel"), tx)));
    wait_for_subscribers(&sentinel, 1).await?;

    sentinel.drop_subscribers();
    wait_for_subscribers(&sentinel, 2).await?;
    sentinel.publish("+sdown", "master shard01 10.244.0.24 6379").await;

    let key = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
    assert!(key.is_some(), "expected a notification after resubscribing");

    let _ = shutdown_tx.send(());
    handle.await??;
    Ok(())
}
