use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::StreamExt;
use tokio::sync::broadcast;

use crate::redis::{Connector, RedisEventMessage, ServerAddr};
use crate::threads::{Notifier, RunnableThread};

/// The delay before subscribing again after the subscription to a Sentinel was lost.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A worker subscribed to the event stream of a single Sentinel.
///
/// Events which reflect a topology change trigger a reconcile of the owning Sentinel resource.
pub struct EventWatcher {
    sentinel: ServerAddr,
    connector: Arc<dyn Connector>,
    reconnect_delay: Duration,
}

impl EventWatcher {
    pub fn new(sentinel: ServerAddr, connector: Arc<dyn Connector>, reconnect_delay: Duration) -> Self {
        Self { sentinel, connector, reconnect_delay }
    }

    /// Handle a raw notification, returning `true` if the owner must be reconciled.
    fn handle_event(&self, topic: &str, payload: &str) -> bool {
        // Sentinels gossip through hello messages on their own channel, these are not events.
        if topic.starts_with("__sentinel__") {
            return false;
        }
        match RedisEventMessage::decode(topic, payload) {
            Ok(event) => {
                tracing::info!(
                    sentinel = %self.sentinel,
                    event = %event.event,
                    target = ?event.target,
                    master = ?event.master,
                    config = ?event.config,
                    "sentinel event"
                );
                event.is_topology_change()
            }
            Err(err) => {
                tracing::warn!(sentinel = %self.sentinel, error = %err, "dropping undecodable sentinel event");
                false
            }
        }
    }
}

#[async_trait]
impl RunnableThread for EventWatcher {
    fn id(&self) -> String {
        format!("event-watcher-{}", self.sentinel)
    }

    #[tracing::instrument(level = "debug", skip(self, shutdown, notifier), fields(sentinel = %self.sentinel))]
    async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>, notifier: Notifier) -> Result<()> {
        tracing::debug!("event watcher started");
        loop {
            let subscription = match self.connector.client(&self.sentinel) {
                Ok(client) => {
                    tokio::select! {
                        res = client.subscribe_events() => res,
                        _ = shutdown.recv() => break,
                    }
                }
                Err(err) => Err(err),
            };
            match subscription {
                Ok(mut events) => loop {
                    tokio::select! {
                        event = events.next() => match event {
                            Some((topic, payload)) => {
                                if self.handle_event(&topic, &payload) {
                                    notifier.notify();
                                }
                            }
                            None => {
                                tracing::warn!("sentinel event subscription lost");
                                break;
                            }
                        },
                        _ = shutdown.recv() => {
                            tracing::debug!("event watcher stopped");
                            return Ok(());
                        }
                    }
                },
                Err(err) => tracing::warn!(error = ?err, "error subscribing to sentinel events"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => continue,
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("event watcher stopped");
        Ok(())
    }
}
