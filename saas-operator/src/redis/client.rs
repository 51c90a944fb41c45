use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{FromRedisValue, InfoDict, Value};
use tokio::sync::Mutex;

use crate::redis::{Connector, RawEvent, RedisClient, Role, SaveState, ServerAddr};

/// A connector backed by live connections, caching one client per server address.
pub struct RedisConnector {
    timeout: Duration,
    clients: DashMap<String, Arc<LiveClient>>,
}

impl RedisConnector {
    /// Create a new instance applying the given timeout to connections & commands.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, clients: DashMap::new() }
    }
}

impl Connector for RedisConnector {
    fn client(&self, addr: &ServerAddr) -> Result<Arc<dyn RedisClient>> {
        let uri = addr.uri();
        if let Some(client) = self.clients.get(&uri) {
            return Ok(client.value().clone());
        }
        let client = redis::Client::open(uri.as_str()).with_context(|| format!("error building redis client for {}", uri))?;
        let client = self
            .clients
            .entry(uri)
            .or_insert_with(|| {
                Arc::new(LiveClient {
                    client,
                    timeout: self.timeout,
                    conn: Mutex::new(None),
                })
            })
            .value()
            .clone();
        Ok(client)
    }
}

/// A client holding a lazily opened multiplexed connection.
///
/// The connection is dropped on any command error, and opened again by the next command.
struct LiveClient {
    client: redis::Client,
    timeout: Duration,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl LiveClient {
    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut conn = self.conn.lock().await;
        if let Some(conn) = conn.as_ref() {
            return Ok(conn.clone());
        }
        let new_conn = tokio::time::timeout(self.timeout, self.client.get_multiplexed_tokio_connection())
            .await
            .context("timeout connecting to redis server")?
            .context("error connecting to redis server")?;
        *conn = Some(new_conn.clone());
        Ok(new_conn)
    }

    async fn query<T: FromRedisValue + Send>(&self, cmd: redis::Cmd) -> Result<T> {
        let mut conn = self.connection().await?;
        let res: Result<T> = match tokio::time::timeout(self.timeout, cmd.query_async::<_, T>(&mut conn)).await {
            Ok(res) => res.context("error executing redis command"),
            Err(_) => Err(anyhow::anyhow!("timeout executing redis command")),
        };
        if res.is_err() {
            *self.conn.lock().await = None;
        }
        res
    }
}

#[async_trait]
impl RedisClient for LiveClient {
    async fn role(&self) -> Result<Role> {
        let value: Value = self.query(redis::cmd("ROLE")).await?;
        let role = match value {
            Value::Bulk(items) => match items.first() {
                Some(first) => String::from_redis_value(first).context("error decoding ROLE reply")?,
                None => bail!("empty ROLE reply"),
            },
            other => bail!("unexpected ROLE reply {:?}", other),
        };
        Ok(Role::parse(&role))
    }

    async fn config_get(&self, parameter: &str) -> Result<Option<String>> {
        let mut cmd = redis::cmd("CONFIG");
        cmd.arg("GET").arg(parameter);
        let reply: HashMap<String, String> = self.query(cmd).await?;
        Ok(reply.get(parameter).cloned())
    }

    async fn bgsave(&self) -> Result<()> {
        let _: Value = self.query(redis::cmd("BGSAVE")).await?;
        Ok(())
    }

    async fn lastsave(&self) -> Result<i64> {
        self.query(redis::cmd("LASTSAVE")).await
    }

    async fn save_state(&self) -> Result<SaveState> {
        let mut cmd = redis::cmd("INFO");
        cmd.arg("persistence");
        let info: InfoDict = self.query(cmd).await?;
        let in_progress: i64 = info.get("rdb_bgsave_in_progress").context("INFO reply is missing rdb_bgsave_in_progress")?;
        let last_status: String = info.get("rdb_last_bgsave_status").context("INFO reply is missing rdb_last_bgsave_status")?;
        Ok(SaveState { in_progress: in_progress != 0, last_ok: last_status == "ok" })
    }

    async fn sentinel_masters(&self) -> Result<Vec<HashMap<String, String>>> {
        let mut cmd = redis::cmd("SENTINEL");
        cmd.arg("MASTERS");
        self.query(cmd).await
    }

    async fn sentinel_replicas(&self, shard: &str) -> Result<Vec<HashMap<String, String>>> {
        let mut cmd = redis::cmd("SENTINEL");
        cmd.arg("REPLICAS").arg(shard);
        self.query(cmd).await
    }

    async fn sentinel_monitor(&self, shard: &str, host: &str, port: u16, quorum: u32) -> Result<()> {
        let mut cmd = redis::cmd("SENTINEL");
        cmd.arg("MONITOR").arg(shard).arg(host).arg(port).arg(quorum);
        let _: Value = self.query(cmd).await?;
        Ok(())
    }

    async fn sentinel_set(&self, shard: &str, key: &str, value: &str) -> Result<()> {
        let mut cmd = redis::cmd("SENTINEL");
        cmd.arg("SET").arg(shard).arg(key).arg(value);
        let _: Value = self.query(cmd).await?;
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<BoxStream<'static, RawEvent>> {
        let mut pubsub = tokio::time::timeout(self.timeout, self.client.get_async_pubsub())
            .await
            .context("timeout opening pubsub connection")?
            .context("error opening pubsub connection")?;
        pubsub.psubscribe("*").await.context("error subscribing to sentinel events")?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(error = ?err, channel = msg.get_channel_name(), "dropping sentinel event with non-string payload");
                    return None;
                }
            };
            Some((msg.get_channel_name().to_string(), payload))
        });
        Ok(stream.boxed())
    }
}
