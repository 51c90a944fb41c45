//! In-memory fakes of the Redis, SSH & object storage backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::backup::remote::{ObjectStore, RemoteShell};
use crate::redis::{Connector, RawEvent, RedisClient, Role, SaveState, ServerAddr};

/// A fake server answering the commands of `RedisClient`.
pub struct FakeRedis {
    pub reachable: AtomicBool,
    pub role: Mutex<Role>,
    pub config: Mutex<HashMap<String, String>>,
    /// The value returned by `LASTSAVE`.
    pub lastsave: AtomicI64,
    /// Whether `BGSAVE` completes, otherwise it stays in progress.
    pub bgsave_completes: AtomicBool,
    /// Whether a completed `BGSAVE` advances `LASTSAVE`, which it does not when it finishes within
    /// the same second as the previous save.
    pub lastsave_advances: AtomicBool,
    pub bgsave_calls: AtomicUsize,
    /// The masters reported by `SENTINEL MASTERS`, keyed by name, with their replicas.
    pub masters: Mutex<HashMap<String, (HashMap<String, String>, Vec<HashMap<String, String>>)>>,
    pub monitor_calls: AtomicUsize,
    pub set_calls: Mutex<Vec<(String, String, String)>>,
    /// Senders of the active event subscriptions.
    pub subscribers: Mutex<Vec<mpsc::Sender<RawEvent>>>,
    pub subscribe_calls: AtomicUsize,
}

impl FakeRedis {
    pub fn new(role: Role) -> Arc<Self> {
        let config = HashMap::from([("save".to_string(), "900 1".to_string()), ("slave-read-only".to_string(), "yes".to_string())]);
        Arc::new(Self {
            reachable: AtomicBool::new(true),
            role: Mutex::new(role),
            config: Mutex::new(config),
            lastsave: AtomicI64::new(1_700_000_000),
            bgsave_completes: AtomicBool::new(true),
            lastsave_advances: AtomicBool::new(true),
            bgsave_calls: AtomicUsize::new(0),
            masters: Mutex::new(HashMap::new()),
            monitor_calls: AtomicUsize::new(0),
            set_calls: Mutex::new(vec![]),
            subscribers: Mutex::new(vec![]),
            subscribe_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Publish an event to every active subscription.
    pub async fn publish(&self, topic: &str, payload: &str) {
        let subscribers = self.subscribers.lock().unwrap().clone();
        for tx in subscribers {
            let _ = tx.send((topic.into(), payload.into())).await;
        }
    }

    /// Drop every active subscription, ending their streams.
    pub fn drop_subscribers(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    fn check(&self) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl RedisClient for FakeRedis {
    async fn role(&self) -> Result<Role> {
        self.check()?;
        Ok(*self.role.lock().unwrap())
    }

    async fn config_get(&self, parameter: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.config.lock().unwrap().get(parameter).cloned())
    }

    async fn bgsave(&self) -> Result<()> {
        self.check()?;
        self.bgsave_calls.fetch_add(1, Ordering::SeqCst);
        if self.bgsave_completes.load(Ordering::SeqCst) && self.lastsave_advances.load(Ordering::SeqCst) {
            self.lastsave.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn lastsave(&self) -> Result<i64> {
        self.check()?;
        Ok(self.lastsave.load(Ordering::SeqCst))
    }

    async fn save_state(&self) -> Result<SaveState> {
        self.check()?;
        let started = self.bgsave_calls.load(Ordering::SeqCst) > 0;
        Ok(SaveState { in_progress: started && !self.bgsave_completes.load(Ordering::SeqCst), last_ok: true })
    }

    async fn sentinel_masters(&self) -> Result<Vec<HashMap<String, String>>> {
        self.check()?;
        Ok(self.masters.lock().unwrap().values().map(|(master, _)| master.clone()).collect())
    }

    async fn sentinel_replicas(&self, shard: &str) -> Result<Vec<HashMap<String, String>>> {
        self.check()?;
        match self.masters.lock().unwrap().get(shard) {
            Some((_, replicas)) => Ok(replicas.clone()),
            None => bail!("ERR No such master with that name"),
        }
    }

    async fn sentinel_monitor(&self, shard: &str, host: &str, port: u16, quorum: u32) -> Result<()> {
        self.check()?;
        self.monitor_calls.fetch_add(1, Ordering::SeqCst);
        let mut masters = self.masters.lock().unwrap();
        if masters.contains_key(shard) {
            bail!("ERR Duplicated master name");
        }
        let master = HashMap::from([
            ("name".to_string(), shard.to_string()),
            ("ip".to_string(), host.to_string()),
            ("port".to_string(), port.to_string()),
            ("quorum".to_string(), quorum.to_string()),
            ("flags".to_string(), "master".to_string()),
        ]);
        masters.insert(shard.into(), (master, vec![]));
        Ok(())
    }

    async fn sentinel_set(&self, shard: &str, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.set_calls.lock().unwrap().push((shard.into(), key.into(), value.into()));
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<BoxStream<'static, RawEvent>> {
        self.check()?;
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(100);
        self.subscribers.lock().unwrap().push(tx);
        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// A connector handing out registered fake servers.
#[derive(Default)]
pub struct FakeConnector {
    pub servers: Mutex<HashMap<ServerAddr, Arc<FakeRedis>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new fake server at the given `host:port` address.
    pub fn add(&self, addr: &str, role: Role) -> Arc<FakeRedis> {
        let server = FakeRedis::new(role);
        let addr = ServerAddr::parse(addr).unwrap();
        self.servers.lock().unwrap().insert(addr, server.clone());
        server
    }

    pub fn get(&self, addr: &str) -> Arc<FakeRedis> {
        let addr = ServerAddr::parse(addr).unwrap();
        self.servers.lock().unwrap().get(&addr).cloned().unwrap()
    }
}

impl Connector for FakeConnector {
    fn client(&self, addr: &ServerAddr) -> Result<Arc<dyn RedisClient>> {
        match self.servers.lock().unwrap().get(addr) {
            Some(server) => Ok(server.clone()),
            None => {
                // Servers which were never registered behave as if they were down.
                let server = FakeRedis::new(Role::Unknown);
                server.set_reachable(false);
                Ok(server)
            }
        }
    }
}

/// A fake remote shell returning a fixed output for every command.
pub struct FakeShell {
    pub output: Vec<u8>,
    pub fail: bool,
    /// Time spent executing each command.
    pub delay: Duration,
    pub commands: Mutex<Vec<(String, String)>>,
}

impl FakeShell {
    pub fn new(output: &[u8]) -> Arc<Self> {
        Arc::new(Self { output: output.to_vec(), fail: false, delay: Duration::ZERO, commands: Mutex::new(vec![]) })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { output: vec![], fail: true, delay: Duration::ZERO, commands: Mutex::new(vec![]) })
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn exec(&self, host: &str, command: &str) -> Result<Vec<u8>> {
        self.commands.lock().unwrap().push((host.into(), command.into()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            bail!("remote command exited with status 1: gzip: /data/dump.rdb: No such file or directory");
        }
        Ok(self.output.clone())
    }
}

/// A fake object store keeping uploaded objects in memory.
#[derive(Default)]
pub struct FakeStore {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<String> {
        self.objects.lock().unwrap().insert(key.into(), body);
        Ok(format!("s3://test-bucket/{}", key))
    }
}
