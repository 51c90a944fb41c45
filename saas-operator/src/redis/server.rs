use std::collections::BTreeMap;
use std::net::IpAddr;

use anyhow::{Context, Result};

use crate::error::AppError;
use crate::redis::RedisClient;

/// The default port used when an address does not carry one.
const DEFAULT_PORT: u16 = 6379;

/// The role of a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Master,
    Slave,
    Sentinel,
    Unknown,
}

impl Role {
    /// Parse a role as reported by `ROLE`, treating `replica` as `slave`.
    pub fn parse(role: &str) -> Self {
        match role {
            "master" => Self::Master,
            "slave" | "replica" => Self::Slave,
            "sentinel" => Self::Sentinel,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Master => "master",
                Self::Slave => "slave",
                Self::Sentinel => "sentinel",
                Self::Unknown => "unknown",
            }
        )
    }
}

/// The network address of a server.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    /// Parse an address given either as `redis://[user:password@]host[:port][/db]` or `host[:port]`.
    pub fn parse(addr: &str) -> Result<Self, AppError> {
        let rest = addr.trim();
        let rest = rest.strip_prefix("redis://").unwrap_or(rest);
        let rest = rest.rsplit_once('@').map(|(_, rest)| rest).unwrap_or(rest);
        let rest = rest.split('/').next().unwrap_or_default();
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| AppError::InvalidInput(format!("invalid port in server address {:?}", addr)))?;
                (host, port)
            }
            None => (rest, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(AppError::InvalidInput(format!("missing host in server address {:?}", addr)));
        }
        Ok(Self { host: host.into(), port })
    }

    /// The canonical `host:port` identifier of this address.
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The connection URI of this address.
    pub fn uri(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }

    /// A short human friendly name for the server behind this address.
    ///
    /// For DNS names this is the first label, e.g. the pod name of a headless service record.
    pub fn alias(&self) -> String {
        if self.host.parse::<IpAddr>().is_ok() {
            return self.host.clone();
        }
        self.host.split('.').next().unwrap_or(&self.host).to_string()
    }
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A single addressable Redis or Sentinel server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisServer {
    pub alias: String,
    pub addr: ServerAddr,
    pub role: Role,
    /// Server settings read during discovery.
    pub config: BTreeMap<String, String>,
    /// The error hit during the last discovery, if the server could not be queried.
    pub unreachable: Option<String>,
}

impl RedisServer {
    /// Create a new, not yet discovered, server.
    pub fn new(addr: ServerAddr) -> Self {
        Self {
            alias: addr.alias(),
            addr,
            role: Role::Unknown,
            config: Default::default(),
            unreachable: None,
        }
    }

    /// The canonical `host:port` identifier of this server.
    pub fn id(&self) -> String {
        self.addr.id()
    }

    pub fn is_reachable(&self) -> bool {
        self.unreachable.is_none()
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    /// Whether this server is a reachable replica which does not accept writes.
    pub fn is_ro_replica(&self) -> bool {
        self.role == Role::Slave && self.is_reachable() && self.config.get("slave-read-only").map(|val| val != "no").unwrap_or(true)
    }

    /// Refresh the role & the given config parameters of this server.
    ///
    /// On error the server is flagged unreachable with an unknown role, and its config is cleared.
    pub async fn discover(&mut self, client: &dyn RedisClient, parameters: &[&str]) {
        match Self::query(client, parameters).await {
            Ok((role, config)) => {
                self.role = role;
                self.config = config;
                self.unreachable = None;
            }
            Err(err) => {
                tracing::warn!(server = %self.addr, error = ?err, "error discovering redis server");
                self.role = Role::Unknown;
                self.config.clear();
                self.unreachable = Some(format!("{:#}", err));
            }
        }
    }

    async fn query(client: &dyn RedisClient, parameters: &[&str]) -> Result<(Role, BTreeMap<String, String>)> {
        let role = client.role().await.context("error querying server role")?;
        let mut config = BTreeMap::new();
        if role != Role::Sentinel {
            for param in parameters {
                if let Some(val) = client.config_get(param).await.with_context(|| format!("error reading config parameter {}", param))? {
                    config.insert(param.to_string(), val);
                }
            }
        }
        Ok((role, config))
    }
}
