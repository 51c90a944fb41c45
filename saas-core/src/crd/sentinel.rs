//! Sentinel CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type Sentinel = SentinelCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the Sentinel resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "SentinelCRD",
    status = "SentinelStatus",
    group = "saas.3scale.net",
    version = "v1alpha1",
    kind = "Sentinel",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "sentinel",
    printcolumn = r#"{"name":"Sentinels","type":"string","jsonPath":".status.sentinels"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SentinelSpec {
    /// Connection URIs of the Sentinel processes of the pool, e.g. `redis://sentinel-0:26379`.
    pub sentinel_uris: Vec<String>,
    /// The logical shards to be monitored, mapping each shard name to the URIs of its servers.
    pub monitored_shards: BTreeMap<String, Vec<String>>,
    /// Settings applied to each shard when Sentinels start monitoring it.
    #[serde(default)]
    pub monitor_config: Option<SentinelMonitorConfig>,
}

/// Per-shard settings applied through `SENTINEL SET` right after a shard is registered.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SentinelMonitorConfig {
    /// Milliseconds an instance must be unreachable to be considered down.
    #[serde(default)]
    pub down_after_milliseconds: Option<u64>,
    /// Failover timeout in milliseconds.
    #[serde(default)]
    pub failover_timeout: Option<u64>,
    /// Number of replicas reconfigured at the same time after a failover.
    #[serde(default)]
    pub parallel_syncs: Option<u32>,
}

impl SentinelMonitorConfig {
    /// The `SENTINEL SET` key/value pairs for every configured setting.
    pub fn settings(&self) -> Vec<(&'static str, String)> {
        let mut settings = vec![];
        if let Some(val) = self.down_after_milliseconds {
            settings.push(("down-after-milliseconds", val.to_string()));
        }
        if let Some(val) = self.failover_timeout {
            settings.push(("failover-timeout", val.to_string()));
        }
        if let Some(val) = self.parallel_syncs {
            settings.push(("parallel-syncs", val.to_string()));
        }
        settings
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SentinelStatus {
    /// The addresses of the Sentinels observed during the last reconcile.
    #[serde(default)]
    pub sentinels: Vec<String>,
    /// The shards monitored by the Sentinels, as they see them.
    #[serde(default)]
    pub monitored_shards: Vec<MonitoredShard>,
}

impl SentinelStatus {
    /// Look up a monitored shard by name.
    pub fn shard(&self, name: &str) -> Option<&MonitoredShard> {
        self.monitored_shards.iter().find(|shard| shard.name == name)
    }

    /// Map every monitored shard to the addresses of its servers.
    pub fn shard_addresses(&self) -> BTreeMap<String, Vec<String>> {
        self.monitored_shards
            .iter()
            .map(|shard| (shard.name.clone(), shard.servers.keys().cloned().collect()))
            .collect()
    }
}

/// A shard as observed by the Sentinels.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredShard {
    /// The shard name, which is also the Sentinel master name.
    pub name: String,
    /// The servers of the shard keyed by `host:port`.
    #[serde(default)]
    pub servers: BTreeMap<String, MonitoredServer>,
}

/// A server of a monitored shard.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredServer {
    /// The role reported by the Sentinels, `master` or `slave`.
    pub role: String,
    /// Selected server settings reported by the Sentinels.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}
