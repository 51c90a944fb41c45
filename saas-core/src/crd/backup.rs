//! ShardedRedisBackup CRD.
//!
//! The code here is used to generate the actual CRD used in K8s. See examples/crd.rs.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type ShardedRedisBackup = ShardedRedisBackupCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the ShardedRedisBackup resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "ShardedRedisBackupCRD",
    status = "ShardedRedisBackupStatus",
    group = "saas.3scale.net",
    version = "v1alpha1",
    kind = "ShardedRedisBackup",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "srb",
    printcolumn = r#"{"name":"Sentinel","type":"string","jsonPath":".spec.sentinelRef"}"#,
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Paused","type":"boolean","jsonPath":".spec.pause"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ShardedRedisBackupSpec {
    /// The name of the Sentinel resource whose monitored shards are to be backed up.
    pub sentinel_ref: String,
    /// A cron expression, either in the standard 5 field form or with a leading seconds field.
    pub schedule: String,
    /// The max duration in seconds of a single backup.
    #[serde(default = "ShardedRedisBackupSpec::timeout_seconds_default")]
    pub timeout_seconds: u64,
    /// The interval in seconds at which a running backup checks for save completion.
    #[serde(default = "ShardedRedisBackupSpec::poll_interval_seconds_default")]
    pub poll_interval_seconds: u64,
    /// The max number of backup records kept in status per shard.
    #[serde(default = "ShardedRedisBackupSpec::history_limit_default")]
    pub history_limit: u32,
    /// The path of the Redis database file on the replica hosts.
    #[serde(default = "ShardedRedisBackupSpec::db_file_default")]
    pub db_file: String,
    /// SSH settings used to reach the replica hosts.
    pub ssh_options: SshOptions,
    /// Object storage settings for the backup artifacts.
    pub s3_options: S3Options,
    /// Stop scheduling and dispatching new backups.
    ///
    /// Running backups are still tracked to completion.
    #[serde(default)]
    pub pause: bool,
}

impl ShardedRedisBackupSpec {
    pub fn timeout_seconds_default() -> u64 {
        600
    }

    pub fn poll_interval_seconds_default() -> u64 {
        60
    }

    pub fn history_limit_default() -> u32 {
        10
    }

    pub fn db_file_default() -> String {
        "/data/dump.rdb".into()
    }
}

/// SSH settings used to reach the replica hosts.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshOptions {
    /// The remote user.
    pub user: String,
    /// The name of the Secret holding the private key under `privateKey`.
    pub private_key_secret_ref: String,
    /// The SSH port, 22 when not set.
    #[serde(default)]
    pub port: Option<u16>,
    /// Run the remote commands through `sudo`.
    #[serde(default)]
    pub sudo: bool,
}

/// Object storage settings for backup artifacts.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Options {
    /// The target bucket.
    pub bucket: String,
    /// The key prefix under which artifacts are stored.
    pub path: String,
    /// The bucket's region.
    pub region: String,
    /// The name of the Secret holding `AWS_ACCESS_KEY_ID` & `AWS_SECRET_ACCESS_KEY`.
    pub credentials_secret_ref: String,
    /// A custom endpoint for S3 compatible stores.
    #[serde(default)]
    pub service_endpoint: Option<String>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShardedRedisBackupStatus {
    /// The backup history, newest first.
    #[serde(default)]
    pub backups: BackupStatusList,
}

/// The lifecycle state of a backup.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum BackupState {
    Pending,
    Running,
    Completed,
    Failed,
    Unknown,
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Pending => "Pending",
                Self::Running => "Running",
                Self::Completed => "Completed",
                Self::Failed => "Failed",
                Self::Unknown => "Unknown",
            }
        )
    }
}

/// The record of a single backup of a shard.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// The shard being backed up.
    pub shard: String,
    /// The alias of the replica the backup runs on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_alias: Option<String>,
    /// The `host:port` of the replica the backup runs on.
    #[serde(default, rename = "serverID", skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// The time at which the backup is scheduled to run.
    pub scheduled_for: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// The object storage location of the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_file: Option<String>,
    /// The artifact size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_size: Option<i64>,
    /// A human readable description of the current state.
    #[serde(default)]
    pub message: String,
    pub state: BackupState,
}

impl BackupStatus {
    /// Create a new pending backup record.
    pub fn pending(shard: &str, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            shard: shard.into(),
            server_alias: None,
            server_id: None,
            scheduled_for,
            started_at: None,
            finished_at: None,
            backup_file: None,
            backup_size: None,
            message: "backup scheduled".into(),
            state: BackupState::Pending,
        }
    }

    /// Ordering which places the most recently scheduled records first.
    ///
    /// Records scheduled at the same time are ordered by descending shard name.
    pub fn cmp_newest_first(a: &Self, b: &Self) -> Ordering {
        b.scheduled_for.cmp(&a.scheduled_for).then_with(|| b.shard.cmp(&a.shard))
    }
}

/// A list of backup records kept sorted newest first.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(transparent)]
pub struct BackupStatusList(pub Vec<BackupStatus>);

impl Deref for BackupStatusList {
    type Target = Vec<BackupStatus>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BackupStatusList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl BackupStatusList {
    /// Sort the list newest first.
    pub fn sort(&mut self) {
        self.0.sort_by(BackupStatus::cmp_newest_first);
    }

    /// Find the index of the most recently scheduled record of the given shard in the given state.
    pub fn position_last(&self, shard: &str, state: BackupState) -> Option<usize> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, backup)| backup.shard == shard && backup.state == state)
            .max_by(|(_, a), (_, b)| BackupStatus::cmp_newest_first(b, a))
            .map(|(idx, _)| idx)
    }

    /// Find the most recently scheduled record of the given shard in the given state.
    pub fn find_last(&self, shard: &str, state: BackupState) -> Option<&BackupStatus> {
        self.position_last(shard, state).map(|idx| &self.0[idx])
    }

    /// Keep only the `limit` most recently scheduled records of each of the given shards.
    ///
    /// Records of other shards are left in place. The resulting list is sorted newest first.
    /// Returns `true` if the list was modified.
    pub fn apply_history_limit(&mut self, limit: usize, shards: &[String]) -> bool {
        let mut updated = self.0.clone();
        updated.sort_by(BackupStatus::cmp_newest_first);
        let mut seen: HashMap<String, usize> = HashMap::new();
        updated.retain(|backup| {
            if !shards.contains(&backup.shard) {
                return true;
            }
            let count = seen.entry(backup.shard.clone()).or_default();
            *count += 1;
            *count <= limit
        });

        if updated == self.0 {
            return false;
        }
        self.0 = updated;
        true
    }
}
