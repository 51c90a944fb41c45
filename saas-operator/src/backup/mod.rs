//! Sharded backup scheduling & execution.

pub(crate) mod remote;
mod runner;
mod scheduler;
#[cfg(test)]
mod scheduler_test;

pub use remote::{BackupBackends, S3Store, SshShell};
pub use runner::{runner_id, BackupOptions, BackupRunner};
pub use scheduler::{next_run, reconcile_backup_list};
