use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use saas_core::crd::{BackupState, BackupStatusList};

use super::scheduler::{next_run, reconcile_backup_list};
use crate::error::AppError;

fn ts(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, s).single().unwrap()
}

fn shards() -> Vec<String> {
    vec!["shard01".into(), "shard02".into()]
}

#[test]
fn next_run_accepts_five_field_expressions() -> Result<()> {
    let now = ts(2024, 3, 1, 10, 17, 42);

    let next = next_run("30 * * * *", now)?;
    assert_eq!(next, ts(2024, 3, 1, 10, 30, 0), "expected 10:30:00, got {}", next);

    let next = next_run("0 0 3 * * *", now)?;
    assert_eq!(next, ts(2024, 3, 2, 3, 0, 0), "expected 03:00:00 next day, got {}", next);

    Ok(())
}

#[test]
fn next_run_is_strictly_after_now() -> Result<()> {
    let now = ts(2024, 3, 1, 10, 30, 0);

    let next = next_run("30 * * * *", now)?;

    assert_eq!(next, ts(2024, 3, 1, 11, 30, 0), "expected 11:30:00, got {}", next);
    Ok(())
}

#[test]
fn next_run_rejects_invalid_expressions() {
    let res = next_run("every hour", Utc::now());
    assert!(matches!(res, Err(AppError::InvalidSchedule { .. })), "expected invalid schedule error, got {:?}", res);
}

#[test]
fn reconcile_backup_list_is_idempotent() -> Result<()> {
    let next = ts(2024, 3, 1, 11, 0, 0);
    let mut backups = BackupStatusList::default();

    let changed = reconcile_backup_list(&mut backups, next, &shards());
    assert!(changed, "expected first pass to change the list");
    assert_eq!(backups.len(), 2, "expected a pending backup per shard, got {}", backups.len());
    let first = backups.clone();

    let changed = reconcile_backup_list(&mut backups, next, &shards());
    assert!(!changed, "expected second pass with the same run to report no change");
    assert_eq!(backups, first, "expected list to be unchanged");

    Ok(())
}

#[test]
fn reconcile_backup_list_replaces_pending_on_new_run() -> Result<()> {
    let next = ts(2024, 3, 1, 11, 0, 0);
    let mut backups = BackupStatusList::default();
    reconcile_backup_list(&mut backups, next, &shards());

    let later = next + Duration::hours(1);
    let changed = reconcile_backup_list(&mut backups, later, &shards());

    assert!(changed, "expected list to be changed");
    assert_eq!(backups.len(), 2, "expected pending backups to be replaced, got {} records", backups.len());
    for backup in backups.iter() {
        assert_eq!(backup.scheduled_for, later, "expected {} to be rescheduled for {}, got {}", backup.shard, later, backup.scheduled_for);
        assert_eq!(backup.state, BackupState::Pending, "expected pending state, got {}", backup.state);
    }

    Ok(())
}

#[test]
fn reconcile_backup_list_skips_shards_with_running_backup() -> Result<()> {
    let next = ts(2024, 3, 1, 11, 0, 0);
    let mut backups = BackupStatusList::default();
    reconcile_backup_list(&mut backups, next, &shards());
    let idx = backups.position_last("shard01", BackupState::Pending).unwrap();
    backups[idx].state = BackupState::Running;

    reconcile_backup_list(&mut backups, next + Duration::hours(1), &shards());

    let shard01: Vec<_> = backups.iter().filter(|b| b.shard == "shard01").map(|b| (b.state, b.scheduled_for)).collect();
    assert_eq!(shard01, vec![(BackupState::Running, next)], "expected only the running shard01 backup, got {:?}", shard01);
    let pending = backups.find_last("shard02", BackupState::Pending).map(|b| b.scheduled_for);
    assert_eq!(pending, Some(next + Duration::hours(1)), "expected shard02 to be rescheduled, got {:?}", pending);

    Ok(())
}
