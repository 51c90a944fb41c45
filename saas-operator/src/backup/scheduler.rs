use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use saas_core::crd::{BackupState, BackupStatus, BackupStatusList};

use crate::error::AppError;

/// Compute the first occurrence of the given cron expression strictly after `now`.
///
/// Standard 5 field expressions are evaluated at second 0, 6 & 7 field expressions (with a
/// leading seconds field & an optional trailing year) are used as is.
pub fn next_run(expr: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
    let expr = expr.trim();
    let normalized = match expr.split_whitespace().count() {
        5 => format!("0 {}", expr),
        _ => expr.to_string(),
    };
    let schedule = Schedule::from_str(&normalized).map_err(|err| AppError::InvalidSchedule { schedule: expr.into(), reason: err.to_string() })?;
    schedule.after(&now).next().ok_or_else(|| AppError::InvalidSchedule {
        schedule: expr.into(),
        reason: "the schedule has no upcoming occurrence".into(),
    })
}

/// Ensure each of the given shards has a pending backup scheduled for `next_run`.
///
/// Shards with a running backup are skipped. A pending backup scheduled for another time is
/// rescheduled. Returns `true` if the list was modified, in which case it is sorted again.
pub fn reconcile_backup_list(backups: &mut BackupStatusList, next_run: DateTime<Utc>, shards: &[String]) -> bool {
    let mut changed = false;
    for shard in shards {
        if backups.find_last(shard, BackupState::Running).is_some() {
            continue;
        }
        match backups.position_last(shard, BackupState::Pending) {
            Some(idx) if backups[idx].scheduled_for == next_run => (),
            Some(idx) => {
                tracing::debug!(%shard, from = %backups[idx].scheduled_for, to = %next_run, "rescheduling pending backup");
                backups[idx] = BackupStatus::pending(shard, next_run);
                changed = true;
            }
            None => {
                tracing::debug!(%shard, scheduled_for = %next_run, "scheduling backup");
                backups.push(BackupStatus::pending(shard, next_run));
                changed = true;
            }
        }
    }
    if changed {
        backups.sort();
    }
    changed
}
