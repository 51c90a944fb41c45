//! SaaS operator error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The given cron expression could not be parsed.
    #[error("invalid schedule {schedule:?}: {reason}")]
    InvalidSchedule { schedule: String, reason: String },
    /// A credential required for correct operation is entirely absent.
    #[error("missing key {key:?} in secret {secret:?}")]
    MissingCredential { secret: String, key: String },
    /// A referenced resource does not exist.
    #[error("the referenced resource {0} was not found")]
    ResourceNotFound(String),
}
