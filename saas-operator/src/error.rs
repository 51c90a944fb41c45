//! Operator error abstractions.

pub use saas_core::AppError;

/// An error decoding a Sentinel event payload.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload does not have the number of fields required by its topic.
    #[error("invalid {topic} payload {payload:?}: expected {expected} fields, got {got}")]
    FieldCount { topic: String, payload: String, expected: &'static str, got: usize },
    /// The topic carries no payload, but one was given.
    #[error("invalid {topic} payload {payload:?}: expected an empty payload")]
    UnexpectedPayload { topic: String, payload: String },
    /// A port field is not a valid port number.
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    /// A non-master instance was given without the details of its master.
    #[error("invalid {topic} payload {payload:?}: {role} instance details must be followed by `@ <master-name> <master-ip> <master-port>`")]
    MissingMaster { topic: String, payload: String, role: String },
}
