pub mod crd;
pub mod error;

pub use error::AppError;

/// The API group of all CRDs served by the SaaS operator.
pub const API_GROUP: &str = "saas.3scale.net";

/// The name used as field manager and label value for objects written by the operator.
pub const OPERATOR_NAME: &str = "saas-operator";
