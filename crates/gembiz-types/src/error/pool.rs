//! Account-pool and external-refresh errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by pool operations and the registrar upload protocol.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum PoolError {
    /// Selection found no account satisfying cooldown/fail/quota constraints
    #[error("No account available")]
    NoAccountAvailable,

    /// An uploaded account payload failed validation
    #[error("Invalid account upload: {reason}")]
    InvalidUpload {
        /// Which requirement the payload violated
        reason: String,
    },

    /// The referenced external-refresh task does not exist
    #[error("Unknown refresh task: {task_id}")]
    TaskNotFound {
        /// Task id presented by the worker
        task_id: String,
    },

    /// Task exists but is leased to a different worker
    #[error("Refresh task {task_id} is not leased to {worker_id}")]
    LeaseMismatch { task_id: String, worker_id: String },

    /// Persisting the merged account failed
    #[error("Pool persistence failed: {message}")]
    Persistence { message: String },
}

impl PoolError {
    /// HTTP status for registrar-facing endpoints. Validation failures are
    /// client errors and must be distinguishable from the 500 family.
    pub const fn http_status_code(&self) -> u16 {
        match *self {
            Self::InvalidUpload { .. } => 400,
            Self::TaskNotFound { .. } | Self::LeaseMismatch { .. } => 409,
            Self::NoAccountAvailable => 503,
            Self::Persistence { .. } => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_validation_is_a_client_error() {
        let err = PoolError::InvalidUpload { reason: "missing cookies".to_string() };
        assert_eq!(err.http_status_code(), 400);
        assert_eq!(PoolError::Persistence { message: "disk".to_string() }.http_status_code(), 500);
    }
}
