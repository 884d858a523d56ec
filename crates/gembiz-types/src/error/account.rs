//! Account-record errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading, validating, or persisting account files.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum AccountError {
    /// No account with this email is known to the pool
    #[error("Account not found: {email}")]
    NotFound {
        /// Email used as the lookup key
        email: String,
    },

    /// The record failed validation
    #[error("Invalid account data: {reason}")]
    InvalidData {
        /// Why the record was rejected
        reason: String,
    },

    /// The file name does not match the record's email
    #[error("File name {file} does not match account email {email}")]
    FilenameMismatch { file: String, email: String },

    /// Reading or writing the account file failed
    #[error("Account file I/O failed: {message}")]
    Io { message: String },

    /// JSON (de)serialization failed
    #[error("Account serialization failed: {message}")]
    Serialize { message: String },
}
