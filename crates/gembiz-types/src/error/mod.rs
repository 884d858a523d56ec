//! Typed error definitions for the gateway.
//!
//! Errors are structured so that handlers can map them to HTTP responses and
//! the pipeline can branch on upstream failure classes without string
//! matching at the call site.

mod account;
mod pool;
mod proxy;

pub use account::AccountError;
pub use pool::PoolError;
pub use proxy::UpstreamError;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type wrapping all domain-specific errors.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "domain", content = "error")]
pub enum GatewayError {
    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),
}

/// Standard Result type using GatewayError.
pub type Result<T> = std::result::Result<T, GatewayError>;
