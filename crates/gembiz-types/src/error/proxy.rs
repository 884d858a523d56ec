//! Upstream call errors used by the request pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes observed while talking to the upstream assistant API.
///
/// The pipeline's attempt loop branches on these to decide between account
/// rotation, cooldown extension, and surfacing the error to the client.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum UpstreamError {
    /// Upstream answered with a non-200 status
    #[error("upstream HTTP {status}: {body}")]
    Status {
        status: u16,
        /// Response body, kept verbatim for passthrough to the client
        body: String,
    },

    /// Transport-level failure (DNS, connect, timeout)
    #[error("network error: {message}")]
    Network { message: String },

    /// The response body could not be decoded
    #[error("malformed upstream response: {message}")]
    Malformed { message: String },

    /// HTTP 200 whose body is an authentication envelope, not content
    #[error("authentication envelope in response body")]
    AuthEnvelope,

    /// Body parsed but carried no usable content
    #[error("empty upstream response")]
    EmptyResponse,

    /// Body carried only "thought" parts
    #[error("response contained only thought parts")]
    ThoughtOnly,

    /// Body carried an error object with a quota-exhausted token
    #[error("upstream quota exhausted")]
    QuotaExhausted,

    /// Body carried an error object without usable content
    #[error("upstream returned an error body")]
    ErrorBody,

    /// Uploading user media into the session failed
    #[error("media upload failed: {message}")]
    MediaUpload { message: String },

    /// Downloading user-supplied media failed with this status
    #[error("media download failed: upstream status {status}")]
    MediaDownload { status: u16 },

    /// All generated-file downloads hit 401/403; the client must resend
    #[error("generated file download requires a fresh account")]
    DownloadNeedsRetry,
}

impl UpstreamError {
    /// True when the account's credentials are the problem and the account
    /// should be parked for refresh.
    pub fn flags_account_refresh(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 401 || *status == 403,
            Self::AuthEnvelope | Self::DownloadNeedsRetry => true,
            _ => false,
        }
    }

    /// True for HTTP 429.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Status { status: 429, .. })
    }

    /// Status and body to pass through to the client, when available.
    pub fn passthrough(&self) -> Option<(u16, &str)> {
        match self {
            Self::Status { status, body } => Some((*status, body.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_flag_refresh() {
        assert!(UpstreamError::Status { status: 401, body: String::new() }.flags_account_refresh());
        assert!(UpstreamError::Status { status: 403, body: String::new() }.flags_account_refresh());
        assert!(UpstreamError::AuthEnvelope.flags_account_refresh());
        assert!(!UpstreamError::Status { status: 400, body: String::new() }.flags_account_refresh());
        assert!(!UpstreamError::QuotaExhausted.flags_account_refresh());
    }

    #[test]
    fn rate_limit_detection() {
        assert!(UpstreamError::Status { status: 429, body: String::new() }.is_rate_limited());
        assert!(!UpstreamError::Status { status: 500, body: String::new() }.is_rate_limited());
    }
}
