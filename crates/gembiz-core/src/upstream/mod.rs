//! HTTP client for the upstream assistant API: JWT minting, session
//! creation, context-file upload, streamAssist, and generated-file
//! retrieval.

mod client;

pub use client::{MintedJwt, UpstreamClient, DEFAULT_JWT_TTL_SEC};
