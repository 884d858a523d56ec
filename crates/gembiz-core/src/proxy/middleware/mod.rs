//! Authentication middleware for the chat and admin surfaces.

mod auth;

pub use auth::{admin_auth, api_key_auth, extract_api_key, session_token};
