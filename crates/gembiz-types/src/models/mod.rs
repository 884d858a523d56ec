//! Data models shared across the gateway.

mod account;
mod config;

pub use account::{
    format_cookie_string, parse_cookie_string, AccountData, AccountStatus, Cookie,
    FALLBACK_BEARER_PREFIX, SESSION_COOKIE_DOMAIN, SESSION_COOKIE_NAME,
};
pub use config::{AppConfig, FlowConfig, PoolConfig, PoolServerConfig};
