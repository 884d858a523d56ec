//! Request pipeline: protocol translation, media handling, upstream
//! invocation, tolerant response parsing, and streaming.

pub mod canonical;
pub mod handlers;
pub mod media;
pub mod middleware;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod server;
pub mod sse;

pub use server::{build_proxy_router, GatewayState};
