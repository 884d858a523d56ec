//! Shared data models, wire-protocol shapes, and typed errors for the
//! gembiz gateway.
//!
//! This crate is dependency-light on purpose: everything here is plain data
//! that both the core library and the server binary agree on.

pub mod error;
pub mod models;
pub mod protocol;
