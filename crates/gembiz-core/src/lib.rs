//! Core library of the gembiz gateway: the account pool, the refresh
//! engine, the upstream client, and the request pipeline.

pub mod adminauth;
pub mod collab;
pub mod config;
pub mod logstream;
pub mod pool;
pub mod proxy;
pub mod refresh;
pub mod stats;
pub mod upstream;
