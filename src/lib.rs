//! Mojang Proxy - Caching, Address-Pooled Profile Lookups
//!
//! This crate fronts the Mojang identity API with a cache-aside entity store
//! and spreads upstream calls across a pool of local egress addresses, each
//! with its own request counter, so that per-address rate limits are never
//! exceeded.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod http;
pub mod pool;
pub mod upstream;

pub use dispatch::Dispatcher;
pub use error::{ProxyError, Result};
