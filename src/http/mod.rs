//! HTTP front for the lookup API.

mod server;
mod service;

pub use server::HttpServer;
pub use service::{router, ApiError, AtQuery, ErrorBody, ServerVersion};
