//! Error types for the proxy.

use std::net::IpAddr;

use thiserror::Error;

use crate::cache::StoreError;

/// Main error type for proxy operations.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed address or address range in the pool configuration
    #[error("Invalid address range: {0}")]
    InvalidRange(String),

    /// Caller input violates a stated constraint
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The upstream has no mapping for the requested name or identifier
    #[error("No such profile: {0}")]
    NotFound(String),

    /// The upstream answered 429 for the egress address in use
    #[error("Upstream rate limit exceeded for {address}")]
    RateLimited { address: IpAddr },

    /// The upstream answered with a status the client does not understand
    #[error("Encountered unexpected status code {status} while querying the upstream API")]
    UpstreamProtocol { status: u16 },

    /// The upstream answered 200 with a payload that cannot be used
    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),

    /// No egress identity could be lent
    #[error("No egress address available")]
    PoolExhausted,

    /// Transport errors, including request timeouts
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Payload (de)serialization errors
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Whether the failure was caused by the caller rather than by this
    /// service or the upstream.
    pub fn is_client_error(&self) -> bool {
        matches!(self, ProxyError::InvalidRequest(_) | ProxyError::NotFound(_))
    }

    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidRange(_) => "invalid_range",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::NotFound(_) => "not_found",
            ProxyError::RateLimited { .. } => "rate_limited",
            ProxyError::UpstreamProtocol { .. } => "upstream_protocol",
            ProxyError::InvalidResponse(_) => "invalid_response",
            ProxyError::PoolExhausted => "pool_exhausted",
            ProxyError::Http(_) => "upstream_transport",
            ProxyError::Decode(_) => "decode",
            ProxyError::Store(_) => "store",
            ProxyError::Config(_) => "config",
            ProxyError::Io(_) => "io",
        }
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
