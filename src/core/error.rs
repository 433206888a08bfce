//! Unified error handling for the gateway core.
//!
//! A single enum keeps every module from needing its own error type and
//! from depending on each other just to propagate failures.

use std::fmt;

/// Unified error types produced by the cache-and-rule core.
#[derive(Debug)]
pub enum ProxyError {
    /// Configuration failed to parse or validate.
    Configuration(String),
    /// Network or I/O failure talking to an upstream.
    Upstream(String),
    /// Disk I/O failure inside the cache manager.
    CacheIo(String),
    /// The on-disk cache entry is corrupt or missing its backing file.
    CacheCorrupt(String),
    /// A probe (HEAD request) could not establish reachability or size.
    ProbeUnreachable(String),
    /// Route/rule matching failed to find anything usable.
    RouteMatching(String),
    /// Admin API request was malformed.
    Validation(String),
    /// Resource not found.
    NotFound(String),
    /// Request was rejected due to an active IP ban.
    Banned { retry_after_secs: u64 },
    /// Pingora framework error.
    Pingora(pingora_error::Error),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            ProxyError::Upstream(msg) => write!(f, "upstream error: {msg}"),
            ProxyError::CacheIo(msg) => write!(f, "cache I/O error: {msg}"),
            ProxyError::CacheCorrupt(msg) => write!(f, "cache entry corrupt: {msg}"),
            ProxyError::ProbeUnreachable(msg) => write!(f, "probe unreachable: {msg}"),
            ProxyError::RouteMatching(msg) => write!(f, "route matching failed: {msg}"),
            ProxyError::Validation(msg) => write!(f, "validation error: {msg}"),
            ProxyError::NotFound(msg) => write!(f, "not found: {msg}"),
            ProxyError::Banned { retry_after_secs } => {
                write!(f, "client is banned, retry after {retry_after_secs}s")
            }
            ProxyError::Pingora(err) => write!(f, "pingora error: {err}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Pingora(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::CacheIo(err.to_string())
    }
}

impl From<pingora_error::Error> for ProxyError {
    fn from(err: pingora_error::Error) -> Self {
        ProxyError::Pingora(err)
    }
}

impl From<ProxyError> for Box<pingora_error::Error> {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Pingora(pingora_err) => Box::new(pingora_err),
            other => Box::new(pingora_error::Error::new_str(&other.to_string())),
        }
    }
}

/// Result type alias used throughout the core.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;
