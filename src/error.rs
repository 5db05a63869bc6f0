// ABOUTME: Proxy-wide error type for startup and configuration failures
// ABOUTME: Per-connection protocol anomalies are never represented as errors; see policy.rs

use thiserror::Error;

/// Errors that can abort the proxy at startup, or the accept loop between
/// connections. Per-connection I/O failures are handled inside
/// `connection::ConnectionPipe` and never surface here.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to read configuration file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to bind listener on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to initialize log sink at {path}: {source}")]
    LogInit {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;
