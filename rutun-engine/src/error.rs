//! Error types for the gateway engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while starting or running the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tunnel error
    #[error("tunnel error: {0}")]
    Tunnel(#[from] rutun_tunnel::Error),

    /// Router error
    #[error("router error: {0}")]
    Router(#[from] rutun_router::Error),

    /// TUN plane error
    #[error("TUN error: {0}")]
    Tun(#[from] rutun_tun::Error),

    /// Malformed client request (HTTP or SOCKS5)
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Profile store error
    #[error("profile store error: {0}")]
    Profile(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error came from client misbehavior rather than a
    /// local fault.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}
