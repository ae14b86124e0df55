//! Error types for the TUN data plane

use std::net::Ipv4Addr;

use thiserror::Error;

/// Result type alias for TUN plane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or running the TUN data plane
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TUN device could not be opened or configured
    #[error("TUN device error: {0}")]
    Device(String),

    /// Userspace network stack failed to start
    #[error("netstack error: {0}")]
    Netstack(String),

    /// Route table manipulation failed
    #[error("route error: {0}")]
    Route(String),

    /// Invalid interface CIDR or alias spec
    #[error("configuration error: {0}")]
    Config(String),

    /// A subnet alias could not be parsed
    #[error("invalid alias {spec}: {reason}")]
    InvalidAlias { spec: String, reason: String },

    /// A captured range contains the SSH server itself: the tunnel would
    /// carry its own transport.
    #[error("self-loop: SSH server {ip} falls inside captured range {cidr}")]
    SelfLoop { cidr: String, ip: Ipv4Addr },
}
