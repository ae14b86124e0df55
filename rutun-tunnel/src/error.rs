//! Error types for tunnel establishment and dialing

use std::io;
use thiserror::Error;

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building the hop chain or dialing through it
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TCP connection to a hop failed
    #[error("failed to reach {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },

    /// SSH handshake with a hop failed
    #[error("SSH handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },

    /// All authentication methods were exhausted
    #[error("authentication failed for {user}@{host}: {reason}")]
    AuthFailed {
        user: String,
        host: String,
        reason: String,
    },

    /// The private key is passphrase-protected, which is not supported
    #[error("private key {0} is passphrase-protected (not supported)")]
    PassphraseUnsupported(String),

    /// The remote side refused the channel open
    #[error("connection to {addr} refused by remote")]
    DialRefused { addr: String },

    /// The channel open did not complete within the dial timeout
    #[error("dial to {addr} timed out")]
    DialTimeout { addr: String },

    /// The SSH transport is no longer usable
    #[error("SSH session is down: {0}")]
    SessionDown(String),

    /// The tunnel has already been closed
    #[error("tunnel is closed")]
    Closed,
}

impl Error {
    /// Whether this error indicates the whole session is unusable,
    /// as opposed to a single failed dial.
    pub fn is_session_down(&self) -> bool {
        matches!(self, Error::SessionDown(_) | Error::Closed)
    }
}
