//! Multi-hop SSH tunnel management.
//!
//! This crate establishes a chain of SSH hops (jump hosts followed by the
//! final target) and exposes a single outbound primitive: open a TCP
//! channel inside the multiplexed session to a remote `host:port`.
//!
//! # Example
//!
//! ```ignore
//! use rutun_tunnel::{AuthConfig, HopAddr, SshTunnel, TunnelConfig};
//!
//! let config = TunnelConfig {
//!     jumps: vec![],
//!     target: HopAddr::parse("deploy@example.com", None, 22)?,
//!     auth: AuthConfig::default(),
//!     dial_timeout: std::time::Duration::from_secs(10),
//! };
//!
//! let tunnel = std::sync::Arc::new(SshTunnel::connect(&config)?);
//! let stream = tunnel.dial("internal.service", 443).await?;
//! ```
//!
//! The hop stack is opaque: callers only see [`SshTunnel::dial`] and
//! [`SshTunnel::close`]. Closing walks the hops in reverse so the
//! outermost TCP socket is released last.

pub mod auth;
pub mod config;
pub mod error;
mod pump;
mod session;

pub use auth::AuthConfig;
pub use config::{HopAddr, TunnelConfig};
pub use error::{Error, Result};
pub use pump::TunnelStream;
pub use session::SshTunnel;
