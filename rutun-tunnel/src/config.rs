//! Hop addressing and tunnel configuration

use std::fmt;
use std::time::Duration;

use crate::auth::AuthConfig;
use crate::error::{Error, Result};

/// Default SSH port applied when a hop spec carries none
pub const DEFAULT_SSH_PORT: u16 = 22;

/// One SSH endpoint in the hop chain: `user@host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopAddr {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl HopAddr {
    /// Parse a hop spec of the form `user@host[:port]` or `host[:port]`.
    ///
    /// When the user part is absent, `default_user` is used; a spec
    /// without a user and no default is rejected. `default_port` applies
    /// when the host part carries no port.
    pub fn parse(spec: &str, default_user: Option<&str>, default_port: u16) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(invalid_hop(spec, "empty hop spec"));
        }

        let parts: Vec<&str> = spec.split('@').collect();
        let (user, host_part) = match parts.as_slice() {
            [host] => match default_user {
                Some(u) if !u.is_empty() => (u.to_string(), *host),
                _ => return Err(invalid_hop(spec, "missing user")),
            },
            [user, host] => {
                if user.is_empty() {
                    return Err(invalid_hop(spec, "empty user"));
                }
                (user.to_string(), *host)
            }
            _ => return Err(invalid_hop(spec, "expected user@host[:port]")),
        };

        let (host, port) = match host_part.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| invalid_hop(spec, "invalid port"))?;
                (h, port)
            }
            None => (host_part, default_port),
        };

        if host.is_empty() {
            return Err(invalid_hop(spec, "empty host"));
        }

        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }

    /// The `host:port` form used for TCP connects and DNS resolution
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for HopAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

fn invalid_hop(spec: &str, reason: &str) -> Error {
    Error::Handshake {
        host: spec.to_string(),
        reason: format!("invalid hop spec: {}", reason),
    }
}

/// Full configuration for establishing the hop chain
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Jump hosts, traversed in order before the target
    pub jumps: Vec<HopAddr>,
    /// Final SSH endpoint
    pub target: HopAddr,
    /// Authentication preferences, shared by every hop
    pub auth: AuthConfig,
    /// Timeout applied to TCP connects and to each `dial`
    pub dial_timeout: Duration,
}
