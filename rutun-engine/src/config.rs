//! Gateway configuration
//!
//! Populated by the CLI, validated once before anything starts.

use std::path::PathBuf;
use std::time::Duration;

use rutun_tun::TunOptions;
use rutun_tunnel::{AuthConfig, HopAddr, TunnelConfig, config::DEFAULT_SSH_PORT};

use crate::error::{Error, Result};

/// Default HTTP proxy listen address
pub const DEFAULT_HTTP_ADDR: &str = ":8080";
/// Default dial timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Full gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP proxy listen address (`:8080` or `host:port`)
    pub http_addr: String,
    /// SOCKS5 listen address; `None` disables the frontend
    pub socks_addr: Option<String>,

    /// SSH user
    pub ssh_user: String,
    /// SSH host
    pub ssh_host: String,
    /// SSH port applied when the host spec carries none
    pub ssh_port: u16,
    /// Jump hop specs (`user@host[:port]`), traversed in order
    pub jump_hosts: Vec<String>,
    /// Explicit private key path
    pub key_file: Option<PathBuf>,
    /// SSH password; implies non-interactive
    pub password: Option<String>,
    /// Whether an interactive password prompt is permitted
    pub interactive: bool,
    /// Timeout for connects and tunneled dials
    pub dial_timeout: Duration,

    /// Router rule file
    pub rule_file: Option<PathBuf>,
    /// Point the OS proxy settings at the HTTP frontend
    pub system_proxy: bool,
    /// Force every absolute-URL HTTP request to this upstream
    pub http_upstream: Option<String>,

    /// TUN data plane; `None` disables it
    pub tun: Option<TunOptions>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            socks_addr: None,
            ssh_user: String::new(),
            ssh_host: String::new(),
            ssh_port: DEFAULT_SSH_PORT,
            jump_hosts: Vec::new(),
            key_file: None,
            password: None,
            interactive: true,
            dial_timeout: DEFAULT_TIMEOUT,
            rule_file: None,
            system_proxy: true,
            http_upstream: None,
            tun: None,
        }
    }
}

impl Config {
    /// Validate the configuration; called once before startup.
    pub fn validate(&self) -> Result<()> {
        if self.ssh_host.is_empty() {
            return Err(Error::Config("SSH server host is required".into()));
        }
        if self.ssh_user.is_empty() {
            return Err(Error::Config("SSH user is required".into()));
        }
        if !self.interactive && self.password.is_none() && self.key_file.is_none() {
            return Err(Error::Config(
                "non-interactive mode needs a password or a key file".into(),
            ));
        }

        for spec in &self.jump_hosts {
            if spec.trim().is_empty() {
                continue;
            }
            HopAddr::parse(spec, Some(&self.ssh_user), DEFAULT_SSH_PORT)
                .map_err(|e| Error::Config(format!("bad jump host {}: {}", spec, e)))?;
        }

        Ok(())
    }

    /// The terminal SSH endpoint.
    pub fn target(&self) -> Result<HopAddr> {
        let spec = format!("{}@{}", self.ssh_user, self.ssh_host);
        HopAddr::parse(&spec, None, self.ssh_port)
            .map_err(|e| Error::Config(format!("bad SSH target: {}", e)))
    }

    /// The jump chain as parsed hops.
    pub fn jumps(&self) -> Result<Vec<HopAddr>> {
        self.jump_hosts
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|spec| {
                HopAddr::parse(spec, Some(&self.ssh_user), DEFAULT_SSH_PORT)
                    .map_err(|e| Error::Config(format!("bad jump host {}: {}", spec, e)))
            })
            .collect()
    }

    /// Tunnel configuration derived from the SSH fields.
    pub fn tunnel_config(&self) -> Result<TunnelConfig> {
        Ok(TunnelConfig {
            jumps: self.jumps()?,
            target: self.target()?,
            auth: AuthConfig {
                key_path: self.key_file.clone(),
                // A supplied password always suppresses the prompt.
                password: self.password.clone(),
                interactive: self.interactive && self.password.is_none(),
            },
            dial_timeout: self.dial_timeout,
        })
    }
}

/// Turn a `:port` listen spec into a bindable address.
pub fn bind_addr(listen: &str) -> String {
    if let Some(stripped) = listen.strip_prefix(':') {
        format!("0.0.0.0:{}", stripped)
    } else {
        listen.to_string()
    }
}

/// The address clients (and the OS proxy settings) should use to reach a
/// listener bound on a wildcard or `:port` spec.
pub fn client_addr(listen: &str) -> String {
    if let Some(stripped) = listen.strip_prefix(':') {
        return format!("127.0.0.1:{}", stripped);
    }
    match listen.split_once(':') {
        Some(("", port)) | Some(("0.0.0.0", port)) => format!("127.0.0.1:{}", port),
        _ => listen.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            ssh_user: "alice".into(),
            ssh_host: "example.com".into(),
            ..Config::default()
        }
    }

    #[test]
    fn default_config_fails_without_target() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn missing_user_is_rejected() {
        let mut cfg = valid();
        cfg.ssh_user.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_interactive_needs_credentials() {
        let mut cfg = valid();
        cfg.interactive = false;
        assert!(cfg.validate().is_err());

        cfg.password = Some("secret".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bad_jump_spec_is_rejected() {
        let mut cfg = valid();
        cfg.jump_hosts = vec!["@nouser".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn jump_hosts_inherit_user_and_port() {
        let mut cfg = valid();
        cfg.jump_hosts = vec!["bastion.corp".into(), "bob@edge:2222".into()];
        let jumps = cfg.jumps().unwrap();
        assert_eq!(jumps[0].user, "alice");
        assert_eq!(jumps[0].port, 22);
        assert_eq!(jumps[1].user, "bob");
        assert_eq!(jumps[1].port, 2222);
    }

    #[test]
    fn password_disables_prompting() {
        let mut cfg = valid();
        cfg.password = Some("secret".into());
        let tc = cfg.tunnel_config().unwrap();
        assert!(!tc.auth.interactive);
    }

    #[test]
    fn target_applies_default_port() {
        let cfg = valid();
        let target = cfg.target().unwrap();
        assert_eq!(target.port, 22);
        assert_eq!(target.addr(), "example.com:22");

        let mut cfg = valid();
        cfg.ssh_host = "example.com:2200".into();
        assert_eq!(cfg.target().unwrap().port, 2200);
    }

    #[test]
    fn listen_addr_helpers() {
        assert_eq!(bind_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(bind_addr("127.0.0.1:8080"), "127.0.0.1:8080");
        assert_eq!(client_addr(":8080"), "127.0.0.1:8080");
        assert_eq!(client_addr("0.0.0.0:9000"), "127.0.0.1:9000");
        assert_eq!(client_addr("192.168.1.5:8080"), "192.168.1.5:8080");
    }
}
