//! Rule-based traffic routing.
//!
//! A [`Router`] classifies a hostname (or IP literal) into one of three
//! actions: forward through the tunnel, connect directly from the local
//! network, or reject. Rules come from a small YAML document:
//!
//! ```yaml
//! mode: rule            # rule | direct | global
//! rules:
//!   - DOMAIN-SUFFIX,corp.internal,PROXY
//!   - DOMAIN-KEYWORD,tracker,REJECT
//!   - IP-CIDR,10.0.0.0/8,DIRECT
//!   - MATCH,,PROXY
//! ```
//!
//! Rules are evaluated in source order and the first match wins; with no
//! match (or no rule file at all) the default is PROXY. Matching is a
//! linear scan — rule files are small; callers needing scale should
//! pre-compile, which is out of scope here.

pub mod error;
mod rules;

pub use error::{Error, Result};
pub use rules::{Action, Mode, Rule, RuleType};

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

/// Raw shape of the YAML rule document
#[derive(Debug, Deserialize)]
struct RuleDoc {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    rules: Vec<String>,
}

/// Immutable rule set, loaded once at startup and shared freely.
#[derive(Debug, Clone)]
pub struct Router {
    mode: Mode,
    rules: Vec<Rule>,
}

impl Router {
    /// Load a router from a YAML rule file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref()).map_err(Error::Io)?;
        Self::from_str(&data)
    }

    /// Parse a router from YAML text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(data: &str) -> Result<Self> {
        let doc: RuleDoc = serde_yaml::from_str(data)?;

        let mode = match doc.mode.as_deref() {
            None | Some("") | Some("rule") => Mode::Rule,
            Some("direct") => Mode::Direct,
            Some("global") => Mode::Global,
            Some(other) => return Err(Error::UnknownMode(other.to_string())),
        };

        let mut rules = Vec::with_capacity(doc.rules.len());
        for (idx, line) in doc.rules.iter().enumerate() {
            match Rule::parse(line) {
                Ok(Some(rule)) => rules.push(rule),
                // Short or empty lines are skipped, not fatal.
                Ok(None) => continue,
                Err(kind) => {
                    return Err(Error::UnknownRuleType {
                        line: idx + 1,
                        rule_type: kind,
                    })
                }
            }
        }

        Ok(Self { mode, rules })
    }

    /// A router with no rules: everything classifies as PROXY.
    pub fn global() -> Self {
        Self {
            mode: Mode::Global,
            rules: Vec::new(),
        }
    }

    /// The configured routing mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Number of loaded rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the rule list is empty.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Classify a host. Accepts `host`, `host:port`, IP literals and
    /// `[v6]:port` forms; the port is ignored for matching.
    pub fn match_host(&self, host: &str) -> Action {
        match self.mode {
            Mode::Global => return Action::Proxy,
            Mode::Direct => return Action::Direct,
            Mode::Rule => {}
        }

        let hostname = strip_port(host);
        let ip: Option<IpAddr> = hostname.parse().ok();

        for rule in &self.rules {
            if rule.matches(hostname, ip) {
                log::debug!("rule hit: {} -> {:?}", hostname, rule.action);
                return rule.action;
            }
        }

        // No rule matched: default to the tunnel.
        Action::Proxy
    }
}

/// Strip a trailing `:port` from a host string, handling the bracketed
/// IPv6 form. A bare IPv6 literal (several colons, no brackets) is
/// returned unchanged.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }

    match host.rfind(':') {
        Some(pos) if host[..pos].contains(':') => host, // bare IPv6
        Some(pos) => {
            if host[pos + 1..].chars().all(|c| c.is_ascii_digit()) && pos + 1 < host.len() {
                &host[..pos]
            } else {
                host
            }
        }
        None => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
mode: rule
rules:
  - DOMAIN-SUFFIX,example.com,DIRECT
  - DOMAIN-KEYWORD,tracker,REJECT
  - DOMAIN,exact.host,DIRECT
  - IP-CIDR,10.0.0.0/8,DIRECT
  - IP-CIDR6,fd00::/8,DIRECT
  - MATCH,,PROXY
"#;

    #[test]
    fn first_match_wins() {
        let router = Router::from_str(SAMPLE).unwrap();
        assert_eq!(router.match_host("www.example.com"), Action::Direct);
        assert_eq!(router.match_host("ads.tracker.net"), Action::Reject);
        assert_eq!(router.match_host("exact.host"), Action::Direct);
        assert_eq!(router.match_host("unrelated.org"), Action::Proxy);
    }

    #[test]
    fn suffix_match_is_bytewise() {
        // No label-boundary check, by fidelity with the source:
        // evilexample.com ends with example.com and therefore matches.
        let router = Router::from_str(SAMPLE).unwrap();
        assert_eq!(router.match_host("evilexample.com"), Action::Direct);
    }

    #[test]
    fn port_is_stripped() {
        let router = Router::from_str(SAMPLE).unwrap();
        assert_eq!(router.match_host("www.example.com:443"), Action::Direct);
        assert_eq!(router.match_host("10.1.2.3:22"), Action::Direct);
    }

    #[test]
    fn cidr_rules_apply_to_matching_family_only() {
        let router = Router::from_str(SAMPLE).unwrap();
        assert_eq!(router.match_host("10.200.0.1"), Action::Direct);
        assert_eq!(router.match_host("192.168.1.1"), Action::Proxy);
        assert_eq!(router.match_host("fd00::1"), Action::Direct);
        assert_eq!(router.match_host("[fd00::1]:443"), Action::Direct);
        assert_eq!(router.match_host("2001:db8::1"), Action::Proxy);
    }

    #[test]
    fn global_mode_always_proxies() {
        let router = Router::from_str("mode: global\nrules: []\n").unwrap();
        assert_eq!(router.match_host("anything.at.all"), Action::Proxy);
    }

    #[test]
    fn direct_mode_always_direct() {
        let router = Router::from_str("mode: direct\nrules: []\n").unwrap();
        assert_eq!(router.match_host("anything.at.all"), Action::Direct);
    }

    #[test]
    fn missing_mode_defaults_to_rule() {
        let router = Router::from_str("rules:\n  - DOMAIN,a.b,REJECT\n").unwrap();
        assert_eq!(router.mode(), Mode::Rule);
        assert_eq!(router.match_host("a.b"), Action::Reject);
    }

    #[test]
    fn no_match_defaults_to_proxy() {
        let router = Router::from_str("rules:\n  - DOMAIN,a.b,DIRECT\n").unwrap();
        assert_eq!(router.match_host("c.d"), Action::Proxy);
    }

    #[test]
    fn unknown_rule_type_is_fatal_and_names_the_line() {
        let err = Router::from_str("rules:\n  - DOMAIN,a.b\n  - BOGUS,x,DIRECT\n").unwrap_err();
        match err {
            Error::UnknownRuleType { line, rule_type } => {
                assert_eq!(line, 2);
                assert_eq!(rule_type, "BOGUS");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn unknown_action_defaults_to_proxy() {
        let router = Router::from_str("rules:\n  - DOMAIN,a.b,WAT\n").unwrap();
        assert_eq!(router.match_host("a.b"), Action::Proxy);
    }

    #[test]
    fn short_lines_are_skipped() {
        let router = Router::from_str("rules:\n  - justonefield\n  - DOMAIN,a.b,DIRECT\n").unwrap();
        assert_eq!(router.len(), 1);
        assert_eq!(router.match_host("a.b"), Action::Direct);
    }

    #[test]
    fn action_defaults_to_proxy_when_absent() {
        let router = Router::from_str("rules:\n  - DOMAIN,a.b\n").unwrap();
        assert_eq!(router.match_host("a.b"), Action::Proxy);
    }

    #[test]
    fn invalid_cidr_payload_never_matches() {
        let router = Router::from_str("rules:\n  - IP-CIDR,not-a-cidr,REJECT\n").unwrap();
        assert_eq!(router.match_host("10.0.0.1"), Action::Proxy);
    }

    #[test]
    fn loads_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
        let router = Router::from_file(f.path()).unwrap();
        assert_eq!(router.match_host("sub.example.com"), Action::Direct);
    }

    #[test]
    fn strip_port_handles_edge_cases() {
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("example.com:80"), "example.com");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("fd00::1"), "fd00::1");
    }
}
