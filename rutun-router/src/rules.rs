//! Rule grammar: `TYPE,PAYLOAD[,ACTION]`

use std::net::IpAddr;

use ipnet::IpNet;

/// What to do with a matched flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Forward through the SSH tunnel
    Proxy,
    /// Connect directly from the local network
    Direct,
    /// Refuse the connection
    Reject,
}

/// Global routing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Evaluate rules in order
    Rule,
    /// Everything direct
    Direct,
    /// Everything through the tunnel
    Global,
}

/// Rule kinds, evaluated per §payload semantics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleType {
    /// Hostname ends with payload (byte-wise, no label boundary)
    DomainSuffix,
    /// Hostname contains payload
    DomainKeyword,
    /// Hostname equals payload
    Domain,
    /// IPv4 literal inside payload CIDR
    IpCidr,
    /// IPv6 literal inside payload CIDR
    IpCidr6,
    /// Terminal catch-all
    Match,
}

/// One routing rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub rule_type: RuleType,
    pub payload: String,
    pub action: Action,
}

impl Rule {
    /// Parse one `TYPE,PAYLOAD[,ACTION]` line.
    ///
    /// Returns `Ok(None)` for lines with fewer than two fields (skipped),
    /// and `Err(type)` for an unknown TYPE. Unknown actions fall back to
    /// PROXY.
    pub(crate) fn parse(line: &str) -> std::result::Result<Option<Self>, String> {
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() < 2 {
            return Ok(None);
        }

        let type_str = parts[0].trim().to_ascii_uppercase();
        let rule_type = match type_str.as_str() {
            "DOMAIN-SUFFIX" => RuleType::DomainSuffix,
            "DOMAIN-KEYWORD" => RuleType::DomainKeyword,
            "DOMAIN" => RuleType::Domain,
            "IP-CIDR" => RuleType::IpCidr,
            "IP-CIDR6" => RuleType::IpCidr6,
            "MATCH" => RuleType::Match,
            _ => return Err(parts[0].trim().to_string()),
        };

        let action = match parts.get(2).map(|s| s.trim().to_ascii_uppercase()) {
            Some(a) if a == "DIRECT" => Action::Direct,
            Some(a) if a == "REJECT" => Action::Reject,
            // Absent or unrecognized actions mean PROXY.
            _ => Action::Proxy,
        };

        Ok(Some(Rule {
            rule_type,
            payload: parts[1].trim().to_string(),
            action,
        }))
    }

    /// Evaluate this rule against an already port-stripped hostname and
    /// its parsed IP form, if it is a literal.
    pub(crate) fn matches(&self, hostname: &str, ip: Option<IpAddr>) -> bool {
        match self.rule_type {
            RuleType::DomainSuffix => hostname.ends_with(&self.payload),
            RuleType::DomainKeyword => hostname.contains(&self.payload),
            RuleType::Domain => hostname == self.payload,
            RuleType::IpCidr => match ip {
                Some(IpAddr::V4(v4)) => cidr_contains(&self.payload, IpAddr::V4(v4)),
                _ => false,
            },
            RuleType::IpCidr6 => match ip {
                Some(IpAddr::V6(v6)) => cidr_contains(&self.payload, IpAddr::V6(v6)),
                _ => false,
            },
            RuleType::Match => true,
        }
    }
}

/// True when `payload` parses as a CIDR containing `ip`. A payload that
/// fails to parse simply never matches.
fn cidr_contains(payload: &str, ip: IpAddr) -> bool {
    payload
        .parse::<IpNet>()
        .map(|net| net.contains(&ip))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_variants() {
        let r = Rule::parse("DOMAIN-SUFFIX,example.com,DIRECT")
            .unwrap()
            .unwrap();
        assert_eq!(r.rule_type, RuleType::DomainSuffix);
        assert_eq!(r.action, Action::Direct);

        let r = Rule::parse("MATCH,,REJECT").unwrap().unwrap();
        assert_eq!(r.rule_type, RuleType::Match);
        assert_eq!(r.action, Action::Reject);
    }

    #[test]
    fn parse_is_case_insensitive_on_type_and_action() {
        let r = Rule::parse("domain-keyword,ads,reject").unwrap().unwrap();
        assert_eq!(r.rule_type, RuleType::DomainKeyword);
        assert_eq!(r.action, Action::Reject);
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert_eq!(Rule::parse("NOPE,x,DIRECT").unwrap_err(), "NOPE");
    }

    #[test]
    fn short_line_is_skipped() {
        assert!(Rule::parse("DOMAIN").unwrap().is_none());
        assert!(Rule::parse("").unwrap().is_none());
    }

    #[test]
    fn match_rule_hits_everything() {
        let r = Rule::parse("MATCH,,PROXY").unwrap().unwrap();
        assert!(r.matches("whatever", None));
        assert!(r.matches("", Some("1.2.3.4".parse().unwrap())));
    }

    #[test]
    fn cidr_mismatched_family_never_matches() {
        let r = Rule::parse("IP-CIDR,10.0.0.0/8,DIRECT").unwrap().unwrap();
        assert!(!r.matches("fd00::1", Some("fd00::1".parse().unwrap())));
        let r6 = Rule::parse("IP-CIDR6,fd00::/8,DIRECT").unwrap().unwrap();
        assert!(!r6.matches("10.0.0.1", Some("10.0.0.1".parse().unwrap())));
    }
}
