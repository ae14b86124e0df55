//! Rule-file scenarios exercised end to end through the public API.

use rutun_router::{Action, Router};
use std::io::Write;

#[test]
fn direct_rule_with_proxy_fallthrough() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    write!(
        f,
        "mode: rule\nrules:\n  - DOMAIN-SUFFIX,example.com,DIRECT\n  - MATCH,,PROXY\n"
    )
    .unwrap();

    let router = Router::from_file(f.path()).unwrap();

    // The suffix rule sends the site direct; everything else tunnels.
    assert_eq!(router.match_host("example.com"), Action::Direct);
    assert_eq!(router.match_host("example.com:80"), Action::Direct);
    assert_eq!(router.match_host("foo.internal:443"), Action::Proxy);
}

#[test]
fn reject_rule_blocks_before_any_dial_decision() {
    let router = Router::from_str("rules:\n  - DOMAIN,blocked.test,REJECT\n").unwrap();
    assert_eq!(router.match_host("blocked.test"), Action::Reject);
    assert_eq!(router.match_host("blocked.test:443"), Action::Reject);
    assert_eq!(router.match_host("fine.test"), Action::Proxy);
}

#[test]
fn missing_rule_file_reports_io_error() {
    assert!(Router::from_file("/nonexistent/rules.yaml").is_err());
}

#[test]
fn ip_rules_see_literal_addresses_only() {
    let router = Router::from_str(
        "rules:\n  - IP-CIDR,192.0.2.0/24,REJECT\n  - MATCH,,DIRECT\n",
    )
    .unwrap();

    assert_eq!(router.match_host("192.0.2.7:22"), Action::Reject);
    // A hostname is not resolved before matching; IP rules pass it by.
    assert_eq!(router.match_host("host.in.192.0.2"), Action::Direct);
}
