//! Subnet aliases: destination NAT applied before the upstream dial
//!
//! An alias maps a virtual source range onto a real destination range of
//! the same size. A packet addressed into the source range is rewritten
//! to the isomorphic address in the destination range, preserving the
//! host offset. A single IP is a /32 alias.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// One `SRC:DST` rewrite pair with equal prefix lengths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetAlias {
    pub src: Ipv4Net,
    pub dst: Ipv4Net,
}

impl SubnetAlias {
    /// Parse an alias spec of the form `SRC:DST`, where each side is an
    /// IPv4 CIDR or a bare IPv4 address (treated as /32).
    pub fn parse(spec: &str) -> Result<Self> {
        let (src_str, dst_str) = spec
            .split_once(':')
            .ok_or_else(|| invalid(spec, "expected SRC:DST"))?;

        let src = parse_net(src_str).ok_or_else(|| invalid(spec, "invalid source CIDR"))?;
        let dst = parse_net(dst_str).ok_or_else(|| invalid(spec, "invalid destination CIDR"))?;

        if src.prefix_len() != dst.prefix_len() {
            return Err(invalid(spec, "source and destination prefix lengths differ"));
        }

        Ok(Self { src, dst })
    }

    /// Rewrite `addr` if it lies inside the source range.
    ///
    /// The offset of the address from the source network is preserved:
    /// `offset(rewrite(a), dst.network) == offset(a, src.network)`.
    pub fn rewrite(&self, addr: Ipv4Addr) -> Option<Ipv4Addr> {
        if !self.src.contains(&addr) {
            return None;
        }
        let offset = u32::from(addr).wrapping_sub(u32::from(self.src.network()));
        Some(Ipv4Addr::from(u32::from(self.dst.network()).wrapping_add(offset)))
    }
}

impl std::fmt::Display for SubnetAlias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.src, self.dst)
    }
}

fn parse_net(s: &str) -> Option<Ipv4Net> {
    let s = s.trim();
    if let Ok(net) = s.parse::<Ipv4Net>() {
        return Some(net);
    }
    // A bare address is a /32 alias.
    s.parse::<Ipv4Addr>()
        .ok()
        .and_then(|ip| Ipv4Net::new(ip, 32).ok())
}

fn invalid(spec: &str, reason: &str) -> Error {
    Error::InvalidAlias {
        spec: spec.to_string(),
        reason: reason.to_string(),
    }
}

/// Apply the first matching alias; addresses outside every source range
/// pass through unchanged.
pub fn rewrite_destination(aliases: &[SubnetAlias], addr: Ipv4Addr) -> Ipv4Addr {
    for alias in aliases {
        if let Some(rewritten) = alias.rewrite(addr) {
            log::debug!("NAT alias hit: {} -> {} ({})", addr, rewritten, alias);
            return rewritten;
        }
    }
    addr
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alias(s: &str) -> SubnetAlias {
        SubnetAlias::parse(s).unwrap()
    }

    #[test]
    fn parse_cidr_pair() {
        let a = alias("10.77.0.0/24:192.168.1.0/24");
        assert_eq!(a.src.prefix_len(), 24);
        assert_eq!(a.dst.network(), Ipv4Addr::new(192, 168, 1, 0));
    }

    #[test]
    fn parse_bare_ips_as_slash32() {
        let a = alias("10.10.10.10:127.0.0.1");
        assert_eq!(a.src.prefix_len(), 32);
        assert_eq!(a.dst.prefix_len(), 32);
        assert_eq!(a.rewrite(Ipv4Addr::new(10, 10, 10, 10)), Some(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn parse_rejects_unequal_prefixes() {
        assert!(SubnetAlias::parse("10.0.0.0/24:192.168.0.0/16").is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(SubnetAlias::parse("nonsense").is_err());
        assert!(SubnetAlias::parse("10.0.0.0/24").is_err());
        assert!(SubnetAlias::parse("a:b").is_err());
    }

    #[test]
    fn rewrite_preserves_offset() {
        let a = alias("10.77.0.0/24:192.168.1.0/24");
        assert_eq!(a.rewrite(Ipv4Addr::new(10, 77, 0, 5)), Some(Ipv4Addr::new(192, 168, 1, 5)));
        assert_eq!(a.rewrite(Ipv4Addr::new(10, 77, 0, 0)), Some(Ipv4Addr::new(192, 168, 1, 0)));
        assert_eq!(a.rewrite(Ipv4Addr::new(10, 77, 0, 255)), Some(Ipv4Addr::new(192, 168, 1, 255)));
    }

    #[test]
    fn rewrite_outside_range_is_none() {
        let a = alias("10.77.0.0/24:192.168.1.0/24");
        assert_eq!(a.rewrite(Ipv4Addr::new(10, 78, 0, 5)), None);
    }

    #[test]
    fn offset_symmetry_across_prefix_sizes() {
        for (spec, addr, expect) in [
            ("10.0.0.0/8:172.16.0.0/8", "10.1.2.3", "172.17.2.3"),
            ("10.77.0.0/16:192.168.0.0/16", "10.77.200.9", "192.168.200.9"),
        ] {
            let a = alias(spec);
            let addr: Ipv4Addr = addr.parse().unwrap();
            let expect: Ipv4Addr = expect.parse().unwrap();
            let got = a.rewrite(addr).unwrap();
            assert_eq!(got, expect);
            // offset(NAT(a), dst.net) == offset(a, src.net)
            assert_eq!(
                u32::from(got) - u32::from(a.dst.network()),
                u32::from(addr) - u32::from(a.src.network())
            );
        }
    }

    #[test]
    fn first_matching_alias_wins() {
        let aliases = vec![
            alias("10.77.0.0/24:192.168.1.0/24"),
            alias("10.77.0.0/16:172.16.0.0/16"),
        ];
        assert_eq!(
            rewrite_destination(&aliases, Ipv4Addr::new(10, 77, 0, 5)),
            Ipv4Addr::new(192, 168, 1, 5)
        );
        // Second alias catches what the first does not.
        assert_eq!(
            rewrite_destination(&aliases, Ipv4Addr::new(10, 77, 9, 5)),
            Ipv4Addr::new(172, 16, 9, 5)
        );
    }

    #[test]
    fn unmatched_address_passes_through() {
        let aliases = vec![alias("10.77.0.0/24:192.168.1.0/24")];
        assert_eq!(
            rewrite_destination(&aliases, Ipv4Addr::new(8, 8, 8, 8)),
            Ipv4Addr::new(8, 8, 8, 8)
        );
    }
}
