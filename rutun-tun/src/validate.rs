//! Pre-flight validation of captured ranges
//!
//! Two checks run before the device is opened:
//!
//! - a captured range containing a resolved SSH server address is fatal:
//!   the tunnel would carry its own transport (self-loop);
//! - a captured range containing a local interface address is a warning:
//!   that traffic may escape via the physical NIC and skip the TUN.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;

use crate::alias::SubnetAlias;
use crate::error::{Error, Result};

/// Every CIDR the TUN will capture: explicit routes plus alias sources.
pub fn captured_ranges(routes: &[Ipv4Net], aliases: &[SubnetAlias]) -> Vec<Ipv4Net> {
    routes
        .iter()
        .copied()
        .chain(aliases.iter().map(|a| a.src))
        .collect()
}

/// Fail when any captured range contains a resolved SSH server address.
pub fn check_self_loop(ranges: &[Ipv4Net], ssh_ips: &[IpAddr]) -> Result<()> {
    for range in ranges {
        for ip in ssh_ips {
            let IpAddr::V4(v4) = ip else { continue };
            if range.contains(v4) {
                return Err(Error::SelfLoop {
                    cidr: range.to_string(),
                    ip: *v4,
                });
            }
        }
    }
    Ok(())
}

/// Collect overlaps between captured ranges and local interface
/// addresses. Loopback interfaces and addresses are ignored.
pub fn interface_conflicts(ranges: &[Ipv4Net], local_addrs: &[Ipv4Addr]) -> Vec<(Ipv4Net, Ipv4Addr)> {
    let mut conflicts = Vec::new();
    for range in ranges {
        for addr in local_addrs {
            if addr.is_loopback() {
                continue;
            }
            if range.contains(addr) {
                conflicts.push((*range, *addr));
            }
        }
    }
    conflicts
}

/// IPv4 addresses of the local non-loopback interfaces.
pub fn local_interface_addrs() -> Vec<Ipv4Addr> {
    match if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces
            .into_iter()
            .filter(|i| !i.is_loopback())
            .filter_map(|i| match i.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect(),
        Err(e) => {
            log::warn!("cannot enumerate local interfaces, skipping conflict check: {}", e);
            Vec::new()
        }
    }
}

/// Run both checks; log warnings, return the fatal error if any.
pub fn preflight(routes: &[Ipv4Net], aliases: &[SubnetAlias], ssh_ips: &[IpAddr]) -> Result<()> {
    let ranges = captured_ranges(routes, aliases);

    for (range, addr) in interface_conflicts(&ranges, &local_interface_addrs()) {
        log::warn!(
            "route conflict: captured range {} contains local interface address {}; \
             that traffic may bypass the TUN",
            range,
            addr
        );
    }

    check_self_loop(&ranges, ssh_ips)
}
