//! TUN device abstraction
//!
//! Thin wrapper around `tun-rs`, which owns the platform details:
//! interface creation, address assignment, bringing the link up, and the
//! 4-byte protocol prefix some platforms prepend to each packet. The
//! pumps above this layer exchange pure IP packets.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// MTU used for the virtual interface
pub const TUN_MTU: u16 = 1500;

/// Information about an opened TUN device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Interface name as reported by the OS (may differ from the
    /// requested name on platforms that rename devices)
    pub name: String,
    /// Assigned address and prefix
    pub cidr: Ipv4Net,
    /// Point-to-point peer (assigned address + 1)
    pub peer: Ipv4Addr,
}

/// An opened and configured TUN device
pub struct TunDevice {
    inner: tun_rs::AsyncDevice,
    info: DeviceInfo,
}

impl TunDevice {
    /// Create and configure the device: address from `cidr`, peer set to
    /// address + 1 for platforms that need a point-to-point destination.
    ///
    /// Requires root / `CAP_NET_ADMIN` (administrator and the WinTun
    /// driver on Windows).
    pub async fn create(name: Option<&str>, cidr: Ipv4Net) -> Result<Self> {
        let peer = peer_addr(cidr.addr());

        let mut builder = tun_rs::DeviceBuilder::new();
        if let Some(name) = name {
            builder = builder.name(name);
        }
        builder = builder
            .ipv4(cidr.addr(), cidr.prefix_len(), Some(peer))
            .mtu(TUN_MTU);

        let device = builder
            .build_async()
            .map_err(|e| Error::Device(format!("failed to open TUN device: {}", e)))?;

        let name = device
            .name()
            .map_err(|e| Error::Device(format!("failed to read device name: {}", e)))?;

        log::info!(
            "TUN device {} up: {} peer {} (MTU {})",
            name,
            cidr,
            peer,
            TUN_MTU
        );

        Ok(Self {
            inner: device,
            info: DeviceInfo { name, cidr, peer },
        })
    }

    /// Interface name as reported by the OS.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Device information.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Read one IP packet from the device.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.recv(buf).await
    }

    /// Write one IP packet to the device.
    pub async fn send(&self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.send(buf).await
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice").field("info", &self.info).finish()
    }
}

/// Peer address: assigned address + 1 within the same network.
pub fn peer_addr(addr: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr).wrapping_add(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_is_address_plus_one() {
        assert_eq!(peer_addr(Ipv4Addr::new(10, 0, 0, 1)), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(
            peer_addr(Ipv4Addr::new(10, 0, 0, 255)),
            Ipv4Addr::new(10, 0, 1, 0)
        );
    }
}
