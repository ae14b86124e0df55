//! Host route installation and retraction
//!
//! Built on the `net-route` crate. Route adds tolerate "already exists"
//! responses; deletions during cleanup ignore errors entirely.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{Error, Result};

/// Convert an interface name to its index
#[cfg(unix)]
fn interface_index(name: &str) -> Result<u32> {
    use std::ffi::CString;

    let c_name =
        CString::new(name).map_err(|_| Error::Config("invalid interface name".into()))?;

    // SAFETY: if_nametoindex is safe to call with a valid C string
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(Error::Route(format!("interface '{}' not found", name)));
    }
    Ok(index)
}

#[cfg(windows)]
fn interface_index(name: &str) -> Result<u32> {
    Err(Error::Route(format!(
        "interface routing by name not supported on Windows: {}",
        name
    )))
}

/// A route entry to install or remove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network
    pub destination: IpNet,
    /// Gateway (None for interface routes)
    pub gateway: Option<IpAddr>,
    /// Interface name (resolved to an index at install time)
    pub interface: Option<String>,
}

impl Route {
    /// A route via a gateway
    pub fn via_gateway(destination: IpNet, gateway: IpAddr) -> Self {
        Self {
            destination,
            gateway: Some(gateway),
            interface: None,
        }
    }

    /// A route pointing directly at an interface
    pub fn via_interface(destination: IpNet, interface: impl Into<String>) -> Self {
        Self {
            destination,
            gateway: None,
            interface: Some(interface.into()),
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gw) = &self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(iface) = &self.interface {
            write!(f, " dev {}", iface)?;
        }
        Ok(())
    }
}

/// Route table manipulator
pub struct RouteManager {
    handle: net_route::Handle,
}

impl RouteManager {
    /// Create a route manager. Requires root / `CAP_NET_ADMIN`.
    pub fn new() -> Result<Self> {
        let handle = net_route::Handle::new()
            .map_err(|e| Error::Route(format!("failed to create route handle: {}", e)))?;
        Ok(Self { handle })
    }

    /// Add a route. An already-existing identical route counts as
    /// success.
    pub async fn add(&self, route: &Route) -> Result<()> {
        let mut net_route =
            net_route::Route::new(route.destination.addr(), route.destination.prefix_len());

        if let Some(gw) = route.gateway {
            net_route = net_route.with_gateway(gw);
        }
        if let Some(iface) = &route.interface {
            net_route = net_route.with_ifindex(interface_index(iface)?);
        }

        match self.handle.add(&net_route).await {
            Ok(()) => {
                log::info!("added route: {}", route);
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("File exists") || msg.contains("exist") || msg.contains("os error 17")
                {
                    log::debug!("route already exists: {}", route);
                    Ok(())
                } else {
                    Err(Error::Route(format!("failed to add route {}: {}", route, e)))
                }
            }
        }
    }

    /// Remove a route.
    pub async fn delete(&self, route: &Route) -> Result<()> {
        let mut net_route =
            net_route::Route::new(route.destination.addr(), route.destination.prefix_len());

        if let Some(gw) = route.gateway {
            net_route = net_route.with_gateway(gw);
        }
        if let Some(iface) = &route.interface {
            // Interface may already be gone during teardown.
            if let Ok(idx) = interface_index(iface) {
                net_route = net_route.with_ifindex(idx);
            }
        }

        self.handle
            .delete(&net_route)
            .await
            .map_err(|e| Error::Route(format!("failed to delete route {}: {}", route, e)))?;

        log::info!("deleted route: {}", route);
        Ok(())
    }

    /// The current default gateway for IPv4 traffic, if any.
    pub async fn default_gateway(&self) -> Result<Option<IpAddr>> {
        let routes = self
            .handle
            .list()
            .await
            .map_err(|e| Error::Route(format!("failed to list routes: {}", e)))?;

        Ok(routes
            .into_iter()
            .find(|r| r.prefix == 0 && r.destination.is_ipv4() && r.gateway.is_some())
            .and_then(|r| r.gateway))
    }
}

/// Routes installed by this run, removed in reverse on shutdown.
#[derive(Default)]
pub struct AppliedRoutes {
    routes: Vec<Route>,
}

impl AppliedRoutes {
    /// Record a successfully installed route.
    pub fn push(&mut self, route: Route) {
        self.routes.push(route);
    }

    /// Number of recorded routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes were recorded.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Remove every recorded route, newest first. Errors are ignored;
    /// interfaces may already be gone.
    pub async fn cleanup(&mut self, manager: &RouteManager) {
        while let Some(route) = self.routes.pop() {
            if let Err(e) = manager.delete(&route).await {
                log::debug!("route cleanup: {}", e);
            }
        }
    }
}
