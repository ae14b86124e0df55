//! TUN data plane.
//!
//! Intercepts IP traffic on a virtual layer-3 interface, feeds it to a
//! userspace TCP/IP stack, and forwards the resulting TCP flows and DNS
//! queries through the SSH tunnel. Destination NAT (subnet aliases) maps
//! virtual ranges onto real targets before dialing; host routes steer
//! traffic into the device and are retracted on shutdown.
//!
//! Lifecycle: validation runs before the device is opened; the interface
//! is fully configured and routes are installed before the packet pumps
//! start; routes come out before the device closes. `close` is
//! idempotent.

pub mod alias;
pub mod device;
pub mod dns;
pub mod error;
pub mod route;
mod stack;
pub mod validate;

pub use alias::SubnetAlias;
pub use device::TunDevice;
pub use error::{Error, Result};
pub use route::{AppliedRoutes, Route, RouteManager};

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net};
use rutun_tunnel::SshTunnel;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// The two halves of the IPv4 space, used by global mode to shadow the
/// default route at higher specificity without touching it.
const GLOBAL_HALVES: [&str; 2] = ["0.0.0.0/1", "128.0.0.0/1"];

/// User-facing configuration of the TUN plane
#[derive(Debug, Clone)]
pub struct TunOptions {
    /// Interface address and prefix (e.g. `10.0.0.1/24`)
    pub cidr: Ipv4Net,
    /// Explicit CIDRs to route into the device
    pub routes: Vec<Ipv4Net>,
    /// Capture the whole IPv4 space via the two /1 halves
    pub global: bool,
    /// Destination NAT pairs
    pub aliases: Vec<SubnetAlias>,
    /// Requested device name (platform may rename; `None` lets the OS
    /// pick, which macOS requires)
    pub device_name: Option<String>,
}

impl Default for TunOptions {
    fn default() -> Self {
        Self {
            cidr: "10.0.0.1/24".parse().expect("static CIDR"),
            routes: Vec::new(),
            global: false,
            aliases: Vec::new(),
            device_name: default_device_name(),
        }
    }
}

fn default_device_name() -> Option<String> {
    // macOS insists on utunN names assigned by the kernel.
    if cfg!(target_os = "macos") {
        None
    } else {
        Some("rutun0".to_string())
    }
}

/// A running TUN data plane
pub struct TunPlane {
    device: Arc<TunDevice>,
    routes: Mutex<AppliedRoutes>,
    route_manager: RouteManager,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    closed: AtomicBool,
}

impl TunPlane {
    /// Validate, open the device, install routes, and start the stack.
    ///
    /// `ssh_ips` are the resolved addresses of the SSH server, used both
    /// for the self-loop check and for the global-mode bypass route.
    pub async fn start(
        options: TunOptions,
        tunnel: Arc<SshTunnel>,
        ssh_ips: Vec<IpAddr>,
    ) -> Result<TunPlane> {
        // Self-loop is fatal before any device is opened.
        validate::preflight(&options.routes, &options.aliases, &ssh_ips)?;

        let device = Arc::new(TunDevice::create(options.device_name.as_deref(), options.cidr).await?);

        let route_manager = RouteManager::new()?;
        let mut applied = AppliedRoutes::default();
        install_routes(
            &route_manager,
            &mut applied,
            device.name(),
            &options,
            &ssh_ips,
        )
        .await;

        let (shutdown, _) = broadcast::channel(1);
        let tasks = stack::start(
            device.clone(),
            Arc::new(options.aliases),
            tunnel,
            &shutdown,
        )?;

        log::info!(
            "TUN plane up on {} ({}), {} route(s) installed",
            device.name(),
            options.cidr,
            applied.len()
        );

        Ok(TunPlane {
            device,
            routes: Mutex::new(applied),
            route_manager,
            shutdown,
            tasks,
            closed: AtomicBool::new(false),
        })
    }

    /// Interface name as reported by the OS.
    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Stop the pumps, retract routes, release the device. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Pumps and forwarders observe the broadcast and exit, dropping
        // their device references.
        let _ = self.shutdown.send(());

        // Routes out before the device goes down.
        self.routes.lock().await.cleanup(&self.route_manager).await;

        for task in &self.tasks {
            task.abort();
        }

        log::info!("TUN plane closed");
    }
}

/// Install routes per the configured policy. Failures are logged and
/// skipped; the plane still comes up (best-effort, matching the route
/// command contract).
async fn install_routes(
    manager: &RouteManager,
    applied: &mut AppliedRoutes,
    dev_name: &str,
    options: &TunOptions,
    ssh_ips: &[IpAddr],
) {
    // Alias sources always route into the device so virtual addresses
    // actually reach the stack.
    for alias in &options.aliases {
        let route = Route::via_interface(IpNet::V4(alias.src), dev_name);
        install_one(manager, applied, route).await;
    }

    if options.global {
        install_global_routes(manager, applied, dev_name, ssh_ips).await;
    } else {
        for cidr in &options.routes {
            let route = Route::via_interface(IpNet::V4(*cidr), dev_name);
            install_one(manager, applied, route).await;
        }
    }
}

/// Global mode: bypass route for the SSH server via the prior default
/// gateway, then the two /1 halves into the device.
async fn install_global_routes(
    manager: &RouteManager,
    applied: &mut AppliedRoutes,
    dev_name: &str,
    ssh_ips: &[IpAddr],
) {
    match manager.default_gateway().await {
        Ok(Some(gateway)) => {
            for ip in ssh_ips {
                let IpAddr::V4(v4) = ip else { continue };
                let host_net = match Ipv4Net::new(*v4, 32) {
                    Ok(n) => IpNet::V4(n),
                    Err(_) => continue,
                };
                install_one(manager, applied, Route::via_gateway(host_net, gateway)).await;
            }
        }
        Ok(None) => {
            log::warn!("no default gateway found; SSH bypass route not installed");
        }
        Err(e) => {
            log::warn!("default gateway lookup failed: {}", e);
        }
    }

    for half in GLOBAL_HALVES {
        let net: IpNet = half.parse().expect("static CIDR");
        install_one(manager, applied, Route::via_interface(net, dev_name)).await;
    }
}

async fn install_one(manager: &RouteManager, applied: &mut AppliedRoutes, route: Route) {
    match manager.add(&route).await {
        Ok(()) => applied.push(route),
        Err(e) => log::warn!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_documented_defaults() {
        let opts = TunOptions::default();
        assert_eq!(opts.cidr.to_string(), "10.0.0.1/24");
        assert!(!opts.global);
        assert!(opts.routes.is_empty());
        assert!(opts.aliases.is_empty());
    }

    #[test]
    fn global_halves_cover_the_ipv4_space() {
        let a: Ipv4Net = GLOBAL_HALVES[0].parse().unwrap();
        let b: Ipv4Net = GLOBAL_HALVES[1].parse().unwrap();
        assert_eq!(a.prefix_len(), 1);
        assert_eq!(b.prefix_len(), 1);
        // Together the halves shadow every address at /1 specificity.
        let probe: std::net::Ipv4Addr = "93.184.216.34".parse().unwrap();
        assert!(a.contains(&probe) || b.contains(&probe));
        let probe: std::net::Ipv4Addr = "200.1.2.3".parse().unwrap();
        assert!(a.contains(&probe) || b.contains(&probe));
    }
}
