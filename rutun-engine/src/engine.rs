//! Gateway supervisor
//!
//! Builds the components in dependency order (tunnel, router, frontends,
//! TUN plane, system proxy), runs them as independent tasks, and tears
//! everything down in reverse on a shutdown signal or on the first
//! component failure.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rutun_router::Router;
use rutun_tun::TunPlane;
use rutun_tunnel::SshTunnel;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{client_addr, Config};
use crate::error::{Error, Result};
use crate::http::HttpProxy;
use crate::socks5::Socks5Proxy;
use crate::sysproxy::{OsSystemProxy, SystemProxy};

/// How long to wait for each frontend to drain after shutdown
const FRONTEND_STOP_GRACE: Duration = Duration::from_secs(6);

/// The gateway engine
pub struct Engine {
    config: Config,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl Engine {
    /// Create an engine with a validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shutdown_tx: None,
        })
    }

    /// A handle that stops the engine when sent to; can be created
    /// before [`start`](Self::start) so the engine can be moved into a
    /// task.
    pub fn create_shutdown_handle(&mut self) -> broadcast::Sender<()> {
        if let Some(tx) = &self.shutdown_tx {
            return tx.clone();
        }
        let (tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(tx.clone());
        tx
    }

    /// Start every configured component and run until shutdown.
    pub async fn start(&mut self) -> Result<()> {
        let shutdown_tx = self.create_shutdown_handle();

        // Tunnel first; construction is blocking and may prompt for a
        // password on the controlling terminal.
        let tunnel_config = self.config.tunnel_config()?;
        let tunnel = tokio::task::spawn_blocking(move || SshTunnel::connect(&tunnel_config))
            .await
            .map_err(|e| Error::Config(format!("tunnel task failed: {}", e)))??;
        let tunnel = Arc::new(tunnel);
        log::info!("SSH tunnel established to {}", tunnel.target());

        // Router, if a rule file is configured. A broken rule file means
        // global mode, not a dead gateway.
        let router = match &self.config.rule_file {
            Some(path) => match Router::from_file(path) {
                Ok(r) => {
                    log::info!("loaded {} rules from {}", r.len(), path.display());
                    Some(Arc::new(r))
                }
                Err(e) => {
                    log::warn!(
                        "rule file {} unusable ({}); running in global mode",
                        path.display(),
                        e
                    );
                    None
                }
            },
            None => None,
        };

        // Bind every listener before spawning anything, so a startup
        // failure only has the tunnel to unwind.
        let http = match HttpProxy::bind(
            &self.config.http_addr,
            tunnel.clone(),
            router.clone(),
            self.config.http_upstream.clone(),
            self.config.dial_timeout,
        )
        .await
        {
            Ok(h) => h,
            Err(e) => {
                tunnel.close();
                return Err(e);
            }
        };

        let socks = match &self.config.socks_addr {
            Some(addr) => {
                match Socks5Proxy::bind(addr, tunnel.clone(), router.clone(), self.config.dial_timeout)
                    .await
                {
                    Ok(s) => Some(s),
                    Err(e) => {
                        tunnel.close();
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let tun_plane = match self.config.tun.clone() {
            Some(options) => {
                let ssh_ips = match resolve_ssh_ips(&self.config).await {
                    Ok(ips) => ips,
                    Err(e) => {
                        tunnel.close();
                        return Err(e);
                    }
                };
                match TunPlane::start(options, tunnel.clone(), ssh_ips).await {
                    Ok(plane) => Some(plane),
                    Err(e) => {
                        tunnel.close();
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };

        // Long-lived tasks report their failure; the first one wins.
        let (failure_tx, mut failure_rx) = mpsc::channel::<&'static str>(4);

        let mut frontend_handles: Vec<JoinHandle<()>> = Vec::new();
        frontend_handles.push(spawn_frontend(
            "HTTP",
            http.run(shutdown_tx.subscribe()),
            failure_tx.clone(),
        ));
        if let Some(socks) = socks {
            frontend_handles.push(spawn_frontend(
                "SOCKS5",
                socks.run(shutdown_tx.subscribe()),
                failure_tx.clone(),
            ));
        }

        // System proxy last: everything it points at is now listening.
        let sysproxy = if self.config.system_proxy {
            let http_addr = client_addr(&self.config.http_addr);
            let socks_addr = self.config.socks_addr.as_deref().map(client_addr);
            let mut proxy = OsSystemProxy::new();
            let proxy = tokio::task::spawn_blocking(move || {
                if let Err(e) = proxy.enable(&http_addr, socks_addr.as_deref()) {
                    log::error!("failed to set system proxy: {}", e);
                }
                proxy
            })
            .await
            .unwrap_or_default();
            Some(proxy)
        } else {
            None
        };

        // Run until a signal or the first component failure.
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::select! {
            _ = shutdown_rx.recv() => {
                log::info!("shutdown requested");
            }
            Some(name) = failure_rx.recv() => {
                log::error!("{} frontend failed, shutting down", name);
            }
        }

        // Teardown in reverse order, best-effort throughout.
        if let Some(mut proxy) = sysproxy {
            let _ = tokio::task::spawn_blocking(move || {
                if let Err(e) = proxy.disable() {
                    log::error!("failed to restore system proxy: {}", e);
                }
            })
            .await;
        }

        let _ = shutdown_tx.send(());
        for handle in frontend_handles {
            if tokio::time::timeout(FRONTEND_STOP_GRACE, handle).await.is_err() {
                log::warn!("frontend did not stop within the grace period");
            }
        }

        if let Some(plane) = tun_plane {
            plane.close().await;
        }

        tunnel.close();

        log::info!("gateway stopped");
        Ok(())
    }
}

fn spawn_frontend<F>(
    name: &'static str,
    fut: F,
    failure_tx: mpsc::Sender<&'static str>,
) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            log::error!("{} frontend error: {}", name, e);
            let _ = failure_tx.send(name).await;
        }
    })
}

/// Resolve the SSH server for the TUN plane's validation and bypass
/// routes.
async fn resolve_ssh_ips(config: &Config) -> Result<Vec<IpAddr>> {
    let target = config.target()?;
    let addr = target.addr();

    let mut ips: Vec<IpAddr> = tokio::net::lookup_host(&addr)
        .await
        .map_err(|e| Error::Config(format!("cannot resolve SSH server {}: {}", addr, e)))?
        .map(|sa| sa.ip())
        .collect();
    ips.sort();
    ips.dedup();

    if ips.is_empty() {
        return Err(Error::Config(format!("SSH server {} resolved to no addresses", addr)));
    }
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_rejects_invalid_config() {
        assert!(Engine::new(Config::default()).is_err());
    }

    #[test]
    fn shutdown_handle_is_stable() {
        let mut engine = Engine::new(Config {
            ssh_user: "u".into(),
            ssh_host: "h".into(),
            ..Config::default()
        })
        .unwrap();

        let a = engine.create_shutdown_handle();
        let b = engine.create_shutdown_handle();
        // Both handles feed the same channel.
        let mut rx = b.subscribe();
        a.send(()).unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
