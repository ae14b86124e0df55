//! Shared frontend plumbing: routing decisions, upstream dialing and
//! bidirectional relay.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rutun_router::{Action, Router};
use rutun_tunnel::{SshTunnel, TunnelStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Classify a host. Without a router everything goes through the tunnel,
/// equivalent to global mode.
pub(crate) fn decide(router: Option<&Arc<Router>>, host: &str) -> Action {
    match router {
        Some(r) => r.match_host(host),
        None => Action::Proxy,
    }
}

/// An upstream connection: either a local socket or a tunneled stream.
pub(crate) enum Upstream {
    Direct(TcpStream),
    Tunnel(TunnelStream),
}

impl Upstream {
    /// Open the upstream for a PROXY or DIRECT decision. REJECT never
    /// reaches this point; frontends answer it without dialing.
    pub(crate) async fn open(
        action: Action,
        tunnel: &Arc<SshTunnel>,
        host: &str,
        port: u16,
        dial_timeout: Duration,
    ) -> Result<Upstream> {
        match action {
            Action::Direct => {
                let connect = TcpStream::connect((host, port));
                let stream = tokio::time::timeout(dial_timeout, connect)
                    .await
                    .map_err(|_| {
                        Error::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("direct dial {}:{} timed out", host, port),
                        ))
                    })??;
                stream.set_nodelay(true).ok();
                Ok(Upstream::Direct(stream))
            }
            Action::Proxy => Ok(Upstream::Tunnel(tunnel.clone().dial(host, port).await?)),
            Action::Reject => Err(Error::Protocol("rejected flow reached dialer".into())),
        }
    }
}

impl AsyncRead for Upstream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Upstream::Direct(s) => Pin::new(s).poll_read(cx, buf),
            Upstream::Tunnel(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Upstream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Upstream::Direct(s) => Pin::new(s).poll_write(cx, buf),
            Upstream::Tunnel(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Upstream::Direct(s) => Pin::new(s).poll_flush(cx),
            Upstream::Tunnel(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Upstream::Direct(s) => Pin::new(s).poll_shutdown(cx),
            Upstream::Tunnel(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Split a `host[:port]` target, falling back to `default_port`.
/// Handles the bracketed IPv6 form.
pub(crate) fn split_host_port(target: &str, default_port: u16) -> Result<(String, u16)> {
    let target = target.trim();
    if target.is_empty() {
        return Err(Error::Protocol("empty target".into()));
    }

    if let Some(rest) = target.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Err(Error::Protocol(format!("bad IPv6 target {}", target)));
        };
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| Error::Protocol(format!("bad port in {}", target)))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match target.rsplit_once(':') {
        // More than one colon and no brackets: a bare IPv6 literal.
        Some((host, _)) if host.contains(':') => Ok((target.to_string(), default_port)),
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::Protocol(format!("bad port in {}", target)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((target.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decide_without_router_is_proxy() {
        assert_eq!(decide(None, "anything"), Action::Proxy);
    }

    #[test]
    fn split_host_port_variants() {
        assert_eq!(split_host_port("a.b:443", 80).unwrap(), ("a.b".into(), 443));
        assert_eq!(split_host_port("a.b", 443).unwrap(), ("a.b".into(), 443));
        assert_eq!(
            split_host_port("[fd00::1]:8443", 443).unwrap(),
            ("fd00::1".into(), 8443)
        );
        assert_eq!(
            split_host_port("[fd00::1]", 443).unwrap(),
            ("fd00::1".into(), 443)
        );
        assert!(split_host_port("a.b:notaport", 80).is_err());
        assert!(split_host_port("", 80).is_err());
    }
}
