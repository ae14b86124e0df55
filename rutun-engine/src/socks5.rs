//! SOCKS5 proxy frontend (RFC 1928 subset)
//!
//! Only the no-authentication method and the CONNECT command are
//! supported, with IPv4, domain and IPv6 address types. Domain targets
//! are never resolved locally: the literal name goes to the router and
//! then to the tunnel dialer, so resolution happens at the remote SSH
//! host.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rutun_router::{Action, Router};
use rutun_tunnel::SshTunnel;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::config::bind_addr;
use crate::error::{Error, Result};
use crate::relay::{decide, Upstream};

const DRAIN_GRACE: Duration = Duration::from_secs(5);

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

// Reply codes
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

struct ProxyContext {
    tunnel: Arc<SshTunnel>,
    router: Option<Arc<Router>>,
    dial_timeout: Duration,
}

/// SOCKS5 proxy frontend
pub struct Socks5Proxy {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
}

impl Socks5Proxy {
    /// Bind the listener. Failing here aborts startup.
    pub async fn bind(
        listen: &str,
        tunnel: Arc<SshTunnel>,
        router: Option<Arc<Router>>,
        dial_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr(listen)).await?;
        log::info!("SOCKS5 proxy listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            ctx: Arc::new(ProxyContext {
                tunnel,
                router,
                dial_timeout,
            }),
        })
    }

    /// Serve until shutdown, then drain with a bounded grace period.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => {
                    let (socket, peer) = accepted?;
                    let ctx = self.ctx.clone();
                    tasks.spawn(async move {
                        if let Err(e) = handle_client(ctx, socket, peer).await {
                            log::warn!("SOCKS5 client {}: {}", peer, e);
                        }
                    });
                }
            }
        }

        drop(self.listener);
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            log::debug!("SOCKS5 drain grace expired with connections in flight");
        }

        log::info!("SOCKS5 proxy stopped");
        Ok(())
    }
}

/// Requested connect target; domains stay unresolved.
#[derive(Debug, PartialEq, Eq)]
enum Target {
    Addr(SocketAddr),
    Domain(String, u16),
}

impl Target {
    fn host(&self) -> String {
        match self {
            Target::Addr(sa) => sa.ip().to_string(),
            Target::Domain(host, _) => host.clone(),
        }
    }

    fn port(&self) -> u16 {
        match self {
            Target::Addr(sa) => sa.port(),
            Target::Domain(_, port) => *port,
        }
    }
}

async fn handle_client(
    ctx: Arc<ProxyContext>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    negotiate_method(&mut stream).await?;

    let target = match read_request(&mut stream).await {
        Ok(t) => t,
        Err(RequestError::Unsupported(code, why)) => {
            send_reply(&mut stream, code).await?;
            return Err(Error::Protocol(why));
        }
        Err(RequestError::Fatal(e)) => return Err(e),
    };

    let host = target.host();
    let port = target.port();

    let action = decide(ctx.router.as_ref(), &host);
    log::info!("SOCKS5 {} -> {}:{} ({:?})", peer, host, port, action);

    if action == Action::Reject {
        // Dialing is skipped entirely for rejected targets.
        send_reply(&mut stream, REPLY_REFUSED).await?;
        return Ok(());
    }

    let mut upstream =
        match Upstream::open(action, &ctx.tunnel, &host, port, ctx.dial_timeout).await {
            Ok(u) => u,
            Err(e) => {
                log::warn!("SOCKS5 dial {}:{} failed: {}", host, port, e);
                send_reply(&mut stream, REPLY_REFUSED).await?;
                return Ok(());
            }
        };

    send_reply(&mut stream, REPLY_SUCCESS).await?;

    match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
        Ok((up, down)) => {
            log::debug!("SOCKS5 {} done ({} up / {} down bytes)", peer, up, down)
        }
        Err(e) => log::debug!("SOCKS5 {} ended: {}", peer, e),
    }
    Ok(())
}

/// Method negotiation: only NO AUTH is acceptable.
async fn negotiate_method<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::Protocol(format!("unsupported SOCKS version {}", head[0])));
    }

    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS])
            .await?;
        return Err(Error::Protocol("no acceptable auth method".into()));
    }

    stream.write_all(&[SOCKS_VERSION, NO_AUTH]).await?;
    Ok(())
}

enum RequestError {
    /// Answerable with a reply code before closing
    Unsupported(u8, String),
    Fatal(Error),
}

impl From<std::io::Error> for RequestError {
    fn from(e: std::io::Error) -> Self {
        RequestError::Fatal(Error::Io(e))
    }
}

/// Read the CONNECT request and its target address.
async fn read_request<S>(stream: &mut S) -> std::result::Result<Target, RequestError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;

    if head[0] != SOCKS_VERSION {
        return Err(RequestError::Fatal(Error::Protocol(format!(
            "unsupported SOCKS version {} in request",
            head[0]
        ))));
    }
    if head[1] != CMD_CONNECT {
        return Err(RequestError::Unsupported(
            REPLY_COMMAND_NOT_SUPPORTED,
            format!("unsupported command {}", head[1]),
        ));
    }

    let target = match head[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            Target::Addr(SocketAddr::from((addr, port)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let port = read_port(stream).await?;
            let name = String::from_utf8(name).map_err(|_| {
                RequestError::Fatal(Error::Protocol("domain is not valid UTF-8".into()))
            })?;
            Target::Domain(name, port)
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            Target::Addr(SocketAddr::from((addr, port)))
        }
        other => {
            return Err(RequestError::Unsupported(
                REPLY_ATYP_NOT_SUPPORTED,
                format!("unsupported address type {}", other),
            ))
        }
    };

    Ok(target)
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

/// Reply with the given code and a zero bind address.
async fn send_reply<S>(stream: &mut S, code: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        SOCKS_VERSION,
        code,
        0x00, // reserved
        ATYP_IPV4,
        0, 0, 0, 0, // bind address
        0, 0, // bind port
    ];
    stream.write_all(&reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drive<F, Fut, T>(client_bytes: &[u8], f: F) -> (T, Vec<u8>)
    where
        F: FnOnce(tokio::io::DuplexStream) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(client_bytes).await.unwrap();

        let result = f(server).await;

        let mut replies = vec![0u8; 64];
        let n = match tokio::time::timeout(
            Duration::from_millis(100),
            client.read(&mut replies),
        )
        .await
        {
            Ok(Ok(n)) => n,
            _ => 0,
        };
        replies.truncate(n);
        (result, replies)
    }

    #[tokio::test]
    async fn greeting_selects_no_auth() {
        let (result, reply) = drive(&[0x05, 0x01, 0x00], |mut s| async move {
            negotiate_method(&mut s).await
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(reply, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn greeting_without_no_auth_is_refused() {
        let (result, reply) = drive(&[0x05, 0x01, 0x02], |mut s| async move {
            negotiate_method(&mut s).await
        })
        .await;
        assert!(result.is_err());
        assert_eq!(reply, vec![0x05, 0xFF]);
    }

    #[tokio::test]
    async fn wrong_version_is_fatal() {
        let (result, _) = drive(&[0x04, 0x01, 0x00], |mut s| async move {
            negotiate_method(&mut s).await
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn request_domain_stays_unresolved() {
        // CONNECT secret.corp:443 via domain ATYP, as a client would send it.
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 0x0B];
        req.extend_from_slice(b"secret.corp");
        req.extend_from_slice(&[0x01, 0xBB]);

        let (result, _) =
            drive(&req, |mut s| async move { read_request(&mut s).await }).await;
        match result {
            Ok(Target::Domain(host, port)) => {
                assert_eq!(host, "secret.corp");
                assert_eq!(port, 443);
            }
            _ => panic!("expected a domain target"),
        }
    }

    #[tokio::test]
    async fn request_ipv4() {
        let req = [0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50];
        let (result, _) =
            drive(&req, |mut s| async move { read_request(&mut s).await }).await;
        match result {
            Ok(Target::Addr(sa)) => assert_eq!(sa, "1.2.3.4:80".parse().unwrap()),
            _ => panic!("expected an address target"),
        }
    }

    #[tokio::test]
    async fn request_ipv6() {
        let mut req = vec![0x05, 0x01, 0x00, 0x04];
        req.extend_from_slice(&[0u8; 15]);
        req.push(1); // ::1
        req.extend_from_slice(&[0x01, 0xBB]);
        let (result, _) =
            drive(&req, |mut s| async move { read_request(&mut s).await }).await;
        match result {
            Ok(Target::Addr(sa)) => {
                assert_eq!(sa.ip().to_string(), "::1");
                assert_eq!(sa.port(), 443);
            }
            _ => panic!("expected an address target"),
        }
    }

    #[tokio::test]
    async fn unknown_command_gets_0x07() {
        let req = [0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50]; // BIND
        let (result, _) =
            drive(&req, |mut s| async move { read_request(&mut s).await }).await;
        match result {
            Err(RequestError::Unsupported(code, _)) => {
                assert_eq!(code, REPLY_COMMAND_NOT_SUPPORTED)
            }
            _ => panic!("expected an unsupported-command error"),
        }
    }

    #[tokio::test]
    async fn unknown_atyp_gets_0x08() {
        let req = [0x05, 0x01, 0x00, 0x09, 0, 0];
        let (result, _) =
            drive(&req, |mut s| async move { read_request(&mut s).await }).await;
        match result {
            Err(RequestError::Unsupported(code, _)) => {
                assert_eq!(code, REPLY_ATYP_NOT_SUPPORTED)
            }
            _ => panic!("expected an unsupported-atyp error"),
        }
    }

    #[tokio::test]
    async fn reply_bytes_are_exact() {
        let (_, reply) = drive(&[], |mut s| async move {
            send_reply(&mut s, REPLY_SUCCESS).await
        })
        .await;
        assert_eq!(reply, vec![0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }
}
