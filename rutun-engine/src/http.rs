//! HTTP/HTTPS forward proxy frontend
//!
//! One TCP listener, two request shapes: absolute-URL requests
//! (GET/POST/...) are forwarded after rewriting the request line to
//! origin form, and CONNECT requests become raw byte tunnels after the
//! `200 Connection Established` reply. Routing decides PROXY, DIRECT or
//! REJECT per target host before anything is dialed.

use std::sync::Arc;
use std::time::Duration;

use rutun_router::{Action, Router};
use rutun_tunnel::SshTunnel;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::config::bind_addr;
use crate::error::{Error, Result};
use crate::relay::{decide, split_host_port, Upstream};

/// Grace period for in-flight connections after the listener closes
const DRAIN_GRACE: Duration = Duration::from_secs(5);

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

struct ProxyContext {
    tunnel: Arc<SshTunnel>,
    router: Option<Arc<Router>>,
    upstream_override: Option<String>,
    dial_timeout: Duration,
}

/// HTTP proxy frontend
pub struct HttpProxy {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
}

impl HttpProxy {
    /// Bind the listener. Failing here aborts startup.
    pub async fn bind(
        listen: &str,
        tunnel: Arc<SshTunnel>,
        router: Option<Arc<Router>>,
        upstream_override: Option<String>,
        dial_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr(listen)).await?;
        log::info!("HTTP proxy listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            ctx: Arc::new(ProxyContext {
                tunnel,
                router,
                upstream_override,
                dial_timeout,
            }),
        })
    }

    /// Serve until shutdown, then drain in-flight connections with a
    /// bounded grace period.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => {
                    let (socket, peer) = accepted?;
                    let ctx = self.ctx.clone();
                    tasks.spawn(async move {
                        if let Err(e) = handle_connection(ctx, socket).await {
                            log::warn!("HTTP client {}: {}", peer, e);
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
            log::debug!("HTTP drain grace expired with connections in flight");
        }

        log::info!("HTTP proxy stopped");
        Ok(())
    }
}

/// Parsed request line
#[derive(Debug, PartialEq, Eq)]
struct RequestLine {
    method: String,
    target: String,
    version: String,
}

fn parse_request_line(line: &str) -> Result<RequestLine> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) if parts.next().is_none() => Ok(RequestLine {
            method: m.to_string(),
            target: t.to_string(),
            version: v.to_string(),
        }),
        _ => Err(Error::Protocol(format!("bad request line: {}", line.trim_end()))),
    }
}

/// Parsed absolute URL target
#[derive(Debug, PartialEq, Eq)]
struct AbsoluteTarget {
    host: String,
    port: u16,
    path: String,
}

/// Parse an absolute-form target (`http://host[:port]/path`). Returns
/// `None` for origin-form or otherwise non-absolute targets.
fn parse_absolute_url(target: &str) -> Option<AbsoluteTarget> {
    let (scheme, rest) = target.split_once("://")?;
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    let (host, port) = split_host_port(host_port, default_port).ok()?;
    if host.is_empty() {
        return None;
    }

    Some(AbsoluteTarget {
        host,
        port,
        path: path.to_string(),
    })
}

async fn handle_connection(ctx: Arc<ProxyContext>, stream: TcpStream) -> Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(()); // connection closed before a request
    }
    let request = match parse_request_line(&request_line) {
        Ok(r) => r,
        Err(e) => {
            let _ = respond(reader.get_mut(), 400, "Bad Request").await;
            return Err(e);
        }
    };

    // Header block, kept verbatim for passthrough.
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(Error::Protocol("connection closed mid-headers".into()));
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
        headers.push(line);
    }

    if request.method == "CONNECT" {
        handle_connect(ctx, reader, &request).await
    } else {
        handle_absolute(ctx, reader, &request, &headers).await
    }
}

async fn handle_connect(
    ctx: Arc<ProxyContext>,
    mut reader: BufReader<TcpStream>,
    request: &RequestLine,
) -> Result<()> {
    let (host, port) = split_host_port(&request.target, 443)?;

    let action = decide(ctx.router.as_ref(), &host);
    log::info!("CONNECT {}:{} -> {:?}", host, port, action);

    if action == Action::Reject {
        return respond(reader.get_mut(), 403, "Forbidden").await;
    }

    let upstream =
        match Upstream::open(action, &ctx.tunnel, &host, port, ctx.dial_timeout).await {
            Ok(u) => u,
            Err(e) => {
                log::warn!("CONNECT {}:{} dial failed: {}", host, port, e);
                return respond(reader.get_mut(), 502, "Bad Gateway").await;
            }
        };

    reader.get_mut().write_all(ESTABLISHED).await?;
    relay_bidirectional(reader, upstream).await
}

async fn handle_absolute(
    ctx: Arc<ProxyContext>,
    mut reader: BufReader<TcpStream>,
    request: &RequestLine,
    headers: &[String],
) -> Result<()> {
    let Some(target) = parse_absolute_url(&request.target) else {
        log::warn!("non-absolute target on {}: {}", request.method, request.target);
        return respond(reader.get_mut(), 400, "Bad Request").await;
    };

    let action = decide(ctx.router.as_ref(), &target.host);
    log::info!(
        "{} {}:{} -> {:?}",
        request.method,
        target.host,
        target.port,
        action
    );

    if action == Action::Reject {
        return respond(reader.get_mut(), 403, "Forbidden").await;
    }

    // The forced upstream replaces the dial target only; routing already
    // ran against the requested host.
    let (dial_host, dial_port) = match (&ctx.upstream_override, action) {
        (Some(upstream), Action::Proxy) => split_host_port(upstream, 80)?,
        _ => (target.host.clone(), target.port),
    };

    let mut upstream = match Upstream::open(
        action,
        &ctx.tunnel,
        &dial_host,
        dial_port,
        ctx.dial_timeout,
    )
    .await
    {
        Ok(u) => u,
        Err(e) => {
            log::warn!(
                "{} {}:{} dial failed: {}",
                request.method,
                dial_host,
                dial_port,
                e
            );
            return respond(reader.get_mut(), 502, "Bad Gateway").await;
        }
    };

    // Origin-form request line, then the header block untouched.
    let head = format!("{} {} {}\r\n", request.method, target.path, request.version);
    upstream.write_all(head.as_bytes()).await?;
    for header in headers {
        upstream.write_all(header.as_bytes()).await?;
    }
    upstream.write_all(b"\r\n").await?;

    relay_bidirectional(reader, upstream).await
}

/// Flush any bytes buffered past the header block, then copy both
/// directions until close; either half-close propagates to the other
/// side.
async fn relay_bidirectional(
    mut reader: BufReader<TcpStream>,
    mut upstream: Upstream,
) -> Result<()> {
    let buffered = reader.buffer().to_vec();
    if !buffered.is_empty() {
        upstream.write_all(&buffered).await?;
        reader.consume(buffered.len());
    }

    let mut client = reader.into_inner();
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((up, down)) => {
            log::debug!("relay done: {} bytes up, {} bytes down", up, down);
            Ok(())
        }
        // Peer resets are routine at the end of hijacked tunnels.
        Err(e) => {
            log::debug!("relay ended: {}", e);
            Ok(())
        }
    }
}

async fn respond(stream: &mut TcpStream, code: u16, message: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        code, message
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_parses() {
        let r = parse_request_line("GET http://example.com/ HTTP/1.1\r\n").unwrap();
        assert_eq!(r.method, "GET");
        assert_eq!(r.target, "http://example.com/");
        assert_eq!(r.version, "HTTP/1.1");
    }

    #[test]
    fn request_line_rejects_garbage() {
        assert!(parse_request_line("GET\r\n").is_err());
        assert!(parse_request_line("\r\n").is_err());
        assert!(parse_request_line("A B C D\r\n").is_err());
    }

    #[test]
    fn absolute_url_default_ports() {
        let t = parse_absolute_url("http://example.com/").unwrap();
        assert_eq!((t.host.as_str(), t.port, t.path.as_str()), ("example.com", 80, "/"));

        let t = parse_absolute_url("https://example.com/x/y?z=1").unwrap();
        assert_eq!((t.port, t.path.as_str()), (443, "/x/y?z=1"));
    }

    #[test]
    fn absolute_url_explicit_port_and_bare_host() {
        let t = parse_absolute_url("http://example.com:8080").unwrap();
        assert_eq!((t.port, t.path.as_str()), (8080, "/"));
    }

    #[test]
    fn origin_form_is_not_absolute() {
        assert!(parse_absolute_url("/index.html").is_none());
        assert!(parse_absolute_url("example.com:443").is_none());
        assert!(parse_absolute_url("ftp://example.com/").is_none());
    }
}
