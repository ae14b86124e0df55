//! Hop chain establishment and the tunneled dial primitive

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use ssh2::{ErrorCode, Session};

use crate::auth;
use crate::config::{HopAddr, TunnelConfig};
use crate::error::{Error, Result};
use crate::pump::{ChannelBridge, TunnelStream};

// libssh2 error codes surfaced through ssh2::Error::code()
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_CHANNEL_FAILURE: i32 = -21;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

const EAGAIN_RETRY_SLEEP: Duration = Duration::from_millis(2);

/// One established hop. The session owns its transport socket; for
/// non-first hops that socket is the local end of a loopback bridge.
struct Hop {
    session: Session,
    label: String,
}

/// An authenticated multi-hop SSH session.
///
/// Shared read-only across the proxy frontends and the TUN plane. All
/// methods take `&self`; channel multiplexing is serialized internally by
/// libssh2's session lock.
pub struct SshTunnel {
    hops: Mutex<Option<Vec<Hop>>>,
    dial_timeout: Duration,
    target: HopAddr,
}

impl SshTunnel {
    /// Establish the full hop chain. Blocking; run via `spawn_blocking`
    /// from async contexts (this may prompt for a password).
    pub fn connect(config: &TunnelConfig) -> Result<Self> {
        let mut hops: Vec<Hop> = Vec::with_capacity(config.jumps.len() + 1);

        let chain = config
            .jumps
            .iter()
            .chain(std::iter::once(&config.target));

        for hop_addr in chain {
            let result = match hops.last() {
                None => connect_direct(hop_addr, config),
                Some(prev) => connect_via(prev, hop_addr, config),
            };

            match result {
                Ok(hop) => {
                    log::info!("established SSH hop {}", hop.label);
                    hops.push(hop);
                }
                Err(e) => {
                    // Tear down partially established hops in reverse.
                    close_hops(&mut hops);
                    return Err(e);
                }
            }
        }

        // Sessions stay blocking while they serve as the construction
        // transport for the next hop; the terminal session switches to
        // non-blocking here so concurrent channel pumps can never stall
        // each other inside libssh2.
        if let Some(last) = hops.last() {
            last.session.set_blocking(false);
        }

        Ok(Self {
            hops: Mutex::new(Some(hops)),
            dial_timeout: config.dial_timeout,
            target: config.target.clone(),
        })
    }

    /// The final SSH endpoint this tunnel terminates at.
    pub fn target(&self) -> &HopAddr {
        &self.target
    }

    /// Open a TCP channel to `host:port` inside the session.
    ///
    /// Returns a bidirectional stream, or a classified error; never a
    /// partially usable stream. Failures do not invalidate the session.
    pub async fn dial(self: Arc<Self>, host: &str, port: u16) -> Result<TunnelStream> {
        let this = self;
        let host = host.to_string();
        tokio::task::spawn_blocking(move || this.dial_blocking(&host, port))
            .await
            .map_err(|e| Error::SessionDown(format!("dial task failed: {}", e)))?
    }

    /// Blocking form of [`dial`](Self::dial).
    pub fn dial_blocking(&self, host: &str, port: u16) -> Result<TunnelStream> {
        let addr = format!("{}:{}", host, port);
        let deadline = Instant::now() + self.dial_timeout;

        loop {
            let attempt = {
                let guard = self.lock_hops();
                let hops = guard.as_ref().ok_or(Error::Closed)?;
                let last = hops
                    .last()
                    .ok_or_else(|| Error::SessionDown("no established hops".into()))?;
                last.session.channel_direct_tcpip(host, port, None)
            };

            match attempt {
                Ok(channel) => {
                    log::debug!("tunnel dial {} ok", addr);
                    return Ok(TunnelStream::spawn(channel, addr));
                }
                Err(e) if code_of(&e) == LIBSSH2_ERROR_EAGAIN => {
                    if Instant::now() >= deadline {
                        return Err(Error::DialTimeout { addr });
                    }
                    thread::sleep(EAGAIN_RETRY_SLEEP);
                }
                Err(e) => return Err(classify_dial_error(e, addr)),
            }
        }
    }

    /// Close the tunnel, cascading through the hops in reverse.
    /// Safe to call more than once.
    pub fn close(&self) {
        let mut guard = self.lock_hops();
        if let Some(mut hops) = guard.take() {
            log::debug!("closing SSH tunnel ({} hops)", hops.len());
            close_hops(&mut hops);
        }
    }

    fn lock_hops(&self) -> MutexGuard<'_, Option<Vec<Hop>>> {
        match self.hops.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

fn close_hops(hops: &mut Vec<Hop>) {
    while let Some(hop) = hops.pop() {
        let _ = hop
            .session
            .disconnect(None, "closing", None);
    }
}

/// First hop: plain TCP, trying every resolved address under the timeout.
fn connect_direct(hop: &HopAddr, config: &TunnelConfig) -> Result<Hop> {
    let addr_str = hop.addr();
    let addrs = addr_str
        .to_socket_addrs()
        .map_err(|e| Error::Connect {
            host: addr_str.clone(),
            source: e,
        })?;

    let mut last_err: Option<io::Error> = None;
    let mut tcp = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.dial_timeout) {
            Ok(s) => {
                tcp = Some(s);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }

    let tcp = tcp.ok_or_else(|| Error::Connect {
        host: addr_str.clone(),
        source: last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")),
    })?;
    tcp.set_nodelay(true).ok();

    establish(tcp, hop, config)
}

/// Subsequent hop: a direct-tcpip channel over the previous hop, carried
/// by a loopback bridge because libssh2 needs a real socket transport.
fn connect_via(prev: &Hop, hop: &HopAddr, config: &TunnelConfig) -> Result<Hop> {
    let channel = prev
        .session
        .channel_direct_tcpip(&hop.host, hop.port, None)
        .map_err(|e| Error::Connect {
            host: hop.addr(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, e),
        })?;

    // The previous session carries only this one channel from here on;
    // its pump needs non-blocking mode before it starts.
    prev.session.set_blocking(false);

    let mut bridge = ChannelBridge::start(channel, hop.addr())
        .map_err(|e| Error::Connect {
            host: hop.addr(),
            source: e,
        })?;
    let tcp = bridge.take_stream().ok_or_else(|| Error::Connect {
        host: hop.addr(),
        source: io::Error::new(io::ErrorKind::BrokenPipe, "bridge socket unavailable"),
    })?;

    establish(tcp, hop, config)
}

/// Handshake and authenticate one hop over an established transport.
/// The session is left in blocking mode; callers switch it to
/// non-blocking once its channel traffic starts being pumped.
fn establish(tcp: TcpStream, hop: &HopAddr, config: &TunnelConfig) -> Result<Hop> {
    let mut session = Session::new().map_err(|e| Error::Handshake {
        host: hop.addr(),
        reason: e.to_string(),
    })?;

    session.set_tcp_stream(tcp);
    // Bound the handshake; 0 afterwards so idle tunnels never time out.
    session.set_timeout(config.dial_timeout.as_millis() as u32);

    session.handshake().map_err(|e| Error::Handshake {
        host: hop.addr(),
        reason: e.to_string(),
    })?;

    // Host keys are accepted on first connect; this is a local-user tool,
    // not a server component.

    auth::authenticate(&session, &hop.user, &hop.host, &config.auth)?;
    if !session.authenticated() {
        return Err(Error::AuthFailed {
            user: hop.user.clone(),
            host: hop.host.clone(),
            reason: "authentication rejected".to_string(),
        });
    }

    session.set_timeout(0);

    Ok(Hop {
        session,
        label: hop.to_string(),
    })
}

fn code_of(e: &ssh2::Error) -> i32 {
    match e.code() {
        ErrorCode::Session(c) => c,
        ErrorCode::SFTP(c) => c,
    }
}

fn classify_dial_error(e: ssh2::Error, addr: String) -> Error {
    match code_of(&e) {
        LIBSSH2_ERROR_CHANNEL_FAILURE => Error::DialRefused { addr },
        LIBSSH2_ERROR_SOCKET_SEND | LIBSSH2_ERROR_SOCKET_RECV | LIBSSH2_ERROR_SOCKET_DISCONNECT => {
            Error::SessionDown(e.to_string())
        }
        _ => Error::DialRefused { addr },
    }
}
