//! Userspace TCP/IP stack plane
//!
//! A `netstack-smoltcp` stack sits behind the TUN device. Two pump tasks
//! connect the two: the inbound pump injects device packets into the
//! stack, the outbound pump writes stack-produced packets back to the
//! device. The stack's TCP listener yields hijacked flows; its UDP
//! socket yields datagrams, of which only port-53 queries are serviced.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures::{SinkExt, StreamExt};
use netstack_smoltcp::udp::{ReadHalf as UdpReadHalf, UdpMsg, WriteHalf as UdpWriteHalf};
use netstack_smoltcp::StackBuilder;
use rutun_tunnel::SshTunnel;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::alias::{rewrite_destination, SubnetAlias};
use crate::device::TunDevice;
use crate::dns;
use crate::error::{Error, Result};

/// Queue depth between the device pumps and the stack
const STACK_BUFFER: usize = 512;
/// Per-flow TCP buffer inside the stack
const TCP_BUFFER: usize = 64 * 1024;

/// Whether a pump error means the device or stack has been shut down.
/// The underlying libraries expose closure only through their error
/// messages, an acknowledged fragility.
fn is_closed_error(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("closed") || msg.contains("shut down") || msg.contains("bad file descriptor")
}

/// Start the stack, its runner, the two pumps and the two forwarder
/// loops. Returns the spawned task handles.
pub(crate) fn start(
    device: Arc<TunDevice>,
    aliases: Arc<Vec<SubnetAlias>>,
    tunnel: Arc<SshTunnel>,
    shutdown: &broadcast::Sender<()>,
) -> Result<Vec<JoinHandle<()>>> {
    let (stack, runner, udp_socket, tcp_listener) = StackBuilder::default()
        .enable_tcp(true)
        .enable_udp(true)
        .enable_icmp(false)
        .stack_buffer_size(STACK_BUFFER)
        .tcp_buffer_size(TCP_BUFFER)
        .build()
        .map_err(|e| Error::Netstack(format!("failed to build netstack: {}", e)))?;

    let mut handles = Vec::new();

    if let Some(runner) = runner {
        handles.push(tokio::spawn(async move {
            if let Err(e) = runner.await {
                log::error!("netstack runner exited: {}", e);
            }
        }));
    }

    let (stack_sink, stack_stream) = stack.split();

    handles.push(spawn_inbound_pump(
        device.clone(),
        stack_sink,
        shutdown.subscribe(),
    ));
    handles.push(spawn_outbound_pump(
        device,
        stack_stream,
        shutdown.subscribe(),
    ));

    let tcp_listener = tcp_listener
        .ok_or_else(|| Error::Netstack("netstack returned no TCP listener".into()))?;
    handles.push(spawn_tcp_forwarder(
        tcp_listener.boxed(),
        aliases,
        tunnel.clone(),
        shutdown.subscribe(),
    ));

    let udp_socket =
        udp_socket.ok_or_else(|| Error::Netstack("netstack returned no UDP socket".into()))?;
    let (udp_read, udp_write) = udp_socket.split();
    let udp_socket = CombinedUdp {
        read: udp_read,
        write: udp_write,
    };
    handles.push(spawn_udp_forwarder(udp_socket, tunnel, shutdown.subscribe()));

    Ok(handles)
}

/// Inbound pump: device -> stack.
fn spawn_inbound_pump<S>(
    device: Arc<TunDevice>,
    mut stack_sink: S,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()>
where
    S: futures::Sink<Vec<u8>> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; crate::device::TUN_MTU as usize + 64];
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                read = device.recv(&mut buf) => match read {
                    Ok(n) => {
                        if let Err(e) = stack_sink.send(buf[..n].to_vec()).await {
                            log::debug!("inbound pump: stack gone: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        if !is_closed_error(&e.to_string()) {
                            log::error!("inbound pump: device read failed: {}", e);
                        }
                        break;
                    }
                },
            }
        }
        log::debug!("inbound pump exited");
    })
}

/// Outbound pump: stack -> device.
fn spawn_outbound_pump<S>(
    device: Arc<TunDevice>,
    mut stack_stream: S,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()>
where
    S: futures::Stream<Item = std::io::Result<Vec<u8>>> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                pkt = stack_stream.next() => match pkt {
                    Some(Ok(pkt)) => {
                        if let Err(e) = device.send(&pkt).await {
                            if !is_closed_error(&e.to_string()) {
                                log::error!("outbound pump: device write failed: {}", e);
                            }
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::debug!("outbound pump: stack read error: {}", e);
                    }
                    None => break,
                },
            }
        }
        log::debug!("outbound pump exited");
    })
}

/// TCP forwarder: one task per hijacked flow.
fn spawn_tcp_forwarder<L, S>(
    mut listener: L,
    aliases: Arc<Vec<SubnetAlias>>,
    tunnel: Arc<SshTunnel>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()>
where
    L: futures::Stream<Item = (S, SocketAddr, SocketAddr)> + Unpin + Send + 'static,
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let (stream, src, dst) = tokio::select! {
                _ = shutdown.recv() => break,
                next = listener.next() => match next {
                    Some(flow) => flow,
                    None => break,
                },
            };

            let aliases = aliases.clone();
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                handle_tcp_flow(stream, src, dst, &aliases, tunnel).await;
            });
        }
        log::debug!("TCP forwarder exited");
    })
}

async fn handle_tcp_flow<S>(
    mut stream: S,
    src: SocketAddr,
    dst: SocketAddr,
    aliases: &[SubnetAlias],
    tunnel: Arc<SshTunnel>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let SocketAddr::V4(dst_v4) = dst else {
        // IPv6 on the TUN side is out of scope; drop aborts the flow.
        log::debug!("dropping non-IPv4 flow to {}", dst);
        return;
    };

    let target_ip = rewrite_destination(aliases, *dst_v4.ip());
    let target = target_ip.to_string();
    let port = dst_v4.port();

    let mut upstream = match tunnel.dial(&target, port).await {
        Ok(s) => s,
        Err(e) => {
            // Dropping the local stream aborts the flow toward the app.
            log::warn!("TUN flow {} -> {}:{} dial failed: {}", src, target, port, e);
            return;
        }
    };

    log::info!("TUN flow {} -> {}:{}", src, target, port);
    match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
        Ok((up, down)) => log::debug!(
            "TUN flow {} -> {}:{} done ({} up / {} down bytes)",
            src,
            target,
            port,
            up,
            down
        ),
        Err(e) => log::debug!("TUN flow {} -> {}:{} ended: {}", src, target, port, e),
    }
}

/// Joins the netstack's separate UDP read/write halves back into a
/// single value implementing both `Stream` and `Sink`, as
/// `spawn_udp_forwarder` expects.
struct CombinedUdp {
    read: UdpReadHalf,
    write: UdpWriteHalf,
}

impl futures::Stream for CombinedUdp {
    type Item = UdpMsg;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        futures::Stream::poll_next(Pin::new(&mut self.read), cx)
    }
}

impl futures::Sink<UdpMsg> for CombinedUdp {
    type Error = std::io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        futures::Sink::poll_ready(Pin::new(&mut self.write), cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: UdpMsg) -> std::result::Result<(), Self::Error> {
        futures::Sink::start_send(Pin::new(&mut self.write), item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        futures::Sink::poll_flush(Pin::new(&mut self.write), cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        futures::Sink::poll_close(Pin::new(&mut self.write), cx)
    }
}

/// UDP forwarder: services DNS queries to port 53, drops the rest.
fn spawn_udp_forwarder<U>(
    udp_socket: U,
    tunnel: Arc<SshTunnel>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()>
where
    U: futures::Stream<Item = (Vec<u8>, SocketAddr, SocketAddr)>
        + futures::Sink<(Vec<u8>, SocketAddr, SocketAddr), Error = std::io::Error>
        + Send
        + 'static,
{
    tokio::spawn(async move {
        let (udp_sink, mut udp_stream) = udp_socket.split();
        let udp_sink = Arc::new(tokio::sync::Mutex::new(udp_sink));

        loop {
            let (pkt, src, dst) = tokio::select! {
                _ = shutdown.recv() => break,
                next = udp_stream.next() => match next {
                    Some(datagram) => datagram,
                    None => break,
                },
            };

            if !accepts_udp(&dst) {
                log::debug!("dropping non-DNS UDP to {}", dst);
                continue;
            }

            let tunnel = tunnel.clone();
            let udp_sink = udp_sink.clone();
            tokio::spawn(async move {
                let target = dst.ip().to_string();
                let stream = match tunnel.dial(&target, dst.port()).await {
                    Ok(s) => s,
                    Err(e) => {
                        log::warn!("DNS dial {}:{} failed: {}", target, dst.port(), e);
                        return;
                    }
                };

                match dns::roundtrip(stream, &pkt).await {
                    Ok(response) => {
                        // Reply flows from the resolver's address back to
                        // the querying client.
                        let mut sink = udp_sink.lock().await;
                        if let Err(e) = sink.send((response, dst, src)).await {
                            log::debug!("DNS reply to {} failed: {}", src, e);
                        }
                    }
                    Err(e) => log::debug!("DNS round-trip via {} failed: {}", target, e),
                }
            });
        }
        log::debug!("UDP forwarder exited");
    })
}

/// The UDP forwarder accepts only destination port 53.
fn accepts_udp(dst: &SocketAddr) -> bool {
    dst.port() == 53
}
