//! Channel pumps: bridging blocking libssh2 channels to async streams
//!
//! libssh2 serializes all calls on an internal session lock, so a call
//! that blocks inside the library would stall every other channel on the
//! same session. All sessions therefore run in non-blocking mode, and
//! each channel is driven by a single dedicated pump thread that retries
//! on `WouldBlock` — the same single-threaded non-blocking pump shape
//! used for plain TCP relays.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use futures::sink::SinkMapErr;
use futures::SinkExt;
use ssh2::Channel;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{CopyToBytes, SinkWriter, StreamReader};
use tokio_util::sync::{PollSendError, PollSender};

const PUMP_BUF_SIZE: usize = 16 * 1024;
const CHANNEL_DEPTH: usize = 32;
const IDLE_SLEEP: Duration = Duration::from_millis(1);

// SinkWriter needs Sink<_, Error: Into<io::Error>>; PollSendError does
// not convert, so it is mapped here.
fn poll_send_to_io(_: PollSendError<Bytes>) -> io::Error {
    io::Error::from(io::ErrorKind::BrokenPipe)
}

type TunnelReader = StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>;
type TunnelWriter =
    SinkWriter<CopyToBytes<SinkMapErr<PollSender<Bytes>, fn(PollSendError<Bytes>) -> io::Error>>>;

/// A bidirectional byte stream tunneled through an SSH channel.
///
/// Reading yields bytes received from the remote end; writing sends
/// toward it. Shutting down the write half sends channel EOF while the
/// read half keeps draining; dropping the stream tears the channel down.
pub struct TunnelStream {
    reader: TunnelReader,
    writer: TunnelWriter,
}

impl TunnelStream {
    /// Wrap an open channel, spawning its pump thread.
    ///
    /// The channel's session must already be in non-blocking mode.
    pub(crate) fn spawn(channel: Channel, label: String) -> Self {
        let (in_tx, in_rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);

        thread::Builder::new()
            .name(format!("tunnel-pump {}", label))
            .spawn(move || pump_channel(channel, in_tx, out_rx))
            .ok();

        let sink = PollSender::new(out_tx)
            .sink_map_err(poll_send_to_io as fn(PollSendError<Bytes>) -> io::Error);

        Self {
            reader: StreamReader::new(ReceiverStream::new(in_rx)),
            writer: SinkWriter::new(CopyToBytes::new(sink)),
        }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Drive one channel: remote bytes into `in_tx`, `out_rx` bytes to the
/// remote. Exits when both directions have finished or the stream side
/// has gone away.
fn pump_channel(
    mut channel: Channel,
    in_tx: mpsc::Sender<io::Result<Bytes>>,
    mut out_rx: mpsc::Receiver<Bytes>,
) {
    let mut buf = vec![0u8; PUMP_BUF_SIZE];
    // (data, next index) not yet written to the channel
    let mut pending: Option<(Bytes, usize)> = None;
    let mut write_open = true;
    let mut read_open = true;
    let mut reader_alive = true;

    while read_open || write_open || pending.is_some() {
        let mut progressed = false;

        // A dropped TunnelStream closes the inbound channel; stop
        // delivering and let the orphan check below end the pump.
        if reader_alive && in_tx.is_closed() {
            reader_alive = false;
        }

        // Local -> remote, flushing any partial write first.
        if let Some((data, pos)) = pending.as_mut() {
            match channel.write(&data[*pos..]) {
                Ok(n) if n > 0 => {
                    *pos += n;
                    progressed = true;
                    if *pos >= data.len() {
                        pending = None;
                    }
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::debug!("tunnel channel write error: {}", e);
                    pending = None;
                    write_open = false;
                }
            }
        } else if write_open {
            match out_rx.try_recv() {
                Ok(data) => {
                    pending = Some((data, 0));
                    progressed = true;
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    // Write half shut down: propagate EOF so the remote
                    // read side can drain and finish.
                    let _ = channel.send_eof();
                    write_open = false;
                    progressed = true;
                }
            }
        }

        // Remote -> local.
        if read_open {
            match channel.read(&mut buf) {
                Ok(0) => {
                    read_open = false;
                    progressed = true;
                }
                Ok(n) => {
                    progressed = true;
                    if reader_alive {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if in_tx.blocking_send(Ok(chunk)).is_err() {
                            reader_alive = false;
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if channel.eof() {
                        read_open = false;
                    }
                }
                Err(e) => {
                    if reader_alive {
                        let _ = in_tx.blocking_send(Err(e));
                        reader_alive = false;
                    }
                    read_open = false;
                    progressed = true;
                }
            }
        }

        // Fully orphaned: the TunnelStream was dropped.
        if !reader_alive && !write_open && pending.is_none() {
            break;
        }

        if !progressed {
            thread::sleep(IDLE_SLEEP);
        }
    }

    drop(in_tx);
    let _ = channel.close();
}

/// A loopback TCP bridge carrying one SSH channel.
///
/// libssh2 needs a real socket for its transport, so a jump hop cannot
/// hand its channel directly to the next `Session`. Instead the channel
/// is pumped to a 127.0.0.1 socket pair and the next session connects to
/// that.
pub(crate) struct ChannelBridge {
    local: Option<TcpStream>,
}

impl ChannelBridge {
    /// Bind a loopback listener, spawn the pump, and connect through it.
    ///
    /// The channel's session must already be in non-blocking mode.
    pub(crate) fn start(channel: Channel, label: String) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let addr = listener.local_addr()?;

        thread::Builder::new()
            .name(format!("hop-bridge {}", label))
            .spawn(move || {
                if let Ok((sock, _)) = listener.accept() {
                    let _ = sock.set_nodelay(true);
                    if sock.set_nonblocking(true).is_ok() {
                        pump_socket(channel, sock);
                    }
                }
            })
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let local = TcpStream::connect(addr)?;
        local.set_nodelay(true).ok();

        Ok(Self { local: Some(local) })
    }

    /// The local socket whose far end is the remote hop.
    pub(crate) fn take_stream(&mut self) -> Option<TcpStream> {
        self.local.take()
    }
}

/// Relay between a non-blocking channel and a non-blocking TCP socket
/// until either side closes.
fn pump_socket(mut channel: Channel, mut sock: TcpStream) {
    let mut to_remote = vec![0u8; PUMP_BUF_SIZE];
    let mut to_local = vec![0u8; PUMP_BUF_SIZE];
    let mut pending_up: Option<(Vec<u8>, usize)> = None;
    let mut pending_down: Option<(Vec<u8>, usize)> = None;
    let mut sock_open = true;
    let mut chan_open = true;

    while sock_open || chan_open || pending_up.is_some() || pending_down.is_some() {
        let mut progressed = false;

        // socket -> channel
        if let Some((data, pos)) = pending_up.as_mut() {
            match channel.write(&data[*pos..]) {
                Ok(n) if n > 0 => {
                    *pos += n;
                    progressed = true;
                    if *pos >= data.len() {
                        pending_up = None;
                    }
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        } else if sock_open {
            match sock.read(&mut to_remote) {
                Ok(0) => {
                    sock_open = false;
                    let _ = channel.send_eof();
                    progressed = true;
                }
                Ok(n) => {
                    pending_up = Some((to_remote[..n].to_vec(), 0));
                    progressed = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }

        // channel -> socket
        if let Some((data, pos)) = pending_down.as_mut() {
            match sock.write(&data[*pos..]) {
                Ok(n) if n > 0 => {
                    *pos += n;
                    progressed = true;
                    if *pos >= data.len() {
                        pending_down = None;
                    }
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        } else if chan_open {
            match channel.read(&mut to_local) {
                Ok(0) => {
                    chan_open = false;
                    let _ = sock.shutdown(std::net::Shutdown::Write);
                    progressed = true;
                }
                Ok(n) => {
                    pending_down = Some((to_local[..n].to_vec(), 0));
                    progressed = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if channel.eof() {
                        chan_open = false;
                        let _ = sock.shutdown(std::net::Shutdown::Write);
                    }
                }
                Err(_) => break,
            }
        }

        if !progressed {
            thread::sleep(IDLE_SLEEP);
        }
    }

    let _ = channel.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // The pump thread cannot run without a live SSH session, but the
    // stream half is pure plumbing and can be exercised directly.
    fn stream_parts() -> (
        TunnelStream,
        mpsc::Sender<io::Result<Bytes>>,
        mpsc::Receiver<Bytes>,
    ) {
        let (in_tx, in_rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let sink = PollSender::new(out_tx)
            .sink_map_err(poll_send_to_io as fn(PollSendError<Bytes>) -> io::Error);
        let stream = TunnelStream {
            reader: StreamReader::new(ReceiverStream::new(in_rx)),
            writer: SinkWriter::new(CopyToBytes::new(sink)),
        };
        (stream, in_tx, out_rx)
    }

    #[tokio::test]
    async fn read_yields_inbound_bytes() {
        let (mut stream, in_tx, _out_rx) = stream_parts();
        in_tx.send(Ok(Bytes::from_static(b"hello"))).await.unwrap();
        drop(in_tx);

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn write_reaches_outbound_channel() {
        let (mut stream, _in_tx, mut out_rx) = stream_parts();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn shutdown_closes_outbound() {
        let (mut stream, _in_tx, mut out_rx) = stream_parts();
        stream.shutdown().await.unwrap();
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn inbound_error_surfaces_on_read() {
        let (mut stream, in_tx, _out_rx) = stream_parts();
        in_tx
            .send(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
            .await
            .unwrap();

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
