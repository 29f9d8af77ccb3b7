//! Server role
//!
//! Accepts carrier sessions off the packet connection, accepts logical
//! streams on each, decodes the protocol frame, and splices the stream
//! onto a freshly dialed TCP or UDP socket. Errors stay contained: a
//! bad stream never kills its session, a dead session never kills the
//! accept loop.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::carrier::kcp::KcpEndpoint;
use crate::carrier::mux::{MuxSession, MuxStream};
use crate::common::pipe::couple;
use crate::common::Address;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::packet::PacketConn;
use crate::protocol::Frame;

const TCP_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const UDP_DIAL_TIMEOUT: Duration = Duration::from_secs(8);

/// Run the server role until the root scope cancels.
pub async fn run(cfg: Config, cancel: CancellationToken) -> Result<()> {
    let (pconn, datagrams) = PacketConn::new(&cfg.network)?;
    let endpoint = KcpEndpoint::new(pconn, datagrams, cfg.transport.kcp.clone(), true);

    let listen_port = cfg
        .listen
        .as_ref()
        .and_then(|l| l.addr.parse::<Address>().ok())
        .map(|a| a.port())
        .unwrap_or(cfg.network.port);
    info!("server started - listening for packets on :{}", listen_port);

    let active = Arc::new(AtomicI64::new(0));

    loop {
        let conn = tokio::select! {
            r = endpoint.accept() => r,
            _ = cancel.cancelled() => break,
        };

        let conn = match conn {
            Ok(c) => c,
            Err(e) => {
                error!("failed to accept connection: {}", e);
                break;
            }
        };

        let peer = conn.peer();
        let mux = MuxSession::new(conn, endpoint.mux_config(), false);
        info!(
            "accepted new connection from {} [active: {}]",
            peer,
            active.fetch_add(1, Ordering::SeqCst) + 1
        );

        let active = Arc::clone(&active);
        let cancel = cancel.clone();
        let tcpbuf = cfg.transport.tcpbuf;
        let udpbuf = cfg.transport.udpbuf;
        tokio::spawn(async move {
            handle_session(Arc::clone(&mux), peer, tcpbuf, udpbuf, cancel).await;
            mux.close();
            info!(
                "connection from {} closed [active: {}]",
                peer,
                active.fetch_sub(1, Ordering::SeqCst) - 1
            );
        });
    }

    info!("server shutdown completed");
    Ok(())
}

/// Accept streams on one carrier session until it errors or the scope
/// cancels.
async fn handle_session(
    mux: Arc<MuxSession>,
    peer: SocketAddr,
    tcpbuf: usize,
    udpbuf: usize,
    cancel: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            r = mux.accept_stream() => r,
            _ = cancel.cancelled() => return,
        };

        let stream = match stream {
            Ok(s) => s,
            Err(_) => return,
        };

        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(stream, peer, tcpbuf, udpbuf, cancel).await {
                debug!("stream from {} ended: {}", peer, e);
            }
        });
    }
}

/// Decode the protocol frame and dispatch one logical stream.
async fn handle_stream(
    mut stream: MuxStream,
    peer: SocketAddr,
    tcpbuf: usize,
    udpbuf: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let frame = match Frame::read(&mut stream).await {
        Ok(f) => f,
        Err(e) => {
            warn!("protocol decode failed on stream from {}: {}", peer, e);
            return Err(e);
        }
    };

    match frame {
        Frame::DialTcp(addr) => {
            info!("accepted TCP stream {}: {} -> {}", stream.sid(), peer, addr);
            handle_tcp(stream, addr, tcpbuf, cancel).await
        }
        Frame::DialUdp(addr) => {
            info!("accepted UDP stream {}: {} -> {}", stream.sid(), peer, addr);
            handle_udp(stream, addr, udpbuf, cancel).await
        }
        Frame::Ping => {
            Frame::Pong.write(&mut stream).await?;
            Ok(())
        }
        // Flag reports and anything else carry no dial; drop the stream.
        Frame::Pong | Frame::TcpFlagReport(_) => Ok(()),
    }
}

async fn handle_tcp(
    stream: MuxStream,
    addr: Address,
    tcpbuf: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let sid = stream.sid();
    let conn = tokio::time::timeout(TCP_DIAL_TIMEOUT, TcpStream::connect(addr.socket_addr()))
        .await
        .map_err(|_| Error::Timeout)
        .and_then(|r| r.map_err(Error::Io))
        .map_err(|e| {
            error!(
                "failed to establish TCP connection to {} for stream {}: {}",
                addr, sid, e
            );
            e
        })?;
    debug!("TCP connection established to {} for stream {}", addr, sid);

    let (_, err) = couple(stream, conn, tcpbuf, &cancel).await;
    if let Some(e) = err {
        debug!("TCP stream {} to {} finished with: {}", sid, addr, e);
    }
    Ok(())
}

async fn handle_udp(
    stream: MuxStream,
    addr: Address,
    udpbuf: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let sid = stream.sid();
    let conn = tokio::time::timeout(UDP_DIAL_TIMEOUT, dial_udp(addr))
        .await
        .map_err(|_| Error::Timeout)
        .and_then(|r| r)
        .map_err(|e| {
            error!(
                "failed to establish UDP connection to {} for stream {}: {}",
                addr, sid, e
            );
            e
        })?;
    debug!("UDP connection established to {} for stream {}", addr, sid);

    let (_, err) = couple(stream, UdpStream::new(conn), udpbuf, &cancel).await;
    if let Some(e) = err {
        debug!("UDP stream {} to {} finished with: {}", sid, addr, e);
    }
    Ok(())
}

async fn dial_udp(addr: Address) -> Result<UdpSocket> {
    let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr.socket_addr()).await?;
    Ok(socket)
}

/// Byte-stream view of a connected UDP socket, so the copy engine can
/// treat both endpoints alike. Datagrams larger than the caller's read
/// buffer are carried over into the next read.
struct UdpStream {
    socket: UdpSocket,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_len: usize,
}

impl UdpStream {
    fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            read_buf: vec![0u8; 65535],
            read_pos: 0,
            read_len: 0,
        }
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        // Serve buffered datagram remainder first.
        if self.read_pos < self.read_len {
            let remaining = self.read_len - self.read_pos;
            let to_copy = remaining.min(buf.remaining());
            let start = self.read_pos;
            buf.put_slice(&self.read_buf[start..start + to_copy]);
            self.read_pos += to_copy;
            return Poll::Ready(Ok(()));
        }

        let this = self.get_mut();
        let mut recv_buf = ReadBuf::new(&mut this.read_buf);
        match this.socket.poll_recv(cx, &mut recv_buf) {
            Poll::Ready(Ok(())) => {
                this.read_len = recv_buf.filled().len();
                this.read_pos = 0;

                let to_copy = this.read_len.min(buf.remaining());
                buf.put_slice(&this.read_buf[..to_copy]);
                this.read_pos = to_copy;

                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
