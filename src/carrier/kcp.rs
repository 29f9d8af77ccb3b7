//! KCP sessions over the packet connection
//!
//! The ARQ itself comes from the `kcp` crate; this module owns the part
//! a UDP-socket binding would normally do: a driver task per session
//! that ticks the control block, feeds received datagrams in, drains
//! decoded bytes out, and a demultiplexer that routes datagrams to
//! sessions by `(peer address, conv)`.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use dashmap::DashMap;
use kcp::Kcp;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::KcpConfig;
use crate::error::{Error, Result};
use crate::packet::Datagram;

use super::DatagramSend;

/// Smallest well-formed KCP segment (header only).
const KCP_OVERHEAD: usize = 24;

/// Resolved transport profile.
///
/// `flush_write` flushes the control block after each send (the inverse
/// of write-delay batching); `flush_acks_input` pushes ACKs out
/// immediately after input. Congestion control stays disabled on every
/// profile: enabling it zeroes throughput on lossy links.
#[derive(Debug, Clone, Copy)]
pub struct Profile {
    pub nodelay: bool,
    pub interval: u32,
    pub resend: i32,
    pub nocongestion: bool,
    pub flush_write: bool,
    pub flush_acks_input: bool,
    /// Multiplexer frame size paired with this profile.
    pub frame_size: usize,
}

impl Profile {
    /// Resolve the configured mode to concrete knobs.
    pub fn resolve(cfg: &KcpConfig) -> Profile {
        let (nodelay, interval, resend, nc, wdelay, ack_nodelay) = match cfg.mode.as_str() {
            "normal" => (false, 40, 2, true, true, false),
            // Latency-first default for mixed browsing/video traffic.
            "fast" => (true, 20, 2, true, false, true),
            "fast2" => (true, 15, 2, true, false, true),
            "fast3" => (true, 10, 2, true, false, true),
            // Keeps latency low enough for adaptive video streaming
            // while staying resilient on lossy links.
            "stream" => (true, 15, 2, true, false, true),
            "1to1" => (true, 20, 2, true, false, true),
            _ => {
                // "manual": zeroed fields fall back to anti-stall
                // values, ACKs are always immediate, writes unbatched.
                let interval = if cfg.interval == 0 { 15 } else { cfg.interval };
                let resend = if cfg.resend == 0 { 2 } else { cfg.resend };
                (
                    cfg.nodelay != 0,
                    interval,
                    resend,
                    cfg.nocongestion != 0,
                    false,
                    true,
                )
            }
        };

        Profile {
            nodelay,
            interval,
            resend,
            nocongestion: nc,
            flush_write: !wdelay,
            flush_acks_input: ack_nodelay,
            // Large frames favor raw throughput; the latency profiles
            // keep them small to limit head-of-line stalls.
            frame_size: if cfg.mode == "normal" { 32 * 1024 } else { 8 * 1024 },
        }
    }
}

/// Datagram egress adapter handed to the KCP control block.
struct KcpOutput {
    sink: Arc<dyn DatagramSend>,
    peer: SocketAddr,
}

impl io::Write for KcpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink
            .send_to(buf, self.peer)
            .map_err(io::Error::from)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Shared {
    kcp: Mutex<Kcp<KcpOutput>>,
    /// Writer parked on a full send queue, woken each tick.
    write_waker: Mutex<Option<Waker>>,
    wait_snd_limit: usize,
    flush_write: bool,
    closed: CancellationToken,
    epoch: Instant,
    peer: SocketAddr,
    conv: u32,
}

impl Shared {
    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

/// One reliable-UDP session: an ordered byte stream once established.
pub struct KcpConn {
    shared: Arc<Shared>,
    read_rx: mpsc::UnboundedReceiver<Bytes>,
    leftover: Bytes,
}

impl KcpConn {
    /// Build a session and start its driver task. `input_tx` is where
    /// the demultiplexer delivers this session's datagrams.
    fn spawn(
        sink: Arc<dyn DatagramSend>,
        peer: SocketAddr,
        conv: u32,
        cfg: &KcpConfig,
        profile: Profile,
    ) -> (KcpConn, mpsc::UnboundedSender<Bytes>) {
        let output = KcpOutput {
            sink,
            peer,
        };

        let mut kcp = Kcp::new_stream(conv, output);
        kcp.set_nodelay(
            profile.nodelay,
            profile.interval as i32,
            profile.resend,
            profile.nocongestion,
        );
        kcp.set_wndsize(cfg.sndwnd, cfg.rcvwnd);
        if let Err(e) = kcp.set_mtu(cfg.mtu) {
            warn!(mtu = cfg.mtu, "invalid KCP MTU, keeping default: {}", e);
        }

        let shared = Arc::new(Shared {
            kcp: Mutex::new(kcp),
            write_waker: Mutex::new(None),
            wait_snd_limit: usize::from(cfg.sndwnd) * 2,
            flush_write: profile.flush_write,
            closed: CancellationToken::new(),
            epoch: Instant::now(),
            peer,
            conv,
        });

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();

        tokio::spawn(drive(Arc::clone(&shared), input_rx, read_tx, profile));

        (
            KcpConn {
                shared,
                read_rx,
                leftover: Bytes::new(),
            },
            input_tx,
        )
    }

    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn conv(&self) -> u32 {
        self.shared.conv
    }
}

impl Drop for KcpConn {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

/// Session driver: tick the control block on the profile interval, feed
/// datagrams, surface decoded bytes, wake parked writers.
async fn drive(
    shared: Arc<Shared>,
    mut input_rx: mpsc::UnboundedReceiver<Bytes>,
    read_tx: mpsc::UnboundedSender<Bytes>,
    profile: Profile,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(u64::from(profile.interval)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe = input_rx.recv() => {
                let Some(datagram) = maybe else { break };
                let mut kcp = shared.kcp.lock();
                if let Err(e) = kcp.input(&datagram) {
                    // Corrupted or alien segment; KCP state is intact.
                    trace!(peer = %shared.peer, "discarded bad segment: {}", e);
                    continue;
                }
                if profile.flush_acks_input {
                    let _ = kcp.flush_ack();
                }
                drain_recv(&mut kcp, &read_tx);
            }
            _ = ticker.tick() => {
                let mut kcp = shared.kcp.lock();
                if let Err(e) = kcp.update(shared.now_ms()) {
                    debug!(peer = %shared.peer, "kcp update failed: {}", e);
                    break;
                }
                drain_recv(&mut kcp, &read_tx);
                drop(kcp);
                if let Some(waker) = shared.write_waker.lock().take() {
                    waker.wake();
                }
            }
            _ = shared.closed.cancelled() => break,
        }
    }

    shared.closed.cancel();
    debug!(peer = %shared.peer, conv = shared.conv, "kcp session driver stopped");
}

fn drain_recv(kcp: &mut Kcp<KcpOutput>, read_tx: &mpsc::UnboundedSender<Bytes>) {
    loop {
        let size = match kcp.peeksize() {
            Ok(n) if n > 0 => n,
            _ => return,
        };
        let mut buf = vec![0u8; size];
        match kcp.recv(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                if read_tx.send(Bytes::from(buf)).is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

impl AsyncRead for KcpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // Serve buffered bytes from the previous chunk first.
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.remaining());
            buf.put_slice(&self.leftover[..n]);
            self.leftover.advance(n);
            return Poll::Ready(Ok(()));
        }

        match self.read_rx.poll_recv(cx) {
            Poll::Ready(Some(mut chunk)) => {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                chunk.advance(n);
                self.leftover = chunk;
                Poll::Ready(Ok(()))
            }
            // Driver gone: the session is closed, surface EOF.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for KcpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shared.closed.is_cancelled() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "session closed",
            )));
        }

        let mut kcp = self.shared.kcp.lock();
        if kcp.wait_snd() >= self.shared.wait_snd_limit {
            // Send queue full; the driver wakes us on the next tick.
            *self.shared.write_waker.lock() = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = kcp
            .send(buf)
            .map_err(|e| io::Error::other(e.to_string()))?;
        if n > 0 && self.shared.flush_write {
            let _ = kcp.update(self.shared.now_ms());
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Best-effort: before the driver's first update the control
        // block refuses to flush, and the next tick flushes anyway.
        let _ = self.shared.kcp.lock().flush();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.closed.cancel();
        Poll::Ready(Ok(()))
    }
}

/// Routes received datagrams to sessions by `(peer, conv)`.
///
/// The dialing side registers a random conv before the first send; the
/// listening side learns new keys from the wire and surfaces fresh
/// sessions through `accept`.
pub struct KcpEndpoint {
    sink: Arc<dyn DatagramSend>,
    sessions: Arc<DashMap<(SocketAddr, u32), mpsc::UnboundedSender<Bytes>>>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<KcpConn>>,
    cfg: KcpConfig,
    profile: Profile,
    accepting: bool,
}

impl KcpEndpoint {
    /// `accepting` decides whether unknown keys open new sessions
    /// (server) or are dropped (client).
    pub fn new(
        sink: Arc<dyn DatagramSend>,
        mut datagrams: mpsc::UnboundedReceiver<Datagram>,
        cfg: KcpConfig,
        accepting: bool,
    ) -> Arc<Self> {
        let profile = Profile::resolve(&cfg);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let endpoint = Arc::new(Self {
            sink,
            sessions: Arc::new(DashMap::new()),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            cfg,
            profile,
            accepting,
        });

        let demux = Arc::clone(&endpoint);
        tokio::spawn(async move {
            while let Some((payload, src)) = datagrams.recv().await {
                demux.route(payload, src, &accept_tx);
            }
            debug!("datagram source closed, demultiplexer stopped");
        });

        endpoint
    }

    fn route(&self, payload: Bytes, src: SocketAddr, accept_tx: &mpsc::UnboundedSender<KcpConn>) {
        if payload.len() < KCP_OVERHEAD {
            return;
        }
        let conv = kcp::get_conv(&payload);
        let key = (src, conv);

        if let Some(tx) = self.sessions.get(&key) {
            if tx.send(payload).is_ok() {
                return;
            }
            drop(tx);
            // Session driver is gone; forget the key.
            self.sessions.remove(&key);
            return;
        }

        if !self.accepting {
            trace!(peer = %src, conv, "datagram for unknown session dropped");
            return;
        }

        // New sessions are rare; use the occasion to drop dead keys.
        self.sessions.retain(|_, tx| !tx.is_closed());

        let (conn, input_tx) =
            KcpConn::spawn(Arc::clone(&self.sink), src, conv, &self.cfg, self.profile);
        let _ = input_tx.send(payload);
        self.sessions.insert(key, input_tx);
        debug!(peer = %src, conv, "new carrier session");
        if accept_tx.send(conn).is_err() {
            self.sessions.remove(&key);
        }
    }

    /// Open a session toward `peer` (client side).
    pub fn dial(&self, peer: SocketAddr) -> Result<KcpConn> {
        // Dials happen at startup and on reconnect; prune dead keys so
        // churned sessions do not accumulate.
        self.sessions.retain(|_, tx| !tx.is_closed());

        let conv: u32 = rand::thread_rng().gen();
        let key = (peer, conv);
        let (conn, input_tx) =
            KcpConn::spawn(Arc::clone(&self.sink), peer, conv, &self.cfg, self.profile);
        self.sessions.insert(key, input_tx);
        debug!(peer = %peer, conv, "dialed carrier session");
        Ok(conn)
    }

    /// Wait for the next incoming session (server side).
    pub async fn accept(&self) -> Result<KcpConn> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn mux_config(&self) -> super::mux::MuxConfig {
        super::mux::MuxConfig::from_transport(&self.cfg, self.profile.frame_size)
    }
}
