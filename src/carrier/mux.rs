//! Stream multiplexer
//!
//! Many logical streams share one carrier session. Frames are
//! `[ver][cmd][len u16be][sid u32be]` followed by `len` body bytes;
//! commands are SYN (open), FIN (half-close), PSH (data), NOP
//! (keep-alive). Stream ids are odd from the dialing side and even from
//! the listening side, so the two spaces never collide.
//!
//! Memory is bounded twice: a per-stream buffer (an overflowing stream
//! is reset) and a session-wide receive budget (blowing it kills the
//! session, since the peer is ignoring our pacing entirely). Writers
//! share a bounded queue, which is what backpressure rides on.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace, warn};

use crate::config::KcpConfig;
use crate::error::{Error, Result};

const VERSION: u8 = 2;
const HEADER_LEN: usize = 8;

const CMD_SYN: u8 = 0x00;
const CMD_FIN: u8 = 0x01;
const CMD_PSH: u8 = 0x02;
const CMD_NOP: u8 = 0x03;

/// Pending accepted streams before SYNs get dropped.
const ACCEPT_BACKLOG: usize = 128;

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub max_frame_size: usize,
    pub max_receive_buffer: usize,
    pub max_stream_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            // 10s keep-alive: low control traffic, few false positives;
            // 40s timeout tolerates transient loss without flapping.
            keep_alive_interval: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(40),
            max_frame_size: 8 * 1024,
            max_receive_buffer: 4 * 1024 * 1024,
            max_stream_buffer: 2 * 1024 * 1024,
        }
    }
}

impl MuxConfig {
    /// Buffer overrides come from transport config; zero keeps the
    /// defaults. The frame size is paired with the KCP profile.
    pub fn from_transport(cfg: &KcpConfig, frame_size: usize) -> Self {
        let mut mux = MuxConfig {
            max_frame_size: frame_size,
            ..Default::default()
        };
        if cfg.smuxbuf != 0 {
            mux.max_receive_buffer = cfg.smuxbuf;
        }
        if cfg.streambuf != 0 {
            mux.max_stream_buffer = cfg.streambuf;
        }
        mux
    }
}

enum OutFrame {
    Syn(u32),
    Fin(u32),
    Psh(u32, Bytes),
    Nop,
}

impl OutFrame {
    fn encode(&self) -> (u8, u32, &[u8]) {
        match self {
            OutFrame::Syn(sid) => (CMD_SYN, *sid, &[]),
            OutFrame::Fin(sid) => (CMD_FIN, *sid, &[]),
            OutFrame::Psh(sid, body) => (CMD_PSH, *sid, body),
            OutFrame::Nop => (CMD_NOP, 0, &[]),
        }
    }
}

/// Receive-side state of one logical stream.
struct StreamState {
    sid: u32,
    buf: Mutex<std::collections::VecDeque<Bytes>>,
    buffered: AtomicUsize,
    /// Peer sent FIN; drain then EOF.
    eof: AtomicBool,
    /// Stream torn down abnormally (overflow, session death).
    reset: AtomicBool,
    read_waker: Mutex<Option<Waker>>,
}

impl StreamState {
    fn new(sid: u32) -> Arc<Self> {
        Arc::new(Self {
            sid,
            buf: Mutex::new(std::collections::VecDeque::new()),
            buffered: AtomicUsize::new(0),
            eof: AtomicBool::new(false),
            reset: AtomicBool::new(false),
            read_waker: Mutex::new(None),
        })
    }

    fn wake(&self) {
        if let Some(w) = self.read_waker.lock().take() {
            w.wake();
        }
    }

    fn push(&self, data: Bytes) {
        self.buffered.fetch_add(data.len(), Ordering::Relaxed);
        self.buf.lock().push_back(data);
        self.wake();
    }

    fn mark_eof(&self) {
        self.eof.store(true, Ordering::SeqCst);
        self.wake();
    }

    fn mark_reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
        self.wake();
    }
}

struct SessionShared {
    cfg: MuxConfig,
    streams: Mutex<HashMap<u32, Arc<StreamState>>>,
    write_tx: mpsc::Sender<OutFrame>,
    next_sid: AtomicU32,
    closed: CancellationToken,
    last_seen: Mutex<Instant>,
    /// Bytes buffered across all streams.
    total_buffered: AtomicUsize,
}

impl SessionShared {
    fn reset_all(&self) {
        let streams: Vec<_> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for s in streams {
            s.mark_reset();
        }
    }
}

/// One multiplexed carrier session.
pub struct MuxSession {
    shared: Arc<SessionShared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl MuxSession {
    /// Run the multiplexer over `conn`. The dialing side passes
    /// `client = true` and allocates odd stream ids.
    pub fn new<C>(conn: C, cfg: MuxConfig, client: bool) -> Arc<Self>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(conn);

        // Queue depth follows the receive budget so a stalled carrier
        // applies backpressure instead of buffering without bound.
        let queue = (cfg.max_receive_buffer / cfg.max_frame_size).clamp(8, 1024);
        let (write_tx, write_rx) = mpsc::channel(queue);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);

        let shared = Arc::new(SessionShared {
            cfg,
            streams: Mutex::new(HashMap::new()),
            write_tx,
            next_sid: AtomicU32::new(if client { 1 } else { 2 }),
            closed: CancellationToken::new(),
            last_seen: Mutex::new(Instant::now()),
            total_buffered: AtomicUsize::new(0),
        });

        tokio::spawn(recv_loop(Arc::clone(&shared), read_half, accept_tx));
        tokio::spawn(write_loop(Arc::clone(&shared), write_half, write_rx));
        tokio::spawn(keepalive_loop(Arc::clone(&shared)));

        Arc::new(Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        })
    }

    /// Open a new logical stream and announce it to the peer.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let sid = self.shared.next_sid.fetch_add(2, Ordering::Relaxed);
        let state = StreamState::new(sid);
        self.shared.streams.lock().insert(sid, Arc::clone(&state));

        if self.shared.write_tx.send(OutFrame::Syn(sid)).await.is_err() {
            self.shared.streams.lock().remove(&sid);
            return Err(Error::ConnectionClosed);
        }

        trace!(sid, "opened stream");
        Ok(MuxStream::new(state, Arc::clone(&self.shared)))
    }

    /// Wait for a stream opened by the peer.
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream.ok_or(Error::ConnectionClosed),
            _ = self.shared.closed.cancelled() => Err(Error::ConnectionClosed),
        }
    }

    /// Tear the session down; every stream unblocks with an error.
    pub fn close(&self) {
        self.shared.closed.cancel();
        self.shared.reset_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

async fn recv_loop<R>(
    shared: Arc<SessionShared>,
    mut reader: R,
    accept_tx: mpsc::Sender<MuxStream>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut header = [0u8; HEADER_LEN];
    loop {
        let read = tokio::select! {
            r = reader.read_exact(&mut header) => r,
            _ = shared.closed.cancelled() => break,
        };
        if read.is_err() {
            break;
        }

        if header[0] != VERSION {
            warn!(version = header[0], "peer speaks unknown mux version");
            break;
        }
        let cmd = header[1];
        let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
        let sid = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        let mut body = vec![0u8; len];
        if len > 0 {
            let read = tokio::select! {
                r = reader.read_exact(&mut body) => r,
                _ = shared.closed.cancelled() => break,
            };
            if read.is_err() {
                break;
            }
        }

        *shared.last_seen.lock() = Instant::now();

        match cmd {
            CMD_SYN => {
                let state = StreamState::new(sid);
                let fresh = shared
                    .streams
                    .lock()
                    .insert(sid, Arc::clone(&state))
                    .is_none();
                if !fresh {
                    continue;
                }
                let stream = MuxStream::new(state, Arc::clone(&shared));
                if accept_tx.try_send(stream).is_err() {
                    // Backlog full or nobody accepting: shed the stream.
                    warn!(sid, "accept backlog full, dropping stream");
                    shared.streams.lock().remove(&sid);
                }
            }
            CMD_PSH => {
                let state = shared.streams.lock().get(&sid).cloned();
                let Some(state) = state else {
                    trace!(sid, "data for unknown stream discarded");
                    continue;
                };

                let total = shared.total_buffered.fetch_add(len, Ordering::Relaxed) + len;
                if total > shared.cfg.max_receive_buffer {
                    warn!("session receive budget exhausted, closing session");
                    break;
                }
                if state.buffered.load(Ordering::Relaxed) + len > shared.cfg.max_stream_buffer {
                    warn!(sid, "stream buffer overflow, resetting stream");
                    shared.total_buffered.fetch_sub(len, Ordering::Relaxed);
                    shared.streams.lock().remove(&sid);
                    state.mark_reset();
                    continue;
                }
                state.push(Bytes::from(body));
            }
            CMD_FIN => {
                let state = shared.streams.lock().get(&sid).cloned();
                if let Some(state) = state {
                    state.mark_eof();
                }
            }
            CMD_NOP => {}
            other => {
                warn!(cmd = other, "unknown mux command");
                break;
            }
        }
    }

    shared.closed.cancel();
    shared.reset_all();
    debug!("mux receive loop stopped");
}

async fn write_loop<W>(
    shared: Arc<SessionShared>,
    mut writer: W,
    mut write_rx: mpsc::Receiver<OutFrame>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut header = [0u8; HEADER_LEN];
    loop {
        let frame = tokio::select! {
            f = write_rx.recv() => f,
            _ = shared.closed.cancelled() => break,
        };
        let Some(frame) = frame else { break };

        let (cmd, sid, body) = frame.encode();
        header[0] = VERSION;
        header[1] = cmd;
        header[2..4].copy_from_slice(&(body.len() as u16).to_be_bytes());
        header[4..8].copy_from_slice(&sid.to_be_bytes());

        if writer.write_all(&header).await.is_err() {
            break;
        }
        if !body.is_empty() && writer.write_all(body).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }

    shared.closed.cancel();
    shared.reset_all();
    debug!("mux write loop stopped");
}

async fn keepalive_loop(shared: Arc<SessionShared>) {
    let mut ticker = tokio::time::interval(shared.cfg.keep_alive_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shared.closed.cancelled() => return,
        }

        if shared.last_seen.lock().elapsed() > shared.cfg.keep_alive_timeout {
            warn!("peer silent past keep-alive timeout, closing session");
            shared.closed.cancel();
            shared.reset_all();
            return;
        }
        if shared.write_tx.try_send(OutFrame::Nop).is_err() {
            // Queue jammed; the timeout above decides whether the
            // session is actually dead.
            debug!("keep-alive skipped, write queue full");
        }
    }
}

/// One logical stream: a full-duplex byte channel inside a session.
pub struct MuxStream {
    state: Arc<StreamState>,
    shared: Arc<SessionShared>,
    write_tx: PollSender<OutFrame>,
    pending: Option<OutFrame>,
    fin_sent: bool,
}

impl MuxStream {
    fn new(state: Arc<StreamState>, shared: Arc<SessionShared>) -> Self {
        let write_tx = PollSender::new(shared.write_tx.clone());
        Self {
            state,
            shared,
            write_tx,
            pending: None,
            fin_sent: false,
        }
    }

    pub fn sid(&self) -> u32 {
        self.state.sid
    }

    fn closed_err() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "stream reset")
    }

    /// Push `frame` into the session write queue, buffering it across
    /// `Pending` polls.
    fn poll_send(&mut self, cx: &mut Context<'_>, frame: OutFrame) -> Poll<io::Result<()>> {
        self.pending = Some(frame);
        match self.write_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                if let Some(frame) = self.pending.take() {
                    self.write_tx
                        .send_item(frame)
                        .map_err(|_| Self::closed_err())?;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(Self::closed_err())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let mut queue = this.state.buf.lock();
        if let Some(chunk) = queue.front_mut() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..n]);
            chunk.advance(n);
            if chunk.is_empty() {
                queue.pop_front();
            }
            drop(queue);
            this.state.buffered.fetch_sub(n, Ordering::Relaxed);
            this.shared.total_buffered.fetch_sub(n, Ordering::Relaxed);
            return Poll::Ready(Ok(()));
        }
        drop(queue);

        if this.state.eof.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        if this.state.reset.load(Ordering::SeqCst) || this.shared.closed.is_cancelled() {
            return Poll::Ready(Err(Self::closed_err()));
        }

        *this.state.read_waker.lock() = Some(cx.waker().clone());
        // Re-check: data or EOF may have raced the waker install.
        if !this.state.buf.lock().is_empty()
            || this.state.eof.load(Ordering::SeqCst)
            || this.state.reset.load(Ordering::SeqCst)
        {
            this.state.wake();
        }
        Poll::Pending
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.state.reset.load(Ordering::SeqCst) || this.shared.closed.is_cancelled() {
            return Poll::Ready(Err(Self::closed_err()));
        }

        let n = buf.len().min(this.shared.cfg.max_frame_size);
        let sid = this.state.sid;
        match this.poll_send(cx, OutFrame::Psh(sid, Bytes::copy_from_slice(&buf[..n]))) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(n)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the session writer as they drain.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.fin_sent {
            return Poll::Ready(Ok(()));
        }
        let sid = this.state.sid;
        match this.poll_send(cx, OutFrame::Fin(sid)) {
            Poll::Ready(Ok(())) => {
                this.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                // Session already gone; nothing left to half-close.
                this.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        let remaining = self.state.buffered.swap(0, Ordering::Relaxed);
        if remaining > 0 {
            self.shared
                .total_buffered
                .fetch_sub(remaining, Ordering::Relaxed);
        }
        self.shared.streams.lock().remove(&self.state.sid);
        if !self.fin_sent {
            let _ = self.shared.write_tx.try_send(OutFrame::Fin(self.state.sid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair(cfg: MuxConfig) -> (Arc<MuxSession>, Arc<MuxSession>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = MuxSession::new(a, cfg.clone(), true);
        let server = MuxSession::new(b, cfg, false);
        (client, server)
    }

    #[tokio::test]
    async fn test_open_accept_transfer() {
        let (client, server) = pair(MuxConfig::default());

        let mut up = client.open_stream().await.unwrap();
        up.write_all(b"over the carrier").await.unwrap();

        let mut down = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 16];
        down.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over the carrier");

        // And the other direction on the same stream.
        down.write_all(b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        up.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");
    }

    #[tokio::test]
    async fn test_stream_ids_odd_even() {
        let (client, server) = pair(MuxConfig::default());

        let s1 = client.open_stream().await.unwrap();
        let s2 = client.open_stream().await.unwrap();
        assert_eq!(s1.sid() % 2, 1);
        assert_eq!(s2.sid(), s1.sid() + 2);

        let r1 = server.open_stream().await.unwrap();
        assert_eq!(r1.sid() % 2, 0);
    }

    #[tokio::test]
    async fn test_fin_drains_then_eof() {
        let (client, server) = pair(MuxConfig::default());

        let mut up = client.open_stream().await.unwrap();
        up.write_all(b"last words").await.unwrap();
        up.shutdown().await.unwrap();

        let mut down = server.accept_stream().await.unwrap();
        let mut out = Vec::new();
        down.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"last words");
    }

    #[tokio::test]
    async fn test_large_write_chunks_to_frames() {
        let (client, server) = pair(MuxConfig::default());

        let payload = vec![0x42u8; 100 * 1024];
        let mut up = client.open_stream().await.unwrap();
        let send = payload.clone();
        let writer = tokio::spawn(async move {
            up.write_all(&send).await.unwrap();
            up.shutdown().await.unwrap();
        });

        let mut down = server.accept_stream().await.unwrap();
        let mut out = Vec::new();
        down.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_close_resets_streams() {
        let (client, server) = pair(MuxConfig::default());

        let mut up = client.open_stream().await.unwrap();
        let _down = server.accept_stream().await.unwrap();

        client.close();
        let mut buf = [0u8; 1];
        assert!(up.read(&mut buf).await.is_err());
        assert!(client.open_stream().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_timeout_kills_session() {
        let cfg = MuxConfig {
            keep_alive_interval: Duration::from_millis(50),
            keep_alive_timeout: Duration::from_millis(120),
            ..Default::default()
        };
        // A session whose peer never answers: plain duplex with the far
        // end parked, so NOPs go nowhere and nothing ever arrives.
        let (a, _b) = tokio::io::duplex(64 * 1024);
        let lonely = MuxSession::new(a, cfg, true);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(lonely.is_closed());
    }
}
