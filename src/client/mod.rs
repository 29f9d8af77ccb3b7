//! Client role
//!
//! Owns the carrier pool, hands out tunnel streams to the forwarders,
//! and keeps the pool healthy through the background ticker.

mod forward;
pub mod pool;
pub mod ticker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::carrier::kcp::KcpEndpoint;
use crate::carrier::mux::{MuxSession, MuxStream};
use crate::common::Address;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::packet::PacketConn;
use crate::protocol::{Frame, TcpFlags};

use pool::Pool;
use ticker::CarrierFactory;

const MAX_STREAM_RETRIES: u32 = 3;
const PING_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Client {
    pool: Arc<Pool<MuxSession>>,
    endpoint: Arc<KcpEndpoint>,
    server: Address,
    flag_sets: Vec<TcpFlags>,
    tcpbuf: usize,
    udpbuf: usize,
}

impl Client {
    fn new(cfg: &Config, endpoint: Arc<KcpEndpoint>, server: Address) -> Result<Arc<Self>> {
        let mut flag_sets = Vec::new();
        for spec in &cfg.network.tcp_flags {
            flag_sets.push(TcpFlags::parse(spec)?);
        }
        if flag_sets.is_empty() {
            flag_sets.push(TcpFlags::psh_ack());
        }

        Ok(Arc::new(Self {
            pool: Arc::new(Pool::new(cfg.transport.conn)),
            endpoint,
            server,
            flag_sets,
            tcpbuf: cfg.transport.tcpbuf,
            udpbuf: cfg.transport.udpbuf,
        }))
    }

    pub fn tcpbuf(&self) -> usize {
        self.tcpbuf
    }

    pub fn udpbuf(&self) -> usize {
        self.udpbuf
    }

    /// Dial one carrier session and report our TCP flag sets on it.
    /// The report is best-effort; the server may simply drop it.
    fn create_session(&self) -> Result<Arc<MuxSession>> {
        let conn = self.endpoint.dial(self.server.socket_addr())?;
        let mux = MuxSession::new(conn, self.endpoint.mux_config(), true);

        let report = self.flag_sets.clone();
        let session = Arc::clone(&mux);
        tokio::spawn(async move {
            if let Ok(mut stream) = session.open_stream().await {
                let _ = Frame::TcpFlagReport(report).write(&mut stream).await;
            }
        });

        Ok(mux)
    }

    /// Obtain a logical stream from the pool.
    ///
    /// Retries over the round-robin with exponential backoff (50 ms,
    /// 100 ms) so one dead slot does not fail the dispatch.
    pub async fn new_stream(&self) -> Result<MuxStream> {
        let mut last_err = Error::Transport("connection not initialized".into());
        for attempt in 0..MAX_STREAM_RETRIES {
            if attempt > 0 {
                let backoff = Duration::from_millis(50 << (attempt - 1));
                debug!(
                    "stream creation retry {}/{} after {:?}",
                    attempt + 1,
                    MAX_STREAM_RETRIES,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }

            let slot = self.pool.next();
            let Some(conn) = slot.load() else {
                continue;
            };
            match conn.open_stream().await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(
                        "failed to open stream (attempt {}/{}): {}",
                        attempt + 1,
                        MAX_STREAM_RETRIES,
                        e
                    );
                    last_err = e;
                }
            }
        }
        Err(Error::Transport(format!(
            "failed to create stream after {} attempts: {}",
            MAX_STREAM_RETRIES, last_err
        )))
    }

    /// Tunnel stream declared for a TCP dial to `target`.
    pub async fn open_tcp(&self, target: Address) -> Result<MuxStream> {
        let mut stream = self.new_stream().await?;
        Frame::DialTcp(target).write(&mut stream).await?;
        Ok(stream)
    }

    /// Tunnel stream declared for a UDP dial to `target`.
    pub async fn open_udp(&self, target: Address) -> Result<MuxStream> {
        let mut stream = self.new_stream().await?;
        Frame::DialUdp(target).write(&mut stream).await?;
        Ok(stream)
    }
}

/// Health probe: PING on a fresh stream, expecting PONG back.
async fn ping_session(mux: &MuxSession) -> Result<()> {
    let mut stream = mux.open_stream().await?;
    Frame::Ping.write(&mut stream).await?;
    match Frame::read(&mut stream).await? {
        Frame::Pong => Ok(()),
        other => Err(Error::Protocol(format!(
            "unexpected ping reply: {:?}",
            other.frame_type()
        ))),
    }
}

struct ClientSessions {
    client: Arc<Client>,
}

#[async_trait]
impl CarrierFactory for ClientSessions {
    type Session = MuxSession;

    async fn create(&self) -> Result<Arc<MuxSession>> {
        self.client.create_session()
    }

    async fn ping(&self, session: &MuxSession) -> Result<()> {
        tokio::time::timeout(PING_TIMEOUT, ping_session(session))
            .await
            .map_err(|_| Error::Timeout)?
    }

    fn close(&self, session: &MuxSession) {
        session.close();
    }
}

/// Run the client role until the root scope cancels.
pub async fn run(cfg: Config, cancel: CancellationToken) -> Result<()> {
    let server: Address = cfg
        .server
        .as_ref()
        .ok_or_else(|| Error::Config("client requires a server section".into()))?
        .addr
        .parse()?;

    let (pconn, datagrams) = PacketConn::new(&cfg.network)?;
    let endpoint = KcpEndpoint::new(pconn, datagrams, cfg.transport.kcp.clone(), false);
    let client = Client::new(&cfg, endpoint, server)?;

    // Fill the pool up front; failed slots stay empty and the ticker
    // keeps retrying them.
    for (i, slot) in client.pool.slots().enumerate() {
        match client.create_session() {
            Ok(conn) => slot.install(conn),
            Err(e) => error!("connection {} initial dial failed: {}", i, e),
        }
    }
    info!(
        server = %server,
        conns = client.pool.len(),
        "client connected to carrier"
    );

    tokio::spawn(ticker::run(
        Arc::clone(&client.pool),
        ClientSessions {
            client: Arc::clone(&client),
        },
        cancel.clone(),
    ));

    // Bind every forwarder before serving; a bind failure is fatal at
    // startup, not a background retry.
    for entry in &cfg.forwards {
        let target: Address = entry.target.parse()?;
        match entry.protocol.as_str() {
            "tcp" => {
                let listener = TcpListener::bind(&entry.listen).await.map_err(|e| {
                    Error::Transport(format!("failed to bind {}: {}", entry.listen, e))
                })?;
                info!("TCP forwarder listening on {} -> {}", entry.listen, target);
                tokio::spawn(forward::run_tcp(
                    Arc::clone(&client),
                    listener,
                    target,
                    cancel.clone(),
                ));
            }
            "udp" => {
                let socket = UdpSocket::bind(&entry.listen).await.map_err(|e| {
                    Error::Transport(format!("failed to bind {}: {}", entry.listen, e))
                })?;
                info!("UDP forwarder listening on {} -> {}", entry.listen, target);
                tokio::spawn(forward::run_udp(
                    Arc::clone(&client),
                    socket,
                    target,
                    cancel.clone(),
                ));
            }
            other => {
                return Err(Error::Config(format!("unknown forward protocol: {}", other)));
            }
        }
    }

    cancel.cancelled().await;
    info!("client shutdown completed");
    Ok(())
}
