//! Local forwarders
//!
//! Each configured entry binds a local TCP or UDP listener and splices
//! accepted traffic onto tunnel streams. TCP maps one connection to one
//! stream; UDP keeps a per-source table so every local peer gets its
//! own stream, torn down when the tunnel side closes.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::common::pipe::couple;
use crate::common::Address;

use super::Client;

/// Queued datagrams per UDP peer before drops.
const UDP_PEER_BACKLOG: usize = 64;

pub async fn run_tcp(
    client: Arc<Client>,
    listener: TcpListener,
    target: Address,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = cancel.cancelled() => break,
        };

        let (conn, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("failed to accept TCP connection: {}", e);
                continue;
            }
        };

        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            info!("accepted TCP connection {} -> {}", peer, target);
            let stream = match client.open_tcp(target).await {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to establish stream for {} -> {}: {}", peer, target, e);
                    return;
                }
            };

            let (_, err) = couple(conn, stream, client.tcpbuf(), &cancel).await;
            match err {
                Some(e) => debug!("TCP connection {} -> {} closed: {}", peer, target, e),
                None => debug!("TCP connection {} -> {} closed", peer, target),
            }
        });
    }
}

pub async fn run_udp(
    client: Arc<Client>,
    socket: UdpSocket,
    target: Address,
    cancel: CancellationToken,
) {
    let socket = Arc::new(socket);
    let peers: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>> = Arc::new(DashMap::new());
    let mut buf = vec![0u8; client.udpbuf()];

    loop {
        let received = tokio::select! {
            r = socket.recv_from(&mut buf) => r,
            _ = cancel.cancelled() => break,
        };

        let (n, peer) = match received {
            Ok(pair) => pair,
            Err(e) => {
                error!("UDP forwarder receive failed: {}", e);
                continue;
            }
        };
        let datagram = Bytes::copy_from_slice(&buf[..n]);

        if let Some(tx) = peers.get(&peer) {
            // Stale entry (tunnel side gone) falls through to a fresh
            // stream on the next datagram.
            if tx.try_send(datagram).is_err() && tx.is_closed() {
                drop(tx);
                peers.remove(&peer);
            }
            continue;
        }

        let (tx, rx) = mpsc::channel(UDP_PEER_BACKLOG);
        let _ = tx.try_send(datagram);
        peers.insert(peer, tx);

        tokio::spawn(relay_udp_peer(
            Arc::clone(&client),
            Arc::clone(&socket),
            Arc::clone(&peers),
            peer,
            target,
            rx,
            cancel.clone(),
        ));
    }
}

/// One local UDP peer's lifetime: a tunnel stream carrying its
/// datagrams up, and stream bytes sent back down to the peer.
async fn relay_udp_peer(
    client: Arc<Client>,
    socket: Arc<UdpSocket>,
    peers: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    peer: SocketAddr,
    target: Address,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    info!("accepted UDP peer {} -> {}", peer, target);
    let stream = match client.open_udp(target).await {
        Ok(s) => s,
        Err(e) => {
            error!("failed to establish stream for {} -> {}: {}", peer, target, e);
            peers.remove(&peer);
            return;
        }
    };

    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(stream);
    let udpbuf = client.udpbuf();

    let uplink = async {
        while let Some(datagram) = rx.recv().await {
            if tunnel_write.write_all(&datagram).await.is_err() {
                break;
            }
        }
    };

    let downlink = async {
        let mut buf = vec![0u8; udpbuf];
        loop {
            match tunnel_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket.send_to(&buf[..n], peer).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = uplink => {}
        _ = downlink => {}
        _ = cancel.cancelled() => {}
    }

    peers.remove(&peer);
    debug!("UDP peer {} -> {} closed", peer, target);
}
