//! Raw packet receive path
//!
//! A second pcap handle on the same interface, restricted by a BPF
//! filter to carrier traffic. Captured frames are parsed directly to
//! their TCP payload; anything malformed or payload-free is skipped,
//! never surfaced as an error. Reads block on libpcap, so the loop runs
//! on its own OS thread and feeds the async side through a channel.

use std::net::SocketAddr;

use bytes::Bytes;
use pcap::{Active, Capture, Direction};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::dpi::unwrap_padding;
use super::wire;

/// A datagram as delivered to the carrier: payload plus source address.
pub type Datagram = (Bytes, SocketAddr);

/// Configure the capture side of `handle` and start the read loop.
///
/// The loop ends when the receiver side of `tx` is dropped or the
/// handle dies; the thread is detached and owns the handle for its
/// lifetime.
pub fn spawn(
    mut handle: Capture<Active>,
    port: u16,
    padding: bool,
    tx: mpsc::UnboundedSender<Datagram>,
) -> Result<()> {
    // Outbound copies of our own frames are of no interest. Npcap does
    // not fully support capture direction, so this is best-effort there.
    if !cfg!(windows) {
        handle
            .direction(Direction::In)
            .map_err(|e| Error::Packet(format!("failed to set capture direction: {}", e)))?;
    }

    let filter = format!("tcp and dst port {}", port);
    handle
        .filter(&filter, true)
        .map_err(|e| Error::Packet(format!("failed to set BPF filter: {}", e)))?;

    std::thread::Builder::new()
        .name("pkt-recv".into())
        .spawn(move || read_loop(handle, padding, tx))
        .map_err(|e| Error::Packet(format!("failed to spawn capture thread: {}", e)))?;

    Ok(())
}

fn read_loop(mut handle: Capture<Active>, padding: bool, tx: mpsc::UnboundedSender<Datagram>) {
    loop {
        let packet = match handle.next_packet() {
            Ok(p) => p,
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                warn!("capture read failed, stopping receive loop: {}", e);
                return;
            }
        };

        let Some((payload, src)) = wire::parse_tcp_payload(packet.data) else {
            continue;
        };

        let datagram = if padding {
            match unwrap_padding(payload) {
                Some(p) => p,
                // Declared length beyond the datagram: corrupted or a
                // peer without symmetric padding. Drop it.
                None => continue,
            }
        } else {
            payload
        };

        if tx.send((Bytes::copy_from_slice(datagram), src)).is_err() {
            debug!("datagram channel closed, stopping receive loop");
            return;
        }
    }
}
