//! Carrier layer: reliable-UDP sessions and the stream multiplexer
//!
//! A carrier session is one KCP session whose datagrams ride the raw
//! packet connection instead of a UDP socket, with the multiplexer on
//! top so many logical streams share it. The client keeps a small fixed
//! pool of sessions; the server creates one per accepted remote peer.

pub mod kcp;
pub mod mux;

use std::net::SocketAddr;

use crate::error::Result;

/// Datagram egress used by the reliable transport.
///
/// The production implementation is the raw packet connection; tests
/// drive the carrier over in-memory links.
pub trait DatagramSend: Send + Sync + 'static {
    fn send_to(&self, payload: &[u8], dst: SocketAddr) -> Result<()>;
}

impl DatagramSend for crate::packet::PacketConn {
    fn send_to(&self, payload: &[u8], dst: SocketAddr) -> Result<()> {
        crate::packet::PacketConn::send_to(self, payload, dst)
    }
}
