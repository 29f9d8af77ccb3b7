//! Raw layer-2 packet connection
//!
//! The process-wide facility both roles build once at startup: a send
//! handle that emits fully crafted Ethernet/IP/TCP frames and a receive
//! handle capturing frames matching `tcp and dst port P`. Carrier
//! datagrams ride the TCP payload; DPI evasion (decoy injection,
//! payload padding) is applied here, below the reliable transport.

pub mod dpi;
mod recv;
mod send;
pub mod wire;

use std::net::SocketAddr;
use std::sync::Arc;

use pcap::{Active, Capture};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::Network;
use crate::error::{Error, Result};

use dpi::DpiEvasion;
pub use recv::Datagram;
use send::SendHandle;

/// Process-wide packet connection: fixed send handle, fixed receive
/// handle, owned by the role for its entire lifetime.
pub struct PacketConn {
    send: SendHandle,
    port: u16,
}

impl PacketConn {
    /// Build both handles from config and start the capture loop.
    ///
    /// Returns the connection and the stream of received carrier
    /// datagrams `(payload, source address)`.
    pub fn new(cfg: &Network) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Datagram>)> {
        let dpi = Arc::new(DpiEvasion::new(cfg.dpi.clone()));

        let send_handle = open_handle(cfg)?;
        let recv_handle = open_handle(cfg)?;

        let send = SendHandle::new(cfg, Arc::clone(&dpi), send_handle)?;

        let (tx, rx) = mpsc::unbounded_channel();
        recv::spawn(recv_handle, cfg.port, dpi.padding_enabled(), tx)?;

        info!(
            interface = %cfg.interface.name,
            port = cfg.port,
            fake_packet = cfg.dpi.fake_packet,
            padding = cfg.dpi.padding,
            "packet connection ready"
        );

        Ok((Arc::new(Self { send, port: cfg.port }), rx))
    }

    /// Send one carrier datagram to `dst`.
    pub fn send_to(&self, payload: &[u8], dst: SocketAddr) -> Result<()> {
        self.send.send_to(payload, dst)
    }

    /// The local carrier port (BPF filter port).
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Open one pcap handle the way both directions need it: configured
/// buffer, snaplen 2048 (KCP MTU plus headers fits with page
/// alignment), non-promiscuous since the BPF filter already selects our
/// port, blocking reads, immediate delivery.
fn open_handle(cfg: &Network) -> Result<Capture<Active>> {
    let device = cfg.interface.device_name();

    let inactive = Capture::from_device(device.as_str())
        .map_err(|e| Error::Packet(format!("failed to open device {}: {}", device, e)))?;

    inactive
        .buffer_size(cfg.pcap.sockbuf as i32)
        .snaplen(2048)
        .promisc(false)
        .timeout(0)
        .immediate_mode(true)
        .open()
        .map_err(|e| Error::Packet(format!("failed to activate capture on {}: {}", device, e)))
}
