//! Raw packet send path
//!
//! The send handle owns one pcap handle on the configured interface and
//! crafts full Ethernet/IP/TCP frames around each carrier datagram. The
//! underlying handle is not concurrent-safe, so writes are serialized
//! behind a mutex; everything else on the path is lock-free or pooled.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use pcap::{Active, Capture};
use rand::Rng;
use tracing::trace;

use crate::config::Network;
use crate::error::{Error, Result};
use crate::protocol::TcpFlags;

use super::dpi::{wrap_padding, DpiEvasion};
use super::wire::{self, BufferPool, FrameSpec};

/// TTL / hop limit for real carrier packets.
const REAL_TTL: u8 = 64;

/// One address family's egress route: local IP and next-hop MAC.
struct Route<A> {
    src: A,
    next_hop_mac: [u8; 6],
}

/// Per-destination TCP state: rotating flag-set index and advancing
/// sequence number, so the crafted flow looks like one TCP stream.
struct DestState {
    flag_idx: usize,
    seq: u32,
    ack: u32,
}

pub struct SendHandle {
    handle: Mutex<Capture<Active>>,
    src_mac: [u8; 6],
    src_port: u16,
    v4: Option<Route<Ipv4Addr>>,
    v6: Option<Route<Ipv6Addr>>,
    flag_sets: Vec<TcpFlags>,
    dpi: Arc<DpiEvasion>,
    dests: DashMap<u64, DestState>,
    pool: BufferPool,
}

impl SendHandle {
    pub fn new(cfg: &Network, dpi: Arc<DpiEvasion>, handle: Capture<Active>) -> Result<Self> {
        let v4 = cfg
            .ipv4
            .as_ref()
            .map(|r| {
                Ok::<_, Error>(Route {
                    src: r.addr.parse::<Ipv4Addr>().map_err(|_| {
                        Error::Config(format!("invalid network.ipv4.addr: {}", r.addr))
                    })?,
                    next_hop_mac: wire::parse_mac(&r.next_hop_mac)?,
                })
            })
            .transpose()?;
        let v6 = cfg
            .ipv6
            .as_ref()
            .map(|r| {
                Ok::<_, Error>(Route {
                    src: r.addr.parse::<Ipv6Addr>().map_err(|_| {
                        Error::Config(format!("invalid network.ipv6.addr: {}", r.addr))
                    })?,
                    next_hop_mac: wire::parse_mac(&r.next_hop_mac)?,
                })
            })
            .transpose()?;

        let mut flag_sets = Vec::with_capacity(cfg.tcp_flags.len());
        for spec in &cfg.tcp_flags {
            flag_sets.push(TcpFlags::parse(spec)?);
        }
        if flag_sets.is_empty() {
            flag_sets.push(TcpFlags::psh_ack());
        }

        Ok(Self {
            handle: Mutex::new(handle),
            src_mac: wire::parse_mac(&cfg.mac)?,
            src_port: cfg.port,
            v4,
            v6,
            flag_sets,
            dpi,
            dests: DashMap::new(),
            pool: BufferPool::new(2048),
        })
    }

    /// Send one carrier datagram to `dst`.
    ///
    /// Applies padding when enabled, injects decoys for young flows,
    /// then writes the real frame. Decoy failures never block or fail
    /// real traffic.
    pub fn send_to(&self, payload: &[u8], dst: SocketAddr) -> Result<()> {
        if self.dpi.should_send_fake(&dst) {
            for _ in 0..self.dpi.fake_count() {
                let _ = self.write_packet(&self.dpi.fake_payload(), dst, true);
            }
        }

        if self.dpi.padding_enabled() {
            let wrapped = wrap_padding(payload, self.dpi.config().pad_max);
            self.write_packet(&wrapped, dst, false)
        } else {
            self.write_packet(payload, dst, false)
        }
    }

    fn write_packet(&self, payload: &[u8], dst: SocketAddr, fake: bool) -> Result<()> {
        let (src_ip, dst_mac): (IpAddr, [u8; 6]) = match dst.ip() {
            IpAddr::V4(_) => {
                let route = self
                    .v4
                    .as_ref()
                    .ok_or_else(|| Error::Packet("no IPv4 route configured".into()))?;
                (IpAddr::V4(route.src), route.next_hop_mac)
            }
            IpAddr::V6(_) => {
                let route = self
                    .v6
                    .as_ref()
                    .ok_or_else(|| Error::Packet("no IPv6 route configured".into()))?;
                (IpAddr::V6(route.src), route.next_hop_mac)
            }
        };

        let (flags, seq, ack) = self.dest_tcp_state(&dst, payload.len(), fake);

        let spec = FrameSpec {
            src_mac: self.src_mac,
            dst_mac,
            src_ip,
            dst_ip: dst.ip(),
            src_port: self.src_port,
            dst_port: dst.port(),
            seq,
            ack,
            flags,
            // Low TTL lets decoys reach the classifier but expire
            // before the server.
            ttl: if fake { self.dpi.fake_ttl() } else { REAL_TTL },
        };

        let mut buf = self.pool.get();
        let result = wire::serialize_frame(&mut buf, &spec, payload).and_then(|()| {
            self.handle
                .lock()
                .sendpacket(&buf[..])
                .map_err(|e| Error::Packet(format!("pcap send failed: {}", e)))
        });
        self.pool.put(buf);

        trace!(dst = %dst, len = payload.len(), fake, "packet out");
        result
    }

    /// Advance the per-destination TCP state. Fakes reuse the current
    /// sequence number so they overlay the real segment.
    fn dest_tcp_state(&self, dst: &SocketAddr, len: usize, fake: bool) -> (TcpFlags, u32, u32) {
        let key = self.dpi.dest_key(dst);
        let mut state = self.dests.entry(key).or_insert_with(|| {
            let mut rng = rand::thread_rng();
            DestState {
                flag_idx: 0,
                seq: rng.gen(),
                ack: rng.gen(),
            }
        });

        let flags = self.flag_sets[state.flag_idx % self.flag_sets.len()];
        state.flag_idx = state.flag_idx.wrapping_add(1);
        let seq = state.seq;
        if !fake {
            state.seq = state.seq.wrapping_add(len as u32);
        }
        (flags, seq, state.ack)
    }
}

