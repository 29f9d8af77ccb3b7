//! DPI evasion policy
//!
//! Two techniques, both opt-in:
//!
//! 1. Fake packet injection: decoy TCP packets with a low TTL sent
//!    before real data. The decoys pass the on-path classifier but
//!    expire before the server, corrupting the classifier's stream
//!    reassembly so it cannot fingerprint the tunnel.
//! 2. Payload padding: every carrier datagram is wrapped with a length
//!    prefix and trailing random bytes, defeating length-based
//!    fingerprinting of the reliable-UDP framing.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use rand::RngCore;

use crate::config::DpiConfig;

/// Fake payload sizes vary inside this range so the decoys do not
/// create a fingerprint of their own.
const FAKE_PAYLOAD_MIN: usize = 24;
const FAKE_PAYLOAD_SPREAD: usize = 56;

pub struct DpiEvasion {
    cfg: DpiConfig,
    /// hash(IP, port) -> real packets sent, for the fake cutoff.
    packet_count: DashMap<u64, AtomicI64>,
    hasher: RandomState,
}

impl DpiEvasion {
    pub fn new(cfg: DpiConfig) -> Self {
        Self {
            cfg,
            packet_count: DashMap::new(),
            hasher: RandomState::new(),
        }
    }

    pub fn config(&self) -> &DpiConfig {
        &self.cfg
    }

    pub fn padding_enabled(&self) -> bool {
        self.cfg.padding
    }

    pub fn fake_count(&self) -> usize {
        self.cfg.fake_count as usize
    }

    pub fn fake_ttl(&self) -> u8 {
        self.cfg.fake_ttl
    }

    /// Whether fake packets should precede the next real send to `dst`.
    ///
    /// Counts real packets per destination and stops after the cutoff:
    /// classifiers only inspect the first packets of a flow, so later
    /// fakes would be wasted bandwidth.
    pub fn should_send_fake(&self, dst: &SocketAddr) -> bool {
        if !self.cfg.fake_packet {
            return false;
        }
        let key = self.dest_key(dst);
        let count = self
            .packet_count
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        count <= i64::from(self.cfg.fake_cutoff)
    }

    /// Random decoy payload, 24..80 bytes.
    pub fn fake_payload(&self) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let len = FAKE_PAYLOAD_MIN + (rng.next_u32() as usize % FAKE_PAYLOAD_SPREAD);
        let mut payload = vec![0u8; len];
        rng.fill_bytes(&mut payload);
        payload
    }

    pub fn dest_key(&self, dst: &SocketAddr) -> u64 {
        let mut hasher = self.hasher.build_hasher();
        (dst.ip(), dst.port()).hash(&mut hasher);
        std::hash::Hasher::finish(&hasher)
    }
}

/// Wrap a carrier payload with padding.
///
/// Wire format: `[2 bytes be: original length][payload][random bytes]`,
/// with the random-byte count uniform in `[0, pad_max]`. Both peers
/// must agree on whether this layer is present; a one-sided deployment
/// garbles the reliable-UDP handshake and no session ever establishes.
pub fn wrap_padding(payload: &[u8], pad_max: u16) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let pad_len = rng.next_u32() as usize % (usize::from(pad_max) + 1);

    let mut out = vec![0u8; 2 + payload.len() + pad_len];
    out[0..2].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    out[2..2 + payload.len()].copy_from_slice(payload);
    if pad_len > 0 {
        rng.fill_bytes(&mut out[2 + payload.len()..]);
    }
    out
}

/// Remove padding from a received datagram.
///
/// Returns the original payload slice, or `None` when the declared
/// length exceeds the datagram; such datagrams are dropped.
pub fn unwrap_padding(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 2 {
        return None;
    }
    let orig_len = usize::from(u16::from_be_bytes([data[0], data[1]]));
    if orig_len > data.len() - 2 {
        return None;
    }
    Some(&data[2..2 + orig_len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DpiConfig;

    fn cfg(fake: bool, padding: bool) -> DpiConfig {
        DpiConfig {
            fake_packet: fake,
            fake_ttl: 4,
            fake_count: 2,
            fake_cutoff: 3,
            padding,
            pad_max: 64,
        }
    }

    #[test]
    fn test_padding_roundtrip() {
        for pad_max in [1u16, 8, 512] {
            for len in [0usize, 1, 100, 1400] {
                let payload = vec![0xA5u8; len];
                let wrapped = wrap_padding(&payload, pad_max);
                assert!(wrapped.len() >= 2 + len);
                assert!(wrapped.len() <= 2 + len + usize::from(pad_max));
                assert_eq!(unwrap_padding(&wrapped).unwrap(), &payload[..]);
            }
        }
    }

    #[test]
    fn test_padding_rejects_truncation() {
        let mut data = vec![0u8; 10];
        data[0..2].copy_from_slice(&100u16.to_be_bytes());
        assert!(unwrap_padding(&data).is_none());
        assert!(unwrap_padding(&[]).is_none());
        assert!(unwrap_padding(&[0x00]).is_none());
    }

    #[test]
    fn test_fake_cutoff_per_destination() {
        let dpi = DpiEvasion::new(cfg(true, false));
        let a: SocketAddr = "10.0.0.1:443".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:443".parse().unwrap();

        // First `fake_cutoff` real packets get fakes, later ones do not.
        assert!(dpi.should_send_fake(&a));
        assert!(dpi.should_send_fake(&a));
        assert!(dpi.should_send_fake(&a));
        assert!(!dpi.should_send_fake(&a));

        // Independent counter per destination.
        assert!(dpi.should_send_fake(&b));
    }

    #[test]
    fn test_fake_disabled() {
        let dpi = DpiEvasion::new(cfg(false, false));
        let a: SocketAddr = "10.0.0.1:443".parse().unwrap();
        assert!(!dpi.should_send_fake(&a));
    }

    #[test]
    fn test_fake_payload_size_range() {
        let dpi = DpiEvasion::new(cfg(true, false));
        for _ in 0..100 {
            let p = dpi.fake_payload();
            assert!((24..80).contains(&p.len()));
        }
    }
}
