//! Configuration for paqet
//!
//! A YAML tree shared by both roles. Loading applies defaults first,
//! then collects every validation error so a broken file is reported in
//! one pass instead of one complaint per restart.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::common::Address;
use crate::error::{Error, Result};
use crate::protocol::TcpFlags;

/// Which half of the tunnel this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    pub license: LicenseConfig,

    pub network: Network,

    #[serde(default)]
    pub transport: Transport,

    /// Server role: carrier listen address.
    #[serde(default)]
    pub listen: Option<ListenConfig>,

    /// Client role: remote carrier endpoint.
    #[serde(default)]
    pub server: Option<ServerConfig>,

    /// Client role: local forwarder entries.
    #[serde(default)]
    pub forwards: Vec<ForwardEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LicenseConfig {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub timeout_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub interface: InterfaceConfig,

    /// Carrier port: local TCP source port and BPF capture port.
    pub port: u16,

    /// Interface MAC, the Ethernet source of every crafted frame.
    #[serde(default)]
    pub mac: String,

    #[serde(default)]
    pub ipv4: Option<RouteConfig>,

    #[serde(default)]
    pub ipv6: Option<RouteConfig>,

    /// TCP flag sets rotated across crafted packets, e.g. `"psh,ack"`.
    #[serde(default)]
    pub tcp_flags: Vec<String>,

    #[serde(default)]
    pub pcap: PcapConfig,

    #[serde(default)]
    pub dpi: DpiConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    /// Windows NPF device GUID; the human name is used elsewhere.
    #[serde(default)]
    pub guid: String,
}

impl InterfaceConfig {
    /// The pcap device identifier for this platform.
    pub fn device_name(&self) -> String {
        if cfg!(windows) && !self.guid.is_empty() {
            self.guid.clone()
        } else {
            self.name.clone()
        }
    }
}

/// One address family's egress: our address and the next-hop MAC the
/// crafted frames are addressed to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConfig {
    pub addr: String,
    pub next_hop_mac: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PcapConfig {
    #[serde(default)]
    pub sockbuf: usize,
}

/// DPI evasion settings; all techniques are opt-in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DpiConfig {
    /// Decoy TCP packets with low TTL before real data.
    #[serde(default)]
    pub fake_packet: bool,

    /// TTL / hop limit for decoys: high enough to pass the classifier,
    /// low enough to expire before the server.
    #[serde(default)]
    pub fake_ttl: u8,

    /// Decoys per real packet.
    #[serde(default)]
    pub fake_count: u32,

    /// Stop sending decoys after this many real packets per
    /// destination; classifiers only look at the start of a flow.
    #[serde(default)]
    pub fake_cutoff: u32,

    /// Length-randomizing wrapper on every carrier datagram. Both peers
    /// must agree or no session ever establishes.
    #[serde(default)]
    pub padding: bool,

    /// Maximum random padding bytes per datagram.
    #[serde(default)]
    pub pad_max: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transport {
    #[serde(default)]
    pub protocol: String,

    /// Carrier pool size (client role).
    #[serde(default)]
    pub conn: usize,

    /// TCP copy buffer per direction.
    #[serde(default)]
    pub tcpbuf: usize,

    /// UDP copy buffer per direction.
    #[serde(default)]
    pub udpbuf: usize,

    #[serde(default)]
    pub kcp: KcpConfig,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            protocol: String::new(),
            conn: 0,
            tcpbuf: 0,
            udpbuf: 0,
            kcp: KcpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KcpConfig {
    /// normal | fast | fast2 | fast3 | stream | 1to1 | manual
    #[serde(default)]
    pub mode: String,

    // Manual-mode knobs; ignored by the named profiles.
    #[serde(default)]
    pub nodelay: u32,
    #[serde(default)]
    pub interval: u32,
    #[serde(default)]
    pub resend: i32,
    #[serde(default)]
    pub nocongestion: u32,

    #[serde(default)]
    pub sndwnd: u16,
    #[serde(default)]
    pub rcvwnd: u16,
    #[serde(default)]
    pub mtu: usize,

    /// Multiplexer receive budget override (bytes).
    #[serde(default)]
    pub smuxbuf: usize,
    /// Per-stream buffer override (bytes).
    #[serde(default)]
    pub streambuf: usize,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            mode: "fast".to_string(),
            nodelay: 0,
            interval: 0,
            resend: 0,
            nocongestion: 1,
            sndwnd: 1024,
            rcvwnd: 1024,
            mtu: 1350,
            smuxbuf: 0,
            streambuf: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardEntry {
    pub listen: String,
    pub target: String,
    /// "tcp" or "udp"
    #[serde(default = "default_forward_protocol")]
    pub protocol: String,
}

fn default_forward_protocol() -> String {
    "tcp".to_string()
}

impl Config {
    /// Load a config file for `role`: parse, default, validate.
    pub fn load<P: AsRef<Path>>(path: P, role: Role) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_yaml(&content, role)
    }

    pub fn from_yaml(yaml: &str, role: Role) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.set_defaults(role);
        config.validate(role)?;
        Ok(config)
    }

    fn set_defaults(&mut self, _role: Role) {
        if self.license.timeout_sec == 0 {
            self.license.timeout_sec = 6;
        }

        if self.network.pcap.sockbuf == 0 {
            // 4MB covers most workloads; larger per-handle buffers just
            // waste RAM under high user counts.
            self.network.pcap.sockbuf = 4 * 1024 * 1024;
        }

        let dpi = &mut self.network.dpi;
        if dpi.fake_ttl == 0 {
            dpi.fake_ttl = 4;
        }
        if dpi.fake_count == 0 {
            dpi.fake_count = 1;
        }
        if dpi.fake_cutoff == 0 {
            dpi.fake_cutoff = 5;
        }
        if dpi.pad_max == 0 {
            dpi.pad_max = 64;
        }

        let t = &mut self.transport;
        if t.protocol.is_empty() {
            t.protocol = "kcp".to_string();
        }
        // Three connections keep good parallelism with lower control
        // overhead than five.
        if t.conn == 0 {
            t.conn = 3;
        }
        // 32KB relay buffers: smaller ones cause excessive syscalls
        // under high load.
        if t.tcpbuf == 0 {
            t.tcpbuf = 32 * 1024;
        }
        if t.tcpbuf < 4 * 1024 {
            t.tcpbuf = 4 * 1024;
        }
        if t.udpbuf == 0 {
            t.udpbuf = 16 * 1024;
        }
        if t.udpbuf < 2 * 1024 {
            t.udpbuf = 2 * 1024;
        }
        if t.kcp.mode.is_empty() {
            t.kcp.mode = "fast".to_string();
        }
        if t.kcp.sndwnd == 0 {
            t.kcp.sndwnd = 1024;
        }
        if t.kcp.rcvwnd == 0 {
            t.kcp.rcvwnd = 1024;
        }
        if t.kcp.mtu == 0 {
            t.kcp.mtu = 1350;
        }
    }

    fn validate(&self, role: Role) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // License
        if self.license.key.trim().is_empty() {
            errors.push("license.key is required".into());
        }
        let url = self.license.url.trim();
        if url.is_empty() {
            errors.push("license.url is required".into());
        } else if !url_looks_valid(url) {
            errors.push("license.url is invalid".into());
        }
        if !(1..=30).contains(&self.license.timeout_sec) {
            errors.push("license.timeout_sec must be between 1-30".into());
        }
        let sid = self.license.server_id.trim();
        if !sid.is_empty() {
            if sid.contains(char::is_whitespace) {
                errors.push("license.server_id must not contain whitespace".into());
            }
            if sid.len() > 128 {
                errors.push("license.server_id is too long".into());
            }
        }

        // Network
        if self.network.interface.device_name().is_empty() {
            errors.push("network.interface.name is required".into());
        }
        if self.network.port == 0 {
            errors.push("network.port is required".into());
        }
        if self.network.mac.is_empty() {
            errors.push("network.mac is required".into());
        } else if crate::packet::wire::parse_mac(&self.network.mac).is_err() {
            errors.push(format!("network.mac is invalid: {}", self.network.mac));
        }
        if self.network.ipv4.is_none() && self.network.ipv6.is_none() {
            errors.push("at least one of network.ipv4 / network.ipv6 is required".into());
        }
        if let Some(route) = &self.network.ipv4 {
            if route.addr.parse::<std::net::Ipv4Addr>().is_err() {
                errors.push(format!("network.ipv4.addr is invalid: {}", route.addr));
            }
            if crate::packet::wire::parse_mac(&route.next_hop_mac).is_err() {
                errors.push("network.ipv4.next_hop_mac is invalid".into());
            }
        }
        if let Some(route) = &self.network.ipv6 {
            if route.addr.parse::<std::net::Ipv6Addr>().is_err() {
                errors.push(format!("network.ipv6.addr is invalid: {}", route.addr));
            }
            if crate::packet::wire::parse_mac(&route.next_hop_mac).is_err() {
                errors.push("network.ipv6.next_hop_mac is invalid".into());
            }
        }
        for spec in &self.network.tcp_flags {
            if TcpFlags::parse(spec).is_err() {
                errors.push(format!("network.tcp_flags entry is invalid: {}", spec));
            }
        }

        let sockbuf = self.network.pcap.sockbuf;
        if sockbuf < 1024 {
            errors.push("network.pcap.sockbuf must be >= 1024 bytes".into());
        }
        if sockbuf > 100 * 1024 * 1024 {
            errors.push("network.pcap.sockbuf too large (max 100MB)".into());
        }
        if sockbuf >= 1024 && !sockbuf.is_power_of_two() {
            warn!(
                "network.pcap.sockbuf ({} bytes) is not a power of 2 - consider 4MB, 8MB or 16MB",
                sockbuf
            );
        }

        let dpi = &self.network.dpi;
        if dpi.fake_packet {
            if !(1..=64).contains(&dpi.fake_ttl) {
                errors.push("network.dpi.fake_ttl must be between 1-64".into());
            }
            if !(1..=10).contains(&dpi.fake_count) {
                errors.push("network.dpi.fake_count must be between 1-10".into());
            }
            if !(1..=100).contains(&dpi.fake_cutoff) {
                errors.push("network.dpi.fake_cutoff must be between 1-100".into());
            }
        }
        if dpi.padding && !(1..=512).contains(&dpi.pad_max) {
            errors.push("network.dpi.pad_max must be between 1-512".into());
        }

        // Transport
        if self.transport.protocol != "kcp" {
            errors.push("transport.protocol must be one of: [kcp]".into());
        }
        if !(1..=256).contains(&self.transport.conn) {
            errors.push("transport.conn must be between 1-256 connections".into());
        }
        const KCP_MODES: [&str; 7] = ["normal", "fast", "fast2", "fast3", "stream", "1to1", "manual"];
        if !KCP_MODES.contains(&self.transport.kcp.mode.as_str()) {
            errors.push(format!(
                "transport.kcp.mode must be one of: {:?}",
                KCP_MODES
            ));
        }

        // Role-specific
        match role {
            Role::Server => {
                match &self.listen {
                    None => errors.push("server role requires a listen section".into()),
                    Some(listen) => {
                        if listen.addr.parse::<Address>().is_err() {
                            errors.push(format!("listen.addr is invalid: {}", listen.addr));
                        }
                    }
                }
            }
            Role::Client => {
                match &self.server {
                    None => errors.push("client role requires a server section".into()),
                    Some(server) => {
                        if server.addr.parse::<Address>().is_err() {
                            errors.push(format!("server.addr is invalid: {}", server.addr));
                        }
                    }
                }
                if self.forwards.is_empty() {
                    errors.push("client role requires at least one forwards entry".into());
                }
                for (i, entry) in self.forwards.iter().enumerate() {
                    if entry.listen.parse::<std::net::SocketAddr>().is_err() {
                        errors.push(format!("forwards[{}].listen is invalid: {}", i, entry.listen));
                    }
                    if entry.target.parse::<Address>().is_err() {
                        errors.push(format!("forwards[{}].target is invalid: {}", i, entry.target));
                    }
                    if entry.protocol != "tcp" && entry.protocol != "udp" {
                        errors.push(format!(
                            "forwards[{}].protocol must be tcp or udp",
                            i
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(errors.join("; ")))
        }
    }
}

fn url_looks_valid(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    matches!(rest, Some(host) if !host.is_empty() && !host.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_YAML: &str = r#"
license:
  key: test-key
  url: http://license.example.com:8080
network:
  interface:
    name: eth0
  port: 443
  mac: "02:00:00:00:00:01"
  ipv4:
    addr: 10.0.0.2
    next_hop_mac: "02:00:00:00:00:fe"
server:
  addr: 203.0.113.7:443
forwards:
  - listen: 127.0.0.1:7000
    target: 203.0.113.7:9000
    protocol: tcp
"#;

    const SERVER_YAML: &str = r#"
license:
  key: test-key
  url: http://license.example.com:8080
network:
  interface:
    name: eth0
  port: 443
  mac: "02:00:00:00:00:02"
  ipv4:
    addr: 10.0.0.1
    next_hop_mac: "02:00:00:00:00:fe"
listen:
  addr: 0.0.0.0:443
"#;

    #[test]
    fn test_client_defaults() {
        let cfg = Config::from_yaml(CLIENT_YAML, Role::Client).unwrap();
        assert_eq!(cfg.transport.protocol, "kcp");
        assert_eq!(cfg.transport.conn, 3);
        assert_eq!(cfg.transport.tcpbuf, 32 * 1024);
        assert_eq!(cfg.transport.udpbuf, 16 * 1024);
        assert_eq!(cfg.transport.kcp.mode, "fast");
        assert_eq!(cfg.transport.kcp.mtu, 1350);
        assert_eq!(cfg.network.pcap.sockbuf, 4 * 1024 * 1024);
        assert_eq!(cfg.network.dpi.fake_ttl, 4);
        assert_eq!(cfg.network.dpi.pad_max, 64);
        assert_eq!(cfg.license.timeout_sec, 6);
    }

    #[test]
    fn test_server_role() {
        let cfg = Config::from_yaml(SERVER_YAML, Role::Server).unwrap();
        assert_eq!(cfg.listen.unwrap().addr, "0.0.0.0:443");
    }

    #[test]
    fn test_buffer_floors() {
        let yaml = CLIENT_YAML.replace(
            "forwards:",
            "transport:\n  tcpbuf: 1024\n  udpbuf: 512\nforwards:",
        );
        let cfg = Config::from_yaml(&yaml, Role::Client).unwrap();
        assert_eq!(cfg.transport.tcpbuf, 4 * 1024);
        assert_eq!(cfg.transport.udpbuf, 2 * 1024);
    }

    #[test]
    fn test_validation_collects_errors() {
        let yaml = r#"
license:
  key: ""
  url: not-a-url
network:
  interface:
    name: ""
  port: 0
  mac: "xx"
"#;
        let err = Config::from_yaml(yaml, Role::Client).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("license.key"));
        assert!(msg.contains("license.url"));
        assert!(msg.contains("network.port"));
        assert!(msg.contains("network.mac"));
        assert!(msg.contains("server section"));
    }

    #[test]
    fn test_conn_bounds() {
        let yaml = CLIENT_YAML.replace("forwards:", "transport:\n  conn: 300\nforwards:");
        assert!(Config::from_yaml(&yaml, Role::Client).is_err());
    }

    #[test]
    fn test_dpi_bounds_only_when_enabled() {
        // Disabled techniques skip range checks entirely.
        let cfg = Config::from_yaml(CLIENT_YAML, Role::Client).unwrap();
        assert!(!cfg.network.dpi.fake_packet);

        // Enabled fake packets with an out-of-range TTL must fail.
        let with_dpi = CLIENT_YAML.replace(
            "server:",
            "  dpi:\n    fake_packet: true\n    fake_ttl: 99\nserver:",
        );
        assert!(Config::from_yaml(&with_dpi, Role::Client).is_err());

        // In range passes.
        let with_dpi = CLIENT_YAML.replace(
            "server:",
            "  dpi:\n    fake_packet: true\n    fake_ttl: 6\nserver:",
        );
        let cfg = Config::from_yaml(&with_dpi, Role::Client).unwrap();
        assert!(cfg.network.dpi.fake_packet);
        assert_eq!(cfg.network.dpi.fake_ttl, 6);
    }

    #[test]
    fn test_forward_entries_validated() {
        let yaml = CLIENT_YAML.replace("protocol: tcp", "protocol: sctp");
        assert!(Config::from_yaml(&yaml, Role::Client).is_err());

        let yaml = CLIENT_YAML.replace("target: 203.0.113.7:9000", "target: nonsense");
        assert!(Config::from_yaml(&yaml, Role::Client).is_err());
    }
}
