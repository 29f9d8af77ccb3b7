//! In-band control/data protocol
//!
//! Every newly opened logical stream carries exactly one frame before
//! raw data bytes. The frame declares intent: a health-check ping/pong,
//! a TCP-flag report, or a dial request naming the remote endpoint.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::Address;
use crate::error::{Error, Result};

pub const PPING: u8 = 0x01;
pub const PPONG: u8 = 0x02;
pub const PTCPF: u8 = 0x03;
pub const PTCP: u8 = 0x04;
pub const PUDP: u8 = 0x05;

/// Addresses longer than this are rejected outright.
const MAX_ADDR_LEN: usize = 512;
/// A flag report carries at most this many flag sets.
const MAX_TCPF_COUNT: usize = 64;

/// TCP header flag set.
///
/// Bit layout on the wire (and in the TCP header builder):
/// 0:FIN 1:SYN 2:RST 3:PSH 4:ACK 5:URG 6:ECE 7:CWR 8:NS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
    pub ns: bool,
}

impl TcpFlags {
    /// The flag set carrier packets use when nothing else is configured.
    pub fn psh_ack() -> Self {
        Self {
            psh: true,
            ack: true,
            ..Default::default()
        }
    }

    /// Parse a config flag-set spec like `"psh,ack"`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut flags = TcpFlags::default();
        for part in spec.split(',') {
            match part.trim().to_ascii_lowercase().as_str() {
                "fin" => flags.fin = true,
                "syn" => flags.syn = true,
                "rst" => flags.rst = true,
                "psh" => flags.psh = true,
                "ack" => flags.ack = true,
                "urg" => flags.urg = true,
                "ece" => flags.ece = true,
                "cwr" => flags.cwr = true,
                "ns" => flags.ns = true,
                other => {
                    return Err(Error::Config(format!("unknown TCP flag: {}", other)));
                }
            }
        }
        Ok(flags)
    }

    pub fn encode(&self) -> u16 {
        let mut bits = 0u16;
        if self.fin {
            bits |= 1 << 0;
        }
        if self.syn {
            bits |= 1 << 1;
        }
        if self.rst {
            bits |= 1 << 2;
        }
        if self.psh {
            bits |= 1 << 3;
        }
        if self.ack {
            bits |= 1 << 4;
        }
        if self.urg {
            bits |= 1 << 5;
        }
        if self.ece {
            bits |= 1 << 6;
        }
        if self.cwr {
            bits |= 1 << 7;
        }
        if self.ns {
            bits |= 1 << 8;
        }
        bits
    }

    pub fn decode(bits: u16) -> Self {
        Self {
            fin: bits & (1 << 0) != 0,
            syn: bits & (1 << 1) != 0,
            rst: bits & (1 << 2) != 0,
            psh: bits & (1 << 3) != 0,
            ack: bits & (1 << 4) != 0,
            urg: bits & (1 << 5) != 0,
            ece: bits & (1 << 6) != 0,
            cwr: bits & (1 << 7) != 0,
            ns: bits & (1 << 8) != 0,
        }
    }
}

/// One protocol frame, the first payload of every stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ping,
    Pong,
    /// Client's configured TCP flag sets, reported so the far side can
    /// mirror them on its own carrier packets.
    TcpFlagReport(Vec<TcpFlags>),
    /// Dial TCP to the carried address and splice the stream onto it.
    DialTcp(Address),
    /// Dial UDP to the carried address and splice the stream onto it.
    DialUdp(Address),
}

impl Frame {
    pub fn frame_type(&self) -> u8 {
        match self {
            Frame::Ping => PPING,
            Frame::Pong => PPONG,
            Frame::TcpFlagReport(_) => PTCPF,
            Frame::DialTcp(_) => PTCP,
            Frame::DialUdp(_) => PUDP,
        }
    }

    /// Read one frame from the stream.
    ///
    /// Wire format:
    ///   [1 byte: type]
    ///   [2 bytes be: addr len, N bytes: addr string]   (PTCP / PUDP)
    ///   [1 byte: count, count x 2 bytes be: flag bits] (PTCPF)
    ///
    /// Unknown types are an error; the caller closes the stream.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
        let mut type_buf = [0u8; 1];
        r.read_exact(&mut type_buf).await?;

        match type_buf[0] {
            PPING => Ok(Frame::Ping),
            PPONG => Ok(Frame::Pong),
            PTCP | PUDP => {
                let mut len_buf = [0u8; 2];
                r.read_exact(&mut len_buf).await?;
                let addr_len = u16::from_be_bytes(len_buf) as usize;
                if addr_len > MAX_ADDR_LEN {
                    return Err(Error::Protocol(format!("address too long: {}", addr_len)));
                }
                let mut addr_buf = vec![0u8; addr_len];
                r.read_exact(&mut addr_buf).await?;
                let addr_str = std::str::from_utf8(&addr_buf)
                    .map_err(|_| Error::Protocol("address is not utf-8".into()))?;
                let addr: Address = addr_str.parse()?;
                if type_buf[0] == PTCP {
                    Ok(Frame::DialTcp(addr))
                } else {
                    Ok(Frame::DialUdp(addr))
                }
            }
            PTCPF => {
                let mut count_buf = [0u8; 1];
                r.read_exact(&mut count_buf).await?;
                let count = count_buf[0] as usize;
                if count > MAX_TCPF_COUNT {
                    return Err(Error::Protocol(format!("too many flag sets: {}", count)));
                }
                let mut flags = Vec::with_capacity(count);
                for _ in 0..count {
                    let mut bits_buf = [0u8; 2];
                    r.read_exact(&mut bits_buf).await?;
                    flags.push(TcpFlags::decode(u16::from_be_bytes(bits_buf)));
                }
                Ok(Frame::TcpFlagReport(flags))
            }
            t => Err(Error::Protocol(format!("unknown frame type: {}", t))),
        }
    }

    /// Write this frame to the stream.
    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        match self {
            Frame::Ping | Frame::Pong => {
                w.write_all(&[self.frame_type()]).await?;
            }
            Frame::DialTcp(addr) | Frame::DialUdp(addr) => {
                let addr_str = addr.to_string();
                let mut buf = Vec::with_capacity(3 + addr_str.len());
                buf.push(self.frame_type());
                buf.extend_from_slice(&(addr_str.len() as u16).to_be_bytes());
                buf.extend_from_slice(addr_str.as_bytes());
                w.write_all(&buf).await?;
            }
            Frame::TcpFlagReport(flags) => {
                if flags.len() > MAX_TCPF_COUNT {
                    return Err(Error::Protocol(format!(
                        "too many flag sets: {}",
                        flags.len()
                    )));
                }
                let mut buf = Vec::with_capacity(2 + flags.len() * 2);
                buf.push(self.frame_type());
                buf.push(flags.len() as u8);
                for f in flags {
                    buf.extend_from_slice(&f.encode().to_be_bytes());
                }
                w.write_all(&buf).await?;
            }
        }
        w.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn roundtrip(frame: Frame) -> Frame {
        let mut cursor = Cursor::new(Vec::new());
        frame.write(&mut cursor).await.unwrap();
        Frame::read(&mut Cursor::new(cursor.into_inner()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping_pong_roundtrip() {
        assert_eq!(roundtrip(Frame::Ping).await, Frame::Ping);
        assert_eq!(roundtrip(Frame::Pong).await, Frame::Pong);
    }

    #[tokio::test]
    async fn test_dial_roundtrip() {
        let tcp = Frame::DialTcp("[::1]:443".parse().unwrap());
        let decoded = roundtrip(tcp).await;
        match decoded {
            Frame::DialTcp(addr) => assert_eq!(addr.to_string(), "[::1]:443"),
            other => panic!("unexpected frame: {:?}", other),
        }

        let udp = Frame::DialUdp("10.0.0.1:53".parse().unwrap());
        assert_eq!(udp.clone(), roundtrip(udp).await);
    }

    #[tokio::test]
    async fn test_flag_report_roundtrip() {
        let flags = vec![
            TcpFlags::psh_ack(),
            TcpFlags {
                syn: true,
                ece: true,
                cwr: true,
                ns: true,
                ..Default::default()
            },
        ];
        let frame = Frame::TcpFlagReport(flags.clone());
        assert_eq!(roundtrip(frame).await, Frame::TcpFlagReport(flags));
    }

    #[test]
    fn test_flag_parse() {
        let f = TcpFlags::parse("psh,ack").unwrap();
        assert!(f.psh && f.ack && !f.syn);
        assert!(TcpFlags::parse("SYN").unwrap().syn);
        assert!(TcpFlags::parse("psh,bogus").is_err());
    }

    #[test]
    fn test_flag_bit_layout() {
        let all = TcpFlags {
            fin: true,
            syn: true,
            rst: true,
            psh: true,
            ack: true,
            urg: true,
            ece: true,
            cwr: true,
            ns: true,
        };
        assert_eq!(all.encode(), 0x01FF);
        assert_eq!(TcpFlags::decode(0x01FF), all);
        assert_eq!(TcpFlags::psh_ack().encode(), (1 << 3) | (1 << 4));
        // Bits above NS are ignored on decode, never set on encode.
        assert_eq!(TcpFlags::decode(0xFE00), TcpFlags::default());
    }

    #[tokio::test]
    async fn test_unknown_type_fails_closed() {
        let err = Frame::read(&mut Cursor::new(vec![0x7F])).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_oversized_address_rejected() {
        let mut buf = vec![PTCP];
        buf.extend_from_slice(&600u16.to_be_bytes());
        buf.extend_from_slice(&[b'a'; 600]);
        assert!(Frame::read(&mut Cursor::new(buf)).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_flag_count_rejected() {
        let mut buf = vec![PTCPF, 65];
        buf.extend_from_slice(&[0u8; 130]);
        assert!(Frame::read(&mut Cursor::new(buf)).await.is_err());
    }
}
