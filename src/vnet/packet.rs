use std::{
    fmt::Display,
    net::SocketAddrV4,
    ops::{BitOr, BitOrAssign},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bytes::Bytes;
use log::error;

/// IPv4 header length without options.
pub const IPV4_HEADER_LEN: usize = 20;
/// TCP header length without options.
pub const TCP_HEADER_LEN: usize = 20;
/// UDP header length.
pub const UDP_HEADER_LEN: usize = 8;
/// Largest receive window, in segments, a TCP header can carry.
pub const MAX_WINDOW: u32 = u16::MAX as u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// TCP control flags.
///
/// The low bits match the on-wire TCP flag positions. `CON` marks
/// handshake segments that open a multiplexed connection and has no
/// standard wire position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const NONE: TcpFlags = TcpFlags(0);
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const CON: TcpFlags = TcpFlags(0x80);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: TcpFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        TcpFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for TcpFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::CON, "CON"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// TCP sub-header. Sequence numbers count segments, not bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpHeader {
    pub seq: u32,
    pub ack: u32,
    pub window: u32,
    pub flags: TcpFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub protocol: Protocol,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub tcp: Option<TcpHeader>,
}

impl PacketHeader {
    /// Bytes this packet occupies on the wire, headers included.
    pub fn wire_len(&self, payload_len: usize) -> usize {
        let transport = match self.protocol {
            Protocol::Tcp => TCP_HEADER_LEN,
            Protocol::Udp => UDP_HEADER_LEN,
        };
        IPV4_HEADER_LEN + transport + payload_len
    }
}

/// A simulated packet.
///
/// Packets are shared through [`PacketRc`]; buffers, retransmit queues and
/// in-flight events each hold their own handle. The header and payload sit
/// behind separate locks so a writer can restamp the header before the
/// first transmission while readers on another worker only ever observe a
/// complete packet.
pub struct Packet {
    header: RwLock<PacketHeader>,
    payload: RwLock<Bytes>,
}

/// Shared handle to a packet.
pub type PacketRc = Arc<Packet>;

impl Packet {
    pub fn new(header: PacketHeader, payload: Bytes) -> PacketRc {
        Arc::new(Self {
            header: RwLock::new(header),
            payload: RwLock::new(payload),
        })
    }

    pub fn new_tcp(src: SocketAddrV4, dst: SocketAddrV4, tcp: TcpHeader, payload: Bytes) -> PacketRc {
        Self::new(
            PacketHeader {
                protocol: Protocol::Tcp,
                src,
                dst,
                tcp: Some(tcp),
            },
            payload,
        )
    }

    pub fn new_udp(src: SocketAddrV4, dst: SocketAddrV4, payload: Bytes) -> PacketRc {
        Self::new(
            PacketHeader {
                protocol: Protocol::Udp,
                src,
                dst,
                tcp: None,
            },
            payload,
        )
    }

    /// Locks header and payload together for reading.
    ///
    /// Returns `None` if either lock is unavailable; a header lock taken
    /// before the payload lock failed is released before returning.
    pub fn read(&self) -> Option<PacketRead<'_>> {
        let header = match self.header.try_read() {
            Ok(header) => header,
            Err(_) => {
                error!("packet header lock unavailable for reading");
                return None;
            }
        };
        let payload = match self.payload.try_read() {
            Ok(payload) => payload,
            Err(_) => {
                drop(header);
                error!("packet payload lock unavailable for reading");
                return None;
            }
        };
        Some(PacketRead { header, payload })
    }

    /// Locks header and payload together for writing.
    pub fn write(&self) -> Option<PacketWrite<'_>> {
        let header = match self.header.try_write() {
            Ok(header) => header,
            Err(_) => {
                error!("packet header lock unavailable for writing");
                return None;
            }
        };
        let payload = match self.payload.try_write() {
            Ok(payload) => payload,
            Err(_) => {
                drop(header);
                error!("packet payload lock unavailable for writing");
                return None;
            }
        };
        Some(PacketWrite { header, payload })
    }

    /// Snapshot of the header.
    pub fn header(&self) -> Option<PacketHeader> {
        match self.header.try_read() {
            Ok(header) => Some(*header),
            Err(_) => {
                error!("packet header lock unavailable for reading");
                None
            }
        }
    }

    /// Shared view of the payload bytes.
    pub fn payload(&self) -> Option<Bytes> {
        match self.payload.try_read() {
            Ok(payload) => Some(payload.clone()),
            Err(_) => {
                error!("packet payload lock unavailable for reading");
                None
            }
        }
    }

    /// Payload length, zero when the payload cannot be locked.
    pub fn payload_len(&self) -> usize {
        self.payload().map_or(0, |payload| payload.len())
    }

    /// Bytes on the wire including headers.
    pub fn wire_len(&self) -> usize {
        self.read()
            .map_or(0, |packet| packet.header().wire_len(packet.payload().len()))
    }
}

pub struct PacketRead<'a> {
    header: RwLockReadGuard<'a, PacketHeader>,
    payload: RwLockReadGuard<'a, Bytes>,
}

impl PacketRead<'_> {
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

pub struct PacketWrite<'a> {
    header: RwLockWriteGuard<'a, PacketHeader>,
    payload: RwLockWriteGuard<'a, Bytes>,
}

impl PacketWrite<'_> {
    pub fn header_mut(&mut self) -> &mut PacketHeader {
        &mut self.header
    }

    pub fn payload_mut(&mut self) -> &mut Bytes {
        &mut self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn endpoints() -> (SocketAddrV4, SocketAddrV4) {
        (
            SocketAddrV4::new(Ipv4Addr::new(1, 0, 0, 1), 1000),
            SocketAddrV4::new(Ipv4Addr::new(1, 1, 0, 1), 80),
        )
    }

    #[test]
    fn test_flags_display() {
        let flags = TcpFlags::SYN | TcpFlags::ACK | TcpFlags::CON;
        assert_eq!(flags.to_string(), "SYN|ACK|CON");
        assert!(flags.contains(TcpFlags::SYN | TcpFlags::CON));
        assert!(!flags.contains(TcpFlags::RST));
        assert!(flags.intersects(TcpFlags::RST | TcpFlags::ACK));
        assert_eq!(TcpFlags::NONE.to_string(), "-");
    }

    #[test]
    fn test_lock_pair() {
        let (src, dst) = endpoints();
        let tcp = TcpHeader {
            seq: 4,
            ack: 2,
            window: 10,
            flags: TcpFlags::ACK,
        };
        let packet = Packet::new_tcp(src, dst, tcp, Bytes::from_static(b"hello"));
        assert_eq!(packet.wire_len(), 45);

        {
            let mut guard = packet.write().unwrap();
            guard.header_mut().tcp.as_mut().unwrap().ack = 3;
            // a second writer must fail while the pair is held
            assert!(packet.write().is_none());
            assert!(packet.read().is_none());
        }

        let guard = packet.read().unwrap();
        assert_eq!(guard.header().tcp.unwrap().ack, 3);
        assert_eq!(guard.payload().as_ref(), b"hello");
        // readers share
        assert!(packet.read().is_some());
    }

    #[test]
    fn test_failed_payload_lock_releases_header() {
        let (src, dst) = endpoints();
        let packet = Packet::new_udp(src, dst, Bytes::from_static(b"x"));

        let payload = packet.payload.write().unwrap();
        assert!(packet.write().is_none());
        // the header lock taken by the failed attempt must be free again
        assert!(packet.header.try_write().is_ok());
        drop(payload);
        assert!(packet.write().is_some());
    }

    #[test]
    fn test_shared_handle_counts() {
        let (src, dst) = endpoints();
        let packet = Packet::new_udp(src, dst, Bytes::new());
        let held = vec![packet.clone(), packet.clone()];
        assert_eq!(Arc::strong_count(&packet), 3);
        drop(held);
        assert_eq!(Arc::strong_count(&packet), 1);
    }
}
