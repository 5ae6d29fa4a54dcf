//! Cross-boundary frame codec.
//!
//! Every frame starts with a one byte kind tag and the delivery time as a
//! big-endian `u64` of nanoseconds. Packet frames continue with a complete
//! IPv4 datagram carrying a TCP or UDP header; the CON flag travels in the
//! TCP reserved bits. Retransmit and close frames carry the connection
//! 4-tuple followed by the sequence, flags and a payload marker, or the
//! end marker and acknowledgement.
//!
//! The TCP window field is 16 bits. Windows are counted in segments and
//! connections never advertise more than [`MAX_WINDOW`], so the field
//! carries them unchanged.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{error, warn};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::packet::{MutablePacket, Packet as _};

use super::{
    event::{CloseNotice, EventKind, RetransmitRequest},
    time::SimTime,
};
use crate::vnet::packet::{
    Packet, PacketHeader, PacketRc, Protocol, TcpFlags, TcpHeader, MAX_WINDOW, TCP_HEADER_LEN,
    UDP_HEADER_LEN,
};

const FRAME_PACKET: u8 = 1;
const FRAME_RETRANSMIT: u8 = 2;
const FRAME_CLOSE: u8 = 3;

const PREFIX_LEN: usize = 9;
const ENDPOINT_LEN: usize = 6;
const RETRANSMIT_LEN: usize = PREFIX_LEN + 2 * ENDPOINT_LEN + 4 + 2;
const CLOSE_LEN: usize = PREFIX_LEN + 2 * ENDPOINT_LEN + 4 + 4;

/// Reserved-bit position of the CON flag.
const RESERVED_CON: u8 = 0x01;

/// Serializes an event for another worker. Host-local kinds yield `None`.
pub fn encode(time: SimTime, kind: &EventKind) -> Option<Bytes> {
    let mut frame = BytesMut::new();
    match kind {
        EventKind::Packet(packet) => {
            let guard = packet.read()?;
            let header = guard.header();
            let payload = guard.payload();
            let datagram_len = header.wire_len(payload.len());
            if datagram_len > u16::MAX as usize {
                error!("packet of {} bytes does not fit a frame", datagram_len);
                return None;
            }

            frame.put_u8(FRAME_PACKET);
            frame.put_u64(time.as_nanos());
            frame.resize(PREFIX_LEN + datagram_len, 0);
            write_datagram(&mut frame[PREFIX_LEN..], header, payload)?;
        }
        EventKind::Retransmit(request) => {
            frame.reserve(RETRANSMIT_LEN);
            frame.put_u8(FRAME_RETRANSMIT);
            frame.put_u64(time.as_nanos());
            put_endpoint(&mut frame, request.src);
            put_endpoint(&mut frame, request.dst);
            frame.put_u32(request.seq);
            frame.put_u8(request.flags.bits());
            frame.put_u8(request.data as u8);
        }
        EventKind::Close(notice) => {
            frame.reserve(CLOSE_LEN);
            frame.put_u8(FRAME_CLOSE);
            frame.put_u64(time.as_nanos());
            put_endpoint(&mut frame, notice.src);
            put_endpoint(&mut frame, notice.dst);
            frame.put_u32(notice.end);
            frame.put_u32(notice.ack);
        }
        _ => return None,
    }
    Some(frame.freeze())
}

/// Parses a frame produced by [`encode`]. Malformed frames yield `None`.
pub fn decode(frame: &Bytes) -> Option<(SimTime, EventKind)> {
    if frame.len() < PREFIX_LEN {
        warn!("short frame of {} bytes", frame.len());
        return None;
    }
    let mut cursor = &frame[..];
    let tag = cursor.get_u8();
    let time = SimTime::from_nanos(cursor.get_u64());

    let kind = match tag {
        FRAME_PACKET => EventKind::Packet(read_datagram(frame.slice(PREFIX_LEN..))?),
        FRAME_RETRANSMIT if frame.len() >= RETRANSMIT_LEN => {
            let src = get_endpoint(&mut cursor);
            let dst = get_endpoint(&mut cursor);
            EventKind::Retransmit(RetransmitRequest {
                src,
                dst,
                seq: cursor.get_u32(),
                flags: TcpFlags::from_bits(cursor.get_u8()),
                data: cursor.get_u8() != 0,
            })
        }
        FRAME_CLOSE if frame.len() >= CLOSE_LEN => {
            let src = get_endpoint(&mut cursor);
            let dst = get_endpoint(&mut cursor);
            EventKind::Close(CloseNotice {
                src,
                dst,
                end: cursor.get_u32(),
                ack: cursor.get_u32(),
            })
        }
        _ => {
            warn!("unknown or truncated frame kind {}", tag);
            return None;
        }
    };
    Some((time, kind))
}

fn put_endpoint(frame: &mut BytesMut, endpoint: SocketAddrV4) {
    frame.put_u32(u32::from(*endpoint.ip()));
    frame.put_u16(endpoint.port());
}

fn get_endpoint(cursor: &mut &[u8]) -> SocketAddrV4 {
    let ip = Ipv4Addr::from(cursor.get_u32());
    SocketAddrV4::new(ip, cursor.get_u16())
}

fn write_datagram(buffer: &mut [u8], header: &PacketHeader, payload: &[u8]) -> Option<()> {
    let total_len = buffer.len();
    let src_ip = *header.src.ip();
    let dst_ip = *header.dst.ip();

    let mut ipv4_packet = MutableIpv4Packet::new(buffer)?;
    ipv4_packet.set_version(4);
    ipv4_packet.set_header_length(5);
    ipv4_packet.set_dscp(0);
    ipv4_packet.set_ecn(0);
    ipv4_packet.set_total_length(total_len as u16);
    ipv4_packet.set_identification(0);
    ipv4_packet.set_flags(0);
    ipv4_packet.set_fragment_offset(0);
    ipv4_packet.set_ttl(64);
    ipv4_packet.set_checksum(0);
    ipv4_packet.set_source(src_ip);
    ipv4_packet.set_destination(dst_ip);

    match header.protocol {
        Protocol::Tcp => {
            let Some(tcp_header) = header.tcp else {
                error!("tcp packet {} -> {} without tcp header", header.src, header.dst);
                return None;
            };
            ipv4_packet.set_next_level_protocol(IpNextHeaderProtocols::Tcp);

            let mut tcp_packet = MutableTcpPacket::new(ipv4_packet.payload_mut())?;
            let con = tcp_header.flags.contains(TcpFlags::CON);
            tcp_packet.set_source(header.src.port());
            tcp_packet.set_destination(header.dst.port());
            tcp_packet.set_sequence(tcp_header.seq);
            tcp_packet.set_acknowledgement(tcp_header.ack);
            tcp_packet.set_data_offset((TCP_HEADER_LEN / 4) as u8);
            tcp_packet.set_reserved(if con { RESERVED_CON } else { 0 });
            tcp_packet.set_flags(tcp_header.flags.bits() & !TcpFlags::CON.bits());
            if tcp_header.window > MAX_WINDOW {
                warn!("window {} of {} saturated to {}", tcp_header.window, header.src, MAX_WINDOW);
            }
            tcp_packet.set_window(tcp_header.window.min(MAX_WINDOW) as u16);
            tcp_packet.set_checksum(0);
            tcp_packet.set_urgent_ptr(0);
            tcp_packet.set_payload(payload);
            tcp_packet.set_checksum(tcp::ipv4_checksum(
                &tcp_packet.to_immutable(),
                &src_ip,
                &dst_ip,
            ));
        }
        Protocol::Udp => {
            ipv4_packet.set_next_level_protocol(IpNextHeaderProtocols::Udp);

            let mut udp_packet = MutableUdpPacket::new(ipv4_packet.payload_mut())?;
            udp_packet.set_source(header.src.port());
            udp_packet.set_destination(header.dst.port());
            udp_packet.set_length((UDP_HEADER_LEN + payload.len()) as u16);
            udp_packet.set_checksum(0);
            udp_packet.set_payload(payload);
            udp_packet.set_checksum(udp::ipv4_checksum(
                &udp_packet.to_immutable(),
                &src_ip,
                &dst_ip,
            ));
        }
    }

    ipv4_packet.set_checksum(ipv4::checksum(&ipv4_packet.to_immutable()));
    Some(())
}

fn read_datagram(datagram: Bytes) -> Option<PacketRc> {
    let ipv4_packet = Ipv4Packet::new(&datagram)?;
    if ipv4::checksum(&ipv4_packet) != ipv4_packet.get_checksum() {
        warn!("dropping frame with bad ipv4 checksum");
        return None;
    }
    let src_ip = ipv4_packet.get_source();
    let dst_ip = ipv4_packet.get_destination();

    match ipv4_packet.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => {
            let tcp_packet = TcpPacket::new(ipv4_packet.payload())?;
            if tcp::ipv4_checksum(&tcp_packet, &src_ip, &dst_ip) != tcp_packet.get_checksum() {
                warn!("dropping frame with bad tcp checksum");
                return None;
            }
            let mut flags = TcpFlags::from_bits(tcp_packet.get_flags());
            if tcp_packet.get_reserved() & RESERVED_CON != 0 {
                flags |= TcpFlags::CON;
            }
            let tcp_header = TcpHeader {
                seq: tcp_packet.get_sequence(),
                ack: tcp_packet.get_acknowledgement(),
                window: tcp_packet.get_window() as u32,
                flags,
            };
            let src = SocketAddrV4::new(src_ip, tcp_packet.get_source());
            let dst = SocketAddrV4::new(dst_ip, tcp_packet.get_destination());
            let payload = datagram.slice_ref(tcp_packet.payload());
            Some(Packet::new_tcp(src, dst, tcp_header, payload))
        }
        IpNextHeaderProtocols::Udp => {
            let udp_packet = UdpPacket::new(ipv4_packet.payload())?;
            if udp::ipv4_checksum(&udp_packet, &src_ip, &dst_ip) != udp_packet.get_checksum() {
                warn!("dropping frame with bad udp checksum");
                return None;
            }
            let src = SocketAddrV4::new(src_ip, udp_packet.get_source());
            let dst = SocketAddrV4::new(dst_ip, udp_packet.get_destination());
            let payload = datagram.slice_ref(udp_packet.payload());
            Some(Packet::new_udp(src, dst, payload))
        }
        protocol => {
            warn!("dropping frame with protocol {:?}", protocol);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> (SocketAddrV4, SocketAddrV4) {
        (
            SocketAddrV4::new(Ipv4Addr::new(1, 0, 0, 1), 40000),
            SocketAddrV4::new(Ipv4Addr::new(1, 0, 1, 2), 80),
        )
    }

    #[test]
    fn test_tcp_packet_frame() {
        let (src, dst) = endpoints();
        let tcp_header = TcpHeader {
            seq: 17,
            ack: 9,
            window: 44,
            flags: TcpFlags::SYN | TcpFlags::ACK | TcpFlags::CON,
        };
        let packet = Packet::new_tcp(src, dst, tcp_header, Bytes::from_static(b"segment"));
        let time = SimTime::from_millis(12);

        let frame = encode(time, &EventKind::Packet(packet)).unwrap();
        assert_eq!(frame.len(), PREFIX_LEN + 20 + 20 + 7);

        let (decoded_time, kind) = decode(&frame).unwrap();
        assert_eq!(decoded_time, time);
        let EventKind::Packet(decoded) = kind else {
            panic!("expected a packet frame");
        };
        let header = decoded.header().unwrap();
        assert_eq!(header.protocol, Protocol::Tcp);
        assert_eq!((header.src, header.dst), (src, dst));
        assert_eq!(header.tcp, Some(tcp_header));
        assert_eq!(decoded.payload().unwrap().as_ref(), b"segment");
    }

    #[test]
    fn test_widest_window_survives_frame() {
        let (src, dst) = endpoints();
        let tcp_header = TcpHeader {
            seq: 0,
            ack: 0,
            window: MAX_WINDOW,
            flags: TcpFlags::ACK,
        };
        let packet = Packet::new_tcp(src, dst, tcp_header, Bytes::new());
        let frame = encode(SimTime::ZERO, &EventKind::Packet(packet)).unwrap();
        let Some((_, EventKind::Packet(decoded))) = decode(&frame) else {
            panic!("expected a packet frame");
        };
        assert_eq!(decoded.header().unwrap().tcp, Some(tcp_header));
    }

    #[test]
    fn test_udp_packet_frame() {
        let (src, dst) = endpoints();
        let packet = Packet::new_udp(src, dst, Bytes::from_static(b"datagram"));
        let frame = encode(SimTime::ZERO, &EventKind::Packet(packet)).unwrap();
        let (_, kind) = decode(&frame).unwrap();
        let EventKind::Packet(decoded) = kind else {
            panic!("expected a packet frame");
        };
        let header = decoded.header().unwrap();
        assert_eq!(header.protocol, Protocol::Udp);
        assert!(header.tcp.is_none());
        assert_eq!(decoded.payload().unwrap().as_ref(), b"datagram");
    }

    #[test]
    fn test_corrupt_frame_rejected() {
        let (src, dst) = endpoints();
        let tcp_header = TcpHeader {
            seq: 1,
            ack: 1,
            window: 1,
            flags: TcpFlags::ACK,
        };
        let packet = Packet::new_tcp(src, dst, tcp_header, Bytes::from_static(b"abc"));
        let frame = encode(SimTime::ZERO, &EventKind::Packet(packet)).unwrap();

        let mut corrupted = BytesMut::from(&frame[..]);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        assert!(decode(&corrupted.freeze()).is_none());
        assert!(decode(&frame.slice(..4)).is_none());
    }

    #[test]
    fn test_control_frames() {
        let (src, dst) = endpoints();
        let request = RetransmitRequest {
            src,
            dst,
            seq: 99,
            flags: TcpFlags::ACK | TcpFlags::CON,
            data: false,
        };
        let frame = encode(SimTime::from_nanos(5), &EventKind::Retransmit(request)).unwrap();
        assert_eq!(frame.len(), RETRANSMIT_LEN);
        match decode(&frame) {
            Some((time, EventKind::Retransmit(decoded))) => {
                assert_eq!(time, SimTime::from_nanos(5));
                assert_eq!(decoded, request);
            }
            _ => panic!("expected a retransmit frame"),
        }

        let notice = CloseNotice {
            src,
            dst,
            end: 1000,
            ack: 77,
        };
        let frame = encode(SimTime::ZERO, &EventKind::Close(notice)).unwrap();
        match decode(&frame) {
            Some((_, EventKind::Close(decoded))) => {
                assert_eq!(frame.len(), CLOSE_LEN);
                assert_eq!(decoded, notice);
            }
            _ => panic!("expected a close frame"),
        }

        assert!(encode(SimTime::ZERO, &EventKind::Uploaded).is_none());
    }
}
