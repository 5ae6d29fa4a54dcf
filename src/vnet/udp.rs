use std::{io, net::SocketAddrV4};

use bytes::Bytes;
use log::{debug, trace};

use super::{
    host::{bad_descriptor, would_block, Stack},
    packet::{Packet, PacketRc},
    socket::{Descriptor, Engine, SocketKind},
};
use crate::{
    prometheus::metrics::{PACKETS_DROPPED, UDP_RX_PACKETS, UDP_TX_PACKETS},
    vci::Context,
};

/// Datagram socket state beyond its buffers.
#[derive(Default)]
pub(crate) struct UdpEndpoint {
    /// Default destination set by connect.
    pub(crate) peer: Option<SocketAddrV4>,
    /// Sequence number used to key the next outgoing datagram.
    next_seq: u32,
}

impl Stack {
    pub(crate) fn udp_connect(&mut self, fd: Descriptor, remote: SocketAddrV4) -> io::Result<()> {
        self.autobind(fd, &remote)?;
        let socket = self.socket_mut(fd)?;
        if let Engine::Udp(udp) = &mut socket.engine {
            udp.peer = Some(remote);
        }
        Ok(())
    }

    /// Queues one datagram. Datagrams larger than a segment are refused
    /// and a full send buffer reports would-block.
    pub(crate) fn udp_send_to(
        &mut self,
        fd: Descriptor,
        buf: &[u8],
        dst: Option<SocketAddrV4>,
        ctx: &mut Context<'_>,
    ) -> io::Result<usize> {
        let mss = self.config.mss;
        let socket = self.socket_mut(fd)?;
        let Engine::Udp(udp) = &socket.engine else {
            return Err(bad_descriptor(fd));
        };
        let dst = dst
            .or(udp.peer)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        if buf.len() > mss {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "datagram larger than a segment",
            ));
        }
        if socket.buffers.send_space() < buf.len() {
            return Err(would_block());
        }

        let port = self.autobind(fd, &dst)?;
        let src = self.local_endpoint(&dst, port);
        let packet = Packet::new_udp(src, dst, Bytes::copy_from_slice(buf));

        let socket = self.socket_mut(fd)?;
        let Engine::Udp(udp) = &mut socket.engine else {
            return Err(bad_descriptor(fd));
        };
        let seq = udp.next_seq;
        udp.next_seq = udp.next_seq.wrapping_add(1);
        if !socket.buffers.add_send(seq, packet, ctx) {
            return Err(would_block());
        }
        UDP_TX_PACKETS.inc();
        trace!("{}: fd {} datagram {} -> {} ({} bytes)", self.addr, fd, src, dst, buf.len());
        self.ready_send(fd, ctx);
        Ok(buf.len())
    }

    /// Pops one datagram. Bytes beyond `buf` are discarded.
    pub(crate) fn udp_recv_from(
        &mut self,
        fd: Descriptor,
        buf: &mut [u8],
        ctx: &mut Context<'_>,
    ) -> io::Result<(usize, SocketAddrV4)> {
        let socket = self.socket_mut(fd)?;
        let packet = socket.buffers.remove_read(ctx).ok_or_else(would_block)?;
        let Some(read) = packet.read() else {
            return Err(io::Error::new(io::ErrorKind::Other, "datagram unavailable"));
        };
        let payload = read.payload();
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, read.header().src))
    }

    pub(crate) fn udp_arrival(&mut self, packet: PacketRc, ctx: &mut Context<'_>) {
        let Some(header) = packet.header() else {
            return;
        };
        let loopback = header.dst.ip().is_loopback();
        let Some(fd) = self.lookup_port(header.dst.port(), loopback) else {
            debug!("{}: no datagram socket on {}", self.addr, header.dst);
            PACKETS_DROPPED.with_label_values(&["unbound"]).inc();
            return;
        };
        let Some(socket) = self.sockets.get_mut(&fd) else {
            return;
        };
        if socket.kind != SocketKind::Datagram {
            debug!("{}: datagram for stream socket fd {}", self.addr, fd);
            return;
        }
        if !socket.buffers.add_read(packet, ctx) {
            trace!("{}: fd {} receive buffer full, datagram from {} dropped", self.addr, fd, header.src);
            PACKETS_DROPPED.with_label_values(&["receive_buffer"]).inc();
            return;
        }
        UDP_RX_PACKETS.inc();
    }
}
