use std::{cmp::Ordering, net::SocketAddrV4, time::Duration};

use super::{address::VirtualAddr, time::SimTime};
use crate::vnet::{
    packet::{PacketHeader, PacketRc, Protocol, TcpFlags},
    socket::Descriptor,
};

/// Asks the sender of a segment to transmit it again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetransmitRequest {
    /// Endpoint that sent the segment.
    pub src: SocketAddrV4,
    /// Endpoint the segment was addressed to.
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub flags: TcpFlags,
    /// The segment carried payload.
    pub data: bool,
}

impl RetransmitRequest {
    /// Request for a packet lost in the network. Every lost packet gets
    /// one; senders ignore what they have no way to repeat.
    pub fn for_lost(header: &PacketHeader, payload_len: usize) -> Self {
        let (seq, flags) = header.tcp.map_or((0, TcpFlags::NONE), |tcp| (tcp.seq, tcp.flags));
        Self {
            src: header.src,
            dst: header.dst,
            seq,
            flags,
            data: payload_len > 0,
        }
    }

    /// Request for a packet the receiver could not take, if it is one
    /// whose loss must be repaired: stream segments carrying data and
    /// handshake segments.
    pub fn for_packet(header: &PacketHeader, payload_len: usize) -> Option<Self> {
        if header.protocol != Protocol::Tcp {
            return None;
        }
        let tcp = header.tcp?;
        if payload_len == 0 && !tcp.flags.contains(TcpFlags::CON) {
            return None;
        }
        Some(Self::for_lost(header, payload_len))
    }
}

/// Tells the peer this side will send nothing at or beyond `end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseNotice {
    /// Endpoint that closed.
    pub src: SocketAddrV4,
    /// Endpoint being told.
    pub dst: SocketAddrV4,
    pub end: u32,
    /// Everything the closing side received below this; a cumulative
    /// acknowledgement that survives the closer being destroyed.
    pub ack: u32,
}

/// Payload of a scheduled event, one variant per event kind.
#[derive(Clone)]
pub enum EventKind {
    /// A packet arrives at the destination host.
    Packet(PacketRc),
    /// The sender learns a segment was lost.
    Retransmit(RetransmitRequest),
    /// The peer closed its side of a connection.
    Close(CloseNotice),
    Notify(Descriptor),
    Poll(Descriptor),
    DelayedAck(Descriptor),
    Uploaded,
    Downloaded,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Packet(_) => "packet",
            EventKind::Retransmit(_) => "retransmit",
            EventKind::Close(_) => "close",
            EventKind::Notify(_) => "notify",
            EventKind::Poll(_) => "poll",
            EventKind::DelayedAck(_) => "dack",
            EventKind::Uploaded => "uploaded",
            EventKind::Downloaded => "downloaded",
        }
    }
}

/// An event waiting in a worker's queue.
///
/// `owner` and `cpu_mark` record which host's virtual CPU the event has
/// already been charged against and how far along that CPU was.
pub(crate) struct ScheduledEvent {
    pub time: SimTime,
    pub seq: u64,
    pub dst: VirtualAddr,
    pub owner: VirtualAddr,
    pub cpu_mark: Duration,
    pub kind: EventKind,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time, self.seq).cmp(&(other.time, other.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cmp::Reverse, collections::BinaryHeap};

    fn event(time: u64, seq: u64) -> ScheduledEvent {
        let host = VirtualAddr::pack(1, 0, 0x0100).unwrap();
        ScheduledEvent {
            time: SimTime::from_nanos(time),
            seq,
            dst: host,
            owner: host,
            cpu_mark: Duration::ZERO,
            kind: EventKind::Notify(seq as Descriptor),
        }
    }

    #[test]
    fn test_queue_order() {
        let mut queue = BinaryHeap::new();
        queue.push(Reverse(event(20, 0)));
        queue.push(Reverse(event(10, 1)));
        queue.push(Reverse(event(10, 2)));
        queue.push(Reverse(event(5, 3)));

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop().map(|Reverse(e)| e.seq)).collect();
        assert_eq!(order, vec![3, 1, 2, 0]);
    }
}
