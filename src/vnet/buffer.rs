use std::collections::{BTreeMap, VecDeque};

use log::error;

use super::{
    notify::{Notifier, NotifySink, Readiness},
    packet::PacketRc,
};

/// Receive side: segments ready for the application, plus out-of-order
/// segments parked until the gap before them fills.
struct ReceiveBuffer {
    ready: VecDeque<PacketRc>,
    read_offset: usize,
    unprocessed: BTreeMap<u32, VecDeque<PacketRc>>,
    unprocessed_count: usize,
    size: usize,
    max_size: usize,
}

/// Send side: queued writes by sequence, control segments in FIFO order,
/// and sent-but-unacknowledged segments by sequence.
struct SendBuffer {
    pending: BTreeMap<u32, PacketRc>,
    control: VecDeque<PacketRc>,
    retransmit: BTreeMap<u32, PacketRc>,
    size: usize,
    max_size: usize,
}

/// Send and receive buffers of one socket and the notifier they drive.
///
/// Sizes are payload bytes; control segments carry no payload and never
/// count against a budget, so emptiness checks look at packet counts.
/// Every mutation ends by pushing readability and writability into the
/// notifier, including mutations that fail.
pub struct SegmentBuffers {
    recv: ReceiveBuffer,
    send: SendBuffer,
    notifier: Notifier,
    read_signal: bool,
    write_enabled: bool,
}

impl SegmentBuffers {
    /// Creates empty buffers that report readiness through `notifier`.
    ///
    /// # Arguments
    /// * `recv_max` - Payload bytes the receive side may hold
    /// * `send_max` - Payload bytes the send side may hold
    /// * `notifier` - Readiness notifier of the owning socket
    pub fn new(recv_max: usize, send_max: usize, notifier: Notifier) -> Self {
        Self {
            recv: ReceiveBuffer {
                ready: VecDeque::new(),
                read_offset: 0,
                unprocessed: BTreeMap::new(),
                unprocessed_count: 0,
                size: 0,
                max_size: recv_max,
            },
            send: SendBuffer {
                pending: BTreeMap::new(),
                control: VecDeque::new(),
                retransmit: BTreeMap::new(),
                size: 0,
                max_size: send_max,
            },
            notifier,
            read_signal: false,
            write_enabled: false,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn notifier_mut(&mut self) -> &mut Notifier {
        &mut self.notifier
    }

    pub fn is_readable(&self) -> bool {
        !self.recv.ready.is_empty() || self.read_signal
    }

    pub fn is_writable(&self) -> bool {
        self.write_enabled && self.send.size < self.send.max_size
    }

    /// Pushes the current readiness into the notifier.
    pub fn sync(&mut self, sink: &mut dyn NotifySink) {
        let readable = self.is_readable();
        let writable = self.is_writable();
        self.notifier.set_available(Readiness::READ, readable, sink);
        self.notifier.set_available(Readiness::WRITE, writable, sink);
    }

    /// Marks the socket readable regardless of queued data (EOF, reset, or
    /// a connection waiting to be accepted).
    pub fn set_read_signal(&mut self, signal: bool, sink: &mut dyn NotifySink) {
        self.read_signal = signal;
        self.sync(sink);
    }

    pub fn read_signal(&self) -> bool {
        self.read_signal
    }

    /// Gates writability on connection state.
    pub fn set_write_enabled(&mut self, enabled: bool, sink: &mut dyn NotifySink) {
        self.write_enabled = enabled;
        self.sync(sink);
    }

    pub fn set_capacity(&mut self, recv_max: usize, send_max: usize, sink: &mut dyn NotifySink) {
        self.recv.max_size = recv_max;
        self.send.max_size = send_max;
        self.sync(sink);
    }

    pub fn recv_size(&self) -> usize {
        self.recv.size
    }

    pub fn recv_max(&self) -> usize {
        self.recv.max_size
    }

    pub fn recv_space(&self) -> usize {
        self.recv.max_size.saturating_sub(self.recv.size)
    }

    pub fn send_size(&self) -> usize {
        self.send.size
    }

    pub fn send_max(&self) -> usize {
        self.send.max_size
    }

    pub fn send_space(&self) -> usize {
        self.send.max_size.saturating_sub(self.send.size)
    }

    fn recv_fits(&self, len: usize) -> bool {
        self.recv.size + len <= self.recv.max_size
    }

    fn send_fits(&self, len: usize) -> bool {
        self.send.size + len <= self.send.max_size
    }

    /// Parks an out-of-order segment under its sequence number.
    ///
    /// Segments sharing a key keep their arrival order.
    ///
    /// # Arguments
    /// * `key` - Sequence number the segment waits under
    /// * `packet` - The segment, counted against the receive budget
    /// * `sink` - Receives readiness changes
    ///
    /// Returns false if the payload does not fit.
    pub fn add_receive(&mut self, key: u32, packet: PacketRc, sink: &mut dyn NotifySink) -> bool {
        let len = packet.payload_len();
        let added = self.recv_fits(len);
        if added {
            self.recv.unprocessed.entry(key).or_default().push_back(packet);
            self.recv.unprocessed_count += 1;
            self.recv.size += len;
        }
        self.sync(sink);
        added
    }

    pub fn has_unprocessed(&self, key: u32) -> bool {
        self.recv.unprocessed.contains_key(&key)
    }

    /// Peeks the holding area only if its lowest key is `key`.
    pub fn get_unprocessed(&self, key: u32) -> Option<&PacketRc> {
        let (lowest, queue) = self.recv.unprocessed.first_key_value()?;
        if *lowest != key {
            return None;
        }
        queue.front()
    }

    /// Pops the holding area only if its lowest key is `key`.
    ///
    /// # Arguments
    /// * `key` - Sequence number the caller expects next
    /// * `sink` - Receives readiness changes
    pub fn remove_unprocessed(&mut self, key: u32, sink: &mut dyn NotifySink) -> Option<PacketRc> {
        let packet = match self.recv.unprocessed.first_entry() {
            Some(mut entry) if *entry.key() == key => {
                let packet = entry.get_mut().pop_front();
                if entry.get().is_empty() {
                    entry.remove();
                }
                packet
            }
            _ => None,
        };
        if let Some(packet) = &packet {
            self.recv.unprocessed_count -= 1;
            self.recv.size -= packet.payload_len();
        }
        self.sync(sink);
        packet
    }

    /// Appends in-order data for the application.
    pub fn add_read(&mut self, packet: PacketRc, sink: &mut dyn NotifySink) -> bool {
        let len = packet.payload_len();
        let added = self.recv_fits(len);
        if added {
            self.recv.ready.push_back(packet);
            self.recv.size += len;
        }
        self.sync(sink);
        added
    }

    /// Front of the ready queue and the bytes of it already consumed.
    pub fn get_read(&self) -> Option<(&PacketRc, usize)> {
        self.recv.ready.front().map(|packet| (packet, self.recv.read_offset))
    }

    /// Pops the front segment, discarding any unread remainder.
    pub fn remove_read(&mut self, sink: &mut dyn NotifySink) -> Option<PacketRc> {
        let packet = self.recv.ready.pop_front();
        if let Some(packet) = &packet {
            self.recv.size -= packet.payload_len() - self.recv.read_offset;
            self.recv.read_offset = 0;
        }
        self.sync(sink);
        packet
    }

    /// Copies ready data into `buf`, spanning segments as needed.
    ///
    /// A partly consumed segment stays at the front with its offset
    /// remembered.
    ///
    /// # Arguments
    /// * `buf` - Destination for the copied bytes
    /// * `sink` - Receives readiness changes
    ///
    /// Returns the number of bytes copied.
    pub fn read(&mut self, buf: &mut [u8], sink: &mut dyn NotifySink) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(front) = self.recv.ready.front() else {
                break;
            };
            let Some(payload) = front.payload() else {
                error!("ready segment payload unavailable, dropping it");
                self.recv.ready.pop_front();
                self.recv.read_offset = 0;
                continue;
            };
            let offset = self.recv.read_offset;
            let n = (payload.len() - offset).min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&payload[offset..offset + n]);
            copied += n;
            self.recv.size -= n;
            if offset + n == payload.len() {
                self.recv.ready.pop_front();
                self.recv.read_offset = 0;
            } else {
                self.recv.read_offset = offset + n;
            }
        }
        self.sync(sink);
        copied
    }

    /// Queues an application write under `key`.
    ///
    /// # Arguments
    /// * `key` - Sequence number of the segment
    /// * `packet` - The segment, counted against the send budget
    /// * `sink` - Receives readiness changes
    ///
    /// Returns false if the payload does not fit or `key` is already queued.
    pub fn add_send(&mut self, key: u32, packet: PacketRc, sink: &mut dyn NotifySink) -> bool {
        let len = packet.payload_len();
        let added = self.send_fits(len) && !self.send.pending.contains_key(&key);
        if added {
            self.send.pending.insert(key, packet);
            self.send.size += len;
        }
        self.sync(sink);
        added
    }

    /// Queues a zero-payload control segment.
    pub fn add_control(&mut self, packet: PacketRc, sink: &mut dyn NotifySink) -> bool {
        let len = packet.payload_len();
        let added = self.send_fits(len);
        if added {
            self.send.control.push_back(packet);
            self.send.size += len;
        }
        self.sync(sink);
        added
    }

    /// Holds a transmitted segment until it is acknowledged.
    ///
    /// # Arguments
    /// * `key` - Sequence number of the segment
    /// * `packet` - The segment as it went on the wire
    /// * `sink` - Receives readiness changes
    pub fn add_retransmit(&mut self, key: u32, packet: PacketRc, sink: &mut dyn NotifySink) -> bool {
        let len = packet.payload_len();
        let added = self.send_fits(len) && !self.send.retransmit.contains_key(&key);
        if added {
            self.send.retransmit.insert(key, packet);
            self.send.size += len;
        }
        self.sync(sink);
        added
    }

    /// Lowest pending write, only if its key is at most `ceiling`.
    pub fn get_send(&self, ceiling: u32) -> Option<(u32, &PacketRc)> {
        let (key, packet) = self.send.pending.first_key_value()?;
        (*key <= ceiling).then_some((*key, packet))
    }

    /// Takes the lowest pending write if its key is at most `ceiling`.
    ///
    /// # Arguments
    /// * `ceiling` - Highest sequence number the windows allow
    /// * `sink` - Receives readiness changes
    pub fn remove_send(&mut self, ceiling: u32, sink: &mut dyn NotifySink) -> Option<(u32, PacketRc)> {
        let entry = match self.send.pending.first_entry() {
            Some(entry) if *entry.key() <= ceiling => Some(entry.remove_entry()),
            _ => None,
        };
        if let Some((_, packet)) = &entry {
            self.send.size -= packet.payload_len();
        }
        self.sync(sink);
        entry
    }

    pub fn remove_control(&mut self, sink: &mut dyn NotifySink) -> Option<PacketRc> {
        let packet = self.send.control.pop_front();
        if let Some(packet) = &packet {
            self.send.size -= packet.payload_len();
        }
        self.sync(sink);
        packet
    }

    pub fn remove_retransmit(&mut self, key: u32, sink: &mut dyn NotifySink) -> Option<PacketRc> {
        let packet = self.send.retransmit.remove(&key);
        if let Some(packet) = &packet {
            self.send.size -= packet.payload_len();
        }
        self.sync(sink);
        packet
    }

    /// Drops retransmit entries below `ack`, or all of them when
    /// `only_acked` is false.
    ///
    /// # Arguments
    /// * `only_acked` - Keep entries at or above `ack`
    /// * `ack` - Cumulative acknowledgement from the peer
    /// * `sink` - Receives readiness changes
    ///
    /// Returns how many were released.
    pub fn clear_retransmit(&mut self, only_acked: bool, ack: u32, sink: &mut dyn NotifySink) -> usize {
        let released = if only_acked {
            let kept = self.send.retransmit.split_off(&ack);
            std::mem::replace(&mut self.send.retransmit, kept)
        } else {
            std::mem::take(&mut self.send.retransmit)
        };
        for packet in released.values() {
            self.send.size -= packet.payload_len();
        }
        self.sync(sink);
        released.len()
    }

    /// Drops pending writes below `ack`. A segment put back for resending
    /// is redundant once a cumulative acknowledgement covers it.
    ///
    /// # Arguments
    /// * `ack` - Cumulative acknowledgement from the peer
    /// * `sink` - Receives readiness changes
    ///
    /// Returns how many were released.
    pub fn clear_send(&mut self, ack: u32, sink: &mut dyn NotifySink) -> usize {
        let kept = self.send.pending.split_off(&ack);
        let released = std::mem::replace(&mut self.send.pending, kept);
        for packet in released.values() {
            self.send.size -= packet.payload_len();
        }
        self.sync(sink);
        released.len()
    }

    pub fn has_outbound(&self) -> bool {
        !self.send.control.is_empty() || !self.send.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.send.pending.len()
    }

    pub fn retransmit_count(&self) -> usize {
        self.send.retransmit.len()
    }

    pub fn control_count(&self) -> usize {
        self.send.control.len()
    }

    pub fn ready_count(&self) -> usize {
        self.recv.ready.len()
    }

    pub fn unprocessed_count(&self) -> usize {
        self.recv.unprocessed_count
    }

    pub fn is_send_empty(&self) -> bool {
        self.send.pending.is_empty() && self.send.control.is_empty() && self.send.retransmit.is_empty()
    }

    pub fn is_recv_empty(&self) -> bool {
        self.recv.ready.is_empty() && self.recv.unprocessed_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vnet::{
        notify::{tests::RecordingSink, Activity},
        packet::{Packet, TcpFlags, TcpHeader},
    };
    use bytes::Bytes;
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use std::{
        net::{Ipv4Addr, SocketAddrV4},
        sync::Arc,
        time::Duration,
    };

    fn segment(seq: u32, payload: &'static [u8]) -> PacketRc {
        let src = SocketAddrV4::new(Ipv4Addr::new(1, 0, 0, 1), 1000);
        let dst = SocketAddrV4::new(Ipv4Addr::new(2, 0, 0, 1), 80);
        let tcp = TcpHeader {
            seq,
            ack: 0,
            window: 0,
            flags: TcpFlags::ACK,
        };
        Packet::new_tcp(src, dst, tcp, Bytes::from_static(payload))
    }

    fn buffers(recv_max: usize, send_max: usize) -> SegmentBuffers {
        let notifier = Notifier::new(3, Activity::Active, Duration::ZERO);
        SegmentBuffers::new(recv_max, send_max, notifier)
    }

    fn assert_consistent(b: &SegmentBuffers) {
        let available = b.notifier().available();
        assert_eq!(b.is_readable(), available.contains(Readiness::READ));
        assert_eq!(b.is_writable(), available.contains(Readiness::WRITE));
    }

    #[test]
    fn test_in_order_release() {
        let mut sink = RecordingSink::default();
        let mut b = buffers(100, 100);

        assert!(b.add_receive(5, segment(5, b"five"), &mut sink));
        assert!(b.get_unprocessed(4).is_none());
        assert!(b.remove_unprocessed(4, &mut sink).is_none());
        assert_eq!(b.recv_size(), 4);
        assert!(!b.is_readable());

        assert!(b.add_read(segment(4, b"four"), &mut sink));
        let five = b.remove_unprocessed(5, &mut sink).unwrap();
        assert!(b.add_read(five, &mut sink));
        assert_eq!(b.recv_size(), 8);
        assert!(b.is_readable());
        assert_consistent(&b);

        let mut buf = [0u8; 6];
        assert_eq!(b.read(&mut buf, &mut sink), 6);
        assert_eq!(&buf, b"fourfi");
        assert_eq!(b.get_read().unwrap().1, 2);
        assert_eq!(b.recv_size(), 2);

        let mut rest = [0u8; 10];
        assert_eq!(b.read(&mut rest, &mut sink), 2);
        assert_eq!(&rest[..2], b"ve");
        assert!(b.is_recv_empty());
        assert!(!b.is_readable());
        assert_consistent(&b);
    }

    #[test]
    fn test_send_window_ceiling() {
        let mut sink = RecordingSink::default();
        let mut b = buffers(100, 100);
        b.set_write_enabled(true, &mut sink);

        for seq in 0..3 {
            assert!(b.add_send(seq, segment(seq, b"0123456789"), &mut sink));
        }
        assert_eq!(b.send_size(), 30);
        assert_eq!(b.get_send(1).map(|(key, _)| key), Some(0));

        let (k0, _) = b.remove_send(1, &mut sink).unwrap();
        let (k1, _) = b.remove_send(1, &mut sink).unwrap();
        assert_eq!((k0, k1), (0, 1));
        assert!(b.remove_send(1, &mut sink).is_none());
        assert_eq!(b.pending_count(), 1);
        assert_eq!(b.send_size(), 10);
    }

    #[test]
    fn test_budget_rejects_and_stays_consistent() {
        let mut sink = RecordingSink::default();
        let mut b = buffers(6, 12);
        b.set_write_enabled(true, &mut sink);
        b.notifier_mut().set_polling(Readiness::BOTH, &mut sink);

        assert!(b.add_send(0, segment(0, b"0123456789"), &mut sink));
        assert!(!b.add_send(1, segment(1, b"0123456789"), &mut sink));
        assert!(b.is_writable());
        assert!(b.add_retransmit(7, segment(7, b"ab"), &mut sink));
        assert!(!b.is_writable());
        assert_consistent(&b);

        assert!(!b.add_read(segment(0, b"too long"), &mut sink));
        assert!(!b.is_readable());
        assert_consistent(&b);

        // control segments carry no payload and are always accepted
        assert!(b.add_control(segment(0, b""), &mut sink));
        assert!(!b.is_send_empty());
        assert_eq!(b.control_count(), 1);
    }

    #[test]
    fn test_clear_retransmit() {
        let mut sink = RecordingSink::default();
        let mut b = buffers(100, 100);
        for seq in 0..5 {
            assert!(b.add_retransmit(seq, segment(seq, b"xx"), &mut sink));
        }
        assert_eq!(b.clear_retransmit(true, 3, &mut sink), 3);
        assert_eq!(b.retransmit_count(), 2);
        assert_eq!(b.send_size(), 4);
        assert!(b.remove_retransmit(1, &mut sink).is_none());
        assert!(b.remove_retransmit(3, &mut sink).is_some());
        assert_eq!(b.clear_retransmit(false, 0, &mut sink), 1);
        assert!(b.is_send_empty());
        assert_eq!(b.send_size(), 0);
    }

    #[test]
    fn test_clear_send_keeps_unacked_writes() {
        let mut sink = RecordingSink::default();
        let mut b = buffers(100, 100);
        b.set_write_enabled(true, &mut sink);
        b.notifier_mut().set_polling(Readiness::BOTH, &mut sink);
        for seq in 2..6 {
            assert!(b.add_send(seq, segment(seq, b"0123456789"), &mut sink));
        }
        assert_eq!(b.clear_send(4, &mut sink), 2);
        assert_eq!(b.pending_count(), 2);
        assert_eq!(b.send_size(), 20);
        assert_eq!(b.get_send(u32::MAX).map(|(key, _)| key), Some(4));
        assert_eq!(b.clear_send(4, &mut sink), 0);
        assert_consistent(&b);
    }

    #[test]
    fn test_datagram_arrival_order() {
        let mut sink = RecordingSink::default();
        let mut b = buffers(100, 100);
        assert!(b.add_receive(0, segment(0, b"a"), &mut sink));
        assert!(b.add_receive(0, segment(0, b"b"), &mut sink));
        let first = b.remove_unprocessed(0, &mut sink).unwrap();
        let second = b.remove_unprocessed(0, &mut sink).unwrap();
        assert_eq!(first.payload().unwrap().as_ref(), b"a");
        assert_eq!(second.payload().unwrap().as_ref(), b"b");
        assert!(b.is_recv_empty());

        assert!(b.add_read(segment(0, b"abc"), &mut sink));
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf, &mut sink), 1);
        assert!(b.remove_read(&mut sink).is_some());
        assert_eq!(b.recv_size(), 0);
    }

    #[test]
    fn test_refcount_property() {
        let mut sink = RecordingSink::default();
        let mut rng = SmallRng::seed_from_u64(7);
        let mut b = buffers(usize::MAX, usize::MAX);
        let packets: Vec<PacketRc> = (0..16).map(|seq| segment(seq, b"payload")).collect();
        // which containers hold each packet
        let mut held = vec![[false; 3]; packets.len()];

        for _ in 0..2000 {
            let i = rng.gen_range(0..packets.len());
            let key = i as u32;
            match rng.gen_range(0..6) {
                0 => {
                    if b.add_send(key, packets[i].clone(), &mut sink) {
                        held[i][0] = true;
                    }
                }
                1 => {
                    if b.add_retransmit(key, packets[i].clone(), &mut sink) {
                        held[i][1] = true;
                    }
                }
                2 => {
                    if b.add_receive(key, packets[i].clone(), &mut sink) {
                        held[i][2] = true;
                    }
                }
                3 => {
                    if let Some((k, _)) = b.remove_send(key, &mut sink) {
                        held[k as usize][0] = false;
                    }
                }
                4 => {
                    if b.remove_retransmit(key, &mut sink).is_some() {
                        held[i][1] = false;
                    }
                }
                _ => {
                    if let Some(lowest) = b.recv.unprocessed.keys().next().copied() {
                        let _ = b.remove_unprocessed(lowest, &mut sink);
                        held[lowest as usize][2] = b.has_unprocessed(lowest);
                    }
                }
            }

            for (packet, holders) in packets.iter().zip(&held) {
                let referenced = Arc::strong_count(packet) > 1;
                assert_eq!(referenced, holders.iter().any(|held| *held));
            }
        }

        drop(b);
        for packet in &packets {
            assert_eq!(Arc::strong_count(packet), 1);
        }
    }
}
