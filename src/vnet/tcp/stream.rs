use std::{cmp::min, time::Duration};

use bytes::Bytes;
use log::{debug, error, trace, warn};

use super::{
    congestion::{Aimd, Controller},
    types::{AddrPair, State},
};
use crate::{
    config::Config,
    prometheus::metrics::RETRANSMITS,
    vci::event::RetransmitRequest,
    vnet::{
        buffer::SegmentBuffers,
        notify::NotifySink,
        packet::{Packet, PacketHeader, PacketRc, TcpFlags, TcpHeader, MAX_WINDOW},
        socket::{Descriptor, TcpInfo},
    },
};

/// What a connection needs from the scheduler besides notifications.
pub(crate) trait SegmentSink: NotifySink {
    /// Asks the sender of a segment this side could not take to send it again.
    fn request_retransmit(&mut self, header: &PacketHeader, payload_len: usize);

    fn schedule_delayed_ack(&mut self, fd: Descriptor, delay: Duration);
}

const DACK_SCHEDULED: u8 = 0x01;
const DACK_PENDING: u8 = 0x02;

/// Outcome of feeding a segment or notice to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    Continue,
    /// The handshake just completed.
    Established,
    /// The peer refused the connection attempt.
    Refused,
    Reset,
    /// A closed connection has nothing left to exchange; send a final
    /// close notice, which also acknowledges the peer's stream, and destroy.
    Teardown,
    Destroy,
}

/// What the socket layer does after the application closes a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CloseAction {
    Destroy,
    /// Tell the peer the stream ends at the given sequence number.
    Notify(u32),
    NotifyAndDestroy(u32),
    /// Keep the socket until outstanding data is acknowledged.
    Linger,
}

struct Segment<'a> {
    packet: &'a PacketRc,
    header: PacketHeader,
    tcp: TcpHeader,
    len: usize,
}

/// Transmission control block of one stream socket.
///
/// Sequence numbers count segments. A data segment takes `snd_end` when
/// it is written and `snd_nxt` advances past it on first transmission.
/// SYN and pure ACK segments carry `snd_nxt` and consume nothing.
pub(crate) struct ControlBlock {
    fd: Descriptor,
    pub(crate) pair: AddrPair,
    pub(crate) state: State,
    pub(crate) snd_una: u32,
    pub(crate) snd_nxt: u32,
    pub(crate) snd_end: u32,
    pub(crate) snd_wnd: u32,
    snd_wl1: u32,
    snd_wl2: u32,
    pub(crate) rcv_nxt: u32,
    /// Window advertised in the last segment sent.
    pub(crate) rcv_wnd: u32,
    /// Where the peer said its stream ends.
    pub(crate) rcv_end: Option<u32>,
    congestion: Box<dyn Controller>,
    dack: u8,
    delayed_ack: Option<Duration>,
    mss: usize,
    /// Closed while unacknowledged data remained; tear down once it is.
    close_pending: bool,
    /// Counted in the open connection gauge.
    pub(crate) counted: bool,
}

impl ControlBlock {
    pub(crate) fn new(fd: Descriptor, config: &Config) -> Self {
        Self {
            fd,
            pair: AddrPair::default(),
            state: State::Closed,
            snd_una: 0,
            snd_nxt: 0,
            snd_end: 0,
            snd_wnd: config.initial_window,
            snd_wl1: 0,
            snd_wl2: 0,
            rcv_nxt: 0,
            rcv_wnd: 0,
            rcv_end: None,
            congestion: Aimd::new(config.initial_window),
            dack: 0,
            delayed_ack: config.delayed_ack,
            mss: config.mss.max(1),
            close_pending: false,
            counted: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_controller(&mut self, controller: Box<dyn Controller>) {
        self.congestion = controller;
    }

    pub(crate) fn mss(&self) -> usize {
        self.mss
    }

    /// Puts a freshly spawned child in place to answer its peer's SYN.
    pub(crate) fn listen_for(&mut self, pair: AddrPair) {
        self.pair = pair;
        self.state = State::Listen;
    }

    pub(crate) fn connect<S: NotifySink>(
        &mut self,
        pair: AddrPair,
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) {
        self.pair = pair;
        self.state = State::SynSent;
        trace!("{}[{}]: send SYN", self.pair, self.state);
        self.send_control(TcpFlags::SYN | TcpFlags::CON, buffers, sink);
    }

    /// Whether every byte written has been acknowledged.
    pub(crate) fn is_drained(&self) -> bool {
        self.snd_una == self.snd_end
    }

    /// Whether the peer's stream has been fully received.
    pub(crate) fn at_end(&self) -> bool {
        self.rcv_end.is_some_and(|end| self.rcv_nxt >= end)
    }

    /// Whether a closing connection is finished: the peer has closed,
    /// everything sent is acknowledged, and the peer's stream has arrived.
    /// A close deferred from `CloseWait` only waits for its own data.
    fn close_complete(&self) -> bool {
        self.state == State::Closing
            && self.rcv_end.is_some()
            && self.is_drained()
            && (self.close_pending || self.at_end())
    }

    /// Free receive space in whole segments, capped at what a header carries.
    pub(crate) fn receive_window(&self, buffers: &SegmentBuffers) -> u32 {
        min(buffers.recv_space() / self.mss, MAX_WINDOW as usize) as u32
    }

    fn create_packet(&mut self, flags: TcpFlags, payload: Bytes, buffers: &SegmentBuffers) -> PacketRc {
        self.rcv_wnd = self.receive_window(buffers);
        let seq = if payload.is_empty() {
            self.snd_nxt
        } else {
            let seq = self.snd_end;
            self.snd_end += 1;
            seq
        };
        let tcp = TcpHeader {
            seq,
            ack: self.rcv_nxt,
            window: self.rcv_wnd,
            flags,
        };
        Packet::new_tcp(self.pair.local, self.pair.remote, tcp, payload)
    }

    /// Queues a segment without payload ahead of any data.
    pub(crate) fn send_control<S: NotifySink>(
        &mut self,
        flags: TcpFlags,
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) -> bool {
        let packet = self.create_packet(flags, Bytes::new(), buffers);
        if flags.contains(TcpFlags::ACK) {
            self.dack &= !DACK_PENDING;
        }
        buffers.add_control(packet, sink)
    }

    /// Splits `data` into segments and queues them. Returns bytes taken.
    pub(crate) fn write<S: NotifySink>(
        &mut self,
        data: &[u8],
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) -> usize {
        let mut written = 0;
        for chunk in data.chunks(self.mss) {
            let cost = chunk.len();
            if buffers.send_space() < cost {
                break;
            }
            let packet = self.create_packet(TcpFlags::ACK, Bytes::copy_from_slice(chunk), buffers);
            let seq = self.snd_end - 1;
            if !buffers.add_send(seq, packet, sink) {
                error!("{}[{}]: segment {} rejected by send buffer", self.pair, self.state, seq);
                self.snd_end -= 1;
                break;
            }
            written += cost;
        }
        written
    }

    /// Highest sequence number the windows allow on the wire.
    fn ceiling(&self) -> Option<u32> {
        let in_flight = self.snd_nxt.saturating_sub(self.snd_una);
        let mut window = min(self.congestion.window(), self.snd_wnd);
        if window == 0 && in_flight == 0 {
            // a closed window still lets one segment through
            window = 1;
        }
        if window == 0 {
            return None;
        }
        Some(self.snd_una.saturating_add(window - 1))
    }

    /// Whether [`next_packet`](Self::next_packet) would yield something.
    pub(crate) fn can_transmit(&self, buffers: &SegmentBuffers) -> bool {
        if buffers.control_count() > 0 {
            return true;
        }
        if !self.state.is_synchronized() {
            return false;
        }
        self.ceiling()
            .is_some_and(|ceiling| buffers.get_send(ceiling).is_some())
    }

    /// Takes the next segment to put on the wire.
    ///
    /// Control segments go first. Data must fit in the congestion and
    /// receive windows; on first transmission its acknowledgement and
    /// window fields are refreshed, which also answers any pending
    /// delayed ACK. Data segments stay in the retransmit queue until
    /// acknowledged.
    pub(crate) fn next_packet<S: NotifySink>(
        &mut self,
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) -> Option<PacketRc> {
        if let Some(packet) = buffers.remove_control(sink) {
            return Some(packet);
        }
        if !self.state.is_synchronized() {
            return None;
        }

        let ceiling = self.ceiling()?;
        let (seq, packet) = buffers.remove_send(ceiling, sink)?;

        if seq >= self.snd_nxt {
            self.rcv_wnd = self.receive_window(buffers);
            match packet.write() {
                Some(mut guard) => {
                    if let Some(tcp) = guard.header_mut().tcp.as_mut() {
                        tcp.ack = self.rcv_nxt;
                        tcp.window = self.rcv_wnd;
                    }
                }
                None => warn!("{}[{}]: segment {} sent with stale ack", self.pair, self.state, seq),
            }
            self.snd_nxt = seq + 1;
            self.dack &= !DACK_PENDING;
        } else {
            RETRANSMITS.inc();
            debug!("{}[{}]: resend segment {}", self.pair, self.state, seq);
        }

        if !buffers.add_retransmit(seq, packet.clone(), sink) {
            error!("{}[{}]: segment {} already awaiting ack", self.pair, self.state, seq);
        }
        Some(packet)
    }

    /// Handles a segment addressed to this connection.
    pub(crate) fn process<S: SegmentSink>(
        &mut self,
        packet: &PacketRc,
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) -> Verdict {
        let Some(guard) = packet.read() else {
            return Verdict::Continue;
        };
        let header = *guard.header();
        let len = guard.payload().len();
        drop(guard);

        let Some(tcp) = header.tcp else {
            error!("{}[{}]: segment without tcp header", self.pair, self.state);
            return Verdict::Continue;
        };
        trace!(
            "{}[{}]: recv {} seq {} ack {} win {} len {}",
            self.pair,
            self.state,
            tcp.flags,
            tcp.seq,
            tcp.ack,
            tcp.window,
            len
        );

        if tcp.flags.contains(TcpFlags::RST) {
            return self.process_reset(buffers, sink);
        }

        let segment = Segment {
            packet,
            header,
            tcp,
            len,
        };
        match self.state {
            State::Listen => self.state_listen(&segment, buffers, sink),
            State::SynSent => self.state_syn_sent(&segment, buffers, sink),
            State::SynRcvd => self.state_syn_rcvd(&segment, buffers, sink),
            State::Established | State::Closing | State::CloseWait => {
                self.state_synchronized(&segment, buffers, sink)
            }
            State::Closed | State::Udp => Verdict::Continue,
        }
    }

    fn accept_syn(&mut self, tcp: &TcpHeader) {
        self.rcv_nxt = tcp.seq;
        self.snd_wnd = tcp.window;
        self.snd_wl1 = tcp.seq;
        self.snd_wl2 = tcp.ack;
    }

    fn state_listen<S: SegmentSink>(
        &mut self,
        segment: &Segment<'_>,
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) -> Verdict {
        if !segment.tcp.flags.contains(TcpFlags::SYN) {
            return Verdict::Continue;
        }
        self.accept_syn(&segment.tcp);
        self.state = State::SynRcvd;
        trace!("{}[{}]: recv SYN, send SYN|ACK", self.pair, self.state);
        self.send_control(TcpFlags::SYN | TcpFlags::ACK | TcpFlags::CON, buffers, sink);
        Verdict::Continue
    }

    fn state_syn_sent<S: SegmentSink>(
        &mut self,
        segment: &Segment<'_>,
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) -> Verdict {
        let flags = segment.tcp.flags;
        if !flags.contains(TcpFlags::SYN) {
            return Verdict::Continue;
        }
        self.accept_syn(&segment.tcp);

        if flags.contains(TcpFlags::ACK) {
            self.state = State::Established;
            trace!("{}[{}]: recv SYN|ACK, send ACK", self.pair, self.state);
            self.send_control(TcpFlags::ACK | TcpFlags::CON, buffers, sink);
            buffers.set_write_enabled(true, sink);
            return Verdict::Established;
        }

        // simultaneous open
        self.state = State::SynRcvd;
        trace!("{}[{}]: recv SYN, send SYN|ACK", self.pair, self.state);
        self.send_control(TcpFlags::SYN | TcpFlags::ACK | TcpFlags::CON, buffers, sink);
        Verdict::Continue
    }

    fn state_syn_rcvd<S: SegmentSink>(
        &mut self,
        segment: &Segment<'_>,
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) -> Verdict {
        let flags = segment.tcp.flags;
        if !flags.contains(TcpFlags::ACK) {
            if flags.contains(TcpFlags::SYN) {
                trace!("{}[{}]: recv SYN again, resend SYN|ACK", self.pair, self.state);
                self.send_control(TcpFlags::SYN | TcpFlags::ACK | TcpFlags::CON, buffers, sink);
            }
            return Verdict::Continue;
        }
        if flags.contains(TcpFlags::SYN) {
            self.send_control(TcpFlags::ACK | TcpFlags::CON, buffers, sink);
        }

        self.state = State::Established;
        trace!("{}[{}]: handshake complete", self.pair, self.state);
        buffers.set_write_enabled(true, sink);
        self.process_segment(segment, buffers, sink);
        Verdict::Established
    }

    fn state_synchronized<S: SegmentSink>(
        &mut self,
        segment: &Segment<'_>,
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) -> Verdict {
        let flags = segment.tcp.flags;
        if flags.contains(TcpFlags::SYN) {
            if flags.contains(TcpFlags::ACK) {
                // the peer never saw our handshake ACK
                self.send_control(TcpFlags::ACK | TcpFlags::CON, buffers, sink);
            } else {
                warn!("{}[{}]: recv SYN mid-stream, send RST", self.pair, self.state);
                self.send_control(TcpFlags::RST, buffers, sink);
            }
            return Verdict::Continue;
        }
        self.process_segment(segment, buffers, sink)
    }

    fn process_segment<S: SegmentSink>(
        &mut self,
        segment: &Segment<'_>,
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) -> Verdict {
        let deliver = segment.len > 0 && self.check_sequence(segment, buffers, sink);

        if segment.tcp.flags.contains(TcpFlags::ACK) {
            self.process_ack(&segment.tcp, buffers, sink);
        }
        if deliver {
            self.process_payload(segment, buffers, sink);
        }

        if self.close_complete() {
            trace!("{}[{}]: both streams done, tearing down", self.pair, self.state);
            self.state = State::Closed;
            return Verdict::Teardown;
        }
        Verdict::Continue
    }

    /// Filters data segments that cannot be taken now.
    fn check_sequence<S: SegmentSink>(
        &mut self,
        segment: &Segment<'_>,
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) -> bool {
        let seq = segment.tcp.seq;
        if seq < self.rcv_nxt {
            trace!("{}[{}]: duplicate segment {}", self.pair, self.state, seq);
            self.send_control(TcpFlags::ACK, buffers, sink);
            return false;
        }
        if let Some(end) = self.rcv_end {
            if seq >= end {
                warn!("{}[{}]: segment {} past stream end {}", self.pair, self.state, seq, end);
                return false;
            }
        }
        let capacity = (buffers.recv_max() / self.mss).max(1) as u32;
        if seq >= self.rcv_nxt.saturating_add(capacity) {
            trace!("{}[{}]: segment {} beyond window", self.pair, self.state, seq);
            sink.request_retransmit(&segment.header, segment.len);
            return false;
        }
        true
    }

    fn process_ack<S: SegmentSink>(&mut self, tcp: &TcpHeader, buffers: &mut SegmentBuffers, sink: &mut S) {
        if tcp.ack > self.snd_nxt {
            trace!(
                "{}[{}]: ack {} beyond snd_nxt {}",
                self.pair,
                self.state,
                tcp.ack,
                self.snd_nxt
            );
            return;
        }

        if tcp.seq > self.snd_wl1 || (tcp.seq == self.snd_wl1 && tcp.ack >= self.snd_wl2) {
            self.snd_wnd = tcp.window;
            self.snd_wl1 = tcp.seq;
            self.snd_wl2 = tcp.ack;
        }
        self.advance_una(tcp.ack, buffers, sink);
    }

    /// Releases everything a cumulative acknowledgement covers, including
    /// segments put back in the send queue for resending.
    fn advance_una<S: NotifySink>(&mut self, ack: u32, buffers: &mut SegmentBuffers, sink: &mut S) {
        if ack <= self.snd_una || ack > self.snd_nxt {
            return;
        }
        let acked = ack - self.snd_una;
        self.snd_una = ack;
        buffers.clear_retransmit(true, ack, sink);
        let requeued = buffers.clear_send(ack, sink);
        if requeued > 0 {
            debug!("{}[{}]: {} queued resends already acked", self.pair, self.state, requeued);
        }
        self.congestion.on_ack(acked);
        trace!(
            "{}[{}]: {} acked, snd_una {} cwnd {}",
            self.pair,
            self.state,
            acked,
            self.snd_una,
            self.congestion.window()
        );
    }

    fn process_payload<S: SegmentSink>(
        &mut self,
        segment: &Segment<'_>,
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) {
        let seq = segment.tcp.seq;
        if seq != self.rcv_nxt {
            if buffers.has_unprocessed(seq) {
                trace!("{}[{}]: segment {} already held", self.pair, self.state, seq);
            } else if !buffers.add_receive(seq, segment.packet.clone(), sink) {
                sink.request_retransmit(&segment.header, segment.len);
            }
            return;
        }

        if !buffers.add_read(segment.packet.clone(), sink) {
            trace!("{}[{}]: receive buffer full", self.pair, self.state);
            sink.request_retransmit(&segment.header, segment.len);
            return;
        }
        self.rcv_nxt += 1;

        while let Some(next) = buffers.remove_unprocessed(self.rcv_nxt, sink) {
            if !buffers.add_read(next, sink) {
                error!(
                    "{}[{}]: lost held segment {}",
                    self.pair, self.state, self.rcv_nxt
                );
                break;
            }
            self.rcv_nxt += 1;
        }

        if self.at_end() {
            buffers.set_read_signal(true, sink);
        }
        self.acknowledge(buffers, sink);
    }

    fn acknowledge<S: SegmentSink>(&mut self, buffers: &mut SegmentBuffers, sink: &mut S) {
        match self.delayed_ack {
            Some(delay) => {
                self.dack |= DACK_PENDING;
                if self.dack & DACK_SCHEDULED == 0 {
                    self.dack |= DACK_SCHEDULED;
                    sink.schedule_delayed_ack(self.fd, delay);
                }
            }
            None => {
                self.send_control(TcpFlags::ACK, buffers, sink);
            }
        }
    }

    /// Fires the delayed ACK timer. True if an ACK was queued.
    pub(crate) fn on_delayed_ack<S: NotifySink>(
        &mut self,
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) -> bool {
        self.dack &= !DACK_SCHEDULED;
        if self.dack & DACK_PENDING == 0 || !self.state.is_synchronized() {
            return false;
        }
        trace!("{}[{}]: send delayed ACK", self.pair, self.state);
        self.send_control(TcpFlags::ACK, buffers, sink)
    }

    /// Announces reopened receive space after the application read.
    pub(crate) fn on_read<S: NotifySink>(&mut self, buffers: &mut SegmentBuffers, sink: &mut S) -> bool {
        if !self.state.is_synchronized() || self.at_end() {
            return false;
        }
        let window = self.receive_window(buffers);
        let capacity = min(buffers.recv_max() / self.mss, MAX_WINDOW as usize) as u32;
        if window <= self.rcv_wnd || (self.rcv_wnd > 0 && window - self.rcv_wnd < capacity / 2) {
            return false;
        }
        trace!("{}[{}]: window update {} -> {}", self.pair, self.state, self.rcv_wnd, window);
        self.send_control(TcpFlags::ACK, buffers, sink)
    }

    fn process_reset<S: NotifySink>(&mut self, buffers: &mut SegmentBuffers, sink: &mut S) -> Verdict {
        let verdict = match self.state {
            State::SynSent => Verdict::Refused,
            State::Closing => Verdict::Destroy,
            State::Closed | State::Udp => return Verdict::Continue,
            _ => Verdict::Reset,
        };
        trace!("{}[{}]: recv RST, change state to Closed", self.pair, self.state);
        self.state = State::Closed;
        buffers.set_write_enabled(false, sink);
        buffers.set_read_signal(true, sink);
        verdict
    }

    /// Handles a retransmit request for a segment this side sent.
    ///
    /// Handshake segments are rebuilt from the current state, or ignored
    /// once the handshake moved on. Data segments go back to the send
    /// queue unless they have been acknowledged meanwhile. Returns whether
    /// something was queued.
    pub(crate) fn retransmit<S: NotifySink>(
        &mut self,
        request: &RetransmitRequest,
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) -> bool {
        if request.flags.contains(TcpFlags::CON) {
            let flags = match self.state {
                State::SynSent => TcpFlags::SYN | TcpFlags::CON,
                State::SynRcvd => TcpFlags::SYN | TcpFlags::ACK | TcpFlags::CON,
                State::Established if !request.flags.contains(TcpFlags::SYN) => {
                    TcpFlags::ACK | TcpFlags::CON
                }
                _ => {
                    trace!("{}[{}]: stale {} retransmit", self.pair, self.state, request.flags);
                    return false;
                }
            };
            debug!("{}[{}]: resend {}", self.pair, self.state, flags);
            return self.send_control(flags, buffers, sink);
        }
        if !request.data {
            // a lost ACK is replaced by a fresh one
            if request.flags.contains(TcpFlags::RST) || !self.state.is_synchronized() {
                return false;
            }
            return self.send_control(TcpFlags::ACK, buffers, sink);
        }

        let Some(packet) = buffers.remove_retransmit(request.seq, sink) else {
            trace!("{}[{}]: segment {} no longer outstanding", self.pair, self.state, request.seq);
            return false;
        };
        self.congestion.on_timeout();
        debug!(
            "{}[{}]: segment {} lost, cwnd {}",
            self.pair,
            self.state,
            request.seq,
            self.congestion.window()
        );
        if !buffers.add_send(request.seq, packet, sink) {
            error!("{}[{}]: segment {} queued twice", self.pair, self.state, request.seq);
            return false;
        }
        true
    }

    /// Handles the peer's notice that its stream ends at `end` and that it
    /// received everything below `ack`.
    ///
    /// The notice travels outside the bandwidth governor and can overtake
    /// data in either direction. A `Closing` side therefore stays until
    /// both streams are complete.
    pub(crate) fn on_close_notice<S: NotifySink>(
        &mut self,
        end: u32,
        ack: u32,
        buffers: &mut SegmentBuffers,
        sink: &mut S,
    ) -> Verdict {
        self.rcv_end = Some(end);
        if self.state.is_synchronized() {
            self.advance_una(ack, buffers, sink);
        }
        match self.state {
            State::Established | State::SynRcvd => {
                self.state = State::CloseWait;
                trace!("{}[{}]: recv close at {}", self.pair, self.state, end);
                buffers.set_write_enabled(false, sink);
                if self.at_end() {
                    buffers.set_read_signal(true, sink);
                }
                Verdict::Continue
            }
            State::Closing if self.close_complete() => {
                trace!("{}[{}]: recv close, change state to Closed", self.pair, self.state);
                self.state = State::Closed;
                Verdict::Teardown
            }
            State::Closing => {
                trace!(
                    "{}[{}]: recv close at {}, rcv_nxt {} snd_una {} snd_end {}",
                    self.pair,
                    self.state,
                    end,
                    self.rcv_nxt,
                    self.snd_una,
                    self.snd_end
                );
                if self.at_end() {
                    buffers.set_read_signal(true, sink);
                }
                Verdict::Continue
            }
            _ => Verdict::Continue,
        }
    }

    /// Handles the application closing the connection.
    pub(crate) fn close<S: NotifySink>(&mut self, buffers: &mut SegmentBuffers, sink: &mut S) -> CloseAction {
        match self.state {
            State::Established => {
                self.state = State::Closing;
                trace!("{}[{}]: close at {}", self.pair, self.state, self.snd_end);
                buffers.set_write_enabled(false, sink);
                CloseAction::Notify(self.snd_end)
            }
            State::CloseWait if self.is_drained() => {
                self.state = State::Closed;
                CloseAction::NotifyAndDestroy(self.snd_end)
            }
            State::CloseWait => {
                self.state = State::Closing;
                self.close_pending = true;
                trace!(
                    "{}[{}]: close deferred, {} segments unacked",
                    self.pair,
                    self.state,
                    self.snd_end - self.snd_una
                );
                CloseAction::Linger
            }
            State::Closing => CloseAction::Linger,
            _ => {
                self.state = State::Closed;
                CloseAction::Destroy
            }
        }
    }

    pub(crate) fn info(&self, buffers: &SegmentBuffers) -> TcpInfo {
        TcpInfo {
            state: self.state,
            snd_una: self.snd_una,
            snd_nxt: self.snd_nxt,
            snd_end: self.snd_end,
            snd_wnd: self.snd_wnd,
            rcv_nxt: self.rcv_nxt,
            rcv_wnd: self.rcv_wnd,
            cwnd: self.congestion.window(),
            ssthresh: self.congestion.threshold(),
            send_buffer: buffers.send_max(),
            recv_buffer: buffers.recv_max(),
            delayed_ack: self.delayed_ack,
        }
    }
}
