use std::{
    collections::{HashSet, VecDeque},
    time::Duration,
};

use log::{debug, trace};

use super::{
    host::Stack,
    packet::{PacketRc, Protocol},
    socket::{Descriptor, Engine, Socket},
};
use crate::{
    config::{Bandwidth, Config},
    prometheus::metrics::PACKETS_DROPPED,
    vci::{time::SimTime, Context},
};

/// Paces one direction of a host's link.
///
/// Bandwidth is turned into a per-byte transmission cost. Each tick may
/// spend up to one batch of link time; the loop keeps ticking while there
/// is traffic and disarms once the link has been idle long enough.
pub(crate) struct Pacer {
    /// Zero means unlimited.
    nanos_per_byte: f64,
    batch: Duration,
    idle_disarm: Duration,
    armed: bool,
    last_active: SimTime,
}

impl Pacer {
    fn new(kibps: u64, config: &Config) -> Self {
        let nanos_per_byte = if kibps == 0 {
            0.0
        } else {
            1e9 / (kibps as f64 * 1024.0)
        };
        Self {
            nanos_per_byte,
            batch: config.batch,
            idle_disarm: config.idle_disarm,
            armed: false,
            last_active: SimTime::ZERO,
        }
    }

    /// Link time needed to move `bytes`.
    pub(crate) fn cost(&self, bytes: usize) -> Duration {
        Duration::from_nanos((bytes as f64 * self.nanos_per_byte).ceil() as u64)
    }

    /// Delay until the next tick, or `None` to disarm.
    fn next_tick(&mut self, now: SimTime, moved: usize, consumed: Duration) -> Option<Duration> {
        if moved > 0 {
            self.last_active = now;
            self.armed = true;
            return Some(consumed);
        }
        let idle = now.since(self.last_active);
        if idle >= self.idle_disarm {
            self.armed = false;
            return None;
        }
        self.armed = true;
        Some(self.idle_disarm - idle)
    }
}

/// Per-host upload and download pacing.
pub(crate) struct BandwidthGovernor {
    up: Pacer,
    down: Pacer,
    /// Sockets with something to send, served round-robin.
    ready: VecDeque<Descriptor>,
    queued: HashSet<Descriptor>,
    incoming: VecDeque<PacketRc>,
    incoming_bytes: usize,
    incoming_capacity: usize,
}

impl BandwidthGovernor {
    pub(crate) fn new(bandwidth: Bandwidth, config: &Config) -> Self {
        let capacity = if bandwidth.down_kibps == 0 {
            usize::MAX
        } else {
            (config.incoming_burst.as_secs_f64() * (bandwidth.down_kibps * 1024) as f64) as usize
        };
        Self {
            up: Pacer::new(bandwidth.up_kibps, config),
            down: Pacer::new(bandwidth.down_kibps, config),
            ready: VecDeque::new(),
            queued: HashSet::new(),
            incoming: VecDeque::new(),
            incoming_bytes: 0,
            incoming_capacity: capacity,
        }
    }

    fn enqueue(&mut self, fd: Descriptor) -> bool {
        if !self.queued.insert(fd) {
            return false;
        }
        self.ready.push_back(fd);
        true
    }

    fn dequeue(&mut self) -> Option<Descriptor> {
        let fd = self.ready.pop_front()?;
        self.queued.remove(&fd);
        Some(fd)
    }

    /// Drops a destroyed socket from the ready queue.
    pub(crate) fn forget(&mut self, fd: Descriptor) {
        if self.queued.remove(&fd) {
            self.ready.retain(|queued| *queued != fd);
        }
    }

    /// Appends an arrival unless the burst allowance is spent.
    fn admit(&mut self, packet: PacketRc) -> Result<(), PacketRc> {
        let len = packet.wire_len();
        if self.incoming_bytes.saturating_add(len) > self.incoming_capacity {
            return Err(packet);
        }
        self.incoming_bytes += len;
        self.incoming.push_back(packet);
        Ok(())
    }

    fn pop_incoming(&mut self) -> Option<(PacketRc, usize)> {
        let packet = self.incoming.pop_front()?;
        let len = packet.wire_len();
        self.incoming_bytes = self.incoming_bytes.saturating_sub(len);
        Some((packet, len))
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn incoming_len(&self) -> usize {
        self.incoming.len()
    }

    pub(crate) fn is_upload_armed(&self) -> bool {
        self.up.armed
    }

    pub(crate) fn is_download_armed(&self) -> bool {
        self.down.armed
    }
}

impl Stack {
    pub(crate) fn can_transmit(&self, fd: Descriptor) -> bool {
        let Some(socket) = self.sockets.get(&fd) else {
            return false;
        };
        match &socket.engine {
            Engine::Tcp(cb) => cb.can_transmit(&socket.buffers),
            Engine::Udp(_) => socket.buffers.has_outbound(),
        }
    }

    fn transmit(&mut self, fd: Descriptor, ctx: &mut Context<'_>) -> Option<PacketRc> {
        let socket = self.sockets.get_mut(&fd)?;
        let Socket { engine, buffers, .. } = socket;
        match engine {
            Engine::Tcp(cb) => cb.next_packet(buffers, ctx),
            Engine::Udp(_) => buffers.remove_send(u32::MAX, ctx).map(|(_, packet)| packet),
        }
    }

    /// Marks `fd` as having something to send and starts the upload loop
    /// if it is idle.
    pub(crate) fn ready_send(&mut self, fd: Descriptor, ctx: &mut Context<'_>) {
        if !self.can_transmit(fd) {
            return;
        }
        self.governor.enqueue(fd);
        if !self.governor.up.armed {
            self.upload(ctx);
        }
    }

    /// One upload tick: sends packets round-robin across ready sockets
    /// until a batch of link time is spent.
    pub(crate) fn upload(&mut self, ctx: &mut Context<'_>) {
        let batch = self.governor.up.batch;
        let mut consumed = Duration::ZERO;
        let mut moved = 0;

        while consumed < batch {
            let Some(fd) = self.governor.dequeue() else {
                break;
            };
            let Some(packet) = self.transmit(fd, ctx) else {
                continue;
            };
            consumed += self.governor.up.cost(packet.wire_len());
            moved += 1;
            ctx.schedule_packet(packet);
            if self.can_transmit(fd) {
                self.governor.enqueue(fd);
            }
        }

        let now = ctx.now();
        match self.governor.up.next_tick(now, moved, consumed) {
            Some(delay) => {
                trace!("{}: sent {} packets, next upload in {:?}", self.addr, moved, delay);
                ctx.schedule_uploaded(delay);
            }
            None => trace!("{}: upload idle", self.addr),
        }
    }

    /// Queues an arrival for download pacing.
    ///
    /// Arrivals beyond the burst allowance are dropped; stream senders are
    /// asked to send them again.
    pub(crate) fn ready_receive(&mut self, packet: PacketRc, ctx: &mut Context<'_>) {
        if let Err(packet) = self.governor.admit(packet) {
            PACKETS_DROPPED.with_label_values(&["incoming"]).inc();
            if let Some(header) = packet.header() {
                debug!("{}: incoming queue full, dropped packet from {}", self.addr, header.src);
                ctx.request_retransmit(&header, packet.payload_len());
            }
            return;
        }
        if !self.governor.down.armed {
            self.download(ctx);
        }
    }

    /// One download tick: hands queued arrivals to their protocol until a
    /// batch of link time is spent.
    pub(crate) fn download(&mut self, ctx: &mut Context<'_>) {
        let batch = self.governor.down.batch;
        let mut consumed = Duration::ZERO;
        let mut moved = 0;

        while consumed < batch {
            let Some((packet, len)) = self.governor.pop_incoming() else {
                break;
            };
            consumed += self.governor.down.cost(len);
            moved += 1;
            let protocol = packet.header().map(|header| header.protocol);
            match protocol {
                Some(Protocol::Tcp) => self.tcp_arrival(packet, ctx),
                Some(Protocol::Udp) => self.udp_arrival(packet, ctx),
                None => {}
            }
        }

        let now = ctx.now();
        if let Some(delay) = self.governor.down.next_tick(now, moved, consumed) {
            ctx.schedule_downloaded(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use bytes::Bytes;

    use super::*;
    use crate::vnet::packet::Packet;

    #[test]
    fn test_cost() {
        let config = Config::default();
        let pacer = Pacer::new(1024, &config);
        // 1 MiB/s moves a byte in ~954 ns
        assert_eq!(pacer.cost(1), Duration::from_nanos(954));
        assert_eq!(pacer.cost(1048576), Duration::from_secs(1));
        assert_eq!(Pacer::new(0, &config).cost(1 << 20), Duration::ZERO);
    }

    #[test]
    fn test_idle_disarm() {
        let config = Config::default();
        let mut pacer = Pacer::new(1024, &config);
        let start = SimTime::from_millis(5);

        assert_eq!(pacer.next_tick(start, 3, Duration::from_micros(40)), Some(Duration::from_micros(40)));
        assert!(pacer.armed);

        let later = start + Duration::from_micros(400);
        assert_eq!(pacer.next_tick(later, 0, Duration::ZERO), Some(Duration::from_micros(600)));
        assert!(pacer.armed);

        let idle = start + Duration::from_millis(1);
        assert_eq!(pacer.next_tick(idle, 0, Duration::ZERO), None);
        assert!(!pacer.armed);
    }

    #[test]
    fn test_round_robin_queue() {
        let config = Config::default();
        let mut governor = BandwidthGovernor::new(Bandwidth::symmetric(1024), &config);
        assert!(governor.enqueue(3));
        assert!(governor.enqueue(4));
        assert!(!governor.enqueue(3));
        governor.forget(4);
        assert!(governor.enqueue(5));
        assert_eq!(governor.dequeue(), Some(3));
        assert_eq!(governor.dequeue(), Some(5));
        assert_eq!(governor.dequeue(), None);
        assert_eq!(governor.ready_len(), 0);
    }

    #[test]
    fn test_incoming_burst_limit() {
        let config = Config {
            incoming_burst: Duration::from_secs(1),
            ..Config::default()
        };
        // one second at 1 KiB/s
        let mut governor = BandwidthGovernor::new(Bandwidth::new(0, 1), &config);
        let src = SocketAddrV4::new(Ipv4Addr::new(1, 0, 0, 1), 5000);
        let dst = SocketAddrV4::new(Ipv4Addr::new(1, 1, 0, 1), 53);
        let datagram = |len: usize| Packet::new_udp(src, dst, Bytes::from(vec![0u8; len]));

        assert!(governor.admit(datagram(1000)).is_err());
        assert!(governor.admit(datagram(500)).is_ok());
        assert!(governor.admit(datagram(500)).is_err());
        assert_eq!(governor.incoming_len(), 1);

        let (_, len) = governor.pop_incoming().unwrap();
        assert_eq!(len, 528);
        assert!(governor.admit(datagram(900)).is_ok());

        let unlimited = BandwidthGovernor::new(Bandwidth::symmetric(0), &config);
        assert_eq!(unlimited.incoming_capacity, usize::MAX);
    }
}
