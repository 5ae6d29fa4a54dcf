//! Delivery scheduler.
//!
//! One [`Vci`] drives one worker: it owns the hosts simulated on that
//! worker, their event queue and the routes to other workers. Events are
//! executed in delivery-time order with ties broken by scheduling order.
//! Each execution builds a [`Context`] for the destination host, and every
//! operation that needs to schedule follow-up work receives that context
//! explicitly.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    net::SocketAddrV4,
    sync::Arc,
    time::Duration,
};

use log::{debug, error, info, trace, warn};
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    config::{Bandwidth, Config},
    prometheus::metrics::{EVENTS_EXECUTED, FRAMES_RX, PACKETS_DROPPED, PACKETS_SCHEDULED},
    vnet::{
        host::{Application, Host, Stack},
        notify::NotifySink,
        packet::{PacketHeader, PacketRc},
        socket::Descriptor,
    },
};

pub mod address;
pub mod event;
pub mod frame;
pub mod link;
pub mod oracle;
pub mod registry;
pub mod time;

use address::{AddressAllocator, Location, VirtualAddr, WorkerId};
use event::{CloseNotice, EventKind, RetransmitRequest, ScheduledEvent};
use link::{Delivery, Inbox, Links, Mailbox};
use oracle::{NetworkId, NetworkModel};
use registry::{Membership, Registry};
use time::SimTime;

/// Delay applied to loopback traffic.
pub const LOOPBACK_DELAY: Duration = Duration::from_nanos(1);

/// Work charged against a host's virtual CPU.
#[derive(Default)]
struct VirtualCpu {
    position: Duration,
}

/// Queue, clock and routing state of a worker.
///
/// Kept apart from the hosts so a host can be borrowed mutably while its
/// context schedules new events.
pub struct Scheduler {
    config: Arc<Config>,
    worker: WorkerId,
    now: SimTime,
    queue: BinaryHeap<Reverse<ScheduledEvent>>,
    next_seq: u64,
    cpus: HashMap<VirtualAddr, VirtualCpu>,
    registry: Registry,
    model: Arc<dyn NetworkModel>,
    rng: SmallRng,
    links: Links,
}

impl Scheduler {
    fn cpu_position(&self, host: VirtualAddr) -> Duration {
        self.cpus.get(&host).map_or(Duration::ZERO, |cpu| cpu.position)
    }

    /// Queues a local event. The CPU mark is taken from the destination,
    /// so an event crossing hosts is re-homed when it is created.
    fn push(&mut self, time: SimTime, dst: VirtualAddr, owner: VirtualAddr, kind: EventKind) {
        let cpu_mark = self.cpu_position(dst);
        self.push_marked(time, dst, owner, cpu_mark, kind);
    }

    fn push_marked(
        &mut self,
        time: SimTime,
        dst: VirtualAddr,
        owner: VirtualAddr,
        cpu_mark: Duration,
        kind: EventKind,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        trace!("{}: {} event for {} at {}", owner, kind.name(), dst, time);
        self.queue.push(Reverse(ScheduledEvent {
            time: time.max(self.now),
            seq,
            dst,
            owner,
            cpu_mark,
            kind,
        }));
    }

    /// One-way latency and reliability between two hosts.
    fn path(&self, src: VirtualAddr, dst: VirtualAddr) -> Option<(Duration, f64)> {
        let src_net = self.network_of(src)?;
        let dst_net = self.network_of(dst)?;
        let latency = self.model.latency(src_net, dst_net).unwrap_or_else(|| {
            warn!(
                "no latency from network {} to {}, using worst case",
                src_net, dst_net
            );
            self.model.worst_case_latency()
        });
        Some((latency, self.model.reliability(src_net, dst_net)))
    }

    fn network_of(&self, addr: VirtualAddr) -> Option<NetworkId> {
        match self.registry.lookup(addr) {
            Some(membership) => Some(membership.network),
            None => {
                warn!("{} is not attached to any network", addr);
                None
            }
        }
    }

    /// Routes an event to its destination host, wherever it runs.
    fn deliver(&mut self, time: SimTime, owner: VirtualAddr, dst: VirtualAddr, kind: EventKind) {
        let location = self.model.relative_location(self.worker, dst);
        if location == Location::SameUnit {
            self.push(time, dst, owner, kind);
            return;
        }

        let delivery = match kind {
            EventKind::Packet(packet)
                if location == Location::SameMachine
                    && self.model.can_share_memory(self.worker, dst) =>
            {
                Delivery::Shared { time, packet }
            }
            kind => match frame::encode(time, &kind) {
                Some(frame) => Delivery::Frame(frame),
                None => {
                    error!("{}: cannot serialize {} event for {}", owner, kind.name(), dst);
                    return;
                }
            },
        };
        self.links.send(dst.worker_id(), delivery);
    }
}

/// Host-scoped handle on the scheduler, valid for one event execution or
/// one call into a host from outside the event loop.
pub struct Context<'a> {
    sched: &'a mut Scheduler,
    host: VirtualAddr,
}

impl<'a> Context<'a> {
    pub fn now(&self) -> SimTime {
        self.sched.now
    }

    /// Address of the host this context belongs to.
    pub fn host(&self) -> VirtualAddr {
        self.host
    }

    pub fn config(&self) -> &Config {
        &self.sched.config
    }

    /// Charges CPU work to the host; its queued events slide back by as much.
    pub fn charge_cpu(&mut self, work: Duration) {
        self.sched.cpus.entry(self.host).or_default().position += work;
    }

    /// Resolves the host a socket address belongs to.
    fn host_of(&self, endpoint: &SocketAddrV4) -> VirtualAddr {
        if endpoint.ip().is_loopback() {
            self.host
        } else {
            VirtualAddr::from(*endpoint.ip())
        }
    }

    /// One-way latency to `peer`, worst case when unknown.
    pub fn latency_to(&self, peer: VirtualAddr) -> Duration {
        if peer == self.host || peer.is_loopback() {
            return LOOPBACK_DELAY;
        }
        self.sched
            .path(self.host, peer)
            .map_or_else(|| self.sched.model.worst_case_latency(), |(latency, _)| latency)
    }

    pub fn round_trip(&self, peer: VirtualAddr) -> Duration {
        if peer == self.host || peer.is_loopback() {
            return LOOPBACK_DELAY * 2;
        }
        let back = self
            .sched
            .path(peer, self.host)
            .map_or_else(|| self.sched.model.worst_case_latency(), |(latency, _)| latency);
        self.latency_to(peer) + back
    }

    pub fn bandwidth_of(&self, peer: VirtualAddr) -> Option<Bandwidth> {
        self.sched.registry.lookup(peer).map(|m| m.bandwidth)
    }

    /// Sends a packet into the network.
    ///
    /// Loopback packets arrive one tick later. Everything else is dropped
    /// with probability `1 - reliability`, in which case the sender gets a
    /// retransmit request instead, or arrives after the path latency.
    pub fn schedule_packet(&mut self, packet: PacketRc) {
        let Some(header) = packet.header() else {
            return;
        };
        PACKETS_SCHEDULED.inc();
        let now = self.now();

        if header.dst.ip().is_loopback() {
            self.sched
                .push(now + LOOPBACK_DELAY, self.host, self.host, EventKind::Packet(packet));
            return;
        }

        let dst = VirtualAddr::from(*header.dst.ip());
        let Some((latency, reliability)) = self.sched.path(self.host, dst) else {
            PACKETS_DROPPED.with_label_values(&["unroutable"]).inc();
            return;
        };

        if self.sched.rng.gen::<f64>() >= reliability {
            PACKETS_DROPPED.with_label_values(&["reliability"]).inc();
            debug!("{}: dropped packet {} -> {}", self.host, header.src, header.dst);
            let request = RetransmitRequest::for_lost(&header, packet.payload_len());
            self.sched
                .push(now + latency, self.host, self.host, EventKind::Retransmit(request));
            return;
        }

        self.sched
            .deliver(now + latency, self.host, dst, EventKind::Packet(packet));
    }

    /// Tells the sender of a rejected packet to send it again.
    pub fn request_retransmit(&mut self, header: &PacketHeader, payload_len: usize) {
        let Some(request) = RetransmitRequest::for_packet(header, payload_len) else {
            return;
        };
        let sender = self.host_of(&header.src);
        let time = self.now() + self.latency_to(sender);
        self.sched
            .deliver(time, self.host, sender, EventKind::Retransmit(request));
    }

    /// Tells the peer at `dst` that `src` will send nothing at or past `end`
    /// and has received everything below `ack`.
    pub fn schedule_close(&mut self, src: SocketAddrV4, dst: SocketAddrV4, end: u32, ack: u32) {
        let peer = self.host_of(&dst);
        let time = self.now() + self.latency_to(peer);
        self.sched.deliver(
            time,
            self.host,
            peer,
            EventKind::Close(CloseNotice { src, dst, end, ack }),
        );
    }

    pub fn schedule_poll(&mut self, fd: Descriptor, delay: Duration) {
        let time = self.now() + delay;
        self.sched.push(time, self.host, self.host, EventKind::Poll(fd));
    }

    pub fn schedule_delayed_ack(&mut self, fd: Descriptor, delay: Duration) {
        let time = self.now() + delay;
        self.sched
            .push(time, self.host, self.host, EventKind::DelayedAck(fd));
    }

    pub fn schedule_uploaded(&mut self, delay: Duration) {
        let time = self.now() + delay;
        self.sched.push(time, self.host, self.host, EventKind::Uploaded);
    }

    pub fn schedule_downloaded(&mut self, delay: Duration) {
        let time = self.now() + delay;
        self.sched.push(time, self.host, self.host, EventKind::Downloaded);
    }
}

impl NotifySink for Context<'_> {
    fn schedule_notify(&mut self, fd: Descriptor, delay: Duration) {
        let time = self.now() + delay;
        self.sched.push(time, self.host, self.host, EventKind::Notify(fd));
    }
}

/// Virtual communications interface of one worker.
pub struct Vci {
    sched: Scheduler,
    hosts: HashMap<VirtualAddr, Host>,
    allocator: AddressAllocator,
    inbox: Inbox,
    mailbox: Mailbox,
}

impl Vci {
    pub fn new(
        config: Config,
        worker: WorkerId,
        model: Arc<dyn NetworkModel>,
        registry: Registry,
    ) -> Self {
        let seed = config.seed ^ ((worker.machine as u64) << 8 | worker.worker as u64);
        let (mailbox, inbox) = link::mailbox();
        Self {
            sched: Scheduler {
                config: Arc::new(config),
                worker,
                now: SimTime::ZERO,
                queue: BinaryHeap::new(),
                next_seq: 0,
                cpus: HashMap::new(),
                registry,
                model,
                rng: SmallRng::seed_from_u64(seed),
                links: Links::default(),
            },
            hosts: HashMap::new(),
            allocator: AddressAllocator::new(worker),
            inbox,
            mailbox,
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.sched.worker
    }

    pub fn now(&self) -> SimTime {
        self.sched.now
    }

    /// Handle other workers use to reach this one.
    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }

    /// Adds a route to another worker.
    pub fn connect(&mut self, worker: WorkerId, mailbox: Mailbox) {
        self.sched.links.connect(worker, mailbox);
    }

    /// Creates a host on this worker and attaches it to `network`.
    pub fn add_host(
        &mut self,
        name: &str,
        network: NetworkId,
        bandwidth: Bandwidth,
    ) -> Option<VirtualAddr> {
        let addr = self.allocator.allocate()?;
        self.sched.registry.join(addr, Membership { network, bandwidth });
        self.sched.cpus.insert(addr, VirtualCpu::default());
        let host = Host::new(name, addr, self.sched.config.clone(), bandwidth);
        self.hosts.insert(addr, host);
        info!("{}: host {} joined network {}", addr, name, network);
        Some(addr)
    }

    /// Removes a host. Its pending events are discarded when they come due.
    pub fn remove_host(&mut self, addr: VirtualAddr) -> bool {
        let Some(host) = self.hosts.remove(&addr) else {
            return false;
        };
        self.sched.registry.leave(addr);
        self.sched.cpus.remove(&addr);
        info!("{}: host {} left", addr, host.name());
        true
    }

    pub fn host(&self, addr: VirtualAddr) -> Option<&Host> {
        self.hosts.get(&addr)
    }

    /// Runs `f` against a host's stack, as if from inside that host.
    pub fn with_host<R>(
        &mut self,
        addr: VirtualAddr,
        f: impl FnOnce(&mut Stack, &mut Context<'_>) -> R,
    ) -> Option<R> {
        let host = self.hosts.get_mut(&addr)?;
        let mut ctx = Context {
            sched: &mut self.sched,
            host: addr,
        };
        Some(f(host.stack_mut(), &mut ctx))
    }

    /// Installs the application a host runs and starts it.
    pub fn set_application(&mut self, addr: VirtualAddr, app: Box<dyn Application>) -> bool {
        let Some(host) = self.hosts.get_mut(&addr) else {
            return false;
        };
        let mut ctx = Context {
            sched: &mut self.sched,
            host: addr,
        };
        host.start_application(app, &mut ctx);
        true
    }

    /// Moves deliveries from other workers into the local queue.
    fn receive(&mut self) {
        while let Ok(delivery) = self.inbox.try_recv() {
            FRAMES_RX.inc();
            let (time, kind) = match delivery {
                Delivery::Frame(frame) => match frame::decode(&frame) {
                    Some(decoded) => decoded,
                    None => continue,
                },
                Delivery::Shared { time, packet } => (time, EventKind::Packet(packet)),
            };
            let Some(dst) = destination(&kind) else {
                warn!("dropping {} delivery without a destination", kind.name());
                continue;
            };
            self.sched.push(time, dst, dst, kind);
        }
    }

    /// Delivery time of the earliest queued event.
    pub fn next_event_time(&mut self) -> Option<SimTime> {
        self.receive();
        self.sched.queue.peek().map(|Reverse(event)| event.time)
    }

    /// Executes the earliest event. False when the queue is empty.
    pub fn step(&mut self) -> bool {
        self.receive();
        let Some(Reverse(event)) = self.sched.queue.pop() else {
            return false;
        };
        self.sched.now = self.sched.now.max(event.time);
        self.execute(event);
        true
    }

    /// Executes every event due at or before `end`, then advances the clock
    /// to `end`. Returns the number of events popped.
    pub fn run_until(&mut self, end: SimTime) -> usize {
        let mut count = 0;
        while self.next_event_time().is_some_and(|time| time <= end) {
            self.step();
            count += 1;
        }
        self.sched.now = self.sched.now.max(end);
        count
    }

    /// Executes events until the queue drains. Poll ticks keep the queue
    /// alive as long as sockets exist, so prefer [`run_until`](Self::run_until)
    /// when they are enabled.
    pub fn run(&mut self) -> usize {
        let mut count = 0;
        while self.step() {
            count += 1;
        }
        count
    }

    fn execute(&mut self, event: ScheduledEvent) {
        let ScheduledEvent {
            time,
            dst,
            owner,
            cpu_mark,
            kind,
            ..
        } = event;

        let position = self.sched.cpu_position(dst);
        if position > cpu_mark {
            let delay = position - cpu_mark;
            trace!("{}: {} event waits {:?} for the cpu", dst, kind.name(), delay);
            self.sched.push_marked(time + delay, dst, owner, position, kind);
            return;
        }

        let Some(host) = self.hosts.get_mut(&dst) else {
            debug!("{}: no such host for {} event", dst, kind.name());
            return;
        };
        EVENTS_EXECUTED.with_label_values(&[kind.name()]).inc();

        let mut ctx = Context {
            sched: &mut self.sched,
            host: dst,
        };
        host.handle_event(kind, &mut ctx);
    }

    /// Queued events as (time, destination, kind) in no particular order.
    pub fn pending_events(&self) -> Vec<(SimTime, VirtualAddr, &'static str)> {
        self.sched
            .queue
            .iter()
            .map(|Reverse(event)| (event.time, event.dst, event.kind.name()))
            .collect()
    }
}

/// Host an event that arrived from another worker is meant for.
fn destination(kind: &EventKind) -> Option<VirtualAddr> {
    match kind {
        EventKind::Packet(packet) => packet.header().map(|h| VirtualAddr::from(*h.dst.ip())),
        EventKind::Retransmit(request) => Some(VirtualAddr::from(*request.src.ip())),
        EventKind::Close(notice) => Some(VirtualAddr::from(*notice.dst.ip())),
        _ => None,
    }
}

#[cfg(test)]
mod tests;
