use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io,
    net::{Ipv4Addr, SocketAddrV4},
    sync::Arc,
};

use log::{debug, info, trace};

use super::{
    notify::{Activity, Readiness},
    pacing::BandwidthGovernor,
    socket::{Binding, Descriptor, Engine, Socket, SocketKind, TcpInfo},
    tcp::{child_key, State},
};
use crate::{
    config::{Bandwidth, Config},
    prometheus::metrics::{NOTIFICATIONS, TCP_CONNS},
    vci::{address::VirtualAddr, event::EventKind, Context},
};

const FIRST_DESCRIPTOR: Descriptor = 3;
const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 10000..=65535;

/// Program running on a simulated host.
///
/// Callbacks run inside scheduler events and get the host's stack and
/// context to act with.
pub trait Application {
    fn on_start(&mut self, _stack: &mut Stack, _ctx: &mut Context<'_>) {}

    /// A socket the application waits on became ready.
    fn on_ready(&mut self, stack: &mut Stack, ctx: &mut Context<'_>, fd: Descriptor, readiness: Readiness);
}

pub(crate) fn bad_descriptor(fd: Descriptor) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("bad descriptor {}", fd))
}

pub(crate) fn would_block() -> io::Error {
    io::Error::from(io::ErrorKind::WouldBlock)
}

/// A simulated host: its network stack and the application on top.
pub struct Host {
    name: String,
    stack: Stack,
    app: Option<Box<dyn Application>>,
}

impl Host {
    pub(crate) fn new(name: &str, addr: VirtualAddr, config: Arc<Config>, bandwidth: Bandwidth) -> Self {
        Self {
            name: name.to_owned(),
            stack: Stack::new(addr, config, bandwidth),
            app: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub(crate) fn stack_mut(&mut self) -> &mut Stack {
        &mut self.stack
    }

    pub(crate) fn start_application(&mut self, mut app: Box<dyn Application>, ctx: &mut Context<'_>) {
        info!("{}: starting application", self.name);
        app.on_start(&mut self.stack, ctx);
        self.app = Some(app);
    }

    pub(crate) fn handle_event(&mut self, kind: EventKind, ctx: &mut Context<'_>) {
        match kind {
            EventKind::Packet(packet) => self.stack.ready_receive(packet, ctx),
            EventKind::Retransmit(request) => self.stack.on_retransmit(&request, ctx),
            EventKind::Close(notice) => self.stack.on_close_notice(&notice, ctx),
            EventKind::Notify(fd) => self.notify(fd, ctx),
            EventKind::Poll(fd) => self.stack.on_poll(fd, ctx),
            EventKind::DelayedAck(fd) => self.stack.on_delayed_ack(fd, ctx),
            EventKind::Uploaded => self.stack.upload(ctx),
            EventKind::Downloaded => self.stack.download(ctx),
        }
    }

    /// Executes a notification event.
    ///
    /// Each ready direction still available is reported to the waiter
    /// table and the application. A socket destroyed by a callback ends
    /// the notification.
    fn notify(&mut self, fd: Descriptor, ctx: &mut Context<'_>) {
        let kinds = match self.stack.sockets.get_mut(&fd) {
            Some(socket) => socket.buffers.notifier_mut().begin_notification(),
            None => {
                trace!("{}: fd {} gone before its notification", self.name, fd);
                return;
            }
        };

        for kind in kinds {
            let Some(socket) = self.stack.sockets.get(&fd) else {
                return;
            };
            if !socket.buffers.notifier().available().contains(kind) {
                continue;
            }
            NOTIFICATIONS.inc();
            trace!("{}: fd {} ready {}", self.name, fd, kind);
            self.stack.record_ready(fd, kind);
            if let Some(app) = self.app.as_mut() {
                app.on_ready(&mut self.stack, ctx, fd, kind);
            }
        }

        if let Some(socket) = self.stack.sockets.get_mut(&fd) {
            socket.buffers.notifier_mut().finish_notification(ctx);
        }
    }
}

/// Network stack of one host: the socket table, port maps and the
/// bandwidth governor.
pub struct Stack {
    pub(crate) addr: VirtualAddr,
    pub(crate) config: Arc<Config>,
    pub(crate) bandwidth: Bandwidth,
    pub(crate) sockets: HashMap<Descriptor, Socket>,
    destroyed: HashSet<Descriptor>,
    next_fd: Descriptor,
    ethernet_ports: HashMap<u16, Descriptor>,
    loopback_ports: HashMap<u16, Descriptor>,
    next_port: u16,
    pub(crate) governor: BandwidthGovernor,
    waiter: BTreeMap<Descriptor, Readiness>,
}

impl Stack {
    pub(crate) fn new(addr: VirtualAddr, config: Arc<Config>, bandwidth: Bandwidth) -> Self {
        let governor = BandwidthGovernor::new(bandwidth, &config);
        Self {
            addr,
            config,
            bandwidth,
            sockets: HashMap::new(),
            destroyed: HashSet::new(),
            next_fd: FIRST_DESCRIPTOR,
            ethernet_ports: HashMap::new(),
            loopback_ports: HashMap::new(),
            next_port: *EPHEMERAL_PORTS.start(),
            governor,
            waiter: BTreeMap::new(),
        }
    }

    pub fn addr(&self) -> VirtualAddr {
        self.addr
    }

    pub fn bandwidth(&self) -> Bandwidth {
        self.bandwidth
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_open(&self, fd: Descriptor) -> bool {
        self.sockets.contains_key(&fd)
    }

    pub fn state(&self, fd: Descriptor) -> Option<State> {
        self.sockets.get(&fd).map(Socket::state)
    }

    pub fn local_addr(&self, fd: Descriptor) -> Option<SocketAddrV4> {
        let socket = self.sockets.get(&fd)?;
        if let Some(cb) = socket.tcp() {
            if !matches!(cb.state, State::Closed | State::Listen) {
                return Some(cb.pair.local);
            }
        }
        let binding = socket.binding?;
        let ip = if binding.ethernet && binding.loopback {
            Ipv4Addr::UNSPECIFIED
        } else if binding.loopback {
            Ipv4Addr::LOCALHOST
        } else {
            self.addr.to_ipv4()
        };
        Some(SocketAddrV4::new(ip, binding.port))
    }

    pub fn peer_addr(&self, fd: Descriptor) -> Option<SocketAddrV4> {
        let socket = self.sockets.get(&fd)?;
        match &socket.engine {
            Engine::Tcp(cb) if !matches!(cb.state, State::Closed | State::Listen) => Some(cb.pair.remote),
            Engine::Udp(udp) => udp.peer,
            _ => None,
        }
    }

    pub fn readiness(&self, fd: Descriptor) -> Option<Readiness> {
        self.sockets
            .get(&fd)
            .map(|socket| socket.buffers.notifier().available())
    }

    pub fn tcp_info(&self, fd: Descriptor) -> Option<TcpInfo> {
        let socket = self.sockets.get(&fd)?;
        socket.tcp().map(|cb| cb.info(&socket.buffers))
    }

    pub(crate) fn socket_mut(&mut self, fd: Descriptor) -> io::Result<&mut Socket> {
        self.sockets.get_mut(&fd).ok_or_else(|| bad_descriptor(fd))
    }

    /// Creates a socket. Sockets start active; datagram sockets are
    /// writable at once.
    pub fn socket(&mut self, kind: SocketKind, ctx: &mut Context<'_>) -> Descriptor {
        let fd = self.insert_socket(kind, Activity::Active, ctx);
        if kind == SocketKind::Datagram {
            if let Some(socket) = self.sockets.get_mut(&fd) {
                socket.buffers.set_write_enabled(true, ctx);
            }
        }
        debug!("{}: fd {} created ({:?})", self.addr, fd, kind);
        fd
    }

    pub(crate) fn insert_socket(&mut self, kind: SocketKind, activity: Activity, ctx: &mut Context<'_>) -> Descriptor {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.sockets
            .insert(fd, Socket::new(fd, kind, &self.config, activity));
        self.start_poll(fd, ctx);
        fd
    }

    fn start_poll(&mut self, fd: Descriptor, ctx: &mut Context<'_>) {
        let Some(interval) = self.config.poll_interval else {
            return;
        };
        if let Some(socket) = self.sockets.get_mut(&fd) {
            if socket.buffers.notifier_mut().try_schedule_poll() {
                ctx.schedule_poll(fd, interval);
            }
        }
    }

    /// Safety-net tick: re-evaluates readiness and keeps ticking while the
    /// socket lives.
    pub(crate) fn on_poll(&mut self, fd: Descriptor, ctx: &mut Context<'_>) {
        let Some(socket) = self.sockets.get_mut(&fd) else {
            return;
        };
        socket.buffers.notifier_mut().poll_fired();
        socket.buffers.sync(ctx);
        self.start_poll(fd, ctx);
    }

    pub(crate) fn lookup_port(&self, port: u16, loopback: bool) -> Option<Descriptor> {
        let ports = if loopback {
            &self.loopback_ports
        } else {
            &self.ethernet_ports
        };
        ports.get(&port).copied()
    }

    fn port_free(&self, port: u16, ethernet: bool, loopback: bool) -> bool {
        !(ethernet && self.ethernet_ports.contains_key(&port))
            && !(loopback && self.loopback_ports.contains_key(&port))
    }

    fn ephemeral_port(&mut self, ethernet: bool, loopback: bool) -> io::Result<u16> {
        for _ in EPHEMERAL_PORTS {
            let port = self.next_port;
            self.next_port = if port == *EPHEMERAL_PORTS.end() {
                *EPHEMERAL_PORTS.start()
            } else {
                port + 1
            };
            if self.port_free(port, ethernet, loopback) {
                return Ok(port);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no ephemeral port available",
        ))
    }

    /// Binds a socket to a local address.
    ///
    /// The unspecified address binds both interfaces, a loopback address
    /// only the loopback interface and the host's own address only the
    /// ethernet interface. Port zero picks an ephemeral port.
    pub fn bind(&mut self, fd: Descriptor, addr: SocketAddrV4) -> io::Result<()> {
        let socket = self.sockets.get(&fd).ok_or_else(|| bad_descriptor(fd))?;
        if socket.binding.is_some() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket already bound"));
        }

        let ip = *addr.ip();
        let (ethernet, loopback) = if ip.is_unspecified() {
            (true, true)
        } else if ip.is_loopback() {
            (false, true)
        } else if VirtualAddr::from(ip) == self.addr {
            (true, false)
        } else {
            return Err(io::Error::from(io::ErrorKind::AddrNotAvailable));
        };

        let port = if addr.port() == 0 {
            self.ephemeral_port(ethernet, loopback)?
        } else if self.port_free(addr.port(), ethernet, loopback) {
            addr.port()
        } else {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        };

        if ethernet {
            self.ethernet_ports.insert(port, fd);
        }
        if loopback {
            self.loopback_ports.insert(port, fd);
        }
        self.socket_mut(fd)?.binding = Some(Binding {
            port,
            ethernet,
            loopback,
        });
        debug!("{}: fd {} bound to {}:{}", self.addr, fd, ip, port);
        Ok(())
    }

    /// Binds an unbound socket to an ephemeral port suited to reach `remote`.
    pub(crate) fn autobind(&mut self, fd: Descriptor, remote: &SocketAddrV4) -> io::Result<u16> {
        if let Some(binding) = self.sockets.get(&fd).and_then(|s| s.binding) {
            return Ok(binding.port);
        }
        let ip = if remote.ip().is_loopback() {
            Ipv4Addr::LOCALHOST
        } else {
            self.addr.to_ipv4()
        };
        self.bind(fd, SocketAddrV4::new(ip, 0))?;
        self.sockets
            .get(&fd)
            .and_then(|s| s.binding)
            .map(|b| b.port)
            .ok_or_else(|| bad_descriptor(fd))
    }

    /// Local endpoint used when talking to `remote` from `port`.
    pub(crate) fn local_endpoint(&self, remote: &SocketAddrV4, port: u16) -> SocketAddrV4 {
        let ip = if remote.ip().is_loopback() {
            Ipv4Addr::LOCALHOST
        } else {
            self.addr.to_ipv4()
        };
        SocketAddrV4::new(ip, port)
    }

    pub fn send(&mut self, fd: Descriptor, buf: &[u8], ctx: &mut Context<'_>) -> io::Result<usize> {
        match self.socket_mut(fd)?.kind {
            SocketKind::Stream => self.tcp_send(fd, buf, ctx),
            SocketKind::Datagram => self.udp_send_to(fd, buf, None, ctx),
        }
    }

    pub fn send_to(
        &mut self,
        fd: Descriptor,
        buf: &[u8],
        dst: SocketAddrV4,
        ctx: &mut Context<'_>,
    ) -> io::Result<usize> {
        match self.socket_mut(fd)?.kind {
            SocketKind::Stream => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "send_to on a stream socket",
            )),
            SocketKind::Datagram => self.udp_send_to(fd, buf, Some(dst), ctx),
        }
    }

    pub fn recv(&mut self, fd: Descriptor, buf: &mut [u8], ctx: &mut Context<'_>) -> io::Result<usize> {
        match self.socket_mut(fd)?.kind {
            SocketKind::Stream => self.tcp_recv(fd, buf, ctx),
            SocketKind::Datagram => self.udp_recv_from(fd, buf, ctx).map(|(n, _)| n),
        }
    }

    pub fn recv_from(
        &mut self,
        fd: Descriptor,
        buf: &mut [u8],
        ctx: &mut Context<'_>,
    ) -> io::Result<(usize, SocketAddrV4)> {
        match self.socket_mut(fd)?.kind {
            SocketKind::Stream => {
                let n = self.tcp_recv(fd, buf, ctx)?;
                let peer = self.peer_addr(fd).unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
                Ok((n, peer))
            }
            SocketKind::Datagram => self.udp_recv_from(fd, buf, ctx),
        }
    }

    pub fn connect(&mut self, fd: Descriptor, remote: SocketAddrV4, ctx: &mut Context<'_>) -> io::Result<()> {
        match self.socket_mut(fd)?.kind {
            SocketKind::Stream => self.tcp_connect(fd, remote, ctx),
            SocketKind::Datagram => self.udp_connect(fd, remote),
        }
    }

    /// Closes a socket. Closing an already destroyed descriptor succeeds.
    pub fn close(&mut self, fd: Descriptor, ctx: &mut Context<'_>) -> io::Result<()> {
        if self.destroyed.contains(&fd) {
            return Ok(());
        }
        match self.socket_mut(fd)?.kind {
            SocketKind::Stream => self.tcp_close(fd, ctx),
            SocketKind::Datagram => self.destroy(fd, ctx),
        }
        Ok(())
    }

    /// Replaces the readiness mask the application polls `fd` for.
    pub fn set_polling(&mut self, fd: Descriptor, mask: Readiness, ctx: &mut Context<'_>) -> io::Result<()> {
        self.socket_mut(fd)?
            .buffers
            .notifier_mut()
            .set_polling(mask, ctx);
        Ok(())
    }

    pub fn add_interest(&mut self, fd: Descriptor, kind: Readiness, ctx: &mut Context<'_>) -> io::Result<()> {
        self.socket_mut(fd)?
            .buffers
            .notifier_mut()
            .add_interest(kind, ctx);
        Ok(())
    }

    pub fn remove_interest(&mut self, fd: Descriptor, kind: Readiness) -> io::Result<()> {
        self.socket_mut(fd)?
            .buffers
            .notifier_mut()
            .remove_interest(kind);
        Ok(())
    }

    fn record_ready(&mut self, fd: Descriptor, kind: Readiness) {
        let entry = self.waiter.entry(fd).or_default();
        *entry = *entry | kind;
    }

    /// Drains readiness reported since the last call, by descriptor.
    pub fn take_ready(&mut self) -> Vec<(Descriptor, Readiness)> {
        std::mem::take(&mut self.waiter).into_iter().collect()
    }

    /// Removes a socket for good.
    ///
    /// Children of a listener go with it. A child leaving its listener's
    /// table may complete the listener's own deferred close.
    pub(crate) fn destroy(&mut self, fd: Descriptor, ctx: &mut Context<'_>) {
        let Some(socket) = self.sockets.remove(&fd) else {
            return;
        };
        self.destroyed.insert(fd);
        self.waiter.remove(&fd);
        self.governor.forget(fd);

        if let Some(binding) = socket.binding {
            if self.ethernet_ports.get(&binding.port) == Some(&fd) {
                self.ethernet_ports.remove(&binding.port);
            }
            if self.loopback_ports.get(&binding.port) == Some(&fd) {
                self.loopback_ports.remove(&binding.port);
            }
        }
        if socket.tcp().is_some_and(|cb| cb.counted) {
            TCP_CONNS.dec();
        }
        debug!("{}: fd {} destroyed", self.addr, fd);

        if let Some(children) = &socket.children {
            for child in children.all() {
                self.destroy(child, ctx);
            }
        }

        let (Some(parent), Some(cb)) = (socket.parent, socket.tcp()) else {
            return;
        };
        let key = child_key(cb.pair.remote);
        let Some(listener) = self.sockets.get_mut(&parent) else {
            return;
        };
        let Some(table) = listener.children.as_mut() else {
            return;
        };
        table.remove(key);
        let pending = table.has_pending();
        let finished = listener.do_delete && table.is_empty();
        listener.buffers.set_read_signal(pending, ctx);
        if finished {
            self.destroy(parent, ctx);
        }
    }
}
