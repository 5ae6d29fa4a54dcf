//! Stream sockets.
//!
//! The per-connection state machine lives in [`stream`]; this module hooks
//! it into the host: demultiplexing arrivals to listeners and their
//! children, retransmit requests, close notices and the socket calls.

use std::{
    io,
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

use bytes::Bytes;
use log::{debug, error, trace};

mod children;
mod congestion;
mod stream;
mod types;

pub(crate) use children::{child_key, ChildTable};
pub(crate) use stream::{CloseAction, ControlBlock, SegmentSink, Verdict};
pub use types::{AddrPair, State};

use super::{
    host::{bad_descriptor, would_block, Stack},
    notify::Activity,
    packet::{Packet, PacketHeader, PacketRc, TcpFlags, TcpHeader},
    socket::{Descriptor, Engine, Socket, SocketKind},
};
use crate::{
    prometheus::metrics::{TCP_CONNS, TCP_RX_BYTES, TCP_TX_BYTES},
    vci::{
        address::VirtualAddr,
        event::{CloseNotice, RetransmitRequest},
        Context,
    },
};

/// Headroom applied on top of the bandwidth-delay product.
const AUTOTUNE_FACTOR: f64 = 1.25;

impl SegmentSink for Context<'_> {
    fn request_retransmit(&mut self, header: &PacketHeader, payload_len: usize) {
        Context::request_retransmit(self, header, payload_len);
    }

    fn schedule_delayed_ack(&mut self, fd: Descriptor, delay: Duration) {
        Context::schedule_delayed_ack(self, fd, delay);
    }
}

/// Buffer size covering `rtt` at `kibps`, `None` when the link is unlimited.
fn tuned_size(rtt: Duration, kibps: u64, mss: usize) -> Option<usize> {
    if kibps == 0 {
        return None;
    }
    let bytes = rtt.as_secs_f64() * (kibps * 1024) as f64 * AUTOTUNE_FACTOR;
    Some((bytes as usize).max(2 * mss))
}

impl Stack {
    /// Turns a stream socket into a listener. Calling it again only
    /// changes the backlog.
    pub fn listen(&mut self, fd: Descriptor, backlog: usize) -> io::Result<()> {
        let socket = self.socket_mut(fd)?;
        if socket.kind != SocketKind::Stream {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a stream socket"));
        }
        if let Some(table) = socket.children.as_mut() {
            table.set_backlog(backlog);
            return Ok(());
        }
        if socket.state() != State::Closed || socket.error.is_some() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket in use"));
        }
        if socket.binding.is_none() {
            self.bind(fd, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        }

        let socket = self.socket_mut(fd)?;
        socket.children = Some(ChildTable::new(backlog));
        if let Some(cb) = socket.tcp_mut() {
            cb.state = State::Listen;
        }
        debug!("{}: fd {} listening, backlog {}", self.addr, fd, backlog);
        Ok(())
    }

    /// Takes the oldest established connection off a listener.
    pub fn accept(&mut self, fd: Descriptor, ctx: &mut Context<'_>) -> io::Result<(Descriptor, SocketAddrV4)> {
        let socket = self.socket_mut(fd)?;
        let Some(table) = socket.children.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket is not listening"));
        };
        let child = table.accept().ok_or_else(would_block)?;
        let pending = table.has_pending();
        socket.buffers.set_read_signal(pending, ctx);

        let child_socket = self.socket_mut(child)?;
        child_socket.buffers.notifier_mut().mark_active(ctx);
        let peer = child_socket
            .tcp()
            .map(|cb| cb.pair.remote)
            .ok_or_else(|| bad_descriptor(child))?;
        debug!("{}: fd {} accepted fd {} from {}", self.addr, fd, child, peer);
        Ok((child, peer))
    }

    pub(crate) fn tcp_connect(&mut self, fd: Descriptor, remote: SocketAddrV4, ctx: &mut Context<'_>) -> io::Result<()> {
        let socket = self.socket_mut(fd)?;
        if socket.is_listening() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket is listening"));
        }
        match socket.state() {
            State::Closed if socket.error.is_none() => {}
            State::SynSent | State::SynRcvd => {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "connection in progress"))
            }
            _ => return Err(io::Error::new(io::ErrorKind::AlreadyExists, "socket already used")),
        }

        let port = self.autobind(fd, &remote)?;
        let local = self.local_endpoint(&remote, port);
        self.autotune(fd, &remote, ctx);

        let socket = self.socket_mut(fd)?;
        let Socket { engine, buffers, .. } = socket;
        if let Engine::Tcp(cb) = engine {
            cb.connect(AddrPair::new(local, remote), buffers, ctx);
        }
        debug!("{}: fd {} connecting {} -> {}", self.addr, fd, local, remote);
        self.ready_send(fd, ctx);
        Ok(())
    }

    pub(crate) fn tcp_send(&mut self, fd: Descriptor, buf: &[u8], ctx: &mut Context<'_>) -> io::Result<usize> {
        let socket = self.socket_mut(fd)?;
        if let Some(kind) = socket.error {
            return Err(kind.into());
        }
        let Socket { engine, buffers, .. } = socket;
        let Engine::Tcp(cb) = engine else {
            return Err(bad_descriptor(fd));
        };
        match cb.state {
            State::Established => {}
            State::SynSent | State::SynRcvd => return Err(would_block()),
            State::Closing | State::CloseWait => return Err(io::ErrorKind::BrokenPipe.into()),
            _ => return Err(io::ErrorKind::NotConnected.into()),
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let n = cb.write(buf, buffers, ctx);
        if n == 0 {
            return Err(would_block());
        }
        TCP_TX_BYTES.inc_by(n as u64);
        self.ready_send(fd, ctx);
        Ok(n)
    }

    /// Reads stream data. Returns `Ok(0)` at end of stream; reaching it in
    /// `CloseWait` also closes this side.
    pub(crate) fn tcp_recv(&mut self, fd: Descriptor, buf: &mut [u8], ctx: &mut Context<'_>) -> io::Result<usize> {
        let socket = self.socket_mut(fd)?;
        if socket.is_listening() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket is listening"));
        }
        let Socket {
            engine,
            buffers,
            error,
            ..
        } = socket;
        let Engine::Tcp(cb) = engine else {
            return Err(bad_descriptor(fd));
        };

        let n = buffers.read(buf, ctx);
        if n > 0 {
            TCP_RX_BYTES.inc_by(n as u64);
            if cb.on_read(buffers, ctx) {
                self.ready_send(fd, ctx);
            }
            return Ok(n);
        }
        if let Some(kind) = *error {
            return Err(kind.into());
        }
        if cb.at_end() {
            if cb.state == State::CloseWait {
                let action = cb.close(buffers, ctx);
                self.apply_close(fd, action, ctx);
            }
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        match cb.state {
            State::Closed | State::Listen => Err(io::ErrorKind::NotConnected.into()),
            _ => Err(would_block()),
        }
    }

    pub(crate) fn tcp_close(&mut self, fd: Descriptor, ctx: &mut Context<'_>) {
        let Some(socket) = self.sockets.get_mut(&fd) else {
            return;
        };
        if socket.is_listening() {
            self.close_listener(fd, ctx);
            return;
        }
        let Socket { engine, buffers, .. } = socket;
        let Engine::Tcp(cb) = engine else {
            return;
        };
        let action = cb.close(buffers, ctx);
        self.apply_close(fd, action, ctx);
    }

    fn apply_close(&mut self, fd: Descriptor, action: CloseAction, ctx: &mut Context<'_>) {
        trace!("{}: fd {} close action {:?}", self.addr, fd, action);
        let end = match action {
            CloseAction::Destroy => {
                self.destroy(fd, ctx);
                return;
            }
            CloseAction::Linger => None,
            CloseAction::Notify(end) | CloseAction::NotifyAndDestroy(end) => Some(end),
        };

        let Some(socket) = self.sockets.get_mut(&fd) else {
            return;
        };
        if let (Some(end), Some(cb)) = (end, socket.tcp()) {
            ctx.schedule_close(cb.pair.local, cb.pair.remote, end, cb.rcv_nxt);
        }
        if matches!(action, CloseAction::NotifyAndDestroy(_)) {
            self.destroy(fd, ctx);
            return;
        }
        socket.do_delete = true;
        socket.buffers.notifier_mut().mark_inactive();
    }

    /// Unaccepted children go at once; the listener itself stays until
    /// its accepted children are gone.
    fn close_listener(&mut self, fd: Descriptor, ctx: &mut Context<'_>) {
        let Some(socket) = self.sockets.get_mut(&fd) else {
            return;
        };
        socket.do_delete = true;
        socket.buffers.notifier_mut().mark_inactive();
        let Some(table) = socket.children.as_ref() else {
            return;
        };
        let unaccepted = table.unaccepted();
        let accepted = table.accepted_count();
        debug!(
            "{}: closing listener fd {}, dropping {} children, {} accepted remain",
            self.addr,
            fd,
            unaccepted.len(),
            accepted
        );

        for child in unaccepted {
            self.destroy(child, ctx);
        }
        if accepted == 0 {
            self.destroy(fd, ctx);
        }
    }

    /// Sizes a connection's buffers for the path to `remote`.
    ///
    /// Loopback connections get the fixed loopback allowance. Otherwise
    /// each direction covers the round trip at the slower end's bandwidth.
    pub(crate) fn autotune(&mut self, fd: Descriptor, remote: &SocketAddrV4, ctx: &mut Context<'_>) {
        let config = self.config.clone();
        let (recv, send) = if remote.ip().is_loopback() {
            (config.loopback_buffer, config.loopback_buffer)
        } else if !config.autotune {
            (config.recv_buffer, config.send_buffer)
        } else {
            let peer = VirtualAddr::from(*remote.ip());
            let rtt = ctx.round_trip(peer);
            let theirs = ctx.bandwidth_of(peer).unwrap_or(self.bandwidth);
            let ours = self.bandwidth;
            (
                tuned_size(rtt, theirs.up_kibps.min(ours.down_kibps), config.mss)
                    .unwrap_or(config.recv_buffer),
                tuned_size(rtt, ours.up_kibps.min(theirs.down_kibps), config.mss)
                    .unwrap_or(config.send_buffer),
            )
        };

        if let Some(socket) = self.sockets.get_mut(&fd) {
            socket.buffers.set_capacity(recv, send, ctx);
            trace!("{}: fd {} buffers recv {} send {}", self.addr, fd, recv, send);
        }
    }

    /// Answers a segment nobody can take with a reset.
    fn reply_reset(&self, header: &PacketHeader, ctx: &mut Context<'_>) {
        let Some(tcp) = header.tcp else {
            return;
        };
        if tcp.flags.contains(TcpFlags::RST) {
            return;
        }
        trace!("{}: reset {} -> {}", self.addr, header.dst, header.src);
        let reset = Packet::new_tcp(
            header.dst,
            header.src,
            TcpHeader {
                seq: tcp.ack,
                ack: tcp.seq,
                window: 0,
                flags: TcpFlags::RST,
            },
            Bytes::new(),
        );
        ctx.schedule_packet(reset);
    }

    /// Socket owning the connection `local` <-> `remote`.
    pub(crate) fn demux(&self, local: &SocketAddrV4, remote: &SocketAddrV4) -> Option<Descriptor> {
        let fd = self.lookup_port(local.port(), local.ip().is_loopback())?;
        let socket = self.sockets.get(&fd)?;
        let (fd, cb) = match &socket.children {
            Some(table) => {
                let (child, _) = table.lookup(child_key(*remote))?;
                (child, self.sockets.get(&child)?.tcp()?)
            }
            None => (fd, socket.tcp()?),
        };
        (cb.pair.remote == *remote).then_some(fd)
    }

    pub(crate) fn tcp_arrival(&mut self, packet: PacketRc, ctx: &mut Context<'_>) {
        let Some(header) = packet.header() else {
            return;
        };
        let Some(tcp) = header.tcp else {
            error!("{}: tcp packet without tcp header from {}", self.addr, header.src);
            return;
        };

        let loopback = header.dst.ip().is_loopback();
        let Some(fd) = self.lookup_port(header.dst.port(), loopback) else {
            debug!("{}: nothing on {} for {}", self.addr, header.dst, header.src);
            self.reply_reset(&header, ctx);
            return;
        };

        if let Some(target) = self.route(fd, &header, &tcp, ctx) {
            self.deliver_tcp(target, &packet, &header, ctx);
        }
    }

    /// Picks the socket an arrival belongs to, spawning a child for a new
    /// connection on a listener.
    fn route(
        &mut self,
        fd: Descriptor,
        header: &PacketHeader,
        tcp: &TcpHeader,
        ctx: &mut Context<'_>,
    ) -> Option<Descriptor> {
        let socket = self.sockets.get(&fd)?;
        let Some(table) = &socket.children else {
            match socket.tcp() {
                Some(cb) if cb.state != State::Closed && cb.pair.remote == header.src => return Some(fd),
                _ => {
                    debug!("{}: fd {} not connected to {}", self.addr, fd, header.src);
                    self.reply_reset(header, ctx);
                    return None;
                }
            }
        };

        let key = child_key(header.src);
        if let Some((child, _)) = table.lookup(key) {
            match self.sockets.get(&child).and_then(Socket::tcp) {
                Some(cb) if cb.pair.remote == header.src => return Some(child),
                _ => {
                    error!(
                        "{}: listener fd {} has another peer under the key of {}",
                        self.addr, fd, header.src
                    );
                    return None;
                }
            }
        }

        let opening = tcp.flags.contains(TcpFlags::SYN | TcpFlags::CON) && !tcp.flags.contains(TcpFlags::ACK);
        if !opening || socket.do_delete || table.is_full() {
            debug!("{}: listener fd {} refuses {} ({})", self.addr, fd, header.src, tcp.flags);
            self.reply_reset(header, ctx);
            return None;
        }
        self.spawn_child(fd, header, ctx)
    }

    fn spawn_child(&mut self, listener: Descriptor, header: &PacketHeader, ctx: &mut Context<'_>) -> Option<Descriptor> {
        let child = self.insert_socket(SocketKind::Stream, Activity::Inactive, ctx);
        let socket = self.sockets.get_mut(&child)?;
        socket.parent = Some(listener);
        socket.tcp_mut()?.listen_for(AddrPair::new(header.dst, header.src));

        let table = self.sockets.get_mut(&listener)?.children.as_mut()?;
        if !table.insert(child_key(header.src), child) {
            error!("{}: listener fd {} could not register child", self.addr, listener);
            self.sockets.remove(&child);
            return None;
        }
        self.autotune(child, &header.src, ctx);
        debug!("{}: listener fd {} spawned fd {} for {}", self.addr, listener, child, header.src);
        Some(child)
    }

    fn deliver_tcp(&mut self, fd: Descriptor, packet: &PacketRc, header: &PacketHeader, ctx: &mut Context<'_>) {
        let Some(socket) = self.sockets.get_mut(&fd) else {
            return;
        };
        let parent = socket.parent;
        let Socket {
            engine,
            buffers,
            error,
            ..
        } = socket;
        let Engine::Tcp(cb) = engine else {
            return;
        };

        match cb.process(packet, buffers, ctx) {
            Verdict::Continue => {}
            Verdict::Established => {
                if !cb.counted {
                    cb.counted = true;
                    TCP_CONNS.inc();
                }
                debug!("{}: fd {} established {}", self.addr, fd, cb.pair);
                if let Some(parent) = parent {
                    self.promote_child(parent, &header.src, ctx);
                }
            }
            Verdict::Refused => {
                debug!("{}: fd {} refused by {}", self.addr, fd, header.src);
                *error = Some(io::ErrorKind::ConnectionRefused);
            }
            Verdict::Reset if parent.is_some() => {
                self.destroy(fd, ctx);
                return;
            }
            Verdict::Reset => {
                debug!("{}: fd {} reset by {}", self.addr, fd, header.src);
                *error = Some(io::ErrorKind::ConnectionReset);
            }
            Verdict::Teardown => {
                ctx.schedule_close(cb.pair.local, cb.pair.remote, cb.snd_end, cb.rcv_nxt);
                self.destroy(fd, ctx);
                return;
            }
            Verdict::Destroy => {
                self.destroy(fd, ctx);
                return;
            }
        }

        if self.can_transmit(fd) {
            self.ready_send(fd, ctx);
        }
    }

    fn promote_child(&mut self, listener: Descriptor, remote: &SocketAddrV4, ctx: &mut Context<'_>) {
        let Some(socket) = self.sockets.get_mut(&listener) else {
            return;
        };
        let Some(table) = socket.children.as_mut() else {
            return;
        };
        if table.promote(child_key(*remote)) {
            socket.buffers.set_read_signal(true, ctx);
        }
    }

    pub(crate) fn on_retransmit(&mut self, request: &RetransmitRequest, ctx: &mut Context<'_>) {
        let Some(fd) = self.demux(&request.src, &request.dst) else {
            trace!("{}: retransmit for vanished connection {} -> {}", self.addr, request.src, request.dst);
            return;
        };
        let Some(socket) = self.sockets.get_mut(&fd) else {
            return;
        };
        let Socket { engine, buffers, .. } = socket;
        let Engine::Tcp(cb) = engine else {
            return;
        };
        if cb.retransmit(request, buffers, ctx) {
            self.ready_send(fd, ctx);
        }
    }

    pub(crate) fn on_close_notice(&mut self, notice: &CloseNotice, ctx: &mut Context<'_>) {
        let Some(fd) = self.demux(&notice.dst, &notice.src) else {
            trace!("{}: close notice for vanished connection {}", self.addr, notice.dst);
            return;
        };
        let Some(socket) = self.sockets.get_mut(&fd) else {
            return;
        };
        let Socket { engine, buffers, .. } = socket;
        let Engine::Tcp(cb) = engine else {
            return;
        };
        match cb.on_close_notice(notice.end, notice.ack, buffers, ctx) {
            Verdict::Teardown => {
                ctx.schedule_close(cb.pair.local, cb.pair.remote, cb.snd_end, cb.rcv_nxt);
                self.destroy(fd, ctx);
            }
            Verdict::Destroy => self.destroy(fd, ctx),
            // the notice may have acknowledged data and opened the window
            _ => self.ready_send(fd, ctx),
        }
    }

    pub(crate) fn on_delayed_ack(&mut self, fd: Descriptor, ctx: &mut Context<'_>) {
        let Some(socket) = self.sockets.get_mut(&fd) else {
            return;
        };
        let Socket { engine, buffers, .. } = socket;
        let Engine::Tcp(cb) = engine else {
            return;
        };
        if cb.on_delayed_ack(buffers, ctx) {
            self.ready_send(fd, ctx);
        }
    }
}
