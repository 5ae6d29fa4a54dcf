use std::{io, time::Duration};

use super::{
    buffer::SegmentBuffers,
    notify::{Activity, Notifier},
    tcp::{ChildTable, ControlBlock, State},
    udp::UdpEndpoint,
};
use crate::config::Config;

/// Socket handle local to a host. Descriptors are never reused.
pub type Descriptor = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

/// Port a socket is bound to and the interfaces it listens on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    pub port: u16,
    pub ethernet: bool,
    pub loopback: bool,
}

pub(crate) enum Engine {
    Tcp(Box<ControlBlock>),
    Udp(UdpEndpoint),
}

pub(crate) struct Socket {
    pub(crate) kind: SocketKind,
    pub(crate) binding: Option<Binding>,
    /// Listener that spawned this socket.
    pub(crate) parent: Option<Descriptor>,
    /// Closed by the application, destroyed once the engine is done with it.
    pub(crate) do_delete: bool,
    /// Sticky failure returned by later reads and writes.
    pub(crate) error: Option<io::ErrorKind>,
    pub(crate) buffers: SegmentBuffers,
    pub(crate) engine: Engine,
    /// Present on listening sockets.
    pub(crate) children: Option<ChildTable>,
}

impl Socket {
    pub(crate) fn new(fd: Descriptor, kind: SocketKind, config: &Config, activity: Activity) -> Self {
        let notifier = Notifier::new(fd, activity, config.notify_rearm);
        let engine = match kind {
            SocketKind::Stream => Engine::Tcp(Box::new(ControlBlock::new(fd, config))),
            SocketKind::Datagram => Engine::Udp(UdpEndpoint::default()),
        };
        Self {
            kind,
            binding: None,
            parent: None,
            do_delete: false,
            error: None,
            buffers: SegmentBuffers::new(config.recv_buffer, config.send_buffer, notifier),
            engine,
            children: None,
        }
    }

    pub(crate) fn state(&self) -> State {
        match &self.engine {
            Engine::Tcp(cb) => cb.state,
            Engine::Udp(_) => State::Udp,
        }
    }

    pub(crate) fn tcp(&self) -> Option<&ControlBlock> {
        match &self.engine {
            Engine::Tcp(cb) => Some(cb),
            Engine::Udp(_) => None,
        }
    }

    pub(crate) fn tcp_mut(&mut self) -> Option<&mut ControlBlock> {
        match &mut self.engine {
            Engine::Tcp(cb) => Some(cb),
            Engine::Udp(_) => None,
        }
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.children.is_some()
    }
}

/// Point-in-time view of a stream socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpInfo {
    pub state: State,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_end: u32,
    pub snd_wnd: u32,
    pub rcv_nxt: u32,
    pub rcv_wnd: u32,
    pub cwnd: u32,
    pub ssthresh: Option<u32>,
    pub send_buffer: usize,
    pub recv_buffer: usize,
    pub delayed_ack: Option<Duration>,
}
