use std::{fmt::Display, net::SocketAddrV4};

/// Connection state of a socket.
///
/// Stream sockets walk the handshake and teardown states below. There is
/// no FIN exchange: a side that closes tells its peer where its stream
/// ends, so `Closing` and `CloseWait` replace the usual FIN states.
/// Datagram sockets sit in `Udp` for their whole life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    /// This side closed and waits for the peer to close.
    Closing,
    /// The peer closed; this side may still send.
    CloseWait,
    Udp,
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_str())
    }
}

impl State {
    /// Returns the string representation of the state.
    pub fn to_str(&self) -> &'static str {
        match self {
            State::Closed => "Closed",
            State::Listen => "Listen",
            State::SynSent => "SynSent",
            State::SynRcvd => "SynRcvd",
            State::Established => "Established",
            State::Closing => "Closing",
            State::CloseWait => "CloseWait",
            State::Udp => "Udp",
        }
    }

    /// States in which data segments may flow.
    pub fn is_synchronized(&self) -> bool {
        matches!(
            self,
            State::Established | State::Closing | State::CloseWait
        )
    }
}

/// Endpoints of a connection as seen from the local side.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AddrPair {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
}

impl AddrPair {
    pub fn new(local: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self { local, remote }
    }
}

impl Default for AddrPair {
    fn default() -> Self {
        let unspecified = SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0);
        Self::new(unspecified, unspecified)
    }
}

impl Display for AddrPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("({}, {})", self.local, self.remote))
    }
}
