//! Virtual network stack of a simulated host.
//!
//! Sockets are backed by [`buffer::SegmentBuffers`] and drive a
//! [`notify::Notifier`] that tells the application when to act. Stream
//! sockets run the segment-counting protocol in [`tcp`]; datagram sockets
//! live in [`udp`]. Everything leaving or entering a host passes through
//! its bandwidth governor.

pub mod buffer;
pub mod host;
pub mod notify;
pub mod packet;
mod pacing;
pub mod socket;
pub mod tcp;
pub mod udp;

pub use host::{Application, Host, Stack};
pub use notify::Readiness;
pub use socket::{Descriptor, SocketKind, TcpInfo};
pub use tcp::State;
