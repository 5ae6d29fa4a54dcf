use std::{fmt::Display, net::Ipv4Addr};

/// Virtual IPv4 address of a simulated host.
///
/// The 32 bits are packed as `node:16 | worker:8 | machine:8`, most
/// significant first, so the dotted quad of an address reads the node
/// identifier in its first two octets. Node identifiers whose high byte
/// would land in a reserved range (0.x, 127.x and 255.x) are never handed
/// out, which keeps allocated addresses clear of "this network", loopback
/// and broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddr(u32);

impl VirtualAddr {
    pub const ANY: VirtualAddr = VirtualAddr(0);
    pub const LOOPBACK: VirtualAddr = VirtualAddr(0x7f00_0001);

    /// Packs identifiers into an address, rejecting reserved high bytes.
    pub fn pack(machine: u8, worker: u8, node: u16) -> Option<Self> {
        if is_reserved((node >> 8) as u8) {
            return None;
        }
        Some(Self(
            (node as u32) << 16 | (worker as u32) << 8 | machine as u32,
        ))
    }

    pub fn machine(&self) -> u8 {
        self.0 as u8
    }

    pub fn worker(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn node(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// The worker this address is simulated on.
    pub fn worker_id(&self) -> WorkerId {
        WorkerId::new(self.machine(), self.worker())
    }

    pub fn is_loopback(&self) -> bool {
        self.to_ipv4().is_loopback()
    }

    pub fn is_any(&self) -> bool {
        self.0 == 0
    }

    pub fn to_ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.0)
    }

    pub fn to_bits(&self) -> u32 {
        self.0
    }
}

impl From<Ipv4Addr> for VirtualAddr {
    fn from(ip: Ipv4Addr) -> Self {
        Self(u32::from(ip))
    }
}

impl From<VirtualAddr> for Ipv4Addr {
    fn from(addr: VirtualAddr) -> Self {
        addr.to_ipv4()
    }
}

impl Display for VirtualAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.to_ipv4().fmt(f)
    }
}

fn is_reserved(high: u8) -> bool {
    matches!(high, 0x00 | 0x7f | 0xff)
}

/// Where an address lives relative to the local worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    SameUnit,
    SameMachine,
    DifferentMachine,
}

/// Identity of one execution unit: a worker thread on a machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub machine: u8,
    pub worker: u8,
}

impl WorkerId {
    pub fn new(machine: u8, worker: u8) -> Self {
        Self { machine, worker }
    }

    pub fn locate(&self, addr: VirtualAddr) -> Location {
        if addr.machine() != self.machine {
            Location::DifferentMachine
        } else if addr.worker() != self.worker {
            Location::SameMachine
        } else {
            Location::SameUnit
        }
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}/{}", self.machine, self.worker))
    }
}

/// Hands out node identifiers for one worker in increasing order.
pub struct AddressAllocator {
    worker: WorkerId,
    next_node: u32,
}

impl AddressAllocator {
    pub fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            next_node: 0x0100,
        }
    }

    /// Returns the next free address, or `None` once the node space is spent.
    pub fn allocate(&mut self) -> Option<VirtualAddr> {
        while self.next_node <= u16::MAX as u32 {
            let node = self.next_node as u16;
            self.next_node += 1;
            if let Some(addr) = VirtualAddr::pack(self.worker.machine, self.worker.worker, node) {
                return Some(addr);
            }
            // skip the rest of the reserved block
            self.next_node = (self.next_node + 0xff) & !0xff;
        }
        None
    }
}
