use std::sync::Arc;

use dashmap::DashMap;

use super::{address::VirtualAddr, oracle::NetworkId};
use crate::config::Bandwidth;

/// Network attachment of one host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Membership {
    pub network: NetworkId,
    pub bandwidth: Bandwidth,
}

/// Process-wide map of host addresses to their network membership.
///
/// Every worker holds a clone; hosts join when they are created and leave
/// when they are removed.
#[derive(Clone, Default)]
pub struct Registry {
    members: Arc<DashMap<VirtualAddr, Membership>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, addr: VirtualAddr, membership: Membership) {
        self.members.insert(addr, membership);
    }

    pub fn leave(&self, addr: VirtualAddr) {
        self.members.remove(&addr);
    }

    pub fn lookup(&self, addr: VirtualAddr) -> Option<Membership> {
        self.members.get(&addr).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_shared() {
        let registry = Registry::new();
        let other = registry.clone();
        let addr = VirtualAddr::pack(1, 0, 0x0100).unwrap();
        let membership = Membership {
            network: 7,
            bandwidth: Bandwidth::symmetric(1024),
        };

        registry.join(addr, membership);
        assert_eq!(other.lookup(addr), Some(membership));
        assert_eq!(other.len(), 1);

        other.leave(addr);
        assert!(registry.lookup(addr).is_none());
        assert!(registry.is_empty());
    }
}
