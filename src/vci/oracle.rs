use std::{collections::HashMap, time::Duration};

use super::address::{Location, VirtualAddr, WorkerId};

/// Identifier of a network (a topology vertex hosts attach to).
pub type NetworkId = u32;

/// Black-box view of the topology consulted by the scheduler.
///
/// Implementations must be shareable across workers; every worker holds
/// the same model behind an `Arc`.
pub trait NetworkModel: Send + Sync {
    /// One-way latency between two networks, `None` when unknown.
    fn latency(&self, src: NetworkId, dst: NetworkId) -> Option<Duration>;

    /// Probability in `[0, 1]` that a packet between the networks arrives.
    fn reliability(&self, src: NetworkId, dst: NetworkId) -> f64;

    /// Latency used when a lookup fails.
    fn worst_case_latency(&self) -> Duration;

    fn relative_location(&self, local: WorkerId, addr: VirtualAddr) -> Location {
        local.locate(addr)
    }

    /// Whether packets to `addr` may be handed over by reference.
    fn can_share_memory(&self, _local: WorkerId, _addr: VirtualAddr) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug)]
struct Link {
    latency: Duration,
    reliability: f64,
}

/// Table-driven model: explicit symmetric links plus an optional default.
pub struct StaticModel {
    links: HashMap<(NetworkId, NetworkId), Link>,
    fallback: Option<Link>,
    worst_case: Duration,
    shared_memory: bool,
}

impl StaticModel {
    pub fn new(worst_case: Duration) -> Self {
        Self {
            links: HashMap::new(),
            fallback: None,
            worst_case,
            shared_memory: false,
        }
    }

    /// Adds a link in both directions.
    pub fn link(mut self, a: NetworkId, b: NetworkId, latency: Duration, reliability: f64) -> Self {
        let link = Link {
            latency,
            reliability: reliability.clamp(0.0, 1.0),
        };
        self.links.insert((a, b), link);
        self.links.insert((b, a), link);
        self
    }

    /// Applies to every pair without an explicit link.
    pub fn default_link(mut self, latency: Duration, reliability: f64) -> Self {
        self.fallback = Some(Link {
            latency,
            reliability: reliability.clamp(0.0, 1.0),
        });
        self
    }

    pub fn share_memory(mut self, enabled: bool) -> Self {
        self.shared_memory = enabled;
        self
    }

    fn lookup(&self, src: NetworkId, dst: NetworkId) -> Option<Link> {
        self.links.get(&(src, dst)).copied().or(self.fallback)
    }
}

impl NetworkModel for StaticModel {
    fn latency(&self, src: NetworkId, dst: NetworkId) -> Option<Duration> {
        self.lookup(src, dst).map(|link| link.latency)
    }

    fn reliability(&self, src: NetworkId, dst: NetworkId) -> f64 {
        self.lookup(src, dst).map_or(1.0, |link| link.reliability)
    }

    fn worst_case_latency(&self) -> Duration {
        self.worst_case
    }

    fn can_share_memory(&self, local: WorkerId, addr: VirtualAddr) -> bool {
        self.shared_memory && self.relative_location(local, addr) == Location::SameMachine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_model() {
        let model = StaticModel::new(Duration::from_millis(500))
            .link(1, 2, Duration::from_millis(20), 0.9)
            .share_memory(true);

        assert_eq!(model.latency(2, 1), Some(Duration::from_millis(20)));
        assert_eq!(model.reliability(1, 2), 0.9);
        assert_eq!(model.latency(1, 3), None);
        assert_eq!(model.reliability(1, 3), 1.0);

        let model = model.default_link(Duration::from_millis(5), 2.0);
        assert_eq!(model.latency(1, 3), Some(Duration::from_millis(5)));
        assert_eq!(model.reliability(1, 3), 1.0);

        let local = WorkerId::new(1, 0);
        let sibling = VirtualAddr::pack(1, 1, 0x0100).unwrap();
        let remote = VirtualAddr::pack(2, 0, 0x0100).unwrap();
        assert!(model.can_share_memory(local, sibling));
        assert!(!model.can_share_memory(local, remote));
    }
}
