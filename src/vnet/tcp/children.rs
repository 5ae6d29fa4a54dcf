use std::{
    collections::{HashMap, VecDeque},
    hash::{Hash, Hasher},
    net::SocketAddrV4,
};

use rustc_hash::FxHasher;

use crate::vnet::socket::Descriptor;

pub(crate) type ChildKey = u64;

/// Key of the child a listener spawned for `remote`.
///
/// Different peers may collide; callers compare the stored peer address
/// before trusting a hit.
pub(crate) fn child_key(remote: SocketAddrV4) -> ChildKey {
    let mut hasher = FxHasher::default();
    remote.ip().octets().hash(&mut hasher);
    remote.port().hash(&mut hasher);
    hasher.finish()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChildStage {
    /// Handshake in progress.
    Incomplete,
    /// Established, waiting for accept.
    Pending,
    Accepted,
}

/// Children of a listening socket, grouped by handshake progress.
///
/// Incomplete and pending children count against the backlog; accepted
/// ones do not.
pub(crate) struct ChildTable {
    backlog: usize,
    incomplete: HashMap<ChildKey, Descriptor>,
    pending: HashMap<ChildKey, Descriptor>,
    pending_order: VecDeque<ChildKey>,
    accepted: HashMap<ChildKey, Descriptor>,
}

impl ChildTable {
    pub(crate) fn new(backlog: usize) -> Self {
        Self {
            backlog: backlog.max(1),
            incomplete: HashMap::new(),
            pending: HashMap::new(),
            pending_order: VecDeque::new(),
            accepted: HashMap::new(),
        }
    }

    pub(crate) fn set_backlog(&mut self, backlog: usize) {
        self.backlog = backlog.max(1);
    }

    pub(crate) fn is_full(&self) -> bool {
        self.incomplete.len() + self.pending.len() >= self.backlog
    }

    pub(crate) fn lookup(&self, key: ChildKey) -> Option<(Descriptor, ChildStage)> {
        if let Some(fd) = self.incomplete.get(&key) {
            return Some((*fd, ChildStage::Incomplete));
        }
        if let Some(fd) = self.pending.get(&key) {
            return Some((*fd, ChildStage::Pending));
        }
        self.accepted
            .get(&key)
            .map(|fd| (*fd, ChildStage::Accepted))
    }

    /// Registers a new child. Fails on a taken key or a full backlog.
    pub(crate) fn insert(&mut self, key: ChildKey, fd: Descriptor) -> bool {
        if self.is_full() || self.lookup(key).is_some() {
            return false;
        }
        self.incomplete.insert(key, fd);
        true
    }

    /// Moves a child whose handshake completed to the accept queue.
    pub(crate) fn promote(&mut self, key: ChildKey) -> bool {
        let Some(fd) = self.incomplete.remove(&key) else {
            return false;
        };
        self.pending.insert(key, fd);
        self.pending_order.push_back(key);
        true
    }

    /// Hands out the oldest established child.
    pub(crate) fn accept(&mut self) -> Option<Descriptor> {
        while let Some(key) = self.pending_order.pop_front() {
            if let Some(fd) = self.pending.remove(&key) {
                self.accepted.insert(key, fd);
                return Some(fd);
            }
        }
        None
    }

    pub(crate) fn remove(&mut self, key: ChildKey) -> Option<Descriptor> {
        if let Some(fd) = self.incomplete.remove(&key) {
            return Some(fd);
        }
        if let Some(fd) = self.pending.remove(&key) {
            self.pending_order.retain(|k| *k != key);
            return Some(fd);
        }
        self.accepted.remove(&key)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn accepted_count(&self) -> usize {
        self.accepted.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.incomplete.is_empty() && self.pending.is_empty() && self.accepted.is_empty()
    }

    /// Children the application never accepted.
    pub(crate) fn unaccepted(&self) -> Vec<Descriptor> {
        let mut fds: Vec<Descriptor> = self
            .incomplete
            .values()
            .chain(self.pending.values())
            .copied()
            .collect();
        fds.sort_unstable();
        fds
    }

    pub(crate) fn all(&self) -> Vec<Descriptor> {
        let mut fds = self.unaccepted();
        fds.extend(self.accepted.values().copied());
        fds
    }
}
