use std::collections::HashMap;

use bytes::Bytes;
use log::warn;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::{address::WorkerId, time::SimTime};
use crate::vnet::packet::PacketRc;
use crate::prometheus::metrics::FRAMES_TX;

/// What travels between workers.
pub enum Delivery {
    /// A serialized event, see [`super::frame`].
    Frame(Bytes),
    /// A packet handed over by reference between workers sharing memory.
    Shared { time: SimTime, packet: PacketRc },
}

pub type Mailbox = UnboundedSender<Delivery>;
pub type Inbox = UnboundedReceiver<Delivery>;

pub fn mailbox() -> (Mailbox, Inbox) {
    unbounded_channel()
}

/// Outbound routes from one worker to its peers.
#[derive(Default)]
pub struct Links {
    peers: HashMap<WorkerId, Mailbox>,
}

impl Links {
    pub fn connect(&mut self, worker: WorkerId, mailbox: Mailbox) {
        self.peers.insert(worker, mailbox);
    }

    pub fn disconnect(&mut self, worker: WorkerId) {
        self.peers.remove(&worker);
    }

    /// Hands a delivery to `worker`. False if there is no live route.
    pub fn send(&self, worker: WorkerId, delivery: Delivery) -> bool {
        let Some(mailbox) = self.peers.get(&worker) else {
            warn!("no route to worker {}", worker);
            return false;
        };
        if mailbox.send(delivery).is_err() {
            warn!("worker {} has shut down", worker);
            return false;
        }
        FRAMES_TX.inc();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_links() {
        let (tx, mut rx) = mailbox();
        let mut links = Links::default();
        let peer = WorkerId::new(1, 1);

        assert!(!links.send(peer, Delivery::Frame(Bytes::from_static(b"x"))));

        links.connect(peer, tx);
        assert!(links.send(peer, Delivery::Frame(Bytes::from_static(b"frame"))));
        match rx.try_recv() {
            Ok(Delivery::Frame(frame)) => assert_eq!(frame.as_ref(), b"frame"),
            _ => panic!("expected a frame"),
        }

        drop(rx);
        assert!(!links.send(peer, Delivery::Frame(Bytes::new())));
        links.disconnect(peer);
    }
}
