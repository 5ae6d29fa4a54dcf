use std::{
    io,
    net::{Ipv4Addr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use vnetsim::{
    config::{Bandwidth, Config},
    vci::{
        address::{VirtualAddr, WorkerId},
        oracle::StaticModel,
        registry::Registry,
        time::SimTime,
        Context, Vci,
    },
    vnet::{Descriptor, SocketKind, Stack, State},
};

const STEP: Duration = Duration::from_millis(1);

/// Two workers on one machine, each simulating one host, run in lockstep.
struct Pair {
    left: Vci,
    right: Vci,
    a: VirtualAddr,
    b: VirtualAddr,
    clock: SimTime,
}

impl Pair {
    fn new(share_memory: bool) -> Self {
        let config = Config {
            poll_interval: None,
            ..Config::default()
        };
        let model = Arc::new(
            StaticModel::new(Duration::from_millis(100))
                .link(1, 2, Duration::from_millis(10), 1.0)
                .share_memory(share_memory),
        );
        let registry = Registry::new();

        let mut left = Vci::new(config.clone(), WorkerId::new(1, 0), model.clone(), registry.clone());
        let mut right = Vci::new(config, WorkerId::new(1, 1), model, registry.clone());
        left.connect(right.worker(), right.mailbox());
        right.connect(left.worker(), left.mailbox());

        let a = left.add_host("a", 1, Bandwidth::symmetric(0)).unwrap();
        let b = right.add_host("b", 2, Bandwidth::symmetric(0)).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(a.worker_id(), WorkerId::new(1, 0));
        assert_eq!(b.worker_id(), WorkerId::new(1, 1));

        Self {
            left,
            right,
            a,
            b,
            clock: SimTime::ZERO,
        }
    }

    fn advance(&mut self, by: Duration) {
        let end = self.clock + by;
        while self.clock < end {
            self.clock += STEP;
            self.left.run_until(self.clock);
            self.right.run_until(self.clock);
        }
    }

    fn a<R>(&mut self, f: impl FnOnce(&mut Stack, &mut Context<'_>) -> R) -> R {
        let a = self.a;
        self.left.with_host(a, f).unwrap()
    }

    fn b<R>(&mut self, f: impl FnOnce(&mut Stack, &mut Context<'_>) -> R) -> R {
        let b = self.b;
        self.right.with_host(b, f).unwrap()
    }
}

fn read_all(stack: &mut Stack, ctx: &mut Context<'_>, fd: Descriptor, into: &mut Vec<u8>) -> bool {
    let mut buf = [0u8; 2048];
    loop {
        match stack.recv(fd, &mut buf, ctx) {
            Ok(0) => return false,
            Ok(n) => into.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) => panic!("recv failed: {}", e),
        }
    }
}

fn datagram_exchange(share_memory: bool) {
    let mut pair = Pair::new(share_memory);
    let server = SocketAddrV4::new(pair.b.to_ipv4(), 53);

    let listener = pair.b(|stack, ctx| {
        let fd = stack.socket(SocketKind::Datagram, ctx);
        stack
            .bind(fd, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 53))
            .unwrap();
        fd
    });
    let sender = pair.a(|stack, ctx| {
        let fd = stack.socket(SocketKind::Datagram, ctx);
        stack.send_to(fd, b"query", server, ctx).unwrap();
        fd
    });

    pair.advance(Duration::from_millis(5));
    pair.b(|stack, ctx| {
        let mut buf = [0u8; 64];
        let err = stack.recv_from(listener, &mut buf, ctx).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    });

    pair.advance(Duration::from_millis(10));
    let client = pair.a(|stack, _| stack.local_addr(sender)).unwrap();
    pair.b(|stack, ctx| {
        let mut buf = [0u8; 64];
        let (n, from) = stack.recv_from(listener, &mut buf, ctx).unwrap();
        assert_eq!(&buf[..n], b"query");
        assert_eq!(from, client);
        stack.send_to(listener, b"answer", from, ctx).unwrap();
    });

    pair.advance(Duration::from_millis(15));
    pair.a(|stack, ctx| {
        let mut buf = [0u8; 64];
        let (n, from) = stack.recv_from(sender, &mut buf, ctx).unwrap();
        assert_eq!(&buf[..n], b"answer");
        assert_eq!(from, server);
    });
}

fn stream_echo(share_memory: bool) {
    let mut pair = Pair::new(share_memory);
    let remote = SocketAddrV4::new(pair.b.to_ipv4(), 80);

    let listener = pair.b(|stack, ctx| {
        let fd = stack.socket(SocketKind::Stream, ctx);
        stack
            .bind(fd, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 80))
            .unwrap();
        stack.listen(fd, 4).unwrap();
        fd
    });
    let client = pair.a(|stack, ctx| {
        let fd = stack.socket(SocketKind::Stream, ctx);
        stack.connect(fd, remote, ctx).unwrap();
        fd
    });

    pair.advance(Duration::from_millis(40));
    assert_eq!(pair.a(|stack, _| stack.state(client)), Some(State::Established));
    let (child, peer) = pair.b(|stack, ctx| stack.accept(listener, ctx)).unwrap();
    assert_eq!(Some(peer), pair.a(|stack, _| stack.local_addr(client)));

    let message: Vec<u8> = (0..5000).map(|i| (i % 199) as u8).collect();
    let written = pair.a(|stack, ctx| stack.send(client, &message, ctx)).unwrap();
    assert_eq!(written, message.len());

    let mut received = Vec::new();
    let mut echoed = Vec::new();
    for _ in 0..20 {
        pair.advance(Duration::from_millis(10));
        let mut chunk = Vec::new();
        pair.b(|stack, ctx| {
            assert!(read_all(stack, ctx, child, &mut chunk));
            if !chunk.is_empty() {
                stack.send(child, &chunk, ctx).unwrap();
            }
        });
        received.extend_from_slice(&chunk);
        pair.a(|stack, ctx| read_all(stack, ctx, client, &mut echoed));
        if echoed.len() == message.len() {
            break;
        }
    }
    assert_eq!(received, message);
    assert_eq!(echoed, message);

    pair.a(|stack, ctx| stack.close(client, ctx)).unwrap();
    pair.advance(Duration::from_millis(40));
    let open = pair.b(|stack, ctx| read_all(stack, ctx, child, &mut Vec::new()));
    assert!(!open);
}

#[test]
fn test_datagrams_across_workers() {
    datagram_exchange(false);
}

#[test]
fn test_datagrams_across_workers_shared() {
    datagram_exchange(true);
}

#[test]
fn test_stream_echo_across_workers() {
    stream_echo(false);
}

#[test]
fn test_stream_echo_across_workers_shared() {
    stream_echo(true);
}
