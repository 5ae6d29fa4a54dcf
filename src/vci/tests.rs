use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

use super::*;
use crate::vnet::SocketKind;
use oracle::StaticModel;

fn quiet() -> Config {
    Config {
        poll_interval: None,
        ..Config::default()
    }
}

fn worker(model: StaticModel) -> (Vci, VirtualAddr, VirtualAddr) {
    let mut vci = Vci::new(quiet(), WorkerId::new(1, 0), Arc::new(model), Registry::new());
    let a = vci.add_host("a", 1, Bandwidth::symmetric(0)).unwrap();
    let b = vci.add_host("b", 2, Bandwidth::symmetric(0)).unwrap();
    (vci, a, b)
}

#[test]
fn test_ties_run_in_push_order() {
    let (mut vci, a, b) = worker(StaticModel::new(Duration::from_millis(100)));
    let at = SimTime::from_millis(5);
    vci.sched.push(at, a, a, EventKind::Poll(7));
    vci.sched.push(at, b, a, EventKind::Poll(8));
    vci.sched.push(at, a, b, EventKind::Poll(9));
    vci.sched.push(SimTime::from_millis(4), a, a, EventKind::Poll(6));

    let mut order = Vec::new();
    while let Some(Reverse(event)) = vci.sched.queue.pop() {
        if let EventKind::Poll(fd) = event.kind {
            order.push(fd);
        }
    }
    assert_eq!(order, vec![6, 7, 8, 9]);
}

#[test]
fn test_cpu_work_delays_queued_events() {
    let (mut vci, a, _) = worker(StaticModel::new(Duration::from_millis(100)));
    vci.sched.push(SimTime::from_millis(10), a, a, EventKind::Poll(42));
    vci.with_host(a, |_, ctx| ctx.charge_cpu(Duration::from_millis(5)));

    // queued before the work was charged: slides back
    assert!(vci.step());
    assert_eq!(
        vci.pending_events(),
        vec![(SimTime::from_millis(15), a, "poll")]
    );
    assert!(vci.step());
    assert!(vci.pending_events().is_empty());
    assert_eq!(vci.now(), SimTime::from_millis(15));

    // queued after it: runs on time
    vci.sched.push(SimTime::from_millis(20), a, a, EventKind::Poll(43));
    assert_eq!(vci.run(), 1);
    assert_eq!(vci.now(), SimTime::from_millis(20));
}

#[test]
fn test_run_until_advances_clock() {
    let (mut vci, a, _) = worker(StaticModel::new(Duration::from_millis(100)));
    vci.sched.push(SimTime::from_millis(3), a, a, EventKind::Poll(1));
    vci.sched.push(SimTime::from_millis(30), a, a, EventKind::Poll(2));

    assert_eq!(vci.run_until(SimTime::from_millis(10)), 1);
    assert_eq!(vci.now(), SimTime::from_millis(10));
    assert_eq!(vci.next_event_time(), Some(SimTime::from_millis(30)));
}

#[test]
fn test_unreliable_path_turns_packets_into_retransmits() {
    let model = StaticModel::new(Duration::from_millis(100)).link(1, 2, Duration::from_millis(10), 0.0);
    let (mut vci, a, b) = worker(model);

    vci.with_host(a, |stack, ctx| {
        let fd = stack.socket(SocketKind::Stream, ctx);
        stack.connect(fd, SocketAddrV4::new(b.to_ipv4(), 80), ctx).unwrap();
    });

    let pending = vci.pending_events();
    assert!(pending.iter().all(|(_, _, kind)| *kind != "packet"));
    assert!(pending
        .iter()
        .any(|(time, dst, kind)| *kind == "retransmit" && *dst == a && *time == SimTime::from_millis(10)));
}

#[test]
fn test_unknown_latency_uses_worst_case() {
    let (mut vci, a, b) = worker(StaticModel::new(Duration::from_millis(100)));

    vci.with_host(a, |stack, ctx| {
        assert_eq!(ctx.latency_to(b), Duration::from_millis(100));
        assert_eq!(ctx.round_trip(a), LOOPBACK_DELAY * 2);
        let fd = stack.socket(SocketKind::Datagram, ctx);
        stack
            .send_to(fd, b"hi", SocketAddrV4::new(b.to_ipv4(), 53), ctx)
            .unwrap();
    });

    assert!(vci
        .pending_events()
        .contains(&(SimTime::from_millis(100), b, "packet")));
}

#[test]
fn test_loopback_packet_arrives_next_tick() {
    let (mut vci, a, _) = worker(StaticModel::new(Duration::from_millis(100)));
    let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7000);

    let (receiver, sender) = vci
        .with_host(a, |stack, ctx| {
            let receiver = stack.socket(SocketKind::Datagram, ctx);
            stack.bind(receiver, target).unwrap();
            let sender = stack.socket(SocketKind::Datagram, ctx);
            assert_eq!(stack.send_to(sender, b"ping", target, ctx).unwrap(), 4);
            (receiver, sender)
        })
        .unwrap();

    assert!(vci
        .pending_events()
        .contains(&(SimTime::ZERO + LOOPBACK_DELAY, a, "packet")));

    vci.run_until(SimTime::from_millis(1));
    vci.with_host(a, |stack, ctx| {
        let mut buf = [0u8; 16];
        let (n, from) = stack.recv_from(receiver, &mut buf, ctx).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(Some(from), stack.local_addr(sender));
        assert!(from.ip().is_loopback());
    });
}

#[test]
fn test_removed_host_discards_events() {
    let (mut vci, a, b) = worker(StaticModel::new(Duration::from_millis(100)));
    vci.sched.push(SimTime::from_millis(1), b, a, EventKind::Poll(3));

    assert!(vci.remove_host(b));
    assert!(!vci.remove_host(b));
    assert!(vci.host(b).is_none());
    assert!(vci.step());
    assert!(vci.pending_events().is_empty());
    assert!(vci.with_host(b, |_, _| ()).is_none());
}
