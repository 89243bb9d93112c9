//! End-to-end mesh tests: typed messages, bulk transfers in every flavor,
//! pool accounting under load, and connection-loss behavior.
//!
//! Each test runs its own isolated fabric; nodes start in id order, as the
//! mesh bring-up expects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use meshmsg::{BulkMode, Error, MeshConfig, Messenger, PoolKind};
use softib::Network;

fn start_in_order(nodes: &[Arc<Messenger>]) {
    let mut handles = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        let node = node.clone();
        handles.push(thread::spawn(move || node.start().unwrap()));
        // Inbound connects are matched to peers in id order.
        if i + 1 < nodes.len() {
            thread::sleep(Duration::from_millis(150));
        }
    }
    for h in handles {
        h.join().unwrap();
    }
}

fn two_nodes(addrs: &[&str]) -> (Network, Arc<Messenger>, Arc<Messenger>) {
    let network = Network::new();
    let cfg = MeshConfig::new(addrs).unwrap();
    let m0 = Arc::new(Messenger::new(&network, addrs[0].parse().unwrap(), cfg.clone()).unwrap());
    let m1 = Arc::new(Messenger::new(&network, addrs[1].parse().unwrap(), cfg).unwrap());
    (network, m0, m1)
}

#[test]
fn two_node_small_message() {
    let (_network, m0, m1) = two_nodes(&["10.0.1.1", "10.0.1.2"]);

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    m1.register_handler(7, move |d| {
        let hdr = d.header();
        tx.lock()
            .unwrap()
            .send((d.from_node(), hdr.total_size, d.payload().to_vec()))
            .unwrap();
    });

    start_in_order(&[m0.clone(), m1.clone()]);

    m0.send(1, 7, b"ping").unwrap();

    let (from, total, payload) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(from, 0);
    assert_eq!(total as usize, 12 + 4);
    assert_eq!(payload, vec![0x70, 0x69, 0x6e, 0x67]);

    // The receive item returns to the posted pool and the staging ring
    // drains once the send is confirmed.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(m1.recv_counts(0).unwrap(), (128, 0));
    assert_eq!(m0.staging_usage(), 0);
}

#[test]
fn local_delivery_dispatches_without_the_fabric() {
    let network = Network::new();
    let cfg = MeshConfig::new(&["10.0.10.1", "10.0.10.2"]).unwrap();
    let m0 = Arc::new(Messenger::new(&network, "10.0.10.1".parse().unwrap(), cfg).unwrap());

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    m0.register_handler(40, move |d| {
        tx.lock()
            .unwrap()
            .send((d.from_node(), d.payload().to_vec()))
            .unwrap();
    });

    // No mesh needed: local deliveries bypass the fabric entirely.
    m0.deliver_local(40, b"self");
    let (from, payload) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(from, 0);
    assert_eq!(payload, b"self");
}

#[test]
fn self_send_is_rejected() {
    let (_network, m0, m1) = two_nodes(&["10.0.2.1", "10.0.2.2"]);
    start_in_order(&[m0.clone(), m1.clone()]);

    match m0.send(0, 7, b"loop") {
        Err(Error::InvalidPeer(0)) => {}
        other => panic!("expected InvalidPeer, got {:?}", other),
    }
}

#[test]
fn acknowledged_fetch_delivers_and_echoes_slot() {
    let (_network, m0, m1) = two_nodes(&["10.0.3.1", "10.0.3.2"]);

    // Responder: deliver 8192 bytes of 0xAB, record the slot it saw.
    let (slot_tx, slot_rx) = mpsc::channel();
    let slot_tx = Mutex::new(slot_tx);
    let m1c = m1.clone();
    m1.register_handler(10, move |d| {
        let rh = d.rdma_header().unwrap();
        slot_tx.lock().unwrap().send(rh.region_slot).unwrap();
        m1c.bulk_respond(&d, &[0xABu8; 8192]).unwrap();
    });

    // Initiator reply handler: record the echoed slot, release resources.
    let (ack_tx, ack_rx) = mpsc::channel();
    let ack_tx = Mutex::new(ack_tx);
    let m0c = m0.clone();
    m0.register_handler(11, move |d| {
        let rh = d.rdma_header().unwrap();
        ack_tx.lock().unwrap().send(rh.region_slot).unwrap();
        m0c.bulk_complete(&d);
    });

    start_in_order(&[m0.clone(), m1.clone()]);

    let mut dest = vec![0u8; 8192];
    m0.bulk_fetch(1, 10, 11, b"", &mut dest, BulkMode::Acknowledged)
        .unwrap();

    assert!(dest.iter().all(|&b| b == 0xAB));
    let supplied = slot_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let echoed = ack_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(supplied, echoed);

    // Slot released after the acknowledgment.
    assert_eq!(m0.bound_regions(1, PoolKind::Bulk).unwrap(), 0);
}

#[test]
fn polled_inline_fetch() {
    let (_network, m0, m1) = two_nodes(&["10.0.4.1", "10.0.4.2"]);

    let pattern: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    let response = pattern.clone();
    let m1c = m1.clone();
    m1.register_handler(12, move |d| {
        assert!(d.header().polled());
        assert!(!d.header().notify_variant());
        m1c.bulk_respond(&d, &response).unwrap();
    });

    start_in_order(&[m0.clone(), m1.clone()]);

    let reply = m0.bulk_fetch_inline(1, 12, 13, b"", 2048).unwrap();
    assert_eq!(reply.len(), 1024);
    assert_eq!(reply.data(), &pattern[..]);

    // The initiator released its slot after the sentinel flipped.
    assert_eq!(m0.bound_regions(1, PoolKind::Bulk).unwrap(), 0);
}

#[test]
fn polled_notify_fetch() {
    let (_network, m0, m1) = two_nodes(&["10.0.5.1", "10.0.5.2"]);

    let pattern: Vec<u8> = (0..4096u32).map(|i| (i % 89) as u8).collect();
    let response = pattern.clone();
    let m1c = m1.clone();
    m1.register_handler(14, move |d| {
        assert!(d.header().polled());
        assert!(d.header().notify_variant());
        m1c.bulk_respond(&d, &response).unwrap();
    });

    start_in_order(&[m0.clone(), m1.clone()]);

    let mut dest = vec![0u8; 4096];
    m0.bulk_fetch(1, 14, 15, b"", &mut dest, BulkMode::PolledNotify)
        .unwrap();
    assert_eq!(dest, pattern);
    assert_eq!(m0.bound_regions(1, PoolKind::Bulk).unwrap(), 0);
}

#[test]
fn push_is_pulled_by_responder() {
    let (_network, m0, m1) = two_nodes(&["10.0.6.1", "10.0.6.2"]);

    let (data_tx, data_rx) = mpsc::channel();
    let data_tx = Mutex::new(data_tx);
    let m1c = m1.clone();
    m1.register_handler(22, move |d| {
        assert!(!d.header().is_write());
        let mut buf = vec![0u8; 2048];
        let n = m1c.bulk_accept(&d, &mut buf).unwrap();
        buf.truncate(n);
        data_tx.lock().unwrap().send(buf).unwrap();
    });

    let m0c = m0.clone();
    m0.register_handler(23, move |d| {
        assert!(!d.header().is_write());
        m0c.bulk_complete(&d);
    });

    start_in_order(&[m0.clone(), m1.clone()]);

    let src: Vec<u8> = (0..2048u32).map(|i| (i % 13) as u8).collect();
    m0.bulk_push(1, 22, 23, b"", &src).unwrap();

    let pulled = data_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(pulled, src);
    assert_eq!(m0.bound_regions(1, PoolKind::Bulk).unwrap(), 0);
}

#[test]
fn region_pool_exhaustion_resolves_under_load() {
    let (_network, m0, m1) = two_nodes(&["10.0.7.1", "10.0.7.2"]);

    let m1c = m1.clone();
    m1.register_handler(16, move |d| {
        m1c.bulk_respond(&d, &[0x5Au8; 64]).unwrap();
    });
    let m0c = m0.clone();
    m0.register_handler(17, move |d| {
        m0c.bulk_complete(&d);
    });

    start_in_order(&[m0.clone(), m1.clone()]);

    // Watch the bitmap while 128 initiators fight over 64 slots.
    let done = Arc::new(AtomicBool::new(false));
    let watcher = {
        let m0 = m0.clone();
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                let bound = m0.bound_regions(1, PoolKind::Bulk).unwrap();
                assert!(bound <= 64, "bitmap exceeded the pool size: {}", bound);
                thread::yield_now();
            }
        })
    };

    let mut initiators = Vec::new();
    for _ in 0..128 {
        let m0 = m0.clone();
        initiators.push(thread::spawn(move || {
            let mut dest = vec![0u8; 64];
            m0.bulk_fetch(1, 16, 17, b"", &mut dest, BulkMode::Acknowledged)
                .unwrap();
            assert!(dest.iter().all(|&b| b == 0x5A));
        }));
    }
    for h in initiators {
        h.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    watcher.join().unwrap();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(m0.bound_regions(1, PoolKind::Bulk).unwrap(), 0);
    assert_eq!(m1.recv_counts(0).unwrap(), (128, 0));
}

#[test]
fn connection_loss_fails_outstanding_and_subsequent_ops() {
    let network = Network::new();
    let addrs = ["10.0.8.1", "10.0.8.2", "10.0.8.3"];
    let cfg = MeshConfig::new(&addrs).unwrap();
    let m0 = Arc::new(Messenger::new(&network, addrs[0].parse().unwrap(), cfg.clone()).unwrap());
    let m1 = Arc::new(Messenger::new(&network, addrs[1].parse().unwrap(), cfg.clone()).unwrap());
    let m2 = Arc::new(Messenger::new(&network, addrs[2].parse().unwrap(), cfg).unwrap());

    // Node 1 stalls before responding, so requests stay outstanding.
    let m1c = m1.clone();
    m1.register_handler(18, move |d| {
        thread::sleep(Duration::from_millis(500));
        let _ = m1c.bulk_respond(&d, &[1u8; 32]);
    });
    let m0c = m0.clone();
    m0.register_handler(19, move |d| {
        m0c.bulk_complete(&d);
    });

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    m2.register_handler(20, move |d| {
        tx.lock().unwrap().send(d.payload().to_vec()).unwrap();
    });

    start_in_order(&[m0.clone(), m1.clone(), m2.clone()]);

    let mut outstanding = Vec::new();
    for _ in 0..4 {
        let m0 = m0.clone();
        outstanding.push(thread::spawn(move || {
            let mut dest = vec![0u8; 32];
            m0.bulk_fetch(1, 18, 19, b"", &mut dest, BulkMode::Acknowledged)
        }));
    }
    thread::sleep(Duration::from_millis(150));

    m0.disconnect(1).unwrap();

    for h in outstanding {
        match h.join().unwrap() {
            Err(Error::PeerUnreachable(1)) => {}
            other => panic!("expected PeerUnreachable, got {:?}", other.map(|_| ())),
        }
    }

    // Peer 1 fails fast from now on.
    match m0.send(1, 18, b"dead") {
        Err(Error::PeerUnreachable(1)) => {}
        other => panic!("expected PeerUnreachable, got {:?}", other),
    }

    // Peer 2 is unaffected.
    m0.send(2, 20, b"alive").unwrap();
    let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got, b"alive");
}

#[test]
fn three_node_mesh_exchanges_in_both_directions() {
    let network = Network::new();
    let addrs = ["10.0.9.1", "10.0.9.2", "10.0.9.3"];
    let cfg = MeshConfig::new(&addrs).unwrap();
    let nodes: Vec<Arc<Messenger>> = addrs
        .iter()
        .map(|a| Arc::new(Messenger::new(&network, a.parse().unwrap(), cfg.clone()).unwrap()))
        .collect();

    let mut receivers = Vec::new();
    for node in &nodes {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        node.register_handler(30, move |d| {
            tx.lock()
                .unwrap()
                .send((d.from_node(), d.payload().to_vec()))
                .unwrap();
        });
        receivers.push(rx);
    }

    start_in_order(&nodes);

    for (i, node) in nodes.iter().enumerate() {
        for j in 0..nodes.len() {
            if i != j {
                node.send(j, 30, format!("{}->{}", i, j).as_bytes()).unwrap();
            }
        }
    }

    for (j, rx) in receivers.iter().enumerate() {
        let mut seen = Vec::new();
        for _ in 0..2 {
            let (from, payload) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(payload, format!("{}->{}", from, j).into_bytes());
            seen.push(from);
        }
        seen.sort_unstable();
        let expected: Vec<usize> = (0..3).filter(|&i| i != j).collect();
        assert_eq!(seen, expected);
    }
}
