//! End-to-end fabric tests: establishment, send/recv, one-sided access,
//! region rebinding, and fault propagation.

use std::net::Ipv4Addr;
use std::sync::mpsc;
use std::time::Duration;

use softib::{
    AccessFlags, CmEvent, ConnParam, Cq, Network, Pd, Qp, QpCaps, SendWr, Sge, Wc, WcOpcode,
    WcStatus,
};

fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, last)
}

fn expect_event(rx: &mpsc::Receiver<CmEvent>, want: &str) -> CmEvent {
    let ev = rx
        .recv_timeout(Duration::from_secs(5))
        .unwrap_or_else(|_| panic!("timed out waiting for {}", want));
    assert_eq!(format!("{:?}", ev), want);
    ev
}

fn poll_one(cq: &Cq) -> Wc {
    let handle = cq.handle();
    for _ in 0..10_000 {
        if let Some(wc) = handle.poll() {
            return wc;
        }
        std::thread::yield_now();
    }
    panic!("no completion arrived");
}

struct Pair {
    client_qp: Qp,
    client_cq: Cq,
    client_pd: Pd,
    server_qp: Qp,
    server_cq: Cq,
    server_pd: Pd,
}

/// Establish one client/server connection on fresh addresses.
fn establish(network: &Network, addr: Ipv4Addr, port: u16) -> Pair {
    let (server_tx, server_rx) = mpsc::channel();
    let listener = network.create_cm_id(0, move |_, ev| {
        let _ = server_tx.send(ev);
    });
    listener.bind_listen(addr, port, 99).unwrap();

    let (client_tx, client_rx) = mpsc::channel();
    let client = network.create_cm_id(1, move |_, ev| {
        let _ = client_tx.send(ev);
    });

    client.resolve_addr(addr, port, 2000).unwrap();
    expect_event(&client_rx, "AddrResolved");
    client.resolve_route(2000).unwrap();
    expect_event(&client_rx, "RouteResolved");

    let client_pd = Pd::new();
    let client_cq = Cq::new(|_| {});
    let client_qp = client
        .create_qp(&client_pd, QpCaps::default(), &client_cq, &client_cq)
        .unwrap();
    client.connect(&ConnParam::default()).unwrap();

    let server_cm = match expect_event(&server_rx, "ConnectRequest") {
        CmEvent::ConnectRequest(id) => id,
        _ => unreachable!(),
    };
    let server_pd = Pd::new();
    let server_cq = Cq::new(|_| {});
    let server_qp = server_cm
        .create_qp(&server_pd, QpCaps::default(), &server_cq, &server_cq)
        .unwrap();
    server_cm.accept(&ConnParam::default()).unwrap();
    expect_event(&server_rx, "Established");
    expect_event(&client_rx, "Established");

    Pair {
        client_qp,
        client_cq,
        client_pd,
        server_qp,
        server_cq,
        server_pd,
    }
}

#[test]
fn send_recv_roundtrip() {
    let network = Network::new();
    let pair = establish(&network, ip(1), 10453);

    let mut recv_buf = [0u8; 64];
    pair.server_qp
        .post_recv(7, recv_buf.as_mut_ptr() as u64, recv_buf.len() as u32)
        .unwrap();

    let payload = b"hello";
    pair.client_qp
        .post_send(&[SendWr::Send {
            wr_id: 1,
            sge: Sge {
                addr: payload.as_ptr() as u64,
                len: payload.len() as u32,
                lkey: pair.client_pd.local_dma_lkey(),
            },
            signaled: true,
        }])
        .unwrap();

    let send_wc = poll_one(&pair.client_cq);
    assert_eq!(send_wc.opcode, WcOpcode::Send);
    assert_eq!(send_wc.status, WcStatus::Success);
    assert_eq!(send_wc.wr_id, 1);

    let recv_wc = poll_one(&pair.server_cq);
    assert_eq!(recv_wc.opcode, WcOpcode::Recv);
    assert_eq!(recv_wc.wr_id, 7);
    assert_eq!(recv_wc.byte_len, 5);
    assert_eq!(&recv_buf[..5], payload);
}

#[test]
fn send_parks_until_receive_is_posted() {
    let network = Network::new();
    let pair = establish(&network, ip(2), 10453);

    let payload = [0xEEu8; 16];
    pair.client_qp
        .post_send(&[SendWr::Send {
            wr_id: 11,
            sge: Sge {
                addr: payload.as_ptr() as u64,
                len: payload.len() as u32,
                lkey: 0,
            },
            signaled: true,
        }])
        .unwrap();

    // No receive posted yet: no completion on either side.
    assert!(pair.client_cq.handle().poll().is_none());
    assert!(pair.server_cq.handle().poll().is_none());

    let mut recv_buf = [0u8; 64];
    pair.server_qp
        .post_recv(5, recv_buf.as_mut_ptr() as u64, recv_buf.len() as u32)
        .unwrap();

    assert_eq!(poll_one(&pair.client_cq).wr_id, 11);
    assert_eq!(poll_one(&pair.server_cq).wr_id, 5);
    assert_eq!(&recv_buf[..16], &payload);
}

#[test]
fn one_sided_write_and_read() {
    let network = Network::new();
    let pair = establish(&network, ip(3), 10453);

    let mut remote_buf = vec![0u8; 4096];
    let mr = pair
        .server_pd
        .register(
            remote_buf.as_mut_ptr(),
            remote_buf.len(),
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ,
        )
        .unwrap();

    let src = vec![0xABu8; 1024];
    pair.client_qp
        .post_send(&[SendWr::RdmaWrite {
            wr_id: 21,
            sge: Sge {
                addr: src.as_ptr() as u64,
                len: src.len() as u32,
                lkey: 0,
            },
            remote_addr: remote_buf.as_ptr() as u64,
            rkey: mr.rkey(),
            signaled: true,
        }])
        .unwrap();
    let wc = poll_one(&pair.client_cq);
    assert_eq!(wc.opcode, WcOpcode::RdmaWrite);
    assert_eq!(wc.status, WcStatus::Success);
    assert!(remote_buf[..1024].iter().all(|&b| b == 0xAB));

    let mut dst = vec![0u8; 1024];
    pair.client_qp
        .post_send(&[SendWr::RdmaRead {
            wr_id: 22,
            sge: Sge {
                addr: dst.as_mut_ptr() as u64,
                len: dst.len() as u32,
                lkey: 0,
            },
            remote_addr: remote_buf.as_ptr() as u64,
            rkey: mr.rkey(),
            signaled: true,
        }])
        .unwrap();
    let wc = poll_one(&pair.client_cq);
    assert_eq!(wc.opcode, WcOpcode::RdmaRead);
    assert!(dst.iter().all(|&b| b == 0xAB));
}

#[test]
fn rebind_rolls_key_and_revokes_old_one() {
    let network = Network::new();
    let pair = establish(&network, ip(4), 10453);

    let mut buf_a = vec![0u8; 512];
    let mut buf_b = vec![0u8; 512];
    let mr = pair.server_pd.alloc_mr();

    // Bind to A with key 1 via the invalidate + register chain.
    let old_rkey = mr.rkey();
    let rkey_a = mr.set_key(1);
    pair.server_qp
        .post_send(&[
            SendWr::LocalInv {
                wr_id: 0,
                rkey: old_rkey,
                signaled: false,
            },
            SendWr::RegMr {
                wr_id: 0,
                mr: &mr,
                addr: buf_a.as_mut_ptr() as u64,
                len: buf_a.len(),
                key: 1,
                access: AccessFlags::REMOTE_WRITE | AccessFlags::LOCAL_WRITE,
                signaled: false,
            },
        ])
        .unwrap();

    let src = [0x11u8; 128];
    pair.client_qp
        .post_send(&[SendWr::RdmaWrite {
            wr_id: 31,
            sge: Sge {
                addr: src.as_ptr() as u64,
                len: src.len() as u32,
                lkey: 0,
            },
            remote_addr: buf_a.as_ptr() as u64,
            rkey: rkey_a,
            signaled: true,
        }])
        .unwrap();
    assert_eq!(poll_one(&pair.client_cq).status, WcStatus::Success);
    assert_eq!(buf_a[0], 0x11);

    // Rebind to B with key 2: the old key must stop working.
    let rkey_b = mr.set_key(2);
    pair.server_qp
        .post_send(&[
            SendWr::LocalInv {
                wr_id: 0,
                rkey: rkey_a,
                signaled: false,
            },
            SendWr::RegMr {
                wr_id: 0,
                mr: &mr,
                addr: buf_b.as_mut_ptr() as u64,
                len: buf_b.len(),
                key: 2,
                access: AccessFlags::REMOTE_WRITE | AccessFlags::LOCAL_WRITE,
                signaled: false,
            },
        ])
        .unwrap();

    pair.client_qp
        .post_send(&[SendWr::RdmaWrite {
            wr_id: 32,
            sge: Sge {
                addr: src.as_ptr() as u64,
                len: src.len() as u32,
                lkey: 0,
            },
            remote_addr: buf_a.as_ptr() as u64,
            rkey: rkey_a,
            signaled: true,
        }])
        .unwrap();
    let wc = poll_one(&pair.client_cq);
    assert_eq!(wc.wr_id, 32);
    assert_eq!(wc.status, WcStatus::RemoteAccessErr);
    let _ = rkey_b;
    assert!(buf_b.iter().all(|&b| b == 0));
}

#[test]
fn disconnect_fails_fast_and_flushes() {
    let network = Network::new();
    let (server_tx, server_rx) = mpsc::channel();
    let listener = network.create_cm_id(0, move |_, ev| {
        let _ = server_tx.send(ev);
    });
    listener.bind_listen(ip(6), 10453, 99).unwrap();

    let (client_tx, client_rx) = mpsc::channel();
    let client = network.create_cm_id(1, move |_, ev| {
        let _ = client_tx.send(ev);
    });
    client.resolve_addr(ip(6), 10453, 2000).unwrap();
    expect_event(&client_rx, "AddrResolved");
    client.resolve_route(2000).unwrap();
    expect_event(&client_rx, "RouteResolved");

    let pd = Pd::new();
    let cq = Cq::new(|_| {});
    let qp = client.create_qp(&pd, QpCaps::default(), &cq, &cq).unwrap();
    client.connect(&ConnParam::default()).unwrap();

    let server_cm = match expect_event(&server_rx, "ConnectRequest") {
        CmEvent::ConnectRequest(id) => id,
        _ => unreachable!(),
    };
    let spd = Pd::new();
    let scq = Cq::new(|_| {});
    let _sqp = server_cm
        .create_qp(&spd, QpCaps::default(), &scq, &scq)
        .unwrap();
    server_cm.accept(&ConnParam::default()).unwrap();
    expect_event(&server_rx, "Established");
    expect_event(&client_rx, "Established");

    client.disconnect().unwrap();
    expect_event(&client_rx, "Disconnected");
    expect_event(&server_rx, "Disconnected");

    let payload = [0u8; 8];
    let err = qp.post_send(&[SendWr::Send {
        wr_id: 1,
        sge: Sge {
            addr: payload.as_ptr() as u64,
            len: payload.len() as u32,
            lkey: 0,
        },
        signaled: true,
    }]);
    assert!(err.is_err());
}

#[test]
fn connect_without_listener_is_unreachable() {
    let network = Network::new();
    let (tx, rx) = mpsc::channel();
    let cm = network.create_cm_id(9, move |_, ev| {
        let _ = tx.send(ev);
    });
    cm.resolve_addr(ip(200), 10453, 2000).unwrap();
    expect_event(&rx, "AddrResolved");
    cm.resolve_route(2000).unwrap();
    expect_event(&rx, "RouteResolved");
    cm.connect(&ConnParam::default()).unwrap();
    expect_event(&rx, "Unreachable");
}
