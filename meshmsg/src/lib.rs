//! meshmsg - inter-node messaging substrate for a fixed mesh of cooperating
//! kernels.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── Messenger ────────────────────────────┐
//! │  handler table [type → fn]     rendezvous tags     staging ring   │
//! │                                                                   │
//! │  ┌──────── PeerCb 0 ────────┐  ┌──────── PeerCb 2 ────────┐       │
//! │  │ state register · CmId    │  │ state register · CmId    │  ...  │
//! │  │ Qp · Cq · Pd             │  │ Qp · Cq · Pd             │       │
//! │  │ recv pool (128 posted)   │  │ recv pool                │       │
//! │  │ region pool (64 × 3)     │  │ region pool              │       │
//! │  │ sentinels · bottom half  │  │ sentinels · bottom half  │       │
//! │  └──────────────────────────┘  └──────────────────────────┘       │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nodes form a fully connected mesh of reliable queue pairs: node ids are
//! assigned by position in the address table, the lower id connects and the
//! higher id accepts. On top of the mesh the substrate offers:
//!
//! - typed small messages ([`Messenger::send`]) dispatched to registered
//!   handlers on a per-peer bottom-half worker;
//! - one-sided bulk transfers ([`Messenger::bulk_fetch`],
//!   [`Messenger::bulk_push`]) in acknowledged and polled flavors;
//! - the sentinel key exchange that arms the polled notify variant.
//!
//! Transient resource exhaustion yields and retries; connection faults wake
//! every parked caller with a sticky failure; invariant violations panic.

pub mod buffer;
pub mod bulk;
mod channel;
mod completion;
pub mod config;
pub mod dispatch;
pub mod error;
mod keyex;
mod peer;
mod recvpool;
pub mod region;
mod rendezvous;
pub mod ring;
pub mod wire;

use std::net::Ipv4Addr;
use std::sync::atomic::AtomicU32;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};

use slab::Slab;

use softib::{CmEvent, CmId, ConnParam, Cq, Network, Pd, QpCaps};

pub use bulk::{BulkMode, BulkReply};
pub use config::MeshConfig;
pub use dispatch::Delivery;
pub use error::{Error, Result};
pub use peer::ConnState;
pub use region::PoolKind;

use buffer::DmaBuffer;
use config::{
    CONN_INITIATOR_DEPTH, CONN_RESPONDER_RESOURCES, CONN_RETRY_COUNT, LISTEN_BACKLOG, MAX_BULK_SIZE,
    MAX_MSG_SIZE, MAX_RECV_WR, MAX_SEND_WR, MR_POOL_SIZE, NOTIFY_SENTINEL_BYTES,
};
use dispatch::HandlerTable;
use peer::{BhWork, PeerCb, PeerConn};
use recvpool::RecvPool;
use region::RegionPool;
use rendezvous::Rendezvous;
use ring::RingBuffer;
use wire::{
    MessageHeader, HEADER_SIZE, MSG_TYPE_SENTINEL_KEY_REQUEST, MSG_TYPE_SENTINEL_KEY_RESPONSE,
    TYPE_MAX,
};

pub(crate) struct MessengerInner {
    pub(crate) my_id: usize,
    pub(crate) config: MeshConfig,
    pub(crate) network: Network,
    pub(crate) cbs: Vec<Arc<PeerCb>>,
    pub(crate) handlers: HandlerTable,
    pub(crate) rendezvous: Rendezvous,
    pub(crate) ring: RingBuffer,
    /// Established-event demultiplexing: (count on the listener, count on
    /// client handles).
    cm_counters: Mutex<(usize, usize)>,
    pub(crate) weak: Weak<MessengerInner>,
}

impl MessengerInner {
    pub(crate) fn conn(&self, peer: usize) -> Result<Arc<PeerConn>> {
        if peer >= self.config.node_count() || peer == self.my_id {
            return Err(Error::InvalidPeer(peer));
        }
        let cb = &self.cbs[peer];
        if cb.state.get() != ConnState::Connected {
            return Err(Error::PeerUnreachable(peer));
        }
        cb.conn.get().cloned().ok_or(Error::PeerUnreachable(peer))
    }

    /// Sticky failure: mark the peer, wake every parked caller with the
    /// failure indication.
    pub(crate) fn fail_peer(&self, peer: usize) {
        if peer == self.my_id || peer >= self.cbs.len() {
            return;
        }
        let cb = &self.cbs[peer];
        cb.state.set(ConnState::Error);
        if let Some(conn) = cb.conn.get() {
            conn.fail_all_waiters();
        }
        self.rendezvous.fail_peer(peer);
    }

    fn on_cm_event(self: &Arc<Self>, token: usize, event: CmEvent) {
        match event {
            CmEvent::AddrResolved => {
                let cb = &self.cbs[token];
                cb.state.set(ConnState::AddrResolved);
                let cm = cb.cm.lock().unwrap().clone();
                match cm {
                    Some(cm) => {
                        if cm.resolve_route(2000).is_err() {
                            cb.state.set(ConnState::Error);
                        }
                    }
                    None => cb.state.set(ConnState::Error),
                }
            }
            CmEvent::RouteResolved => {
                self.cbs[token].state.set(ConnState::RouteResolved);
            }
            CmEvent::ConnectRequest(id) => {
                // Parked for the accept loop; token is the listener's.
                let cb = &self.cbs[token];
                cb.pending_accept.lock().unwrap().push_back(id);
                cb.state.set(ConnState::ConnectRequest);
            }
            CmEvent::Established => {
                // The k-th Established on the listener is peer my_id + k;
                // the k-th on a client handle is peer k.
                let mut counters = self.cm_counters.lock().unwrap();
                if token == self.my_id {
                    counters.0 += 1;
                    let peer = self.my_id + counters.0;
                    self.cbs[peer].state.set(ConnState::Connected);
                } else {
                    let peer = counters.1;
                    counters.1 += 1;
                    self.cbs[peer].state.set(ConnState::Connected);
                }
            }
            CmEvent::Unreachable | CmEvent::Rejected | CmEvent::ConnectError => {
                self.cbs[token].state.set(ConnState::Error);
            }
            CmEvent::Disconnected => {
                self.fail_peer(token);
            }
        }
    }

    /// Create the protection domain, completion stream, queue pair, pools,
    /// sentinel buffers, and the bottom-half worker for one peer.
    fn setup_conn(self: &Arc<Self>, peer: usize, cm: &CmId) -> Result<()> {
        let pd = Pd::new();
        let weak = self.weak.clone();
        let cq = Cq::new(move |h| {
            if let Some(inner) = weak.upgrade() {
                completion::drain(&inner, peer, h);
            }
        });
        cq.handle().req_notify(false);

        let caps = QpCaps {
            // One extra send slot for the teardown flush.
            max_send_wr: MAX_SEND_WR + 1,
            max_recv_wr: MAX_RECV_WR * 2 + 1,
            max_send_sge: 1,
            max_recv_sge: 1,
        };
        let qp = cm.create_qp(&pd, caps, &cq, &cq)?;

        let recv_pool = RecvPool::new(MAX_RECV_WR as usize, MAX_MSG_SIZE);
        recv_pool.post_all(&qp)?;
        let regions = RegionPool::new(&pd, MR_POOL_SIZE);
        let poll_staging = (0..MR_POOL_SIZE)
            .map(|_| DmaBuffer::new(MAX_BULK_SIZE))
            .collect();
        let notify_target = DmaBuffer::new(NOTIFY_SENTINEL_BYTES);
        let notify_source = DmaBuffer::new(MR_POOL_SIZE);
        unsafe {
            std::ptr::write_bytes(
                notify_source.as_mut_ptr(),
                config::POLL_IS_DATA,
                MR_POOL_SIZE,
            );
        }

        let (tx, rx) = mpsc::channel();
        let weak = self.weak.clone();
        let bh_thread = std::thread::spawn(move || completion::bottom_half(weak, peer, rx));

        let conn = Arc::new(PeerConn {
            pd,
            cq,
            qp,
            post_lock: Mutex::new(()),
            waiters: Mutex::new(Slab::new()),
            recv_pool,
            regions,
            wq_wr: AtomicU32::new(0),
            poll_staging,
            notify_target,
            notify_source,
            notify_local_slot: std::sync::OnceLock::new(),
            remote_notify: Mutex::new(None),
            bh: Mutex::new(Some(tx)),
            bh_thread: Mutex::new(Some(bh_thread)),
        });
        assert!(
            self.cbs[peer].conn.set(conn).is_ok(),
            "peer {} set up twice",
            peer
        );
        Ok(())
    }

    /// Client side of edge (my_id, j) with j < my_id: resolve, set up,
    /// connect, wait.
    fn run_client(self: &Arc<Self>, j: usize) -> Result<()> {
        let cb = &self.cbs[j];
        let weak = self.weak.clone();
        let cm = self.network.create_cm_id(j as u64, move |token, event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_cm_event(token as usize, event);
            }
        });
        *cb.cm.lock().unwrap() = Some(cm.clone());

        cm.resolve_addr(self.config.node_addr(j), self.config.port, 2000)?;
        let state = cb
            .state
            .wait_until(|s| s == ConnState::RouteResolved || s == ConnState::Error);
        if state == ConnState::Error {
            return Err(Error::PeerUnreachable(j));
        }

        self.setup_conn(j, &cm)?;
        cm.connect(&ConnParam {
            responder_resources: CONN_RESPONDER_RESOURCES,
            initiator_depth: CONN_INITIATOR_DEPTH,
            retry_count: CONN_RETRY_COUNT,
        })?;
        let state = cb
            .state
            .wait_until(|s| s == ConnState::Connected || s == ConnState::Error);
        if state == ConnState::Error {
            return Err(Error::PeerUnreachable(j));
        }
        Ok(())
    }

    /// Server side of edge (my_id, k) with k > my_id: wait for the inbound
    /// connect, set up, accept, wait.
    fn run_accept(self: &Arc<Self>, k: usize) -> Result<()> {
        let my_cb = &self.cbs[self.my_id];
        let state = my_cb
            .state
            .wait_until(|s| s == ConnState::ConnectRequest || s == ConnState::Error);
        if state != ConnState::ConnectRequest {
            return Err(Error::PeerUnreachable(k));
        }
        let peer_cm = {
            let mut pending = my_cb.pending_accept.lock().unwrap();
            let cm = pending.pop_front();
            if pending.is_empty() {
                my_cb.state.set(ConnState::Idle);
            }
            cm
        }
        .ok_or(Error::PeerUnreachable(k))?;

        let cb = &self.cbs[k];
        *cb.cm.lock().unwrap() = Some(peer_cm.clone());
        self.setup_conn(k, &peer_cm)?;
        peer_cm.accept(&ConnParam {
            responder_resources: CONN_RESPONDER_RESOURCES,
            initiator_depth: CONN_INITIATOR_DEPTH,
            retry_count: CONN_RETRY_COUNT,
        })?;
        let state = cb
            .state
            .wait_until(|s| s == ConnState::Connected || s == ConnState::Error);
        if state == ConnState::Error {
            return Err(Error::PeerUnreachable(k));
        }
        // From here on, faults on this identifier name the peer directly.
        peer_cm.set_token(k as u64);
        Ok(())
    }

    fn shutdown(&self) {
        for cb in &self.cbs {
            if cb.id == self.my_id {
                continue;
            }
            self.fail_peer(cb.id);
            if let Some(cm) = cb.cm.lock().unwrap().take() {
                let _ = cm.disconnect();
            }
        }
        let _ = self.cbs[self.my_id].cm.lock().unwrap().take();
        for cb in &self.cbs {
            if let Some(conn) = cb.conn.get() {
                if let Some(tx) = conn.bh.lock().unwrap().take() {
                    let _ = tx.send(BhWork::Shutdown);
                }
                if let Some(t) = conn.bh_thread.lock().unwrap().take() {
                    if t.thread().id() != std::thread::current().id() {
                        let _ = t.join();
                    }
                }
            }
        }
    }
}

/// One node's end of the mesh: the messaging substrate instance.
pub struct Messenger {
    inner: Arc<MessengerInner>,
}

impl Messenger {
    /// Create the node identified by `local` in `config`'s address table.
    ///
    /// Handlers are registered on the fresh instance; [`start`](Self::start)
    /// then brings the mesh up.
    pub fn new(network: &Network, local: Ipv4Addr, config: MeshConfig) -> Result<Messenger> {
        let my_id = config
            .find_node(local)
            .ok_or_else(|| Error::InvalidConfig(format!("{} is not in the node table", local)))?;
        let n = config.node_count();
        assert!(n <= u8::MAX as usize, "node id must fit the header byte");

        let ring = RingBuffer::new(config.ring_chunks, config.ring_chunk_size);
        let inner = Arc::new_cyclic(|weak| MessengerInner {
            my_id,
            config,
            network: network.clone(),
            cbs: (0..n).map(|i| Arc::new(PeerCb::new(i))).collect(),
            handlers: HandlerTable::new(),
            rendezvous: Rendezvous::new(),
            ring,
            cm_counters: Mutex::new((0, 0)),
            weak: weak.clone(),
        });

        let weak = inner.weak.clone();
        inner
            .handlers
            .register(MSG_TYPE_SENTINEL_KEY_REQUEST, move |d| {
                if let Some(inner) = weak.upgrade() {
                    keyex::handle_request(&inner, d);
                }
            });
        let weak = inner.weak.clone();
        inner
            .handlers
            .register(MSG_TYPE_SENTINEL_KEY_RESPONSE, move |d| {
                if let Some(inner) = weak.upgrade() {
                    keyex::handle_response(&inner, d);
                }
            });

        Ok(Messenger { inner })
    }

    pub fn my_id(&self) -> usize {
        self.inner.my_id
    }

    pub fn node_count(&self) -> usize {
        self.inner.config.node_count()
    }

    /// Register the handler for `msg_type`. One-shot: registering a type
    /// twice panics.
    pub fn register_handler<F>(&self, msg_type: u16, handler: F)
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        self.inner.handlers.register(msg_type, handler);
    }

    /// Bring the mesh up. Blocks until every edge is established and the
    /// sentinel keys are exchanged.
    ///
    /// Edge (i, j) is driven by min(i, j) as connector and max(i, j) as
    /// acceptor; inbound connects are matched to peers in id order, so
    /// nodes are expected to start in id order.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let my = inner.my_id;
        let n = inner.config.node_count();

        let weak = inner.weak.clone();
        let listener = inner.network.create_cm_id(my as u64, move |token, event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_cm_event(token as usize, event);
            }
        });
        listener.bind_listen(inner.config.node_addr(my), inner.config.port, LISTEN_BACKLOG)?;
        *inner.cbs[my].cm.lock().unwrap() = Some(listener);

        for j in 0..my {
            inner.run_client(j)?;
        }
        for k in my + 1..n {
            inner.run_accept(k)?;
        }
        for i in 0..n {
            if i != my {
                keyex::exchange_keys(inner, i)?;
            }
        }
        Ok(())
    }

    /// Send a typed small message. The outbound copy is staged in the ring
    /// allocator; the call blocks until the fabric confirms the send.
    pub fn send(&self, dst: usize, msg_type: u16, payload: &[u8]) -> Result<()> {
        assert!(msg_type < TYPE_MAX, "message type {} out of range", msg_type);
        let total = HEADER_SIZE + payload.len();
        assert!(
            total <= MAX_MSG_SIZE,
            "message of {} bytes exceeds the maximum",
            total
        );

        let block = loop {
            match self.inner.ring.get(total) {
                Some(b) => break b,
                None => std::thread::yield_now(),
            }
        };
        let buf = unsafe {
            let hdr = MessageHeader::new(msg_type, 0);
            hdr.write_to(block.as_ptr());
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                block.as_ptr().add(HEADER_SIZE),
                payload.len(),
            );
            std::slice::from_raw_parts_mut(block.as_ptr(), total)
        };
        let result = channel::send_message(&self.inner, dst, buf);
        unsafe { self.inner.ring.put(block) };
        result
    }

    /// Forge a local message and dispatch it synchronously to its
    /// registered handler.
    ///
    /// The buffer is a local allocation, not a pre-posted receive item, so
    /// dropping the delivery frees it instead of recycling it into a pool.
    pub fn deliver_local(&self, msg_type: u16, payload: &[u8]) {
        assert!(msg_type < TYPE_MAX, "message type {} out of range", msg_type);
        let total = HEADER_SIZE + payload.len();
        assert!(
            total <= MAX_MSG_SIZE,
            "message of {} bytes exceeds the maximum",
            total
        );
        let mut buf = vec![0u8; total].into_boxed_slice();
        let mut hdr = MessageHeader::new(msg_type, 0);
        hdr.from_node = self.inner.my_id as u8;
        hdr.total_size = total as u32;
        unsafe { hdr.write_to(buf.as_mut_ptr()) };
        buf[HEADER_SIZE..].copy_from_slice(payload);
        let handler = self
            .inner
            .handlers
            .get(msg_type)
            .unwrap_or_else(|| panic!("no handler registered for message type {}", msg_type));
        handler(Delivery::owned(self.inner.clone(), buf));
    }

    /// Ask `dst` to deliver up to `dest.len()` bytes into `dest`.
    ///
    /// With [`BulkMode::Acknowledged`] the call returns when the reply
    /// handler has called [`bulk_complete`](Self::bulk_complete); with
    /// [`BulkMode::PolledNotify`] it returns when the sentinel byte flips.
    pub fn bulk_fetch(
        &self,
        dst: usize,
        msg_type: u16,
        reply_type: u16,
        payload: &[u8],
        dest: &mut [u8],
        mode: BulkMode,
    ) -> Result<()> {
        bulk::fetch(&self.inner, dst, msg_type, reply_type, payload, dest, mode)
    }

    /// Inline-polled fetch: the payload lands in a self-describing staging
    /// buffer owned by the returned [`BulkReply`].
    pub fn bulk_fetch_inline(
        &self,
        dst: usize,
        msg_type: u16,
        reply_type: u16,
        payload: &[u8],
        max_size: usize,
    ) -> Result<BulkReply> {
        bulk::fetch_inline(&self.inner, dst, msg_type, reply_type, payload, max_size)
    }

    /// Expose `src` for `dst` to pull; acknowledged (polled completion is
    /// write-only, reads always acknowledge).
    pub fn bulk_push(
        &self,
        dst: usize,
        msg_type: u16,
        reply_type: u16,
        payload: &[u8],
        src: &[u8],
    ) -> Result<()> {
        bulk::push(&self.inner, dst, msg_type, reply_type, payload, src)
    }

    /// Responder half of a write-flavor bulk request: deliver `data` into
    /// the initiator's region and complete per the request's flavor.
    pub fn bulk_respond(&self, req: &Delivery, data: &[u8]) -> Result<()> {
        bulk::respond(&self.inner, req, data)
    }

    /// Responder half of a read-flavor bulk request: pull the initiator's
    /// buffer into `dest` and acknowledge.
    pub fn bulk_accept(&self, req: &Delivery, dest: &mut [u8]) -> Result<usize> {
        bulk::accept(&self.inner, req, dest)
    }

    /// Initiator half of an acknowledgment; call from the handler
    /// registered for the reply type.
    pub fn bulk_complete(&self, ack: &Delivery) {
        bulk::complete(&self.inner, ack)
    }

    /// Tear down the connection to `peer`: every parked caller wakes with a
    /// failure and later operations fail fast. Other peers are unaffected.
    pub fn disconnect(&self, peer: usize) -> Result<()> {
        if peer >= self.inner.config.node_count() || peer == self.inner.my_id {
            return Err(Error::InvalidPeer(peer));
        }
        self.inner.fail_peer(peer);
        if let Some(cm) = self.inner.cbs[peer].cm.lock().unwrap().clone() {
            let _ = cm.disconnect();
        }
        Ok(())
    }

    pub fn peer_state(&self, peer: usize) -> ConnState {
        self.inner.cbs[peer].state.get()
    }

    /// (posted, held) receive items for `peer`.
    pub fn recv_counts(&self, peer: usize) -> Option<(usize, usize)> {
        self.inner.cbs[peer]
            .conn
            .get()
            .map(|c| (c.recv_pool.posted(), c.recv_pool.held()))
    }

    /// Population count of `peer`'s region bitmap for `kind`.
    pub fn bound_regions(&self, peer: usize, kind: PoolKind) -> Option<u32> {
        self.inner.cbs[peer]
            .conn
            .get()
            .map(|c| c.regions.bound_count(kind))
    }

    /// Bytes currently staged in the outbound ring.
    pub fn staging_usage(&self) -> usize {
        self.inner.ring.usage()
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}
