//! Per-peer control blocks.
//!
//! One [`PeerCb`] exists for every node in the mesh, the local node
//! included (its block carries the listener). The fabric-facing state — the
//! queue pair, pools, sentinel buffers, and the bottom-half worker — lives
//! in a [`PeerConn`] installed once the connection is set up.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU32;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;

use slab::Slab;
use softib::{CmId, Cq, Pd, Qp};

use crate::buffer::DmaBuffer;
use crate::recvpool::RecvPool;
use crate::region::RegionPool;

/// Connection state register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    AddrResolved,
    RouteResolved,
    ConnectRequest,
    Connected,
    Error,
}

/// A state value plus a wakeable waiter.
pub(crate) struct StateRegister {
    state: Mutex<ConnState>,
    cond: Condvar,
}

impl StateRegister {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ConnState::Idle),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set(&self, s: ConnState) {
        let mut state = self.state.lock().unwrap();
        // Error is sticky until teardown.
        if *state != ConnState::Error || s == ConnState::Error {
            *state = s;
        }
        self.cond.notify_all();
    }

    /// Block until the state satisfies `pred`.
    pub(crate) fn wait_until(&self, pred: impl Fn(ConnState) -> bool) -> ConnState {
        let mut state = self.state.lock().unwrap();
        while !pred(*state) {
            state = self.cond.wait(state).unwrap();
        }
        *state
    }
}

/// A parked caller waiting for one completion. `complete(false)` is the
/// sticky failure indication used when the connection dies.
pub(crate) struct OpWaiter {
    done: Mutex<Option<bool>>,
    cond: Condvar,
}

impl OpWaiter {
    pub(crate) fn new() -> Self {
        Self {
            done: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn complete(&self, ok: bool) {
        let mut done = self.done.lock().unwrap();
        if done.is_none() {
            *done = Some(ok);
        }
        self.cond.notify_all();
    }

    /// Park until completed. Returns the success indication.
    pub(crate) fn wait(&self) -> bool {
        let mut done = self.done.lock().unwrap();
        while done.is_none() {
            done = self.cond.wait(done).unwrap();
        }
        done.unwrap()
    }
}

/// Bottom-half work items.
pub(crate) enum BhWork {
    Recv { item: usize },
    Shutdown,
}

/// Fabric-facing half of a peer control block.
pub(crate) struct PeerConn {
    pub(crate) pd: Pd,
    #[allow(dead_code)]
    pub(crate) cq: Cq,
    pub(crate) qp: Qp,
    /// Serializes post calls on the queue pair.
    pub(crate) post_lock: Mutex<()>,
    /// Parked callers indexed by work-request id.
    pub(crate) waiters: Mutex<Slab<Arc<OpWaiter>>>,
    pub(crate) recv_pool: RecvPool,
    pub(crate) regions: RegionPool,
    /// In-flight send accounting self-test.
    pub(crate) wq_wr: AtomicU32,
    /// Responder-side staging buffers for the inline poll variant, one per
    /// bulk region slot.
    pub(crate) poll_staging: Vec<DmaBuffer>,
    /// Local sentinel array peers write to in the notify variant, one byte
    /// per region slot.
    pub(crate) notify_target: DmaBuffer,
    /// One-byte sources for sentinel writes towards the peer.
    pub(crate) notify_source: DmaBuffer,
    /// Slot of the local-sentinel binding held for the mesh lifetime.
    pub(crate) notify_local_slot: OnceLock<usize>,
    /// The peer's sentinel array address and key, learned at key exchange.
    pub(crate) remote_notify: Mutex<Option<(u64, u32)>>,
    pub(crate) bh: Mutex<Option<Sender<BhWork>>>,
    pub(crate) bh_thread: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConn {
    /// Register a parked caller; the returned token doubles as the
    /// work-request id of the operation it waits for.
    pub(crate) fn add_waiter(&self) -> (u64, Arc<OpWaiter>) {
        let waiter = Arc::new(OpWaiter::new());
        let token = self.waiters.lock().unwrap().insert(waiter.clone());
        (token as u64, waiter)
    }

    /// Complete and deregister the waiter for `token`. Tokens already
    /// drained by a connection failure are ignored.
    pub(crate) fn complete_waiter(&self, token: u64, ok: bool) {
        let waiter = self.waiters.lock().unwrap().try_remove(token as usize);
        if let Some(w) = waiter {
            w.complete(ok);
        }
    }

    pub(crate) fn remove_waiter(&self, token: u64) {
        let _ = self.waiters.lock().unwrap().try_remove(token as usize);
    }

    /// Wake every parked caller with the failure indication.
    pub(crate) fn fail_all_waiters(&self) {
        let drained: Vec<Arc<OpWaiter>> = {
            let mut waiters = self.waiters.lock().unwrap();
            let all: Vec<_> = waiters.drain().collect();
            all
        };
        for w in drained {
            w.complete(false);
        }
    }
}

/// A peer control block.
pub(crate) struct PeerCb {
    pub(crate) id: usize,
    pub(crate) state: StateRegister,
    /// Client-side identifier, or the listener on the local node's block.
    pub(crate) cm: Mutex<Option<CmId>>,
    /// Inbound identifiers parked by the connection-manager callback until
    /// the accept loop picks them up, in arrival order. Local node's block
    /// only.
    pub(crate) pending_accept: Mutex<VecDeque<CmId>>,
    pub(crate) conn: OnceLock<Arc<PeerConn>>,
}

impl PeerCb {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            state: StateRegister::new(),
            cm: Mutex::new(None),
            pending_accept: Mutex::new(VecDeque::new()),
            conn: OnceLock::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_register_error_is_sticky() {
        let reg = StateRegister::new();
        assert_eq!(reg.get(), ConnState::Idle);
        reg.set(ConnState::Connected);
        assert_eq!(reg.get(), ConnState::Connected);
        reg.set(ConnState::Error);
        reg.set(ConnState::Connected);
        assert_eq!(reg.get(), ConnState::Error);
    }

    #[test]
    fn waiter_completes_once() {
        let w = OpWaiter::new();
        w.complete(true);
        w.complete(false);
        assert!(w.wait());
    }

    #[test]
    fn waiter_wakes_parked_thread() {
        let w = Arc::new(OpWaiter::new());
        let w2 = w.clone();
        let t = std::thread::spawn(move || w2.wait());
        std::thread::sleep(std::time::Duration::from_millis(20));
        w.complete(false);
        assert!(!t.join().unwrap());
    }
}
