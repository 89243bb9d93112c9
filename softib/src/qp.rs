//! Reliable-connected queue pairs.
//!
//! A queue pair executes its send queue in posting order. Two-sided sends
//! consume the peer's pre-posted receive descriptors; when none is available
//! the send parks at the head of the queue and resumes as soon as the peer
//! posts a receive, so a completion is ultimately observed for every posted
//! request unless the connection fails. One-sided operations resolve the
//! remote key against the peer's protection domain and move bytes directly.
//!
//! Completion order per queue pair equals posting order. Nothing is ordered
//! across queue pairs.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::cq::{Cq, CqShared};
use crate::pd::{MemoryRegion, Pd};
use crate::types::{AccessFlags, QpCaps, Sge, Wc, WcOpcode, WcStatus};

/// A work request for the send queue.
pub enum SendWr<'a> {
    /// Two-sided send of `sge` into the peer's next receive buffer.
    Send { wr_id: u64, sge: Sge, signaled: bool },
    /// One-sided write of `sge` into remote memory at `(remote_addr, rkey)`.
    RdmaWrite {
        wr_id: u64,
        sge: Sge,
        remote_addr: u64,
        rkey: u32,
        signaled: bool,
    },
    /// One-sided read of remote memory at `(remote_addr, rkey)` into `sge`.
    RdmaRead {
        wr_id: u64,
        sge: Sge,
        remote_addr: u64,
        rkey: u32,
        signaled: bool,
    },
    /// Invalidate a local key.
    LocalInv { wr_id: u64, rkey: u32, signaled: bool },
    /// Bind `mr` to `[addr, addr + len)` under a rolled key.
    RegMr {
        wr_id: u64,
        mr: &'a MemoryRegion,
        addr: u64,
        len: usize,
        key: u8,
        access: AccessFlags,
        signaled: bool,
    },
}

struct RecvDesc {
    wr_id: u64,
    addr: u64,
    len: u32,
}

enum SqOp {
    Send {
        wr_id: u64,
        data: Vec<u8>,
        signaled: bool,
    },
    Write {
        wr_id: u64,
        data: Vec<u8>,
        remote_addr: u64,
        rkey: u32,
        signaled: bool,
    },
    Read {
        wr_id: u64,
        local_addr: u64,
        len: u32,
        remote_addr: u64,
        rkey: u32,
        signaled: bool,
    },
    LocalInv {
        wr_id: u64,
        rkey: u32,
        signaled: bool,
    },
    RegMr {
        wr_id: u64,
        mr: MemoryRegion,
        addr: u64,
        len: usize,
        key: u8,
        access: AccessFlags,
        signaled: bool,
    },
}

impl SqOp {
    fn wr_id(&self) -> u64 {
        match self {
            SqOp::Send { wr_id, .. }
            | SqOp::Write { wr_id, .. }
            | SqOp::Read { wr_id, .. }
            | SqOp::LocalInv { wr_id, .. }
            | SqOp::RegMr { wr_id, .. } => *wr_id,
        }
    }

    fn signaled(&self) -> bool {
        match self {
            SqOp::Send { signaled, .. }
            | SqOp::Write { signaled, .. }
            | SqOp::Read { signaled, .. }
            | SqOp::LocalInv { signaled, .. }
            | SqOp::RegMr { signaled, .. } => *signaled,
        }
    }

    fn opcode(&self) -> WcOpcode {
        match self {
            SqOp::Send { .. } => WcOpcode::Send,
            SqOp::Write { .. } => WcOpcode::RdmaWrite,
            SqOp::Read { .. } => WcOpcode::RdmaRead,
            SqOp::LocalInv { .. } => WcOpcode::LocalInv,
            SqOp::RegMr { .. } => WcOpcode::RegMr,
        }
    }
}

pub(crate) struct QpInner {
    pd: Pd,
    #[allow(dead_code)]
    caps: QpCaps,
    send_cq: Arc<CqShared>,
    recv_cq: Arc<CqShared>,
    sq: Mutex<VecDeque<SqOp>>,
    recv_q: Mutex<VecDeque<RecvDesc>>,
    peer: Mutex<Option<Weak<QpInner>>>,
    error: AtomicBool,
    /// Serializes send-queue execution: the queue drains from both the
    /// poster and the peer's receive-post nudge, and completion order must
    /// equal posting order.
    run_lock: Mutex<()>,
}

impl QpInner {
    fn peer_arc(&self) -> Option<Arc<QpInner>> {
        self.peer.lock().unwrap().as_ref().and_then(|w| w.upgrade())
    }

    /// Drive the send queue until it empties or the head parks on an empty
    /// peer receive queue.
    fn process_sq(self: &Arc<Self>) {
        let _run = self.run_lock.lock().unwrap();
        enum Step {
            Done,
            ExecSend(SqOp, RecvDesc, Arc<QpInner>),
            Exec(SqOp),
        }
        loop {
            let step = {
                let mut sq = self.sq.lock().unwrap();
                match sq.front() {
                    None => Step::Done,
                    Some(SqOp::Send { .. }) => match self.peer_arc() {
                        None => Step::Done,
                        Some(peer) => {
                            let desc = peer.recv_q.lock().unwrap().pop_front();
                            match desc {
                                None => Step::Done,
                                Some(d) => Step::ExecSend(sq.pop_front().unwrap(), d, peer),
                            }
                        }
                    },
                    Some(_) => Step::Exec(sq.pop_front().unwrap()),
                }
            };
            match step {
                Step::Done => return,
                Step::ExecSend(op, desc, peer) => self.exec_send(op, desc, &peer),
                Step::Exec(op) => self.exec_other(op),
            }
        }
    }

    fn exec_send(&self, op: SqOp, desc: RecvDesc, peer: &Arc<QpInner>) {
        if let SqOp::Send {
            wr_id,
            data,
            signaled,
        } = op
        {
            assert!(
                data.len() <= desc.len as usize,
                "send of {} bytes exceeds receive buffer of {}",
                data.len(),
                desc.len
            );
            // Safety: the descriptor addresses a receive buffer the peer
            // posted and owns until the receive completion is delivered.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), desc.addr as *mut u8, data.len());
            }
            fence(Ordering::Release);
            peer.recv_cq.push(Wc {
                wr_id: desc.wr_id,
                opcode: WcOpcode::Recv,
                status: WcStatus::Success,
                byte_len: data.len() as u32,
            });
            if signaled {
                self.send_cq.push(Wc {
                    wr_id,
                    opcode: WcOpcode::Send,
                    status: WcStatus::Success,
                    byte_len: data.len() as u32,
                });
            }
        }
    }

    fn complete(&self, wr_id: u64, opcode: WcOpcode, status: WcStatus, byte_len: u32) {
        self.send_cq.push(Wc {
            wr_id,
            opcode,
            status,
            byte_len,
        });
    }

    fn exec_other(&self, op: SqOp) {
        match op {
            SqOp::Send { .. } => unreachable!("sends are executed against a receive descriptor"),
            SqOp::Write {
                wr_id,
                data,
                remote_addr,
                rkey,
                signaled,
            } => {
                let peer = match self.peer_arc() {
                    Some(p) => p,
                    None => {
                        if signaled {
                            self.complete(wr_id, WcOpcode::RdmaWrite, WcStatus::FlushErr, 0);
                        }
                        return;
                    }
                };
                match peer
                    .pd
                    .resolve(rkey, remote_addr, data.len(), AccessFlags::REMOTE_WRITE)
                {
                    Ok(dst) => {
                        // Safety: the peer's region table vouched for the
                        // target range while the key is bound. Bytes land in
                        // increasing address order — pollers rely on the
                        // last byte arriving last.
                        unsafe {
                            copy_in_address_order(data.as_ptr(), dst as *mut u8, data.len());
                        }
                        fence(Ordering::Release);
                        if signaled {
                            self.complete(
                                wr_id,
                                WcOpcode::RdmaWrite,
                                WcStatus::Success,
                                data.len() as u32,
                            );
                        }
                    }
                    Err(_) => {
                        // Access faults always complete, signaled or not.
                        self.error.store(true, Ordering::SeqCst);
                        self.complete(wr_id, WcOpcode::RdmaWrite, WcStatus::RemoteAccessErr, 0);
                    }
                }
            }
            SqOp::Read {
                wr_id,
                local_addr,
                len,
                remote_addr,
                rkey,
                signaled,
            } => {
                let peer = match self.peer_arc() {
                    Some(p) => p,
                    None => {
                        if signaled {
                            self.complete(wr_id, WcOpcode::RdmaRead, WcStatus::FlushErr, 0);
                        }
                        return;
                    }
                };
                match peer
                    .pd
                    .resolve(rkey, remote_addr, len as usize, AccessFlags::REMOTE_READ)
                {
                    Ok(src) => {
                        fence(Ordering::Acquire);
                        // Safety: source vouched for by the peer's region
                        // table; destination is the caller's posted buffer.
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                src as *const u8,
                                local_addr as *mut u8,
                                len as usize,
                            );
                        }
                        if signaled {
                            self.complete(wr_id, WcOpcode::RdmaRead, WcStatus::Success, len);
                        }
                    }
                    Err(_) => {
                        self.error.store(true, Ordering::SeqCst);
                        self.complete(wr_id, WcOpcode::RdmaRead, WcStatus::RemoteAccessErr, 0);
                    }
                }
            }
            SqOp::LocalInv {
                wr_id,
                rkey,
                signaled,
            } => {
                self.pd.invalidate(rkey);
                if signaled {
                    self.complete(wr_id, WcOpcode::LocalInv, WcStatus::Success, 0);
                }
            }
            SqOp::RegMr {
                wr_id,
                mr,
                addr,
                len,
                key,
                access,
                signaled,
            } => {
                let rkey = mr.set_key(key);
                mr.pd().commit(rkey, addr, len, access);
                if signaled {
                    self.complete(wr_id, WcOpcode::RegMr, WcStatus::Success, 0);
                }
            }
        }
    }

    pub(crate) fn set_error(self: &Arc<Self>) {
        self.error.store(true, Ordering::SeqCst);
        let drained: Vec<SqOp> = {
            let mut sq = self.sq.lock().unwrap();
            sq.drain(..).collect()
        };
        for op in drained {
            if op.signaled() {
                self.complete(op.wr_id(), op.opcode(), WcStatus::FlushErr, 0);
            }
        }
    }

    pub(crate) fn link(a: &Arc<QpInner>, b: &Arc<QpInner>) {
        *a.peer.lock().unwrap() = Some(Arc::downgrade(b));
        *b.peer.lock().unwrap() = Some(Arc::downgrade(a));
    }
}

/// A reliable-connected queue pair handle.
pub struct Qp {
    inner: Arc<QpInner>,
}

impl Qp {
    pub(crate) fn new(pd: &Pd, caps: QpCaps, send_cq: &Cq, recv_cq: &Cq) -> Self {
        Self {
            inner: Arc::new(QpInner {
                pd: pd.clone(),
                caps,
                send_cq: send_cq.shared(),
                recv_cq: recv_cq.shared(),
                sq: Mutex::new(VecDeque::new()),
                recv_q: Mutex::new(VecDeque::new()),
                peer: Mutex::new(None),
                error: AtomicBool::new(false),
                run_lock: Mutex::new(()),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<QpInner> {
        &self.inner
    }

    pub fn is_error(&self) -> bool {
        self.inner.error.load(Ordering::SeqCst)
    }

    /// Post a chain of work requests to the send queue.
    ///
    /// The chain executes in order relative to everything already posted.
    /// Local buffers named by the requests must stay valid and unmodified
    /// until the corresponding completion is observed.
    pub fn post_send(&self, wrs: &[SendWr<'_>]) -> io::Result<()> {
        if self.is_error() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "queue pair is in the error state",
            ));
        }
        {
            let mut sq = self.inner.sq.lock().unwrap();
            for wr in wrs {
                sq.push_back(match wr {
                    SendWr::Send {
                        wr_id,
                        sge,
                        signaled,
                    } => SqOp::Send {
                        wr_id: *wr_id,
                        data: copy_sge(sge),
                        signaled: *signaled,
                    },
                    SendWr::RdmaWrite {
                        wr_id,
                        sge,
                        remote_addr,
                        rkey,
                        signaled,
                    } => SqOp::Write {
                        wr_id: *wr_id,
                        data: copy_sge(sge),
                        remote_addr: *remote_addr,
                        rkey: *rkey,
                        signaled: *signaled,
                    },
                    SendWr::RdmaRead {
                        wr_id,
                        sge,
                        remote_addr,
                        rkey,
                        signaled,
                    } => SqOp::Read {
                        wr_id: *wr_id,
                        local_addr: sge.addr,
                        len: sge.len,
                        remote_addr: *remote_addr,
                        rkey: *rkey,
                        signaled: *signaled,
                    },
                    SendWr::LocalInv {
                        wr_id,
                        rkey,
                        signaled,
                    } => SqOp::LocalInv {
                        wr_id: *wr_id,
                        rkey: *rkey,
                        signaled: *signaled,
                    },
                    SendWr::RegMr {
                        wr_id,
                        mr,
                        addr,
                        len,
                        key,
                        access,
                        signaled,
                    } => SqOp::RegMr {
                        wr_id: *wr_id,
                        mr: (*mr).clone(),
                        addr: *addr,
                        len: *len,
                        key: *key,
                        access: *access,
                        signaled: *signaled,
                    },
                });
            }
        }
        self.inner.process_sq();
        Ok(())
    }

    /// Post a receive descriptor for the buffer at `[addr, addr + len)`.
    pub fn post_recv(&self, wr_id: u64, addr: u64, len: u32) -> io::Result<()> {
        if self.is_error() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "queue pair is in the error state",
            ));
        }
        self.inner
            .recv_q
            .lock()
            .unwrap()
            .push_back(RecvDesc { wr_id, addr, len });
        // A send may be parked at the peer waiting for this descriptor.
        if let Some(peer) = self.inner.peer_arc() {
            peer.process_sq();
        }
        Ok(())
    }
}

fn copy_sge(sge: &Sge) -> Vec<u8> {
    // Safety: post_send's contract requires the SGE to address memory that
    // is valid for the duration of the call.
    unsafe { std::slice::from_raw_parts(sge.addr as *const u8, sge.len as usize).to_vec() }
}

/// Byte-wise volatile copy in increasing address order.
///
/// One-sided writes are observed by busy-polling peers without any lock
/// between writer and poller; volatile stores keep the bytes in address
/// order so a flag in the last byte covers everything before it.
///
/// # Safety
/// `src` and `dst` must be valid for `len` bytes and must not overlap.
unsafe fn copy_in_address_order(src: *const u8, dst: *mut u8, len: usize) {
    for i in 0..len {
        std::ptr::write_volatile(dst.add(i), std::ptr::read(src.add(i)));
    }
}
