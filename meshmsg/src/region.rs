//! Per-peer pools of reusable registered regions.
//!
//! Every peer carries a fixed number of region slots per pool kind. A slot
//! is acquired from a bitmap, bound to a virtual range under a freshly
//! rolled key, used for exactly one operation, and released. Binding posts
//! an unsignaled invalidate + register chain, so the slot is remotely
//! reachable by the time any later signaled work request on the same queue
//! pair completes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use softib::{AccessFlags, MemoryRegion, Pd, Qp, SendWr};

use crate::config::ACQUIRE_SPIN_LIMIT;
use crate::error::{Error, Result};

/// Pool kinds. Each kind has its own bitmap and slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// General-purpose bulk transfer windows.
    Bulk = 0,
    /// The node's own notify sentinel array, written by peers.
    SentinelLocal = 1,
    /// One-byte sources for sentinel writes towards peers.
    SentinelPeer = 2,
}

pub const POOL_KINDS: usize = 3;

const KINDS: [PoolKind; POOL_KINDS] = [
    PoolKind::Bulk,
    PoolKind::SentinelLocal,
    PoolKind::SentinelPeer,
];

struct RegionSlot {
    mr: MemoryRegion,
    next_key: AtomicU8,
}

struct KindPool {
    bitmap: Mutex<u64>,
    slots: Vec<RegionSlot>,
}

/// The per-peer region pool, all kinds included.
pub struct RegionPool {
    kinds: [KindPool; POOL_KINDS],
    pool_size: usize,
}

impl RegionPool {
    pub fn new(pd: &Pd, pool_size: usize) -> Self {
        assert!(pool_size >= 1 && pool_size <= 64);
        let kinds = std::array::from_fn(|_| KindPool {
            bitmap: Mutex::new(0),
            slots: (0..pool_size)
                .map(|_| RegionSlot {
                    mr: pd.alloc_mr(),
                    next_key: AtomicU8::new(1),
                })
                .collect(),
        });
        Self { kinds, pool_size }
    }

    /// Acquire a free slot, yielding while the pool is exhausted.
    pub fn acquire(&self, kind: PoolKind) -> Result<usize> {
        self.acquire_spinning(kind, ACQUIRE_SPIN_LIMIT)
    }

    fn acquire_spinning(&self, kind: PoolKind, limit: usize) -> Result<usize> {
        let pool = &self.kinds[kind as usize];
        let mut spins = 0;
        loop {
            {
                let mut bits = pool.bitmap.lock().unwrap();
                let slot = (!*bits).trailing_zeros() as usize;
                if slot < self.pool_size {
                    *bits |= 1 << slot;
                    return Ok(slot);
                }
            }
            spins += 1;
            if spins >= limit {
                return Err(Error::PoolExhausted);
            }
            std::thread::yield_now();
        }
    }

    /// Bind an acquired slot to `[addr, addr + len)` under a fresh key.
    ///
    /// Posts the invalidate + register chain on `qp` and returns the new
    /// remote key. The caller must hold the peer's posting lock.
    pub fn bind(&self, qp: &Qp, kind: PoolKind, slot: usize, addr: u64, len: usize) -> Result<u32> {
        let s = &self.kinds[kind as usize].slots[slot];
        debug_assert!(
            *self.kinds[kind as usize].bitmap.lock().unwrap() & (1 << slot) != 0,
            "binding a slot that was not acquired"
        );
        let old_rkey = s.mr.rkey();
        let key = s.next_key.fetch_add(1, Ordering::Relaxed);
        let rkey = s.mr.set_key(key);
        qp.post_send(&[
            SendWr::LocalInv {
                wr_id: 0,
                rkey: old_rkey,
                signaled: false,
            },
            SendWr::RegMr {
                wr_id: 0,
                mr: &s.mr,
                addr,
                len,
                key,
                access: AccessFlags::LOCAL_WRITE
                    | AccessFlags::REMOTE_READ
                    | AccessFlags::REMOTE_WRITE
                    | AccessFlags::REMOTE_ATOMIC,
                signaled: false,
            },
        ])?;
        Ok(rkey)
    }

    /// Release an acquired slot.
    ///
    /// The caller must not have any operation in flight that still names the
    /// slot's region.
    pub fn release(&self, kind: PoolKind, slot: usize) {
        let mut bits = self.kinds[kind as usize].bitmap.lock().unwrap();
        assert!(*bits & (1 << slot) != 0, "releasing a free region slot");
        *bits &= !(1 << slot);
    }

    /// Population count of the kind's bitmap.
    pub fn bound_count(&self, kind: PoolKind) -> u32 {
        self.kinds[kind as usize].bitmap.lock().unwrap().count_ones()
    }

    /// Total population across all kinds.
    pub fn bound_total(&self) -> u32 {
        KINDS.iter().map(|&k| self.bound_count(k)).sum()
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_tracks_bitmap() {
        let pd = Pd::new();
        let pool = RegionPool::new(&pd, 4);
        let a = pool.acquire(PoolKind::Bulk).unwrap();
        let b = pool.acquire(PoolKind::Bulk).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.bound_count(PoolKind::Bulk), 2);
        assert_eq!(pool.bound_count(PoolKind::SentinelLocal), 0);
        pool.release(PoolKind::Bulk, a);
        assert_eq!(pool.bound_count(PoolKind::Bulk), 1);
        let c = pool.acquire(PoolKind::Bulk).unwrap();
        assert_eq!(c, a);
        pool.release(PoolKind::Bulk, b);
        pool.release(PoolKind::Bulk, c);
        assert_eq!(pool.bound_total(), 0);
    }

    #[test]
    fn exhaustion_reports_after_bounded_spinning() {
        let pd = Pd::new();
        let pool = RegionPool::new(&pd, 2);
        let _a = pool.acquire(PoolKind::Bulk).unwrap();
        let _b = pool.acquire(PoolKind::Bulk).unwrap();
        match pool.acquire_spinning(PoolKind::Bulk, 16) {
            Err(Error::PoolExhausted) => {}
            other => panic!("expected PoolExhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    #[should_panic(expected = "releasing a free region slot")]
    fn double_release_is_a_bug() {
        let pd = Pd::new();
        let pool = RegionPool::new(&pd, 2);
        let a = pool.acquire(PoolKind::Bulk).unwrap();
        pool.release(PoolKind::Bulk, a);
        pool.release(PoolKind::Bulk, a);
    }

    #[test]
    fn kinds_are_independent() {
        let pd = Pd::new();
        let pool = RegionPool::new(&pd, 2);
        let _a = pool.acquire(PoolKind::SentinelLocal).unwrap();
        let _b = pool.acquire(PoolKind::SentinelPeer).unwrap();
        assert_eq!(pool.bound_count(PoolKind::Bulk), 0);
        assert_eq!(pool.bound_count(PoolKind::SentinelLocal), 1);
        assert_eq!(pool.bound_count(PoolKind::SentinelPeer), 1);
        assert_eq!(pool.bound_total(), 2);
    }
}
