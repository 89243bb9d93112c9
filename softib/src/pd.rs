//! Protection domains and memory regions.
//!
//! A [`Pd`] owns the table of remotely addressable regions. One-sided
//! operations resolve `(rkey, addr, len)` against this table; a lookup only
//! succeeds while the key is bound and the binding grants the requested
//! access. Rebinding a region to a new range goes through the queue pair as
//! an invalidate + register work-request chain, so the table transitions in
//! posting order with the rest of the send queue.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::types::AccessFlags;

#[derive(Debug, Clone, Copy)]
struct Binding {
    addr: u64,
    len: usize,
    access: AccessFlags,
}

#[derive(Default)]
struct PdState {
    regions: HashMap<u32, Binding>,
}

struct PdInner {
    state: Mutex<PdState>,
    next_base: AtomicU32,
}

/// A protection domain.
#[derive(Clone)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl Pd {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PdInner {
                state: Mutex::new(PdState::default()),
                // Key 0 is reserved for the direct DMA key.
                next_base: AtomicU32::new(0x100),
            }),
        }
    }

    /// Key addressing local memory directly, without a region binding.
    pub fn local_dma_lkey(&self) -> u32 {
        0
    }

    /// Allocate an unbound memory region handle.
    ///
    /// The region becomes remotely reachable once a register work request
    /// naming it completes on a queue pair of this domain.
    pub fn alloc_mr(&self) -> MemoryRegion {
        let base = self.inner.next_base.fetch_add(0x100, Ordering::Relaxed);
        MemoryRegion {
            inner: Arc::new(MrInner {
                pd: self.clone(),
                state: Mutex::new(MrState { rkey: base }),
            }),
        }
    }

    /// Allocate a region and bind it immediately.
    pub fn register(&self, ptr: *mut u8, len: usize, access: AccessFlags) -> io::Result<MemoryRegion> {
        let mr = self.alloc_mr();
        self.commit(mr.rkey(), ptr as u64, len, access);
        Ok(mr)
    }

    /// Resolve a remote access against the region table.
    ///
    /// Returns the (identity-mapped) target address on success.
    pub(crate) fn resolve(
        &self,
        rkey: u32,
        addr: u64,
        len: usize,
        need: AccessFlags,
    ) -> io::Result<u64> {
        let state = self.inner.state.lock().unwrap();
        let binding = state
            .regions
            .get(&rkey)
            .ok_or_else(|| io::Error::new(io::ErrorKind::PermissionDenied, "unknown rkey"))?;
        let end = binding.addr + binding.len as u64;
        if addr < binding.addr || addr + len as u64 > end {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "access outside region bounds",
            ));
        }
        if !binding.access.contains(need) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "access right not granted",
            ));
        }
        Ok(addr)
    }

    pub(crate) fn commit(&self, rkey: u32, addr: u64, len: usize, access: AccessFlags) {
        let mut state = self.inner.state.lock().unwrap();
        state.regions.insert(rkey, Binding { addr, len, access });
    }

    pub(crate) fn invalidate(&self, rkey: u32) {
        let mut state = self.inner.state.lock().unwrap();
        state.regions.remove(&rkey);
    }
}

impl Default for Pd {
    fn default() -> Self {
        Self::new()
    }
}

struct MrState {
    rkey: u32,
}

struct MrInner {
    pd: Pd,
    state: Mutex<MrState>,
}

impl Drop for MrInner {
    fn drop(&mut self) {
        let rkey = self.state.lock().unwrap().rkey;
        self.pd.invalidate(rkey);
    }
}

/// A registered memory region handle.
///
/// Clones share the underlying region object; the binding is released when
/// the last clone drops.
#[derive(Clone)]
pub struct MemoryRegion {
    inner: Arc<MrInner>,
}

impl MemoryRegion {
    /// Current remote key.
    pub fn rkey(&self) -> u32 {
        self.inner.state.lock().unwrap().rkey
    }

    /// Current local key. Identical to the remote key in this fabric.
    pub fn lkey(&self) -> u32 {
        self.rkey()
    }

    /// Roll the low byte of the key, returning the new remote key.
    ///
    /// The new key takes effect for remote peers once a register work
    /// request naming this region completes; the previous key must be
    /// invalidated through the queue pair first.
    pub fn set_key(&self, key: u8) -> u32 {
        let mut state = self.inner.state.lock().unwrap();
        state.rkey = (state.rkey & !0xff) | key as u32;
        state.rkey
    }

    pub(crate) fn pd(&self) -> &Pd {
        &self.inner.pd
    }
}
