//! Chunked ring allocator for staging outbound messages.
//!
//! The allocator hands out variable-size blocks from a bounded FIFO of
//! physically contiguous chunks. Each block carries a 4-byte header holding
//! a reclaim bit, a terminator bit, and the block size; releasing a block
//! marks it reclaimable and the head then advances past every contiguous
//! reclaimed block, so reclamation cost is amortized across frees.
//!
//! When a block does not fit in the remainder of the current chunk, a
//! terminator header is written over the remainder and allocation continues
//! at the start of the next chunk; a wraparound counter disambiguates a full
//! ring from an empty one. If less than one alignment unit would remain
//! after a block, the remainder is annexed into the block as padding.
//!
//! All state transitions happen under one lock held across the whole head /
//! tail / wraparound update. `put` may be called from any context; `get`
//! returns `None` when the allocator cannot advance without overrunning the
//! head, and the caller yields and retries.

use std::ptr::NonNull;
use std::sync::Mutex;

/// Block alignment: headers and payloads start on 64-byte boundaries.
pub const RB_ALIGN: usize = 64;

const RB_HEADER_MAGIC: u8 = 0xa9;
const HDR_SIZE: usize = 4;

/// Page size used for chunk allocation.
const PAGE_SIZE: usize = 4096;

const RECLAIM_BIT: u32 = 1 << 0;
const LAST_BIT: u32 = 1 << 1;
const SIZE_SHIFT: u32 = 2;
const SIZE_BITS: u32 = 22;
const SIZE_MASK: u32 = (1 << SIZE_BITS) - 1;
const MAGIC_SHIFT: u32 = 24;

#[inline]
fn align_up(v: usize) -> usize {
    (v + RB_ALIGN - 1) & !(RB_ALIGN - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pos {
    chunk: usize,
    off: usize,
}

struct RingState {
    head: Pos,
    tail: Pos,
    wraparound: u32,
    peak: usize,
}

struct Chunk {
    ptr: *mut u8,
}

/// The chunked ring allocator.
pub struct RingBuffer {
    chunks: Vec<Chunk>,
    chunk_size: usize,
    state: Mutex<RingState>,
}

// Safety: the chunk pointers are owned by the allocator and every access to
// block headers happens under the state lock; payload bytes are owned by the
// holder of the block between get and put.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Allocate a ring of `nr_chunks` chunks of `chunk_size` bytes each.
    pub fn new(nr_chunks: usize, chunk_size: usize) -> Self {
        assert!(nr_chunks >= 1);
        assert!(chunk_size % RB_ALIGN == 0);
        assert!(chunk_size <= (SIZE_MASK as usize), "chunk size exceeds header size field");
        let mut chunks = Vec::with_capacity(nr_chunks);
        for _ in 0..nr_chunks {
            let ptr = unsafe {
                let mut p: *mut libc::c_void = std::ptr::null_mut();
                let ret = libc::posix_memalign(&mut p, PAGE_SIZE, chunk_size);
                assert_eq!(ret, 0, "chunk allocation failed");
                std::ptr::write_bytes(p as *mut u8, 0, chunk_size);
                p as *mut u8
            };
            chunks.push(Chunk { ptr });
        }
        Self {
            chunks,
            chunk_size,
            state: Mutex::new(RingState {
                head: Pos { chunk: 0, off: 0 },
                tail: Pos { chunk: 0, off: 0 },
                wraparound: 0,
                peak: 0,
            }),
        }
    }

    #[inline]
    fn hdr_ptr(&self, pos: Pos) -> *mut u8 {
        debug_assert!(pos.off + HDR_SIZE <= self.chunk_size);
        unsafe { self.chunks[pos.chunk].ptr.add(pos.off) }
    }

    #[inline]
    unsafe fn write_hdr(ptr: *mut u8, reclaim: bool, last: bool, size: usize) {
        let word = (reclaim as u32) * RECLAIM_BIT
            | (last as u32) * LAST_BIT
            | ((size as u32) & SIZE_MASK) << SIZE_SHIFT
            | (RB_HEADER_MAGIC as u32) << MAGIC_SHIFT;
        std::ptr::write_unaligned(ptr as *mut u32, word.to_le());
    }

    #[inline]
    unsafe fn read_hdr(ptr: *const u8) -> (bool, bool, usize, u8) {
        let word = u32::from_le(std::ptr::read_unaligned(ptr as *const u32));
        (
            word & RECLAIM_BIT != 0,
            word & LAST_BIT != 0,
            ((word >> SIZE_SHIFT) & SIZE_MASK) as usize,
            (word >> MAGIC_SHIFT) as u8,
        )
    }

    #[inline]
    fn next_chunk(&self, idx: usize) -> (usize, bool) {
        let n = idx + 1;
        if n >= self.chunks.len() {
            (0, true)
        } else {
            (n, false)
        }
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// Returns `None` when the ring is full; the caller yields and retries.
    /// Must not be called while holding the returned block's header (i.e.
    /// not reentrantly from a reclaim path).
    pub fn get(&self, size: usize) -> Option<NonNull<u8>> {
        let mut size = align_up(HDR_SIZE + size) - HDR_SIZE;
        let cs = self.chunk_size;
        assert!(
            HDR_SIZE + size <= cs,
            "allocation of {} bytes exceeds chunk size {}",
            size,
            cs
        );

        let mut st = self.state.lock().unwrap();
        if st.tail.off + HDR_SIZE + size > cs {
            // Terminate the chunk and continue in the next one.
            let term = cs - (st.tail.off + HDR_SIZE);
            unsafe { Self::write_hdr(self.hdr_ptr(st.tail), true, true, term) };
            let (next, wrapped) = self.next_chunk(st.tail.chunk);
            st.tail.chunk = next;
            st.tail.off = 0;
            if wrapped {
                st.wraparound += 1;
            }
        }

        if st.wraparound > 0
            && st.head.chunk == st.tail.chunk
            && st.tail.off + HDR_SIZE + size > st.head.off
        {
            return None;
        }

        let hdr_pos = st.tail;
        st.tail.off += HDR_SIZE + size;
        if st.tail.off + align_up(HDR_SIZE) >= cs {
            // Too little room for another block: annex the trailer.
            size += cs - st.tail.off;
            let (next, wrapped) = self.next_chunk(st.tail.chunk);
            st.tail.chunk = next;
            st.tail.off = 0;
            if wrapped {
                st.wraparound += 1;
            }
        }
        unsafe { Self::write_hdr(self.hdr_ptr(hdr_pos), false, false, size) };

        Some(unsafe { NonNull::new_unchecked(self.hdr_ptr(hdr_pos).add(HDR_SIZE)) })
    }

    /// Release a block obtained from [`get`](Self::get).
    ///
    /// # Safety
    /// `buf` must be a pointer previously returned by `get` on this ring and
    /// not yet released.
    pub unsafe fn put(&self, buf: NonNull<u8>) {
        let hdr = buf.as_ptr().sub(HDR_SIZE);
        let mut st = self.state.lock().unwrap();
        {
            let (_, last, size, magic) = Self::read_hdr(hdr);
            debug_assert_eq!(magic, RB_HEADER_MAGIC);
            Self::write_hdr(hdr, true, last, size);
        }

        // Advance the head past every contiguous reclaimed block.
        loop {
            let ptr = self.hdr_ptr(st.head);
            let (reclaim, _, size, magic) = Self::read_hdr(ptr);
            if !reclaim {
                break;
            }
            debug_assert_eq!(magic, RB_HEADER_MAGIC);
            st.head.off += HDR_SIZE + size;
            if st.head.off == self.chunk_size {
                let (next, wrapped) = self.next_chunk(st.head.chunk);
                st.head.chunk = next;
                st.head.off = 0;
                if wrapped {
                    st.wraparound -= 1;
                }
            }
            if st.head == st.tail {
                break;
            }
        }
    }

    /// Bytes currently held by outstanding and not-yet-reclaimed blocks,
    /// terminators included.
    pub fn usage(&self) -> usize {
        let mut st = self.state.lock().unwrap();
        let cs = self.chunk_size;
        let n = self.chunks.len();
        let used = if st.head.chunk == st.tail.chunk {
            if st.wraparound == 0 {
                st.tail.off - st.head.off
            } else {
                n * cs - (st.head.off - st.tail.off)
            }
        } else {
            (cs - st.head.off)
                + st.tail.off
                + ((st.tail.chunk + st.wraparound as usize * n) - st.head.chunk - 1) * cs
        };
        if used > st.peak {
            st.peak = used;
        }
        used
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.chunks.len() * self.chunk_size
    }

    /// High-water mark of [`usage`](Self::usage).
    pub fn peak_usage(&self) -> usize {
        self.state.lock().unwrap().peak
    }

    #[cfg(test)]
    fn snapshot(&self) -> ((usize, usize), (usize, usize), u32) {
        let st = self.state.lock().unwrap();
        (
            (st.head.chunk, st.head.off),
            (st.tail.chunk, st.tail.off),
            st.wraparound,
        )
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        for c in &self.chunks {
            unsafe { libc::free(c.ptr as *mut libc::c_void) };
        }
    }
}
