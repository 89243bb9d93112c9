//! Per-peer pool of pre-posted receive buffers.
//!
//! Every item is a maximum-size buffer owned alternately by the fabric
//! (posted) and by a handler (held). Items transition only through this
//! pool: posted at setup, handed to the dispatcher on a receive completion,
//! and re-posted once the consumer is done. The sum of posted and held
//! items is constant.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use softib::Qp;

use crate::buffer::DmaBuffer;

pub struct RecvPool {
    items: Vec<DmaBuffer>,
    posted: AtomicUsize,
}

impl RecvPool {
    pub fn new(count: usize, buf_size: usize) -> Self {
        Self {
            items: (0..count).map(|_| DmaBuffer::new(buf_size)).collect(),
            posted: AtomicUsize::new(0),
        }
    }

    /// Post every item to the queue pair. Item index doubles as the work
    /// request identifier.
    pub fn post_all(&self, qp: &Qp) -> io::Result<()> {
        for (i, item) in self.items.iter().enumerate() {
            qp.post_recv(i as u64, item.addr(), item.len() as u32)?;
            self.posted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Pointer to an item's buffer.
    pub fn item_ptr(&self, idx: usize) -> *mut u8 {
        self.items[idx].as_mut_ptr()
    }

    pub fn item_len(&self) -> usize {
        self.items[0].len()
    }

    /// Account for an item moving from the fabric to a consumer.
    pub(crate) fn note_held(&self) {
        let prev = self.posted.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "receive item accounting underflow");
    }

    /// Return an item to the fabric.
    pub fn repost(&self, qp: &Qp, idx: usize) -> io::Result<()> {
        let item = &self.items[idx];
        qp.post_recv(idx as u64, item.addr(), item.len() as u32)?;
        self.posted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn posted(&self) -> usize {
        self.posted.load(Ordering::SeqCst)
    }

    pub fn held(&self) -> usize {
        self.total() - self.posted()
    }
}
