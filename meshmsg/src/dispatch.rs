//! Message dispatch: the type-to-handler table and delivered-buffer
//! ownership.
//!
//! Registration is one-shot; registering a type twice is a programming
//! error and panics. A [`Delivery`] owns its buffer until dropped: buffers
//! that came from a peer's pre-posted pool are re-posted to the fabric,
//! locally forged buffers are freed. Handlers that need to keep a message
//! beyond their own scope simply keep the `Delivery`.

use std::sync::{Arc, Mutex};

use crate::wire::{MessageHeader, RdmaHeader, HEADER_SIZE, RDMA_HEADER_SIZE, TYPE_MAX};
use crate::MessengerInner;

/// A registered message handler.
pub type Handler = Arc<dyn Fn(Delivery) + Send + Sync + 'static>;

pub(crate) struct HandlerTable {
    slots: Mutex<Vec<Option<Handler>>>,
}

impl HandlerTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new((0..TYPE_MAX).map(|_| None).collect()),
        }
    }

    pub(crate) fn register<F>(&self, msg_type: u16, handler: F)
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        assert!(msg_type < TYPE_MAX, "message type {} out of range", msg_type);
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[msg_type as usize];
        assert!(slot.is_none(), "message type {} registered twice", msg_type);
        *slot = Some(Arc::new(handler));
    }

    pub(crate) fn get(&self, msg_type: u16) -> Option<Handler> {
        self.slots.lock().unwrap()[msg_type as usize].clone()
    }

    pub(crate) fn has(&self, msg_type: u16) -> bool {
        msg_type < TYPE_MAX && self.slots.lock().unwrap()[msg_type as usize].is_some()
    }
}

pub(crate) enum DeliveryKind {
    /// Buffer borrowed from the peer's pre-posted receive pool.
    Pooled { peer: usize, item: usize },
    /// Locally forged buffer (reply path, self-delivery).
    Owned { buf: Box<[u8]> },
}

/// A message handed to a handler, owning its buffer until dropped.
pub struct Delivery {
    inner: Arc<MessengerInner>,
    kind: DeliveryKind,
}

impl Delivery {
    pub(crate) fn pooled(inner: Arc<MessengerInner>, peer: usize, item: usize) -> Self {
        Self {
            inner,
            kind: DeliveryKind::Pooled { peer, item },
        }
    }

    pub(crate) fn owned(inner: Arc<MessengerInner>, buf: Box<[u8]>) -> Self {
        Self {
            inner,
            kind: DeliveryKind::Owned { buf },
        }
    }

    fn base_ptr(&self) -> *const u8 {
        match &self.kind {
            DeliveryKind::Pooled { peer, item } => {
                let conn = self.inner.cbs[*peer].conn.get().expect("pooled delivery without connection");
                conn.recv_pool.item_ptr(*item)
            }
            DeliveryKind::Owned { buf } => buf.as_ptr(),
        }
    }

    pub fn header(&self) -> MessageHeader {
        unsafe { MessageHeader::read_from(self.base_ptr()) }
    }

    /// The bulk sub-header, if the message carries one.
    pub fn rdma_header(&self) -> Option<RdmaHeader> {
        let hdr = self.header();
        if hdr.is_rdma() {
            Some(unsafe { RdmaHeader::read_from(self.base_ptr().add(HEADER_SIZE)) })
        } else {
            None
        }
    }

    pub fn from_node(&self) -> usize {
        self.header().from_node as usize
    }

    /// Payload bytes after the header(s).
    pub fn payload(&self) -> &[u8] {
        let hdr = self.header();
        let offset = if hdr.is_rdma() {
            HEADER_SIZE + RDMA_HEADER_SIZE
        } else {
            HEADER_SIZE
        };
        let total = hdr.total_size as usize;
        debug_assert!(total >= offset);
        unsafe { std::slice::from_raw_parts(self.base_ptr().add(offset), total - offset) }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let DeliveryKind::Pooled { peer, item } = &self.kind {
            let (peer, item) = (*peer, *item);
            if let Some(conn) = self.inner.cbs[peer].conn.get() {
                let _guard = conn.post_lock.lock().unwrap();
                // On a dead connection the item simply stays held.
                let _ = conn.recv_pool.repost(&conn.qp, item);
            }
        }
    }
}
