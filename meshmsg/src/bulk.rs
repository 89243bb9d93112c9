//! One-sided bulk transfer engine.
//!
//! Two roles: the *initiator* advertises a region and sends a typed request;
//! the *responder* performs the one-sided access against the advertised
//! region. The `is_write` flag names the responder's verb — a write request
//! makes the responder write its data into the initiator's region (the
//! fetch direction), a read request makes the responder pull the
//! initiator's buffer into its own.
//!
//! Completion comes in two flavors, chosen per operation:
//! - *acknowledged*: the responder sends a reply echoing the region slot
//!   and rendezvous tag; the initiator's reply handler releases the slot
//!   and wakes the parked caller.
//! - *polled* (writes only): no reply flows. In the *inline* variant the
//!   responder frames the data with a length head and flag bytes so the
//!   initiator's buffer is self-describing; in the *notify* variant the
//!   responder issues a second one-byte write to the sentinel the initiator
//!   advertised at key exchange. The initiator busy-waits with yield on the
//!   sentinel byte and releases its slot itself.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use softib::{SendWr, Sge};

use crate::buffer::DmaBuffer;
use crate::channel;
use crate::config::{
    MAX_BULK_SIZE, MAX_BULK_SIZE_INLINE, POLL_HEAD, POLL_HEAD_AND_TAIL, POLL_IS_DATA, POLL_IS_IDLE,
};
use crate::dispatch::Delivery;
use crate::error::{Error, Result};
use crate::peer::{ConnState, PeerCb, PeerConn};
use crate::region::PoolKind;
use crate::wire::{
    MessageHeader, RdmaHeader, FLAG_NOTIFY, FLAG_POLLED, FLAG_RDMA, FLAG_RDMA_ACK, FLAG_WRITE,
    HEADER_SIZE, RDMA_HEADER_SIZE,
};
use crate::MessengerInner;

/// Completion flavor of one bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkMode {
    /// One-sided access followed by an explicit reply message.
    Acknowledged,
    /// One-sided write framed with a length head and flag bytes the
    /// initiator polls; the payload stays in the staging buffer.
    PolledInline,
    /// One-sided write followed by a second one-byte write to the sentinel
    /// advertised at key exchange.
    PolledNotify,
}

/// Payload of an inline-polled fetch, owning its staging buffer.
pub struct BulkReply {
    buf: DmaBuffer,
    offset: usize,
    len: usize,
}

impl BulkReply {
    pub fn data(&self) -> &[u8] {
        unsafe { &self.buf.as_slice()[self.offset..self.offset + self.len] }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Busy-wait with yield until the sentinel byte flips, or the connection
/// dies.
fn poll_sentinel(cb: &PeerCb, ptr: *const u8) -> Result<()> {
    loop {
        let v = unsafe { std::ptr::read_volatile(ptr) };
        if v != POLL_IS_IDLE {
            fence(Ordering::Acquire);
            return Ok(());
        }
        if cb.state.get() == ConnState::Error {
            return Err(Error::PeerUnreachable(cb.id));
        }
        std::thread::yield_now();
    }
}

/// Post one signaled work request and park until its completion.
fn run_signaled(
    conn: &PeerConn,
    peer: usize,
    build: impl FnOnce(u64) -> SendWr<'static>,
) -> Result<()> {
    let (token, waiter) = conn.add_waiter();
    conn.wq_wr.fetch_add(1, Ordering::SeqCst);
    let posted = {
        let _guard = conn.post_lock.lock().unwrap();
        conn.qp.post_send(&[build(token)])
    };
    if posted.is_err() {
        conn.wq_wr.fetch_sub(1, Ordering::SeqCst);
        conn.remove_waiter(token);
        return Err(Error::PeerUnreachable(peer));
    }
    if waiter.wait() {
        Ok(())
    } else {
        Err(Error::PeerUnreachable(peer))
    }
}

fn build_request(
    msg_type: u16,
    flags: u8,
    rdma: &RdmaHeader,
    payload: &[u8],
) -> Vec<u8> {
    let mut msg = vec![0u8; HEADER_SIZE + RDMA_HEADER_SIZE + payload.len()];
    let hdr = MessageHeader::new(msg_type, flags);
    unsafe {
        hdr.write_to(msg.as_mut_ptr());
        rdma.write_to(msg.as_mut_ptr().add(HEADER_SIZE));
    }
    msg[HEADER_SIZE + RDMA_HEADER_SIZE..].copy_from_slice(payload);
    msg
}

/// Initiator: ask `dst` to deliver up to `dest.len()` bytes into `dest`.
///
/// `mode` selects acknowledged or notify completion; the inline variant has
/// its own entry point because the payload lands in a staging buffer.
pub(crate) fn fetch(
    inner: &Arc<MessengerInner>,
    dst: usize,
    msg_type: u16,
    reply_type: u16,
    payload: &[u8],
    dest: &mut [u8],
    mode: BulkMode,
) -> Result<()> {
    assert!(
        mode != BulkMode::PolledInline,
        "inline fetches go through fetch_inline"
    );
    assert!(!dest.is_empty(), "zero-size bulk transfer");
    assert!(
        dest.len() <= MAX_BULK_SIZE,
        "bulk transfer of {} bytes exceeds the maximum",
        dest.len()
    );
    let conn = inner.conn(dst)?;
    let cb = &inner.cbs[dst];

    let slot = conn.regions.acquire(PoolKind::Bulk)?;
    let rkey = {
        let _guard = conn.post_lock.lock().unwrap();
        conn.regions
            .bind(&conn.qp, PoolKind::Bulk, slot, dest.as_ptr() as u64, dest.len())
            .map_err(|e| {
                conn.regions.release(PoolKind::Bulk, slot);
                e
            })?
    };

    let mut flags = FLAG_RDMA | FLAG_WRITE;
    let mut tag = 0;
    let mut waiter = None;
    match mode {
        BulkMode::Acknowledged => {
            let (t, w) = inner.rendezvous.register(dst);
            tag = t;
            waiter = Some(w);
        }
        BulkMode::PolledNotify => {
            debug_assert!(
                conn.notify_local_slot.get().is_some(),
                "sentinel key exchange has not run for peer {}",
                dst
            );
            flags |= FLAG_POLLED | FLAG_NOTIFY;
            unsafe {
                std::ptr::write_volatile(conn.notify_target.as_mut_ptr().add(slot), POLL_IS_IDLE);
            }
        }
        BulkMode::PolledInline => unreachable!(),
    }

    let rdma = RdmaHeader {
        peer_addr: dest.as_ptr() as u64,
        peer_key: rkey,
        transfer_size: dest.len() as u32,
        reply_type,
        region_slot: slot as u16,
        rendezvous_tag: tag,
        local_dma_addr: dest.as_ptr() as u64,
    };
    let mut msg = build_request(msg_type, flags, &rdma, payload);
    if let Err(e) = channel::send_message(inner, dst, &mut msg) {
        if waiter.is_some() {
            inner.rendezvous.cancel(tag);
        }
        conn.regions.release(PoolKind::Bulk, slot);
        return Err(e);
    }

    match mode {
        BulkMode::Acknowledged => {
            // Slot release and wakeup happen in the reply path.
            if waiter.unwrap().wait() {
                Ok(())
            } else {
                Err(Error::PeerUnreachable(dst))
            }
        }
        BulkMode::PolledNotify => {
            let sentinel = unsafe { conn.notify_target.as_ptr().add(slot) };
            poll_sentinel(cb, sentinel)?;
            conn.regions.release(PoolKind::Bulk, slot);
            Ok(())
        }
        BulkMode::PolledInline => unreachable!(),
    }
}

/// Initiator: inline-polled fetch of up to `max_size` bytes.
///
/// The responder writes a self-describing frame; the returned reply owns
/// the staging buffer and exposes the payload.
pub(crate) fn fetch_inline(
    inner: &Arc<MessengerInner>,
    dst: usize,
    msg_type: u16,
    reply_type: u16,
    payload: &[u8],
    max_size: usize,
) -> Result<BulkReply> {
    assert!(max_size > 0, "zero-size bulk transfer");
    assert!(
        max_size <= MAX_BULK_SIZE_INLINE,
        "inline bulk transfer of {} bytes exceeds the maximum",
        max_size
    );
    let conn = inner.conn(dst)?;
    let cb = &inner.cbs[dst];

    let staging = DmaBuffer::new(max_size + POLL_HEAD_AND_TAIL);
    unsafe {
        std::ptr::write_volatile(staging.as_mut_ptr().add(POLL_HEAD - 1), POLL_IS_IDLE);
    }

    let slot = conn.regions.acquire(PoolKind::Bulk)?;
    let rkey = {
        let _guard = conn.post_lock.lock().unwrap();
        conn.regions
            .bind(&conn.qp, PoolKind::Bulk, slot, staging.addr(), staging.len())
            .map_err(|e| {
                conn.regions.release(PoolKind::Bulk, slot);
                e
            })?
    };

    let rdma = RdmaHeader {
        peer_addr: staging.addr(),
        peer_key: rkey,
        transfer_size: max_size as u32,
        reply_type,
        region_slot: slot as u16,
        rendezvous_tag: 0,
        local_dma_addr: staging.addr(),
    };
    let mut msg = build_request(msg_type, FLAG_RDMA | FLAG_WRITE | FLAG_POLLED, &rdma, payload);
    if let Err(e) = channel::send_message(inner, dst, &mut msg) {
        conn.regions.release(PoolKind::Bulk, slot);
        return Err(e);
    }

    // Head flag first, then the length becomes trustworthy, then the tail
    // flag covers the payload bytes in between.
    poll_sentinel(cb, unsafe { staging.as_ptr().add(POLL_HEAD - 1) })?;
    let len = unsafe {
        u32::from_le(std::ptr::read_unaligned(staging.as_ptr() as *const u32)) as usize
    };
    assert!(len <= max_size, "responder wrote a corrupt inline frame");
    poll_sentinel(cb, unsafe {
        staging.as_ptr().add(len + POLL_HEAD_AND_TAIL - 1)
    })?;

    conn.regions.release(PoolKind::Bulk, slot);
    Ok(BulkReply {
        buf: staging,
        offset: POLL_HEAD,
        len,
    })
}

/// Initiator: expose `src` for the responder to pull, acknowledged.
///
/// Polled completion is write-only; read requests always use the
/// acknowledged flavor.
pub(crate) fn push(
    inner: &Arc<MessengerInner>,
    dst: usize,
    msg_type: u16,
    reply_type: u16,
    payload: &[u8],
    src: &[u8],
) -> Result<()> {
    assert!(!src.is_empty(), "zero-size bulk transfer");
    assert!(
        src.len() <= MAX_BULK_SIZE,
        "bulk transfer of {} bytes exceeds the maximum",
        src.len()
    );
    let conn = inner.conn(dst)?;

    let slot = conn.regions.acquire(PoolKind::Bulk)?;
    let rkey = {
        let _guard = conn.post_lock.lock().unwrap();
        conn.regions
            .bind(&conn.qp, PoolKind::Bulk, slot, src.as_ptr() as u64, src.len())
            .map_err(|e| {
                conn.regions.release(PoolKind::Bulk, slot);
                e
            })?
    };

    let (tag, waiter) = inner.rendezvous.register(dst);
    let rdma = RdmaHeader {
        peer_addr: src.as_ptr() as u64,
        peer_key: rkey,
        transfer_size: src.len() as u32,
        reply_type,
        region_slot: slot as u16,
        rendezvous_tag: tag,
        local_dma_addr: src.as_ptr() as u64,
    };
    let mut msg = build_request(msg_type, FLAG_RDMA, &rdma, payload);
    if let Err(e) = channel::send_message(inner, dst, &mut msg) {
        inner.rendezvous.cancel(tag);
        conn.regions.release(PoolKind::Bulk, slot);
        return Err(e);
    }

    if waiter.wait() {
        Ok(())
    } else {
        Err(Error::PeerUnreachable(dst))
    }
}

/// Compose the inline-poll frame: length head, head flag, payload, tail
/// flag.
pub(crate) unsafe fn compose_inline(dst: *mut u8, data: &[u8]) {
    std::ptr::write_unaligned(dst as *mut u32, (data.len() as u32).to_le());
    std::ptr::write(dst.add(POLL_HEAD - 1), POLL_IS_DATA);
    std::ptr::copy_nonoverlapping(data.as_ptr(), dst.add(POLL_HEAD), data.len());
    std::ptr::write(dst.add(POLL_HEAD + data.len()), POLL_IS_DATA);
}

/// Responder: satisfy a write request by delivering `data` into the
/// initiator's advertised region, completing per the request's flavor.
pub(crate) fn respond(inner: &Arc<MessengerInner>, req: &Delivery, data: &[u8]) -> Result<()> {
    let hdr = req.header();
    assert!(hdr.is_rdma() && !hdr.rdma_ack(), "not a bulk request");
    assert!(hdr.is_write(), "read requests are served with bulk_accept");
    let rh = req.rdma_header().unwrap();
    let from = hdr.from_node as usize;
    let conn = inner.conn(from)?;

    match (hdr.polled(), hdr.notify_variant()) {
        (true, false) => {
            // Inline variant: frame into the per-slot staging buffer and
            // deliver frame and payload with a single write.
            assert!(
                data.len() <= MAX_BULK_SIZE_INLINE && data.len() <= rh.transfer_size as usize,
                "response larger than the advertised region"
            );
            let slot = conn.regions.acquire(PoolKind::Bulk)?;
            let staging = &conn.poll_staging[slot];
            let dma_len = data.len() + POLL_HEAD_AND_TAIL;
            unsafe { compose_inline(staging.as_mut_ptr(), data) };
            let lkey = {
                let _guard = conn.post_lock.lock().unwrap();
                conn.regions
                    .bind(&conn.qp, PoolKind::Bulk, slot, staging.addr(), dma_len)
                    .map_err(|e| {
                        conn.regions.release(PoolKind::Bulk, slot);
                        e
                    })?
            };
            let addr = staging.addr();
            let res = run_signaled(&conn, from, move |wr_id| SendWr::RdmaWrite {
                wr_id,
                sge: Sge {
                    addr,
                    len: dma_len as u32,
                    lkey,
                },
                remote_addr: rh.peer_addr,
                rkey: rh.peer_key,
                signaled: true,
            });
            conn.regions.release(PoolKind::Bulk, slot);
            res
        }
        (true, true) => {
            // Notify variant: data write, then a one-byte sentinel write.
            assert!(
                data.len() <= rh.transfer_size as usize,
                "response larger than the advertised region"
            );
            let remote = *conn.remote_notify.lock().unwrap();
            let (notify_addr, notify_key) = remote.ok_or(Error::PeerUnreachable(from))?;

            let slot = conn.regions.acquire(PoolKind::Bulk)?;
            let lkey = {
                let _guard = conn.post_lock.lock().unwrap();
                conn.regions
                    .bind(&conn.qp, PoolKind::Bulk, slot, data.as_ptr() as u64, data.len())
                    .map_err(|e| {
                        conn.regions.release(PoolKind::Bulk, slot);
                        e
                    })?
            };
            let addr = data.as_ptr() as u64;
            let len = data.len() as u32;
            let res = run_signaled(&conn, from, move |wr_id| SendWr::RdmaWrite {
                wr_id,
                sge: Sge { addr, len, lkey },
                remote_addr: rh.peer_addr,
                rkey: rh.peer_key,
                signaled: true,
            });
            conn.regions.release(PoolKind::Bulk, slot);
            res?;

            let s2 = conn.regions.acquire(PoolKind::SentinelPeer)?;
            let src_addr = conn.notify_source.addr() + s2 as u64;
            let src_lkey = {
                let _guard = conn.post_lock.lock().unwrap();
                conn.regions
                    .bind(&conn.qp, PoolKind::SentinelPeer, s2, src_addr, 1)
                    .map_err(|e| {
                        conn.regions.release(PoolKind::SentinelPeer, s2);
                        e
                    })?
            };
            let res = run_signaled(&conn, from, move |wr_id| SendWr::RdmaWrite {
                wr_id,
                sge: Sge {
                    addr: src_addr,
                    len: 1,
                    lkey: src_lkey,
                },
                remote_addr: notify_addr + rh.region_slot as u64,
                rkey: notify_key,
                signaled: true,
            });
            conn.regions.release(PoolKind::SentinelPeer, s2);
            res
        }
        (false, _) => {
            // Acknowledged: write, then reply.
            assert!(
                data.len() <= rh.transfer_size as usize,
                "response larger than the advertised region"
            );
            let slot = conn.regions.acquire(PoolKind::Bulk)?;
            let lkey = {
                let _guard = conn.post_lock.lock().unwrap();
                conn.regions
                    .bind(&conn.qp, PoolKind::Bulk, slot, data.as_ptr() as u64, data.len())
                    .map_err(|e| {
                        conn.regions.release(PoolKind::Bulk, slot);
                        e
                    })?
            };
            let addr = data.as_ptr() as u64;
            let len = data.len() as u32;
            let res = run_signaled(&conn, from, move |wr_id| SendWr::RdmaWrite {
                wr_id,
                sge: Sge { addr, len, lkey },
                remote_addr: rh.peer_addr,
                rkey: rh.peer_key,
                signaled: true,
            });
            conn.regions.release(PoolKind::Bulk, slot);
            res?;

            send_ack(inner, from, &rh, FLAG_RDMA | FLAG_RDMA_ACK | FLAG_WRITE, data.len())
        }
    }
}

/// Responder: satisfy a read request by pulling the initiator's advertised
/// buffer into `dest`, then acknowledge. Returns the number of bytes
/// pulled.
pub(crate) fn accept(
    inner: &Arc<MessengerInner>,
    req: &Delivery,
    dest: &mut [u8],
) -> Result<usize> {
    let hdr = req.header();
    assert!(hdr.is_rdma() && !hdr.rdma_ack(), "not a bulk request");
    assert!(!hdr.is_write(), "write requests are served with bulk_respond");
    let rh = req.rdma_header().unwrap();
    let from = hdr.from_node as usize;
    let conn = inner.conn(from)?;

    let len = dest.len().min(rh.transfer_size as usize);
    assert!(len > 0, "zero-size bulk transfer");

    let slot = conn.regions.acquire(PoolKind::Bulk)?;
    let lkey = {
        let _guard = conn.post_lock.lock().unwrap();
        conn.regions
            .bind(&conn.qp, PoolKind::Bulk, slot, dest.as_ptr() as u64, len)
            .map_err(|e| {
                conn.regions.release(PoolKind::Bulk, slot);
                e
            })?
    };
    let addr = dest.as_ptr() as u64;
    let res = run_signaled(&conn, from, move |wr_id| SendWr::RdmaRead {
        wr_id,
        sge: Sge {
            addr,
            len: len as u32,
            lkey,
        },
        remote_addr: rh.peer_addr,
        rkey: rh.peer_key,
        signaled: true,
    });
    conn.regions.release(PoolKind::Bulk, slot);
    res?;

    send_ack(inner, from, &rh, FLAG_RDMA | FLAG_RDMA_ACK, len)?;
    Ok(len)
}

fn send_ack(
    inner: &Arc<MessengerInner>,
    to: usize,
    rh: &RdmaHeader,
    flags: u8,
    transferred: usize,
) -> Result<()> {
    let ack = RdmaHeader {
        peer_addr: rh.peer_addr,
        peer_key: rh.peer_key,
        transfer_size: transferred as u32,
        reply_type: 0,
        region_slot: rh.region_slot,
        rendezvous_tag: rh.rendezvous_tag,
        local_dma_addr: rh.local_dma_addr,
    };
    let mut msg = build_request(rh.reply_type, flags, &ack, &[]);
    channel::send_message(inner, to, &mut msg)
}

/// Initiator side of an acknowledgment: release the echoed region slot and
/// wake the rendezvous waiter. Called from the handler registered for the
/// reply type.
pub(crate) fn complete(inner: &Arc<MessengerInner>, ack: &Delivery) {
    let hdr = ack.header();
    assert!(hdr.is_rdma() && hdr.rdma_ack(), "not a bulk acknowledgment");
    let rh = ack.rdma_header().unwrap();
    let from = hdr.from_node as usize;
    if let Some(conn) = inner.cbs[from].conn.get() {
        conn.regions.release(PoolKind::Bulk, rh.region_slot as usize);
    }
    inner.rendezvous.complete(rh.rendezvous_tag);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_frame_layout() {
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let mut buf = vec![0u8; data.len() + POLL_HEAD_AND_TAIL];
        unsafe { compose_inline(buf.as_mut_ptr(), &data) };

        assert_eq!(&buf[0..4], &1024u32.to_le_bytes());
        assert_eq!(buf[4], POLL_IS_DATA);
        assert_eq!(&buf[POLL_HEAD..POLL_HEAD + 1024], &data[..]);
        assert_eq!(buf[1029], POLL_IS_DATA);
    }

    #[test]
    fn inline_frame_empty_tail_position() {
        let data = [0xAAu8; 8];
        let mut buf = vec![0u8; 8 + POLL_HEAD_AND_TAIL];
        unsafe { compose_inline(buf.as_mut_ptr(), &data) };
        assert_eq!(buf[POLL_HEAD + 8], POLL_IS_DATA);
        assert_eq!(
            buf[8 + POLL_HEAD_AND_TAIL - 1],
            POLL_IS_DATA,
            "tail flag sits at len + head-and-tail - 1"
        );
    }
}
