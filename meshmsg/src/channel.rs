//! The small-message channel: reliable typed datagram send.
//!
//! A send writes the size and origin into the header, posts one signaled
//! send, and parks the caller on a stack-resident waiter until the
//! completion engine wakes it. The fabric is reliable, so there is no retry
//! tier; failures are connection failures.

use std::sync::atomic::Ordering;

use softib::{SendWr, Sge};

use crate::config::{MAX_MSG_SIZE, MAX_SEND_WR};
use crate::error::{Error, Result};
use crate::peer::ConnState;
use crate::wire::{MessageHeader, HEADER_SIZE};
use crate::MessengerInner;

pub(crate) fn send_message(inner: &MessengerInner, dst: usize, buf: &mut [u8]) -> Result<()> {
    assert!(buf.len() >= HEADER_SIZE, "message smaller than its header");
    assert!(
        buf.len() <= MAX_MSG_SIZE,
        "message of {} bytes exceeds the maximum of {}",
        buf.len(),
        MAX_MSG_SIZE
    );
    if dst >= inner.config.node_count() || dst == inner.my_id {
        return Err(Error::InvalidPeer(dst));
    }
    let cb = &inner.cbs[dst];
    if cb.state.get() != ConnState::Connected {
        return Err(Error::PeerUnreachable(dst));
    }
    let conn = cb.conn.get().cloned().ok_or(Error::PeerUnreachable(dst))?;

    unsafe {
        let mut hdr = MessageHeader::read_from(buf.as_ptr());
        hdr.total_size = buf.len() as u32;
        hdr.from_node = inner.my_id as u8;
        hdr.write_to(buf.as_mut_ptr());
    }

    let (token, waiter) = conn.add_waiter();
    let in_flight = conn.wq_wr.fetch_add(1, Ordering::SeqCst) + 1;
    debug_assert!(
        in_flight < MAX_SEND_WR,
        "send queue depth exceeded on peer {}",
        dst
    );

    let posted = {
        let _guard = conn.post_lock.lock().unwrap();
        conn.qp.post_send(&[SendWr::Send {
            wr_id: token,
            sge: Sge {
                addr: buf.as_ptr() as u64,
                len: buf.len() as u32,
                lkey: conn.pd.local_dma_lkey(),
            },
            signaled: true,
        }])
    };
    if posted.is_err() {
        conn.wq_wr.fetch_sub(1, Ordering::SeqCst);
        conn.remove_waiter(token);
        return Err(Error::PeerUnreachable(dst));
    }

    if waiter.wait() {
        Ok(())
    } else {
        Err(Error::PeerUnreachable(dst))
    }
}
