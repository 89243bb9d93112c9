//! The per-peer completion engine.
//!
//! One handler drains the peer's single completion stream: send and
//! one-sided completions wake the parked caller named by the work-request
//! id, receive completions are validated and pushed to the peer's
//! bottom-half worker, invalidate/register completions are only logged, and
//! anything broken marks the connection. After draining, notification is
//! re-armed with missed-event reporting and the drain loops while
//! completions slipped in.

use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};

use softib::{CqHandle, WcOpcode, WcStatus};

use crate::config::MAX_MSG_SIZE;
use crate::dispatch::Delivery;
use crate::peer::{BhWork, ConnState};
use crate::wire::{MessageHeader, TYPE_MAX};
use crate::MessengerInner;

pub(crate) fn drain(inner: &Arc<MessengerInner>, peer: usize, cq: &CqHandle) {
    let cb = &inner.cbs[peer];
    if cb.state.get() == ConnState::Error {
        eprintln!("< completion on peer {} in error state >", peer);
        return;
    }
    let conn = match cb.conn.get() {
        Some(c) => c.clone(),
        None => return,
    };

    loop {
        while let Some(wc) = cq.poll() {
            match wc.status {
                WcStatus::Success => {}
                WcStatus::FlushErr => {
                    eprintln!("< cq flushed: peer {} wr_id {:#x} >", peer, wc.wr_id);
                    continue;
                }
                other => {
                    eprintln!(
                        "< completion failed: peer {} wr_id {:#x} opcode {:?} status {:?} >",
                        peer, wc.wr_id, wc.opcode, other
                    );
                    inner.fail_peer(peer);
                    return;
                }
            }

            match wc.opcode {
                WcOpcode::Send => {
                    conn.wq_wr.fetch_sub(1, Ordering::SeqCst);
                    conn.complete_waiter(wc.wr_id, true);
                }
                WcOpcode::RdmaWrite | WcOpcode::RdmaRead => {
                    conn.wq_wr.fetch_sub(1, Ordering::SeqCst);
                    conn.complete_waiter(wc.wr_id, true);
                }
                WcOpcode::Recv => {
                    let item = wc.wr_id as usize;
                    debug_assert!(wc.byte_len as usize <= conn.recv_pool.item_len());
                    let hdr = unsafe { MessageHeader::read_from(conn.recv_pool.item_ptr(item)) };
                    assert!(
                        hdr.msg_type < TYPE_MAX,
                        "received message with invalid type {}",
                        hdr.msg_type
                    );
                    assert!(
                        hdr.total_size as usize <= MAX_MSG_SIZE,
                        "received message of impossible size {}",
                        hdr.total_size
                    );
                    assert_eq!(
                        hdr.from_node as usize, peer,
                        "message source {} does not match connection {}",
                        hdr.from_node, peer
                    );
                    assert!(
                        inner.handlers.has(hdr.msg_type),
                        "no handler registered for message type {}",
                        hdr.msg_type
                    );
                    conn.recv_pool.note_held();
                    if let Some(tx) = conn.bh.lock().unwrap().as_ref() {
                        let _ = tx.send(BhWork::Recv { item });
                    }
                }
                WcOpcode::LocalInv => {
                    eprintln!("< local invalidate completion: peer {} >", peer);
                }
                WcOpcode::RegMr => {
                    eprintln!("< region register completion: peer {} >", peer);
                }
            }
        }
        if !cq.req_notify(true) {
            return;
        }
    }
}

/// The bottom-half worker loop: dispatch validated receives to their
/// handlers outside the completion context, so handlers may block.
///
/// Running one worker per peer keeps dispatch order equal to receive order
/// for each `(source, destination)` pair.
pub(crate) fn bottom_half(weak: Weak<MessengerInner>, peer: usize, rx: Receiver<BhWork>) {
    loop {
        match rx.recv() {
            Ok(BhWork::Recv { item }) => {
                let inner = match weak.upgrade() {
                    Some(i) => i,
                    None => return,
                };
                let conn = match inner.cbs[peer].conn.get() {
                    Some(c) => c.clone(),
                    None => return,
                };
                let hdr = unsafe { MessageHeader::read_from(conn.recv_pool.item_ptr(item)) };
                let handler = inner
                    .handlers
                    .get(hdr.msg_type)
                    .expect("handler table shrank after validation");
                let delivery = Delivery::pooled(inner.clone(), peer, item);
                handler(delivery);
            }
            Ok(BhWork::Shutdown) | Err(_) => return,
        }
    }
}
