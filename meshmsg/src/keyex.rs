//! Sentinel key exchange.
//!
//! Right after a connection is established, each node binds its notify
//! sentinel array and advertises the address and key to the peer. The
//! receipt is confirmed with a reply carrying the request's rendezvous tag,
//! so the initiator knows the exchange is done before the mesh goes live.
//!
//! Advertisement payload: sentinel address (8) + key (4) + tag (4).

use std::sync::Arc;

use crate::channel;
use crate::config::NOTIFY_SENTINEL_BYTES;
use crate::dispatch::Delivery;
use crate::error::{Error, Result};
use crate::region::PoolKind;
use crate::wire::{
    MessageHeader, HEADER_SIZE, MSG_TYPE_SENTINEL_KEY_REQUEST, MSG_TYPE_SENTINEL_KEY_RESPONSE,
};
use crate::MessengerInner;

const REQUEST_PAYLOAD: usize = 8 + 4 + 4;
const RESPONSE_PAYLOAD: usize = 4;

pub(crate) fn exchange_keys(inner: &Arc<MessengerInner>, peer: usize) -> Result<()> {
    let conn = inner.conn(peer)?;

    let slot = conn.regions.acquire(PoolKind::SentinelLocal)?;
    let rkey = {
        let _guard = conn.post_lock.lock().unwrap();
        conn.regions
            .bind(
                &conn.qp,
                PoolKind::SentinelLocal,
                slot,
                conn.notify_target.addr(),
                NOTIFY_SENTINEL_BYTES,
            )
            .map_err(|e| {
                conn.regions.release(PoolKind::SentinelLocal, slot);
                e
            })?
    };
    // The binding stays for the lifetime of the mesh.
    let _ = conn.notify_local_slot.set(slot);

    let (tag, waiter) = inner.rendezvous.register(peer);
    let mut msg = [0u8; HEADER_SIZE + REQUEST_PAYLOAD];
    let hdr = MessageHeader::new(MSG_TYPE_SENTINEL_KEY_REQUEST, 0);
    unsafe { hdr.write_to(msg.as_mut_ptr()) };
    msg[HEADER_SIZE..HEADER_SIZE + 8].copy_from_slice(&conn.notify_target.addr().to_le_bytes());
    msg[HEADER_SIZE + 8..HEADER_SIZE + 12].copy_from_slice(&rkey.to_le_bytes());
    msg[HEADER_SIZE + 12..].copy_from_slice(&tag.to_le_bytes());

    if let Err(e) = channel::send_message(inner, peer, &mut msg) {
        inner.rendezvous.cancel(tag);
        return Err(e);
    }
    if waiter.wait() {
        Ok(())
    } else {
        Err(Error::PeerUnreachable(peer))
    }
}

pub(crate) fn handle_request(inner: &Arc<MessengerInner>, req: Delivery) {
    let payload = req.payload();
    assert_eq!(payload.len(), REQUEST_PAYLOAD, "malformed key advertisement");
    let addr = u64::from_le_bytes(payload[0..8].try_into().unwrap());
    let key = u32::from_le_bytes(payload[8..12].try_into().unwrap());
    let tag = u32::from_le_bytes(payload[12..16].try_into().unwrap());
    let from = req.from_node();

    if let Some(conn) = inner.cbs[from].conn.get() {
        *conn.remote_notify.lock().unwrap() = Some((addr, key));
    }

    let mut msg = [0u8; HEADER_SIZE + RESPONSE_PAYLOAD];
    let hdr = MessageHeader::new(MSG_TYPE_SENTINEL_KEY_RESPONSE, 0);
    unsafe { hdr.write_to(msg.as_mut_ptr()) };
    msg[HEADER_SIZE..].copy_from_slice(&tag.to_le_bytes());
    let _ = channel::send_message(inner, from, &mut msg);
}

pub(crate) fn handle_response(inner: &Arc<MessengerInner>, res: Delivery) {
    let payload = res.payload();
    assert_eq!(payload.len(), RESPONSE_PAYLOAD, "malformed key acknowledgment");
    let tag = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    inner.rendezvous.complete(tag);
}
