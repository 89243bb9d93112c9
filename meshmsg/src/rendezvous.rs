//! Tag registry re-attaching acknowledgment messages to blocked callers.
//!
//! The substrate only carries opaque tags; whoever sits above it (callers of
//! the bulk engine, the key exchange) registers a waiter, threads the tag
//! through request and reply, and is woken when the reply names the tag.

use std::sync::{Arc, Mutex};

use slab::Slab;

use crate::peer::OpWaiter;

struct Entry {
    peer: usize,
    waiter: Arc<OpWaiter>,
}

pub(crate) struct Rendezvous {
    entries: Mutex<Slab<Entry>>,
}

impl Rendezvous {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Slab::new()),
        }
    }

    /// Register a waiter for a reply from `peer`. Returns the wire tag.
    pub(crate) fn register(&self, peer: usize) -> (u32, Arc<OpWaiter>) {
        let waiter = Arc::new(OpWaiter::new());
        let tag = self.entries.lock().unwrap().insert(Entry {
            peer,
            waiter: waiter.clone(),
        });
        (tag as u32, waiter)
    }

    /// Wake the caller registered under `tag`. Unknown tags are ignored
    /// (the entry may have been drained by a connection failure).
    pub(crate) fn complete(&self, tag: u32) {
        let entry = self.entries.lock().unwrap().try_remove(tag as usize);
        if let Some(e) = entry {
            e.waiter.complete(true);
        }
    }

    /// Drop a registration that will never be completed (send failed).
    pub(crate) fn cancel(&self, tag: u32) {
        let _ = self.entries.lock().unwrap().try_remove(tag as usize);
    }

    /// Fail every caller waiting on `peer`.
    pub(crate) fn fail_peer(&self, peer: usize) {
        let failed: Vec<Arc<OpWaiter>> = {
            let mut entries = self.entries.lock().unwrap();
            let keys: Vec<usize> = entries
                .iter()
                .filter(|(_, e)| e.peer == peer)
                .map(|(k, _)| k)
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.try_remove(k))
                .map(|e| e.waiter)
                .collect()
        };
        for w in failed {
            w.complete(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_wakes_registered_waiter() {
        let r = Rendezvous::new();
        let (tag, waiter) = r.register(1);
        r.complete(tag);
        assert!(waiter.wait());
    }

    #[test]
    fn fail_peer_only_hits_that_peer() {
        let r = Rendezvous::new();
        let (_t1, w1) = r.register(1);
        let (t2, w2) = r.register(2);
        r.fail_peer(1);
        assert!(!w1.wait());
        r.complete(t2);
        assert!(w2.wait());
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let r = Rendezvous::new();
        r.complete(123);
        r.cancel(456);
    }
}
