//! The fabric domain: listener registry and connection event dispatch.
//!
//! A [`Network`] is one isolated fabric. All connection-management events in
//! the domain are delivered from a single dispatcher thread, so event order
//! is total — the counting-based demultiplexing of `Established` events that
//! connection managers build on top relies on this.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use crate::cm::{CmEvent, CmHandler, CmId, CmIdInner};

struct EqState {
    q: VecDeque<(CmHandler, u64, CmEvent)>,
    shutdown: bool,
}

pub(crate) struct EventQueue {
    state: Mutex<EqState>,
    cond: Condvar,
}

impl EventQueue {
    pub(crate) fn post(&self, handler: CmHandler, token: u64, event: CmEvent) {
        let mut state = self.state.lock().unwrap();
        state.q.push_back((handler, token, event));
        self.cond.notify_all();
    }
}

pub(crate) struct NetworkInner {
    pub(crate) listeners: Mutex<HashMap<(Ipv4Addr, u16), Weak<CmIdInner>>>,
    pub(crate) queue: Arc<EventQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for NetworkInner {
    fn drop(&mut self) {
        {
            let mut state = self.queue.state.lock().unwrap();
            state.shutdown = true;
            self.queue.cond.notify_all();
        }
        if let Some(t) = self.worker.lock().unwrap().take() {
            // The final reference may be released from the dispatcher
            // thread itself; it cannot join itself.
            if t.thread().id() != std::thread::current().id() {
                let _ = t.join();
            }
        }
    }
}

/// An isolated fabric domain.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

impl Network {
    pub fn new() -> Self {
        let queue = Arc::new(EventQueue {
            state: Mutex::new(EqState {
                q: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let worker_queue = queue.clone();
        let worker = std::thread::spawn(move || loop {
            let item = {
                let mut state = worker_queue.state.lock().unwrap();
                loop {
                    if let Some(item) = state.q.pop_front() {
                        break Some(item);
                    }
                    if state.shutdown {
                        break None;
                    }
                    state = worker_queue.cond.wait(state).unwrap();
                }
            };
            match item {
                Some((handler, token, event)) => handler(token, event),
                None => return,
            }
        });
        Self {
            inner: Arc::new(NetworkInner {
                listeners: Mutex::new(HashMap::new()),
                queue,
                worker: Mutex::new(Some(worker)),
            }),
        }
    }

    /// Create a connection-management identifier whose events are delivered
    /// to `handler` tagged with the opaque `token`.
    ///
    /// The token is the only state a handler should capture; it indexes
    /// whatever registry of per-connection blocks the caller maintains.
    pub fn create_cm_id<F>(&self, token: u64, handler: F) -> CmId
    where
        F: Fn(u64, CmEvent) + Send + Sync + 'static,
    {
        CmId::new(self.inner.clone(), token, Arc::new(handler))
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}
