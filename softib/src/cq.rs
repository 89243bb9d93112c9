//! Completion queues with event notification.
//!
//! A [`Cq`] owns a dedicated notification thread. Arming the queue with
//! [`CqHandle::req_notify`] requests that the next pushed completion fire the
//! notification handler once; the handler is expected to drain the queue with
//! [`CqHandle::poll`] and re-arm, looping while `req_notify` reports missed
//! completions. This mirrors the arm/drain/re-arm discipline of the hardware
//! completion paths.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::types::Wc;

struct CqState {
    queue: VecDeque<Wc>,
    armed: bool,
    fire: bool,
    shutdown: bool,
}

pub(crate) struct CqShared {
    state: Mutex<CqState>,
    cond: Condvar,
}

impl CqShared {
    /// Append a completion, firing the notification thread if armed.
    pub(crate) fn push(&self, wc: Wc) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(wc);
        if state.armed {
            state.armed = false;
            state.fire = true;
            self.cond.notify_all();
        }
    }
}

/// Cheap handle for draining and re-arming a completion queue.
///
/// The notification handler receives one of these; additional clones may be
/// held by pollers.
#[derive(Clone)]
pub struct CqHandle {
    shared: Arc<CqShared>,
}

impl CqHandle {
    /// Pop the oldest completion, if any.
    pub fn poll(&self) -> Option<Wc> {
        self.shared.state.lock().unwrap().queue.pop_front()
    }

    /// Arm the queue for the next completion.
    ///
    /// With `report_missed` set, returns `true` when completions are already
    /// pending, in which case no event may fire for them and the caller must
    /// drain again.
    pub fn req_notify(&self, report_missed: bool) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        state.armed = true;
        report_missed && !state.queue.is_empty()
    }

    /// Number of queued completions. Test and teardown aid.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }
}

/// A completion queue plus its notification thread.
pub struct Cq {
    shared: Arc<CqShared>,
    thread: Option<JoinHandle<()>>,
}

impl Cq {
    /// Create a queue whose notification handler is `handler`.
    ///
    /// The handler runs on the queue's own thread, at most once per arming.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&CqHandle) + Send + 'static,
    {
        let shared = Arc::new(CqShared {
            state: Mutex::new(CqState {
                queue: VecDeque::new(),
                armed: false,
                fire: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let thread = std::thread::spawn(move || {
            let handle = CqHandle {
                shared: thread_shared.clone(),
            };
            loop {
                {
                    let mut state = thread_shared.state.lock().unwrap();
                    while !state.fire && !state.shutdown {
                        state = thread_shared.cond.wait(state).unwrap();
                    }
                    if state.shutdown {
                        return;
                    }
                    state.fire = false;
                }
                handler(&handle);
            }
        });
        Self {
            shared,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> CqHandle {
        CqHandle {
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn shared(&self) -> Arc<CqShared> {
        self.shared.clone()
    }
}

impl Drop for Cq {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(t) = self.thread.take() {
            // The final reference may be released from the notification
            // thread itself; it cannot join itself.
            if t.thread().id() != std::thread::current().id() {
                let _ = t.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{WcOpcode, WcStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn wc(id: u64) -> Wc {
        Wc {
            wr_id: id,
            opcode: WcOpcode::Send,
            status: WcStatus::Success,
            byte_len: 0,
        }
    }

    #[test]
    fn armed_queue_fires_once_per_arming() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let cq = Cq::new(move |h| {
            while h.poll().is_some() {}
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        let handle = cq.handle();

        // Not armed: no event.
        cq.shared().push(wc(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Arming with pending completions reports them as missed.
        assert!(handle.req_notify(true));
        while handle.poll().is_some() {}

        assert!(!handle.req_notify(true));
        cq.shared().push(wc(2));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn poll_returns_in_push_order() {
        let cq = Cq::new(|_| {});
        let handle = cq.handle();
        cq.shared().push(wc(1));
        cq.shared().push(wc(2));
        assert_eq!(handle.poll().unwrap().wr_id, 1);
        assert_eq!(handle.poll().unwrap().wr_id, 2);
        assert!(handle.poll().is_none());
    }
}
