//! Connection management: resolve, listen, connect, accept.
//!
//! The event flow mirrors the RDMA connection-manager discipline: a client
//! resolves the peer address and route, creates its queue pair, and connects;
//! the listener receives a `ConnectRequest` carrying a fresh identifier that
//! inherits the listener's handler and token, creates a queue pair on it, and
//! accepts. Both sides then observe `Established`. Faults surface as error
//! events on the identifier they belong to; they never tear anything down by
//! themselves.

use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, Weak};

use crate::cq::Cq;
use crate::network::NetworkInner;
use crate::pd::Pd;
use crate::qp::{Qp, QpInner};
use crate::types::{ConnParam, QpCaps};

/// Connection-management events.
pub enum CmEvent {
    AddrResolved,
    RouteResolved,
    /// An inbound connect arrived on a listener. The carried identifier is
    /// the server-side end of the new connection.
    ConnectRequest(CmId),
    Established,
    /// No listener at the resolved address.
    Unreachable,
    Rejected,
    ConnectError,
    Disconnected,
}

impl std::fmt::Debug for CmEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CmEvent::AddrResolved => "AddrResolved",
            CmEvent::RouteResolved => "RouteResolved",
            CmEvent::ConnectRequest(_) => "ConnectRequest",
            CmEvent::Established => "Established",
            CmEvent::Unreachable => "Unreachable",
            CmEvent::Rejected => "Rejected",
            CmEvent::ConnectError => "ConnectError",
            CmEvent::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

pub type CmHandler = Arc<dyn Fn(u64, CmEvent) + Send + Sync>;

#[derive(Default)]
struct CmState {
    dst: Option<(Ipv4Addr, u16)>,
    listening: Option<(Ipv4Addr, u16)>,
    qp: Option<Arc<QpInner>>,
    peer: Option<Weak<CmIdInner>>,
}

pub(crate) struct CmIdInner {
    network: Arc<NetworkInner>,
    token: Mutex<u64>,
    handler: CmHandler,
    state: Mutex<CmState>,
}

impl CmIdInner {
    fn post(&self, event: CmEvent) {
        let token = *self.token.lock().unwrap();
        self.network.queue.post(self.handler.clone(), token, event);
    }
}

impl Drop for CmIdInner {
    fn drop(&mut self) {
        if let Some(key) = self.state.lock().unwrap().listening.take() {
            self.network.listeners.lock().unwrap().remove(&key);
        }
    }
}

/// A connection-management identifier.
#[derive(Clone)]
pub struct CmId {
    inner: Arc<CmIdInner>,
}

impl CmId {
    pub(crate) fn new(network: Arc<NetworkInner>, token: u64, handler: CmHandler) -> Self {
        Self {
            inner: Arc::new(CmIdInner {
                network,
                token: Mutex::new(token),
                handler,
                state: Mutex::new(CmState::default()),
            }),
        }
    }

    /// Re-tag the identifier. Used by acceptors once the inbound connection
    /// has been matched to a peer, so later events name the right block.
    pub fn set_token(&self, token: u64) {
        *self.inner.token.lock().unwrap() = token;
    }

    pub fn token(&self) -> u64 {
        *self.inner.token.lock().unwrap()
    }

    /// Resolve the destination address. Completes asynchronously with
    /// `AddrResolved`.
    pub fn resolve_addr(&self, dst: Ipv4Addr, port: u16, _timeout_ms: u64) -> io::Result<()> {
        self.inner.state.lock().unwrap().dst = Some((dst, port));
        self.inner.post(CmEvent::AddrResolved);
        Ok(())
    }

    /// Resolve the route to the previously resolved address. Completes
    /// asynchronously with `RouteResolved`.
    pub fn resolve_route(&self, _timeout_ms: u64) -> io::Result<()> {
        if self.inner.state.lock().unwrap().dst.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "address not resolved",
            ));
        }
        self.inner.post(CmEvent::RouteResolved);
        Ok(())
    }

    /// Bind to `(addr, port)` and start listening.
    pub fn bind_listen(&self, addr: Ipv4Addr, port: u16, _backlog: i32) -> io::Result<()> {
        let mut listeners = self.inner.network.listeners.lock().unwrap();
        let key = (addr, port);
        if let Some(existing) = listeners.get(&key) {
            if existing.upgrade().is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{}:{} already bound", addr, port),
                ));
            }
        }
        listeners.insert(key, Arc::downgrade(&self.inner));
        self.inner.state.lock().unwrap().listening = Some(key);
        Ok(())
    }

    /// Create the queue pair carried by this identifier.
    pub fn create_qp(
        &self,
        pd: &Pd,
        caps: QpCaps,
        send_cq: &Cq,
        recv_cq: &Cq,
    ) -> io::Result<Qp> {
        let qp = Qp::new(pd, caps, send_cq, recv_cq);
        self.inner.state.lock().unwrap().qp = Some(qp.inner().clone());
        Ok(qp)
    }

    /// Initiate the connection. The listener observes `ConnectRequest`; this
    /// side observes `Established` once the listener accepts, or an error
    /// event otherwise.
    pub fn connect(&self, _param: &ConnParam) -> io::Result<()> {
        let dst = self
            .inner
            .state
            .lock()
            .unwrap()
            .dst
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "route not resolved"))?;
        let listener = {
            let listeners = self.inner.network.listeners.lock().unwrap();
            listeners.get(&dst).and_then(|w| w.upgrade())
        };
        let listener = match listener {
            Some(l) => l,
            None => {
                self.inner.post(CmEvent::Unreachable);
                return Ok(());
            }
        };
        let server = Arc::new(CmIdInner {
            network: self.inner.network.clone(),
            token: Mutex::new(*listener.token.lock().unwrap()),
            handler: listener.handler.clone(),
            state: Mutex::new(CmState {
                peer: Some(Arc::downgrade(&self.inner)),
                ..CmState::default()
            }),
        });
        self.inner.state.lock().unwrap().peer = Some(Arc::downgrade(&server));
        let event = CmEvent::ConnectRequest(CmId {
            inner: server.clone(),
        });
        server.post(event);
        Ok(())
    }

    /// Accept an inbound connection (on the identifier delivered with
    /// `ConnectRequest`). Both ends observe `Established`.
    pub fn accept(&self, _param: &ConnParam) -> io::Result<()> {
        let client = self
            .inner
            .state
            .lock()
            .unwrap()
            .peer
            .as_ref()
            .and_then(|w| w.upgrade())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "initiator is gone"))?;
        let server_qp = self.inner.state.lock().unwrap().qp.clone();
        let client_qp = client.state.lock().unwrap().qp.clone();
        match (server_qp, client_qp) {
            (Some(s), Some(c)) => QpInner::link(&s, &c),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "queue pair missing on one side",
                ))
            }
        }
        self.inner.post(CmEvent::Established);
        client.post(CmEvent::Established);
        Ok(())
    }

    /// Reject an inbound connection.
    pub fn reject(&self) -> io::Result<()> {
        if let Some(client) = self
            .inner
            .state
            .lock()
            .unwrap()
            .peer
            .as_ref()
            .and_then(|w| w.upgrade())
        {
            client.post(CmEvent::Rejected);
        }
        Ok(())
    }

    /// Tear the connection down. Both queue pairs enter the error state and
    /// both ends observe `Disconnected`.
    pub fn disconnect(&self) -> io::Result<()> {
        let (qp, peer) = {
            let state = self.inner.state.lock().unwrap();
            (
                state.qp.clone(),
                state.peer.as_ref().and_then(|w| w.upgrade()),
            )
        };
        if let Some(qp) = qp {
            qp.set_error();
        }
        if let Some(peer) = peer {
            if let Some(qp) = peer.state.lock().unwrap().qp.clone() {
                qp.set_error();
            }
            peer.post(CmEvent::Disconnected);
        }
        self.inner.post(CmEvent::Disconnected);
        Ok(())
    }
}
