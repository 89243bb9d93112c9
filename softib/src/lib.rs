//! softib - a process-local software fabric speaking the reliable-connected
//! verbs vocabulary.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────── Network ──────────────────────────┐
//! │  listener registry (addr:port → CmId)   event dispatcher    │
//! └──────────────┬──────────────────────────────┬───────────────┘
//!                ▼                              ▼
//!          ┌──────────┐   ConnectRequest   ┌──────────┐
//!          │  CmId    │ ─────────────────▶ │  CmId    │
//!          │ (client) │ ◀───Established──▶ │ (server) │
//!          └────┬─────┘                    └────┬─────┘
//!               ▼                               ▼
//!          ┌─────────┐  sends / one-sided  ┌─────────┐
//!          │   Qp    │ ◀─────────────────▶ │   Qp    │
//!          │ Pd · Cq │                     │ Pd · Cq │
//!          └─────────┘                     └─────────┘
//! ```
//!
//! - **Pd / MemoryRegion**: remote keys resolve against a per-domain region
//!   table; rebinding flows through the queue pair as invalidate + register
//!   work requests.
//! - **Cq**: single completion stream with arm / drain / re-arm notification
//!   on a dedicated thread.
//! - **Qp**: reliable-connected pair; send-queue execution in posting order,
//!   two-sided sends against pre-posted receives, one-sided READ/WRITE
//!   against the peer's region table.
//! - **CmId / Network**: address-route-connect-accept establishment driven
//!   by a single ordered event stream.
//!
//! All of it lives in one process: several fabric nodes coexist on one
//! [`Network`], which is what makes full-mesh messaging layers testable with
//! plain threads.

pub mod cm;
pub mod cq;
pub mod network;
pub mod pd;
pub mod qp;
pub mod types;

pub use cm::{CmEvent, CmHandler, CmId};
pub use cq::{Cq, CqHandle};
pub use network::Network;
pub use pd::{MemoryRegion, Pd};
pub use qp::{Qp, SendWr};
pub use types::{AccessFlags, ConnParam, QpCaps, Sge, Wc, WcOpcode, WcStatus};
