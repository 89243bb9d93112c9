//! Common fabric types: access flags, work completions, connection parameters.

use bitflags::bitflags;

bitflags! {
    /// Access rights attached to a registered memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_READ = 1 << 1;
        const REMOTE_WRITE = 1 << 2;
        const REMOTE_ATOMIC = 1 << 3;
    }
}

/// Opcode of a completed work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    /// A two-sided send finished placing its payload at the peer.
    Send,
    /// A pre-posted receive buffer was filled by a peer send.
    Recv,
    /// A one-sided write into remote memory finished.
    RdmaWrite,
    /// A one-sided read from remote memory finished.
    RdmaRead,
    /// A local key invalidation finished.
    LocalInv,
    /// A region (re)registration finished.
    RegMr,
}

/// Status of a completed work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// The queue pair was flushed while the request was outstanding.
    FlushErr,
    /// The remote key did not grant the requested access.
    RemoteAccessErr,
}

/// A work completion entry.
#[derive(Debug, Clone, Copy)]
pub struct Wc {
    /// Opaque identifier supplied when the work request was posted.
    pub wr_id: u64,
    pub opcode: WcOpcode,
    pub status: WcStatus,
    /// Bytes transferred (receives and one-sided operations).
    pub byte_len: u32,
}

/// Connection establishment parameters.
#[derive(Debug, Clone, Copy)]
pub struct ConnParam {
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub retry_count: u8,
}

impl Default for ConnParam {
    fn default() -> Self {
        Self {
            responder_resources: 1,
            initiator_depth: 1,
            retry_count: 1,
        }
    }
}

/// Queue pair capacity limits.
#[derive(Debug, Clone, Copy)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

impl Default for QpCaps {
    fn default() -> Self {
        Self {
            max_send_wr: 128,
            max_recv_wr: 128,
            max_send_sge: 1,
            max_recv_sge: 1,
        }
    }
}

/// A scatter-gather element referencing local memory.
///
/// An `lkey` of zero addresses local memory directly without a region lookup,
/// mirroring the device-wide DMA key of the hardware stacks.
#[derive(Debug, Clone, Copy)]
pub struct Sge {
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_flags_compose() {
        let rw = AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
        assert!(rw.contains(AccessFlags::REMOTE_READ));
        assert!(rw.contains(AccessFlags::REMOTE_WRITE));
        assert!(!rw.contains(AccessFlags::LOCAL_WRITE));
    }
}
