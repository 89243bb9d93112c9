//! Mesh configuration and fabric parameters.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// TCP port every node listens on for connection establishment.
pub const MSG_PORT: u16 = 10453;

/// Listen backlog for the per-node listener.
pub const LISTEN_BACKLOG: i32 = 99;

/// Responder resources granted on connect/accept.
pub const CONN_RESPONDER_RESOURCES: u8 = 1;

/// Initiator depth granted on connect/accept.
pub const CONN_INITIATOR_DEPTH: u8 = 1;

/// Connect retry count.
pub const CONN_RETRY_COUNT: u8 = 1;

/// Maximum in-flight sends per peer. Check it if only the sender crashes.
pub const MAX_SEND_WR: u32 = 128;

/// Pre-posted receive buffers per peer.
pub const MAX_RECV_WR: u32 = 128;

/// Region slots per peer per pool kind.
pub const MR_POOL_SIZE: usize = 64;

/// Maximum size of one message, header included.
pub const MAX_MSG_SIZE: usize = 64 << 10;

/// Inline-poll head: 4-byte length plus 1-byte data flag.
pub const POLL_HEAD: usize = 4 + 1;

/// Inline-poll tail: 1-byte data flag.
pub const POLL_TAIL: usize = 1;

pub const POLL_HEAD_AND_TAIL: usize = POLL_HEAD + POLL_TAIL;

/// Sentinel value meaning "data has landed".
pub const POLL_IS_DATA: u8 = 0x01;

/// Sentinel value meaning "nothing yet".
pub const POLL_IS_IDLE: u8 = 0;

/// Maximum bulk transfer size for the acknowledged and notify paths.
pub const MAX_BULK_SIZE: usize = MAX_MSG_SIZE;

/// Maximum bulk transfer size for the inline-poll path, which spends
/// `POLL_HEAD_AND_TAIL` bytes on the self-describing framing.
pub const MAX_BULK_SIZE_INLINE: usize = MAX_MSG_SIZE - POLL_HEAD_AND_TAIL;

/// Bytes in the notify sentinel array each node advertises: one byte per
/// possible in-flight operation.
pub const NOTIFY_SENTINEL_BYTES: usize = MAX_SEND_WR as usize;

/// Rounds of yield-and-retry before a pool acquisition gives up with
/// `PoolExhausted`.
pub const ACQUIRE_SPIN_LIMIT: usize = 1 << 22;

/// Default number of chunks backing the outbound staging ring.
pub const RING_CHUNKS: usize = 8;

/// Default chunk size of the outbound staging ring.
pub const RING_CHUNK_SIZE: usize = 64 << 10;

/// Static description of the mesh: one IPv4 address per node, indexed by
/// node id. The set is fixed for the lifetime of the mesh.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    nodes: Vec<Ipv4Addr>,
    /// Listener port, `MSG_PORT` unless overridden (tests run several meshes
    /// in one process).
    pub port: u16,
    /// Chunks backing the outbound staging ring.
    pub ring_chunks: usize,
    /// Chunk size of the outbound staging ring.
    pub ring_chunk_size: usize,
}

impl MeshConfig {
    /// Build a mesh description from textual IPv4 addresses, index = node id.
    pub fn new(nodes: &[&str]) -> Result<Self> {
        if nodes.len() < 2 {
            return Err(Error::InvalidConfig("a mesh needs at least 2 nodes".into()));
        }
        let mut parsed = Vec::with_capacity(nodes.len());
        for n in nodes {
            let addr: Ipv4Addr = n
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("bad IPv4 address {:?}", n)))?;
            parsed.push(addr);
        }
        Ok(Self {
            nodes: parsed,
            port: MSG_PORT,
            ring_chunks: RING_CHUNKS,
            ring_chunk_size: RING_CHUNK_SIZE,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Number of nodes in the mesh.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Address of node `id`.
    pub fn node_addr(&self, id: usize) -> Ipv4Addr {
        self.nodes[id]
    }

    /// Identify a node by interface address.
    pub fn find_node(&self, addr: Ipv4Addr) -> Option<usize> {
        self.nodes.iter().position(|&a| a == addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_identifies() {
        let cfg = MeshConfig::new(&["10.1.0.1", "10.1.0.2", "10.1.0.3"]).unwrap();
        assert_eq!(cfg.node_count(), 3);
        assert_eq!(cfg.find_node("10.1.0.2".parse().unwrap()), Some(1));
        assert_eq!(cfg.find_node("10.9.9.9".parse().unwrap()), None);
        assert_eq!(cfg.port, MSG_PORT);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(MeshConfig::new(&["10.0.0.1"]).is_err());
        assert!(MeshConfig::new(&["10.0.0.1", "not-an-ip"]).is_err());
    }

    #[test]
    fn inline_limit_accounts_for_framing() {
        assert_eq!(MAX_BULK_SIZE_INLINE + POLL_HEAD_AND_TAIL, MAX_MSG_SIZE);
        assert_eq!(POLL_HEAD_AND_TAIL, 6);
    }
}
