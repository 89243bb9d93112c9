//! Error types for meshmsg.
//!
//! The taxonomy is deliberately narrow. Connection faults surface as
//! [`Error::PeerUnreachable`] and stick until teardown; transient resource
//! exhaustion is retried internally and only reported as
//! [`Error::PoolExhausted`] after bounded spinning. Local invariant
//! violations (unknown message type, header corruption, double registration,
//! oversized messages) are programming errors and panic instead of returning.

use std::io;

/// Messaging-layer errors.
#[derive(Debug)]
pub enum Error {
    /// IO error from the underlying fabric.
    Io(io::Error),
    /// The connection to the peer is not (or no longer) established.
    PeerUnreachable(usize),
    /// A resource pool stayed exhausted past the bounded retry window.
    PoolExhausted,
    /// The destination is not a valid remote peer (e.g. self-send).
    InvalidPeer(usize),
    /// Invalid mesh configuration.
    InvalidConfig(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::PeerUnreachable(id) => write!(f, "peer {} unreachable", id),
            Error::PoolExhausted => write!(f, "resource pool exhausted"),
            Error::InvalidPeer(id) => write!(f, "invalid peer {}", id),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for meshmsg operations.
pub type Result<T> = std::result::Result<T, Error>;
