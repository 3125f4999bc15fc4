use std::io;
use std::net::SocketAddr;

use crate::common::messages::EncodeError;

/// Errors reported by [`PeerNode`](super::PeerNode) operations.
///
/// None of these are fatal to the node except [`NodeError::Bind`] during
/// startup; each one is also logged where it happens.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("node is already listening on {0}")]
    AlreadyListening(SocketAddr),

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("handshake with {address} failed: {reason}")]
    Handshake { address: String, reason: String },

    #[error("timed out waiting for introduction from {0}")]
    HandshakeTimeout(String),

    #[error("no connection found for {0}")]
    PeerNotFound(String),

    #[error("could not encode message: {0}")]
    Encode(#[from] EncodeError),

    #[error("outbound queue for {0} is full")]
    QueueFull(String),

    #[error("connection to {0} is closed")]
    Closed(String),

    #[error("node is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Io(#[from] io::Error),
}
