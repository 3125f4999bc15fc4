//! # Peer Components
//!
//! ## Node ([`node`])
//! The connection manager: listener, handshakes, registry, send/broadcast.
//!
//! ## Supporting pieces
//! - [`registry`]: peer name -> connection handle map
//! - [`session`]: per-connection writer task and handshake reads
//! - [`inbound`]: shaping inbound frames for the consumer
//! - [`error`]: error type for node operations

pub mod error;
pub mod inbound;
pub mod node;
pub mod registry;
pub mod session;

// Re-export for convenience
pub use error::NodeError;
pub use inbound::Inbound;
pub use node::{AdmissionFn, PeerNode};
