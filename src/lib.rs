//! Serverless peer-to-peer chat over persistent TCP connections.
//!
//! Peers are dialed by address, exchange an `introduce` handshake, and then
//! trade newline-delimited JSON messages: direct chat, presence, group chat
//! and file transfers.

pub mod common;
pub mod peer;
pub mod transfer;

pub use common::config::NodeConfig;
pub use common::messages::Message;
pub use peer::{Inbound, NodeError, PeerNode};
