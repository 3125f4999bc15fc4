//! # Common Components
//!
//! Shared building blocks for the peer node and its front-ends.
//!
//! ## Modules
//!
//! - [`messages`]: Message kinds and the JSON codec
//! - [`connection`]: Line-delimited framing over TCP
//! - [`config`]: TOML configuration
//! - [`logging`]: Logger setup for binaries

pub mod messages;
pub mod connection;
pub mod config;
pub mod logging;
