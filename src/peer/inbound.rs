//! # Inbound Delivery
//!
//! Turns decoded frames into the events handed to the consumer. Chat and
//! presence become ready-to-display lines; every other kind is passed through
//! as the structured [`Message`] so the consumer can handle it (e.g., save a
//! file transfer).

use log::debug;
use std::fmt;

use crate::common::messages::{decode, Message};

/// One event delivered to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A formatted chat or presence line
    Notice(String),
    /// A frame from a peer that could not be decoded
    Warning(String),
    /// Any other message, unmodified
    Message(Message),
}

impl fmt::Display for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inbound::Notice(text) | Inbound::Warning(text) => f.write_str(text),
            Inbound::Message(message) => write!(f, "[{}] {:?}", message.kind().to_uppercase(), message),
        }
    }
}

/// Decode one frame received from `peer_name` and shape it for delivery.
pub fn process_inbound(frame: &[u8], peer_name: &str) -> Inbound {
    match decode(frame) {
        Ok(Message::Chat {
            sender, content, ..
        }) => Inbound::Notice(format!("[CHAT] {}: {}", sender, content)),
        Ok(Message::Presence { sender, status }) => {
            Inbound::Notice(format!("[PRESENCE] {} is now {}.", sender, status))
        }
        Ok(message) => Inbound::Message(message),
        Err(e) => {
            debug!("Undecodable frame from {}: {}", peer_name, e);
            Inbound::Warning(format!("[WARN] Received invalid message from {}.", peer_name))
        }
    }
}
