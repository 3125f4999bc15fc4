//! # Message Protocol
//!
//! Defines every message exchanged between peers and the codec that turns
//! them into frame bodies and back.
//!
//! Each message is a JSON object whose `"type"` field names its kind:
//!
//! | kind            | fields                                              |
//! |-----------------|-----------------------------------------------------|
//! | `introduce`     | `username`                                          |
//! | `chat`          | `sender`, `recipient`, `content`                    |
//! | `presence`      | `sender`, `status`                                  |
//! | `group_chat`    | `sender`, `group`, `content`                        |
//! | `file_transfer` | `sender`, `recipient`, `filename`, `filesize`, `content` |
//!
//! Objects with any other `"type"` (or none) are kept as
//! [`Message::Unrecognized`] so they can be handed to the consumer untouched.
//!
//! The codec is pure: [`encode`] and [`decode`] never touch I/O and never
//! panic on bad input. The `\n` frame delimiter is added by the connection
//! layer, not here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind names with a typed representation.
pub const KNOWN_KINDS: [&str; 5] = [
    "introduce",
    "chat",
    "presence",
    "group_chat",
    "file_transfer",
];

/// Core message enum for all peer-to-peer communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// **Introduce**
    ///
    /// First frame in each direction of every connection. Binds the
    /// connection to the sender's display name.
    Introduce { username: String },

    /// **Direct chat** from `sender` to a single `recipient`.
    Chat {
        sender: String,
        recipient: String,
        content: String,
    },

    /// **Presence** change (e.g., "online", "offline", "away").
    Presence { sender: String, status: String },

    /// **Group chat**
    ///
    /// Sent individually to every connected peer; `group` is a free-form
    /// label, there is no membership tracking.
    GroupChat {
        sender: String,
        group: String,
        content: String,
    },

    /// **File transfer**
    ///
    /// `content` is the base64 encoding of the whole file and `filesize`
    /// its decoded length in bytes.
    FileTransfer {
        sender: String,
        recipient: String,
        filename: String,
        filesize: u64,
        content: String,
    },

    /// Any JSON object whose kind is not listed in [`KNOWN_KINDS`].
    #[serde(skip)]
    Unrecognized(Map<String, Value>),
}

impl Message {
    pub fn introduce(username: impl Into<String>) -> Self {
        Message::Introduce {
            username: username.into(),
        }
    }

    pub fn chat(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Message::Chat {
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
        }
    }

    pub fn presence(sender: impl Into<String>, status: impl Into<String>) -> Self {
        Message::Presence {
            sender: sender.into(),
            status: status.into(),
        }
    }

    pub fn group_chat(
        sender: impl Into<String>,
        group: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Message::GroupChat {
            sender: sender.into(),
            group: group.into(),
            content: content.into(),
        }
    }

    /// Build a message from loose JSON fields.
    ///
    /// A known `"type"` must carry its full field set; anything else becomes
    /// [`Message::Unrecognized`].
    pub fn from_fields(fields: Map<String, Value>) -> Result<Self, serde_json::Error> {
        let known = fields
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|kind| KNOWN_KINDS.contains(&kind));

        if known {
            serde_json::from_value(Value::Object(fields))
        } else {
            Ok(Message::Unrecognized(fields))
        }
    }

    /// Wire name of this message's kind (empty if an unrecognized object has none).
    pub fn kind(&self) -> &str {
        match self {
            Message::Introduce { .. } => "introduce",
            Message::Chat { .. } => "chat",
            Message::Presence { .. } => "presence",
            Message::GroupChat { .. } => "group_chat",
            Message::FileTransfer { .. } => "file_transfer",
            Message::Unrecognized(fields) => {
                fields.get("type").and_then(Value::as_str).unwrap_or("")
            }
        }
    }
}

/// Error turning a message into bytes.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("fields do not form a valid `{kind}` message: {source}")]
    Schema {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Error turning a frame body back into a message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("invalid fields for a known message kind: {0}")]
    Schema(#[source] serde_json::Error),
}

/// Serialize a message to compact JSON bytes (no trailing delimiter).
///
/// The output never contains a raw line feed: JSON string escaping turns
/// any `\n` inside a field into the two characters `\` `n`.
pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    match message {
        Message::Unrecognized(fields) => serde_json::to_vec(fields),
        known => serde_json::to_vec(known),
    }
    .map_err(EncodeError::Serialize)
}

/// Parse one frame body into a message.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;

    match value {
        Value::Object(fields) => Message::from_fields(fields).map_err(DecodeError::Schema),
        Value::Null => Err(DecodeError::NotAnObject("null")),
        Value::Bool(_) => Err(DecodeError::NotAnObject("a boolean")),
        Value::Number(_) => Err(DecodeError::NotAnObject("a number")),
        Value::String(_) => Err(DecodeError::NotAnObject("a string")),
        Value::Array(_) => Err(DecodeError::NotAnObject("an array")),
    }
}
