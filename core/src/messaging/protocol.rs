//! Message protocol definitions
//!
//! Defines the wire format for peer messages.

use serde::{Deserialize, Serialize};

use crate::crypto::message::{InitialMessage, RatchetMessage};
use crate::util::{now_ms, random_id};

/// Current envelope version
pub const PROTOCOL_VERSION: u8 = 1;

/// Message types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Regular text message
    Text,
    /// Delivery receipt
    Receipt,
    /// Typing indicator
    Typing,
    /// Application control message
    Control,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::Receipt => "RECEIPT",
            MessageType::Typing => "TYPING",
            MessageType::Control => "CONTROL",
        }
    }
}

/// Plaintext message content, encrypted as a whole
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Message ID (random)
    pub id: String,
    pub message_type: MessageType,
    /// Timestamp (Unix ms)
    pub timestamp: u64,
    /// Content (type-dependent)
    pub body: String,
    /// Recipient should answer with a receipt
    #[serde(default)]
    pub require_ack: bool,
}

impl Message {
    pub fn new(message_type: MessageType, body: &str, require_ack: bool) -> Self {
        Self {
            id: random_id(),
            message_type,
            timestamp: now_ms(),
            body: body.to_string(),
            require_ack,
        }
    }

    /// Create a new text message
    pub fn text(body: &str) -> Self {
        Self::new(MessageType::Text, body, false)
    }

    /// Create a delivery receipt for `message_id`
    pub fn receipt(message_id: &str) -> Self {
        Self::new(MessageType::Receipt, message_id, false)
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|_| ProtocolError::InvalidFormat)
    }
}

/// What an envelope carries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// First messages of a session, carrying the X3DH header
    SessionInit {
        initial: InitialMessage,
        #[serde(with = "crate::util::serde_hex")]
        message: Vec<u8>,
    },
    Message {
        #[serde(with = "crate::util::serde_hex")]
        message: Vec<u8>,
    },
}

/// Message envelope for transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    /// Protocol version
    pub version: u8,
    /// Sender's peer ID
    pub sender_peer_id: String,
    pub kind: EnvelopeKind,
}

impl Envelope {
    pub fn session_init(sender_peer_id: &str, initial: InitialMessage, message: &RatchetMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sender_peer_id: sender_peer_id.to_string(),
            kind: EnvelopeKind::SessionInit {
                initial,
                message: message.to_bytes(),
            },
        }
    }

    pub fn message(sender_peer_id: &str, message: &RatchetMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sender_peer_id: sender_peer_id.to_string(),
            kind: EnvelopeKind::Message {
                message: message.to_bytes(),
            },
        }
    }

    /// X3DH header, when present
    pub fn initial(&self) -> Option<&InitialMessage> {
        match &self.kind {
            EnvelopeKind::SessionInit { initial, .. } => Some(initial),
            EnvelopeKind::Message { .. } => None,
        }
    }

    /// Decode the ratchet message inside
    pub fn ratchet_message(&self) -> Result<RatchetMessage, ProtocolError> {
        let bytes = match &self.kind {
            EnvelopeKind::SessionInit { message, .. } | EnvelopeKind::Message { message } => message,
        };
        RatchetMessage::from_bytes(bytes).map_err(|_| ProtocolError::InvalidFormat)
    }

    /// Serialize to bytes for transport
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Deserialize from transport bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Self = serde_json::from_slice(bytes).map_err(|_| ProtocolError::InvalidFormat)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnknownVersion(envelope.version));
        }
        Ok(envelope)
    }
}

/// Protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    InvalidFormat,
    #[error("Unknown protocol version {0}")]
    UnknownVersion(u8),
}
