//! Seals outgoing messages into envelopes and opens incoming ones

use std::sync::Arc;

use tracing::debug;

use crate::messaging::protocol::{Envelope, Message, ProtocolError};
use crate::session::{SessionError, SessionManager};

/// Result of opening an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    /// Cryptographic sender, taken from the envelope
    pub sender_peer_id: String,
    pub message: Message,
    /// A new session was accepted from this envelope
    pub session_established: bool,
}

/// Handles message encryption/decryption
pub struct MessageHandler {
    /// Our peer ID
    peer_id: String,
    sessions: Arc<SessionManager>,
}

impl MessageHandler {
    pub fn new(peer_id: &str, sessions: Arc<SessionManager>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            sessions,
        }
    }

    /// Encrypt a message for the recipient.
    ///
    /// The X3DH header rides along until the recipient has answered.
    pub async fn prepare_outgoing(&self, recipient_peer_id: &str, message: &Message) -> Result<Envelope, HandlerError> {
        let encrypted = self.sessions.encrypt(recipient_peer_id, &message.to_bytes()).await?;
        let envelope = match self.sessions.pending_initial_message(recipient_peer_id).await {
            Some(initial) => Envelope::session_init(&self.peer_id, initial, &encrypted),
            None => Envelope::message(&self.peer_id, &encrypted),
        };
        Ok(envelope)
    }

    /// Decrypt, accepting a handshake header only together with its message
    pub async fn process_incoming(&self, envelope: &Envelope) -> Result<Incoming, HandlerError> {
        // The transport sender may be a relay; session state follows the envelope sender
        let sender = &envelope.sender_peer_id;
        let encrypted = envelope.ratchet_message()?;

        let (plaintext, session_established) = match envelope.initial() {
            Some(initial) => self.sessions.accept_session(sender, initial, &encrypted).await?,
            None => (self.sessions.decrypt(sender, &encrypted).await?, false),
        };
        let message = Message::from_bytes(&plaintext)?;
        debug!("Opened {:?} {} from {}", message.message_type, message.id, sender);

        Ok(Incoming {
            sender_peer_id: sender.clone(),
            message,
            session_established,
        })
    }
}

/// Handler errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl HandlerError {
    /// Tampering or replay, as opposed to a local or format problem
    pub fn is_security_event(&self) -> bool {
        match self {
            HandlerError::Session(SessionError::Ratchet(e)) => e.is_security_event(),
            HandlerError::Session(SessionError::X3DH(crate::crypto::X3DHError::InvalidSignature)) => true,
            _ => false,
        }
    }
}
