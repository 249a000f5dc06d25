//! Wire formats for ratchet messages and session bootstrap headers

use serde::{Deserialize, Serialize};

use crate::crypto::provider::TAG_LEN;

/// Encoded header length: ratchet key ‖ previousChainLength ‖ messageNumber
pub const HEADER_LEN: usize = 32 + 4 + 4;

/// Encrypted message as it travels between peers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetMessage {
    /// Sender's current ratchet public key
    pub ratchet_public_key: [u8; 32],
    /// Length of the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Position in the current sending chain
    pub message_number: u32,
    pub ciphertext: Vec<u8>,
    pub auth_tag: [u8; TAG_LEN],
}

impl RatchetMessage {
    /// Header bytes, bound into the AEAD associated data
    pub fn header_bytes(&self) -> [u8; HEADER_LEN] {
        encode_header(&self.ratchet_public_key, self.previous_chain_length, self.message_number)
    }

    /// header ‖ u32 ciphertext length ‖ ciphertext ‖ tag
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + 4 + self.ciphertext.len() + TAG_LEN);
        bytes.extend_from_slice(&self.header_bytes());
        bytes.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes.extend_from_slice(&self.auth_tag);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageFormatError> {
        if bytes.len() < HEADER_LEN + 4 + TAG_LEN {
            return Err(MessageFormatError::Truncated);
        }
        let ratchet_public_key: [u8; 32] = bytes[0..32].try_into().map_err(|_| MessageFormatError::Truncated)?;
        let previous_chain_length = read_u32(&bytes[32..36])?;
        let message_number = read_u32(&bytes[36..40])?;
        let ciphertext_len = read_u32(&bytes[40..44])? as usize;

        let body = &bytes[HEADER_LEN + 4..];
        if body.len() != ciphertext_len + TAG_LEN {
            return Err(MessageFormatError::LengthMismatch);
        }
        let (ciphertext, tag) = body.split_at(ciphertext_len);
        let auth_tag: [u8; TAG_LEN] = tag.try_into().map_err(|_| MessageFormatError::Truncated)?;

        Ok(Self {
            ratchet_public_key,
            previous_chain_length,
            message_number,
            ciphertext: ciphertext.to_vec(),
            auth_tag,
        })
    }
}

pub(crate) fn encode_header(ratchet_key: &[u8; 32], previous_chain_length: u32, message_number: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..32].copy_from_slice(ratchet_key);
    header[32..36].copy_from_slice(&previous_chain_length.to_be_bytes());
    header[36..40].copy_from_slice(&message_number.to_be_bytes());
    header
}

fn read_u32(bytes: &[u8]) -> Result<u32, MessageFormatError> {
    let array: [u8; 4] = bytes.try_into().map_err(|_| MessageFormatError::Truncated)?;
    Ok(u32::from_be_bytes(array))
}

/// X3DH header the initiator attaches until the responder answers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialMessage {
    /// Initiator's identity key (Ed25519)
    #[serde(with = "crate::util::serde_hex::bytes32")]
    pub identity_key: [u8; 32],
    /// Ephemeral key from X3DH
    #[serde(with = "crate::util::serde_hex::bytes32")]
    pub ephemeral_key: [u8; 32],
    pub signed_pre_key_id: u32,
    pub one_time_pre_key_id: Option<u32>,
}

impl InitialMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(73);
        bytes.extend_from_slice(&self.identity_key);
        bytes.extend_from_slice(&self.ephemeral_key);
        bytes.extend_from_slice(&self.signed_pre_key_id.to_be_bytes());
        match self.one_time_pre_key_id {
            Some(id) => {
                bytes.push(1);
                bytes.extend_from_slice(&id.to_be_bytes());
            }
            None => bytes.push(0),
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageFormatError> {
        if bytes.len() < 69 {
            return Err(MessageFormatError::Truncated);
        }
        let identity_key: [u8; 32] = bytes[0..32].try_into().map_err(|_| MessageFormatError::Truncated)?;
        let ephemeral_key: [u8; 32] = bytes[32..64].try_into().map_err(|_| MessageFormatError::Truncated)?;
        let signed_pre_key_id = read_u32(&bytes[64..68])?;
        let one_time_pre_key_id = match (bytes[68], bytes.len()) {
            (0, 69) => None,
            (1, 73) => Some(read_u32(&bytes[69..73])?),
            _ => return Err(MessageFormatError::LengthMismatch),
        };
        Ok(Self {
            identity_key,
            ephemeral_key,
            signed_pre_key_id,
            one_time_pre_key_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageFormatError {
    #[error("Message truncated")]
    Truncated,
    #[error("Declared length does not match payload")]
    LengthMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RatchetMessage {
        RatchetMessage {
            ratchet_public_key: [1u8; 32],
            previous_chain_length: 5,
            message_number: 10,
            ciphertext: vec![1, 2, 3, 4, 5],
            auth_tag: [9u8; TAG_LEN],
        }
    }

    #[test]
    fn test_ratchet_message_layout() {
        let msg = sample();
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), 32 + 4 + 4 + 4 + 5 + 16);
        assert_eq!(&bytes[32..36], &5u32.to_be_bytes());
        assert_eq!(&bytes[36..40], &10u32.to_be_bytes());
        assert_eq!(RatchetMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_ratchet_message_rejects_truncation() {
        let bytes = sample().to_bytes();
        assert_eq!(RatchetMessage::from_bytes(&bytes[..20]), Err(MessageFormatError::Truncated));
        assert_eq!(
            RatchetMessage::from_bytes(&bytes[..bytes.len() - 1]),
            Err(MessageFormatError::LengthMismatch)
        );
    }

    #[test]
    fn test_initial_message_serialization() {
        let msg = InitialMessage {
            identity_key: [3u8; 32],
            ephemeral_key: [4u8; 32],
            signed_pre_key_id: 2,
            one_time_pre_key_id: Some(42),
        };
        let bytes = msg.to_bytes();
        // 32 + 32 + 4 + 1 + 4
        assert_eq!(bytes.len(), 73);
        assert_eq!(InitialMessage::from_bytes(&bytes).unwrap(), msg);

        let no_otpk = InitialMessage { one_time_pre_key_id: None, ..msg };
        assert_eq!(InitialMessage::from_bytes(&no_otpk.to_bytes()).unwrap(), no_otpk);
    }
}
