//! Double Ratchet Algorithm
//!
//! Provides forward secrecy and post-compromise security through
//! continuous key ratcheting.
//!
//! [`RatchetState`] is a value: [`RatchetEngine::encrypt`] and
//! [`RatchetEngine::decrypt`] never touch the state they are given and return
//! a successor instead. The caller persists the successor before releasing
//! the result; on any error the previous state is still the current one.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::config::RatchetConfig;
use crate::crypto::message::{encode_header, MessageFormatError, RatchetMessage};
use crate::crypto::provider::{CryptoError, CryptoProvider, KeyPair, NONCE_LEN};

const RATCHET_INFO: &[u8] = b"SecureChat_Ratchet";
const MESSAGE_KEY_INFO: &[u8] = b"SecureChat_MessageKeys";
const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;
/// Remote ratchet keys remembered after a DH step, for replay detection
const RETIRED_RATCHET_KEYS: usize = 16;

/// Symmetric chain: current key and the number of the next message
#[derive(Clone, Serialize, Deserialize)]
struct ChainState {
    #[serde(with = "crate::util::serde_hex::bytes32")]
    key: [u8; 32],
    index: u32,
}

impl ChainState {
    fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }
}

impl Drop for ChainState {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Message key cached for a message that has not arrived yet
#[derive(Clone, Serialize, Deserialize)]
struct SkippedMessageKey {
    #[serde(with = "crate::util::serde_hex::bytes32")]
    ratchet_key: [u8; 32],
    message_number: u32,
    #[serde(with = "crate::util::serde_hex::bytes32")]
    message_key: [u8; 32],
}

impl Drop for SkippedMessageKey {
    fn drop(&mut self) {
        self.message_key.zeroize();
    }
}

/// Where a session stands in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatchetPhase {
    /// Responder that has not seen the initiator's ratchet key yet; cannot send
    AwaitingFirstReceive,
    /// Sending is possible but nothing has been received on this session
    AwaitingFirstSend,
    Established,
}

/// Complete per-session ratchet state
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    #[serde(with = "crate::util::serde_hex::bytes32")]
    root_key: [u8; 32],
    sending_chain: Option<ChainState>,
    receiving_chain: Option<ChainState>,
    #[serde(with = "crate::util::serde_hex::bytes32")]
    ratchet_private: [u8; 32],
    #[serde(with = "crate::util::serde_hex::bytes32")]
    ratchet_public: [u8; 32],
    #[serde(with = "crate::util::serde_hex::option_bytes32")]
    remote_ratchet_key: Option<[u8; 32]>,
    /// Newest first, at most [`RETIRED_RATCHET_KEYS`]
    #[serde(default, with = "crate::util::serde_hex::bytes32_seq")]
    retired_remote_ratchet_keys: VecDeque<[u8; 32]>,
    previous_chain_length: u32,
    /// Insertion ordered, oldest first
    skipped_keys: VecDeque<SkippedMessageKey>,
    #[serde(with = "crate::util::serde_hex")]
    associated_data: Vec<u8>,
}

impl RatchetState {
    pub fn phase(&self) -> RatchetPhase {
        if self.remote_ratchet_key.is_none() {
            RatchetPhase::AwaitingFirstReceive
        } else if self.receiving_chain.is_none() {
            RatchetPhase::AwaitingFirstSend
        } else {
            RatchetPhase::Established
        }
    }

    /// Our current ratchet public key
    pub fn ratchet_public_key(&self) -> [u8; 32] {
        self.ratchet_public
    }

    pub fn remote_ratchet_key(&self) -> Option<[u8; 32]> {
        self.remote_ratchet_key
    }

    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }

    /// Number of the next message on the sending chain
    pub fn sending_index(&self) -> u32 {
        self.sending_chain.as_ref().map(|c| c.index).unwrap_or(0)
    }

    /// Number of the next expected message on the receiving chain
    pub fn receiving_index(&self) -> u32 {
        self.receiving_chain.as_ref().map(|c| c.index).unwrap_or(0)
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped_keys.len()
    }

    fn take_skipped(&mut self, ratchet_key: &[u8; 32], message_number: u32) -> Option<SkippedMessageKey> {
        let position = self
            .skipped_keys
            .iter()
            .position(|k| &k.ratchet_key == ratchet_key && k.message_number == message_number)?;
        self.skipped_keys.remove(position)
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.ratchet_private.zeroize();
    }
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("phase", &self.phase())
            .field("ratchet_public", &hex::encode(self.ratchet_public))
            .field("sending_index", &self.sending_index())
            .field("receiving_index", &self.receiving_index())
            .field("skipped_keys", &self.skipped_keys.len())
            .finish_non_exhaustive()
    }
}

/// Ratchet errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RatchetError {
    /// Responder tried to send before the initiator's first message arrived
    #[error("Ratchet is awaiting the peer's first message")]
    AwaitingFirstMessage,
    /// AEAD tag mismatch: tampered, forged or misrouted message
    #[error("Message authentication failed")]
    AuthenticationFailed,
    #[error("Message {message_number} was already received")]
    Replay { message_number: u32 },
    #[error("Too many skipped messages ({requested} > {limit})")]
    TooManySkipped { requested: u32, limit: u32 },
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] MessageFormatError),
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

impl RatchetError {
    /// Errors that indicate an attack rather than a local condition
    pub fn is_security_event(&self) -> bool {
        matches!(self, RatchetError::AuthenticationFailed | RatchetError::Replay { .. })
    }
}

impl From<CryptoError> for RatchetError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::KeyDerivation => RatchetError::KeyDerivationFailed,
            CryptoError::Encryption => RatchetError::EncryptionFailed,
            CryptoError::Authentication => RatchetError::AuthenticationFailed,
        }
    }
}

/// Stateless driver for [`RatchetState`] transitions
#[derive(Clone)]
pub struct RatchetEngine {
    provider: Arc<dyn CryptoProvider>,
    config: RatchetConfig,
}

impl RatchetEngine {
    pub fn new(provider: Arc<dyn CryptoProvider>, config: RatchetConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &RatchetConfig {
        &self.config
    }

    /// Initiator: sending chain is live immediately, receiving chain is empty
    pub fn initialize_as_initiator(
        &self,
        shared_secret: &[u8; 32],
        associated_data: &[u8],
        receiver_signed_pre_key: &[u8; 32],
    ) -> Result<RatchetState, RatchetError> {
        let keypair = self.provider.generate_keypair();
        let dh_output = self.provider.diffie_hellman(&keypair.private, receiver_signed_pre_key);
        let (root_key, chain_key) = self.kdf_rk(shared_secret, dh_output)?;

        Ok(RatchetState {
            root_key,
            sending_chain: Some(ChainState::new(chain_key)),
            receiving_chain: None,
            ratchet_private: keypair.private,
            ratchet_public: keypair.public,
            remote_ratchet_key: Some(*receiver_signed_pre_key),
            retired_remote_ratchet_keys: VecDeque::new(),
            previous_chain_length: 0,
            skipped_keys: VecDeque::new(),
            associated_data: associated_data.to_vec(),
        })
    }

    /// Responder: only the root key; chains start with the first DH step
    pub fn initialize_as_responder(
        &self,
        shared_secret: &[u8; 32],
        associated_data: &[u8],
        own_signed_pre_key: &KeyPair,
    ) -> RatchetState {
        RatchetState {
            root_key: *shared_secret,
            sending_chain: None,
            receiving_chain: None,
            ratchet_private: own_signed_pre_key.private,
            ratchet_public: own_signed_pre_key.public,
            remote_ratchet_key: None,
            retired_remote_ratchet_keys: VecDeque::new(),
            previous_chain_length: 0,
            skipped_keys: VecDeque::new(),
            associated_data: associated_data.to_vec(),
        }
    }

    pub fn encrypt(&self, state: &RatchetState, plaintext: &[u8]) -> Result<(RatchetMessage, RatchetState), RatchetError> {
        let mut next = state.clone();

        if next.sending_chain.is_none() {
            self.dh_ratchet_send(&mut next)?;
        }
        let chain = next.sending_chain.as_ref().ok_or(RatchetError::AwaitingFirstMessage)?;
        let message_number = chain.index;
        let (message_key, advanced) = self.chain_step(chain)?;
        next.sending_chain = Some(advanced);

        let header = encode_header(&next.ratchet_public, next.previous_chain_length, message_number);
        let aad = [next.associated_data.as_slice(), &header].concat();
        let (key, nonce) = self.message_keys(message_key)?;
        let sealed = self.provider.aead_seal(&key, &nonce, plaintext, &aad);
        zeroize_pair(key, nonce);
        let (ciphertext, auth_tag) = sealed?;

        Ok((
            RatchetMessage {
                ratchet_public_key: next.ratchet_public,
                previous_chain_length: next.previous_chain_length,
                message_number,
                ciphertext,
                auth_tag,
            },
            next,
        ))
    }

    pub fn decrypt(&self, state: &RatchetState, message: &RatchetMessage) -> Result<(Vec<u8>, RatchetState), RatchetError> {
        let mut next = state.clone();
        let ratchet_key = message.ratchet_public_key;

        if let Some(skipped) = next.take_skipped(&ratchet_key, message.message_number) {
            tracing::debug!("Ratchet: message {} decrypted from skipped key", message.message_number);
            let plaintext = self.open(skipped.message_key, &next.associated_data, message)?;
            return Ok((plaintext, next));
        }

        if next.remote_ratchet_key != Some(ratchet_key) {
            if next.retired_remote_ratchet_keys.contains(&ratchet_key) {
                return Err(RatchetError::Replay {
                    message_number: message.message_number,
                });
            }
            self.skip_message_keys(&mut next, message.previous_chain_length)?;
            self.dh_ratchet_receive(&mut next, ratchet_key)?;
        }

        let chain_index = next.receiving_index();
        if message.message_number < chain_index {
            return Err(RatchetError::Replay {
                message_number: message.message_number,
            });
        }
        self.skip_message_keys(&mut next, message.message_number)?;

        let chain = next.receiving_chain.as_ref().ok_or(RatchetError::AwaitingFirstMessage)?;
        let (message_key, advanced) = self.chain_step(chain)?;
        next.receiving_chain = Some(advanced);

        let plaintext = self.open(message_key, &next.associated_data, message)?;
        Ok((plaintext, next))
    }

    /// Receiving half of a DH step; the sending half waits for the next encrypt
    fn dh_ratchet_receive(&self, state: &mut RatchetState, their_key: [u8; 32]) -> Result<(), RatchetError> {
        if let Some(chain) = state.sending_chain.as_ref() {
            state.previous_chain_length = chain.index;
        }
        if let Some(retired) = state.remote_ratchet_key {
            state.retired_remote_ratchet_keys.push_front(retired);
            state.retired_remote_ratchet_keys.truncate(RETIRED_RATCHET_KEYS);
        }
        state.remote_ratchet_key = Some(their_key);

        let dh_output = self.provider.diffie_hellman(&state.ratchet_private, &their_key);
        let (root_key, chain_key) = self.kdf_rk(&state.root_key, dh_output)?;
        state.root_key = root_key;
        state.receiving_chain = Some(ChainState::new(chain_key));
        state.sending_chain = None;

        tracing::debug!("Ratchet: DH step on receive, new remote key {}", hex::encode(&their_key[..4]));
        Ok(())
    }

    fn dh_ratchet_send(&self, state: &mut RatchetState) -> Result<(), RatchetError> {
        let their_key = state.remote_ratchet_key.ok_or(RatchetError::AwaitingFirstMessage)?;
        let keypair = self.provider.generate_keypair();
        let dh_output = self.provider.diffie_hellman(&keypair.private, &their_key);
        let (root_key, chain_key) = self.kdf_rk(&state.root_key, dh_output)?;

        state.root_key = root_key;
        state.ratchet_private = keypair.private;
        state.ratchet_public = keypair.public;
        state.sending_chain = Some(ChainState::new(chain_key));

        tracing::debug!("Ratchet: DH step on send, new ratchet key {}", hex::encode(&keypair.public[..4]));
        Ok(())
    }

    /// Advance the receiving chain to `until`, caching the keys passed over
    fn skip_message_keys(&self, state: &mut RatchetState, until: u32) -> Result<(), RatchetError> {
        let (Some(chain), Some(ratchet_key)) = (state.receiving_chain.clone(), state.remote_ratchet_key) else {
            return Ok(());
        };
        if until <= chain.index {
            return Ok(());
        }
        let gap = until - chain.index;
        if gap > self.config.max_skip_per_chain {
            return Err(RatchetError::TooManySkipped {
                requested: gap,
                limit: self.config.max_skip_per_chain,
            });
        }

        let mut chain = chain;
        while chain.index < until {
            let (message_key, advanced) = self.chain_step(&chain)?;
            state.skipped_keys.push_back(SkippedMessageKey {
                ratchet_key,
                message_number: chain.index,
                message_key,
            });
            chain = advanced;
        }
        state.receiving_chain = Some(chain);

        let mut evicted = 0usize;
        while state.skipped_keys.len() > self.config.max_skipped_keys {
            state.skipped_keys.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            tracing::debug!("Ratchet: evicted {} oldest skipped keys", evicted);
        }
        Ok(())
    }

    /// KDF_RK: (root key, DH output) -> (root key, chain key)
    fn kdf_rk(&self, root_key: &[u8; 32], mut dh_output: [u8; 32]) -> Result<([u8; 32], [u8; 32]), RatchetError> {
        let mut output = [0u8; 64];
        let result = self.provider.hkdf_sha256(Some(root_key), &dh_output, RATCHET_INFO, &mut output);
        dh_output.zeroize();
        result?;

        let mut new_root = [0u8; 32];
        let mut chain_key = [0u8; 32];
        new_root.copy_from_slice(&output[..32]);
        chain_key.copy_from_slice(&output[32..]);
        output.zeroize();
        Ok((new_root, chain_key))
    }

    /// KDF_CK: message key for `chain.index` plus the advanced chain
    fn chain_step(&self, chain: &ChainState) -> Result<([u8; 32], ChainState), RatchetError> {
        let message_key = self.provider.hmac_sha256(&chain.key, &[MESSAGE_KEY_SEED])?;
        let next_key = self.provider.hmac_sha256(&chain.key, &[CHAIN_KEY_SEED])?;
        Ok((
            message_key,
            ChainState {
                key: next_key,
                index: chain.index + 1,
            },
        ))
    }

    /// Expand a message key into an AEAD key and nonce
    fn message_keys(&self, mut message_key: [u8; 32]) -> Result<([u8; 32], [u8; NONCE_LEN]), RatchetError> {
        let mut okm = [0u8; 32 + NONCE_LEN];
        let result = self.provider.hkdf_sha256(None, &message_key, MESSAGE_KEY_INFO, &mut okm);
        message_key.zeroize();
        result?;

        let mut key = [0u8; 32];
        let mut nonce = [0u8; NONCE_LEN];
        key.copy_from_slice(&okm[..32]);
        nonce.copy_from_slice(&okm[32..]);
        okm.zeroize();
        Ok((key, nonce))
    }

    fn open(&self, message_key: [u8; 32], associated_data: &[u8], message: &RatchetMessage) -> Result<Vec<u8>, RatchetError> {
        let aad = [associated_data, &message.header_bytes()].concat();
        let (key, nonce) = self.message_keys(message_key)?;
        let opened = self
            .provider
            .aead_open(&key, &nonce, &message.ciphertext, &message.auth_tag, &aad);
        zeroize_pair(key, nonce);
        opened.map_err(|e| {
            tracing::warn!("Ratchet: authentication failed for message {}", message.message_number);
            RatchetError::from(e)
        })
    }
}

fn zeroize_pair(mut key: [u8; 32], mut nonce: [u8; NONCE_LEN]) {
    key.zeroize();
    nonce.zeroize();
}
