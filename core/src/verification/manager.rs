//! Out-of-band identity verification
//!
//! Safety numbers are derived from both parties' identifiers and identity
//! keys. Each side is hashed on its own and the two halves are ordered
//! canonically, so both peers display the same 60 digits.

use std::sync::Arc;

use sha2::{Digest, Sha256, Sha512};
use tracing::{info, warn};

use crate::storage::StoreError;
use crate::util::now_ms;
use crate::verification::store::{TrustRecord, TrustStore};

const SAFETY_NUMBER_VERSION: u16 = 0;
const SAFETY_NUMBER_ITERATIONS: usize = 5200;
/// Digits contributed by each party
const DIGITS_PER_PARTY: usize = 30;
const CHUNK_BYTES: usize = 5;
const GROUP_SIZE: usize = 5;

/// Outcome of comparing a presented identity key with the pinned one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    FirstUse,
    Match,
    /// Key differs from the pinned one; any verification is revoked
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("No identity recorded for peer {0}")]
    UnknownPeer(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

pub struct VerificationManager {
    store: Arc<dyn TrustStore>,
}

impl VerificationManager {
    pub fn new(store: Arc<dyn TrustStore>) -> Self {
        Self { store }
    }

    /// Hex SHA-256 over local key, remote key and associated data.
    ///
    /// Directional: swapping the keys yields a different fingerprint.
    pub fn generate_session_fingerprint(local_public_key: &[u8], remote_public_key: &[u8], associated_data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(local_public_key);
        hasher.update(remote_public_key);
        hasher.update(associated_data);
        hex::encode(hasher.finalize())
    }

    /// 60 digits in 12 space separated groups, identical on both sides
    pub fn generate_safety_numbers(local_id: &str, local_public_key: &[u8], remote_id: &str, remote_public_key: &[u8]) -> String {
        let local = (local_id.as_bytes(), local_public_key);
        let remote = (remote_id.as_bytes(), remote_public_key);
        let (first, second) = if local <= remote { (local, remote) } else { (remote, local) };

        let mut digits = party_digits(first.0, first.1);
        digits.push_str(&party_digits(second.0, second.1));
        format_safety_number(&digits)
    }

    /// Pin on first use, report whether a known peer's key changed
    pub async fn record_identity(&self, peer_id: &str, identity_key: &[u8; 32]) -> Result<TrustState, VerificationError> {
        let existing = self.store.get(peer_id).await?;
        match existing {
            Some(record) if &record.identity_key == identity_key => Ok(TrustState::Match),
            Some(record) => {
                warn!(
                    "Identity key for {} changed: {} -> {}",
                    peer_id,
                    hex::encode(&record.identity_key[..8]),
                    hex::encode(&identity_key[..8])
                );
                self.store
                    .put(&TrustRecord {
                        peer_id: peer_id.to_string(),
                        identity_key: *identity_key,
                        verified: false,
                        verified_at: None,
                        first_seen_at: now_ms(),
                    })
                    .await?;
                Ok(TrustState::Changed)
            }
            None => {
                self.store
                    .put(&TrustRecord {
                        peer_id: peer_id.to_string(),
                        identity_key: *identity_key,
                        verified: false,
                        verified_at: None,
                        first_seen_at: now_ms(),
                    })
                    .await?;
                Ok(TrustState::FirstUse)
            }
        }
    }

    /// Upgrade the pinned identity to verified after comparing safety numbers
    pub async fn mark_as_verified(&self, peer_id: &str) -> Result<(), VerificationError> {
        let mut record = self
            .store
            .get(peer_id)
            .await?
            .ok_or_else(|| VerificationError::UnknownPeer(peer_id.to_string()))?;
        record.verified = true;
        record.verified_at = Some(now_ms());
        self.store.put(&record).await?;
        info!("Peer {} marked as verified", peer_id);
        Ok(())
    }

    pub async fn is_verified(&self, peer_id: &str) -> Result<bool, VerificationError> {
        Ok(self.store.get(peer_id).await?.map(|r| r.verified).unwrap_or(false))
    }

    /// Drop back to trust-on-first-use; the pinned key is kept
    pub async fn clear_verification(&self, peer_id: &str) -> Result<(), VerificationError> {
        if let Some(mut record) = self.store.get(peer_id).await? {
            record.verified = false;
            record.verified_at = None;
            self.store.put(&record).await?;
        }
        Ok(())
    }

    pub async fn trust_record(&self, peer_id: &str) -> Result<Option<TrustRecord>, VerificationError> {
        Ok(self.store.get(peer_id).await?)
    }

    /// Forget the peer entirely, the next key seen is pinned afresh
    pub async fn forget_peer(&self, peer_id: &str) -> Result<(), VerificationError> {
        self.store.delete(peer_id).await?;
        Ok(())
    }
}

/// Group digits in blocks of five, separated by single spaces
pub fn format_safety_number(digits: &str) -> String {
    let clean: Vec<char> = digits.chars().filter(|c| c.is_ascii_digit()).collect();
    clean
        .chunks(GROUP_SIZE)
        .map(|group| group.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}

fn party_digits(id: &[u8], key: &[u8]) -> String {
    let mut data = Vec::with_capacity(2 + key.len() + id.len());
    data.extend_from_slice(&SAFETY_NUMBER_VERSION.to_be_bytes());
    data.extend_from_slice(key);
    data.extend_from_slice(id);

    for _ in 0..SAFETY_NUMBER_ITERATIONS {
        let mut hasher = Sha512::new();
        hasher.update(&data);
        hasher.update(key);
        data = hasher.finalize().to_vec();
    }

    data[..DIGITS_PER_PARTY]
        .chunks(CHUNK_BYTES)
        .map(|chunk| {
            let value = chunk.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            format!("{:05}", value % 100_000)
        })
        .collect()
}
