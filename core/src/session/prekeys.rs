//! Local pre-key material handed out in bundles
//!
//! The whole registry is persisted as one [`PreKeyRecord`] so ids are never
//! reissued with different keys across restarts.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::crypto::keys::{IdentityKeyPair, OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::crypto::provider::CryptoProvider;
use crate::crypto::x3dh::X3DH;

/// Persisted form of the registry, private keys included
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKeyRecord {
    /// Owner of the keys; a record for another identity is never loaded
    #[serde(with = "crate::util::serde_hex::bytes32")]
    pub identity_key: [u8; 32],
    signed_pre_key: SignedPreKey,
    /// Newest first
    previous_signed_pre_keys: VecDeque<SignedPreKey>,
    next_signed_pre_key_id: u32,
    one_time_pre_keys: Vec<OneTimePreKey>,
    next_one_time_pre_key_id: u32,
}

/// Current and recently rotated signed pre-keys plus the one-time pool
#[derive(Clone)]
pub struct PreKeyRegistry {
    identity: IdentityKeyPair,
    provider: Arc<dyn CryptoProvider>,
    config: SessionConfig,
    keys: PreKeyRecord,
}

impl PreKeyRegistry {
    pub fn new(identity: IdentityKeyPair, provider: Arc<dyn CryptoProvider>, config: SessionConfig) -> Self {
        let signed_pre_key = SignedPreKey::generate(1, &identity, provider.as_ref());
        let keys = PreKeyRecord {
            identity_key: identity.identity_key(),
            signed_pre_key,
            previous_signed_pre_keys: VecDeque::new(),
            next_signed_pre_key_id: 2,
            one_time_pre_keys: Vec::new(),
            next_one_time_pre_key_id: 1,
        };
        let mut registry = Self {
            identity,
            provider,
            config,
            keys,
        };
        registry.fill_pool(registry.config.one_time_pre_key_pool);
        registry
    }

    /// Registry with the same owner holding the stored keys instead.
    ///
    /// `None` if the record belongs to another identity.
    pub fn resume(&self, record: PreKeyRecord) -> Option<Self> {
        if record.identity_key != self.identity.identity_key() {
            return None;
        }
        Some(Self {
            identity: self.identity.clone(),
            provider: self.provider.clone(),
            config: self.config.clone(),
            keys: record,
        })
    }

    pub fn record(&self) -> &PreKeyRecord {
        &self.keys
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn signed_pre_key(&self) -> &SignedPreKey {
        &self.keys.signed_pre_key
    }

    /// Current key or one still retained after rotation
    pub fn find_signed_pre_key(&self, id: u32) -> Option<&SignedPreKey> {
        if self.keys.signed_pre_key.id == id {
            return Some(&self.keys.signed_pre_key);
        }
        self.keys.previous_signed_pre_keys.iter().find(|k| k.id == id)
    }

    pub fn one_time_pre_key_count(&self) -> usize {
        self.keys.one_time_pre_keys.len()
    }

    pub fn find_one_time_pre_key(&self, id: u32) -> Option<&OneTimePreKey> {
        self.keys.one_time_pre_keys.iter().find(|k| k.id == id)
    }

    /// Bundle offering the oldest unused one-time pre-key, if any.
    ///
    /// The key stays in the pool until a handshake consumes it.
    pub fn bundle(&self, x3dh: &X3DH) -> PreKeyBundle {
        x3dh.generate_pre_key_bundle(&self.identity, &self.keys.signed_pre_key, self.keys.one_time_pre_keys.first())
    }

    /// Remove a one-time pre-key so it can never be used again
    pub fn take_one_time_pre_key(&mut self, id: u32) -> Option<OneTimePreKey> {
        let position = self.keys.one_time_pre_keys.iter().position(|k| k.id == id)?;
        let key = self.keys.one_time_pre_keys.remove(position);

        if self.keys.one_time_pre_keys.len() < self.config.one_time_pre_key_low_water as usize {
            let missing = (self.config.one_time_pre_key_pool as usize).saturating_sub(self.keys.one_time_pre_keys.len());
            self.fill_pool(missing as u32);
            tracing::debug!("Replenished one-time pre-keys, pool now {}", self.keys.one_time_pre_keys.len());
        }
        Some(key)
    }

    /// Replace the signed pre-key; the old one is still accepted for a while
    pub fn rotate_signed_pre_key(&mut self) -> u32 {
        let id = self.keys.next_signed_pre_key_id;
        self.keys.next_signed_pre_key_id = self.keys.next_signed_pre_key_id.wrapping_add(1);

        let fresh = SignedPreKey::generate(id, &self.identity, self.provider.as_ref());
        let old = std::mem::replace(&mut self.keys.signed_pre_key, fresh);
        self.keys.previous_signed_pre_keys.push_front(old);
        self.keys.previous_signed_pre_keys.truncate(self.config.retained_signed_pre_keys);

        tracing::info!("Rotated signed pre-key, new id {}", id);
        id
    }

    /// The current signed pre-key has outlived the rotation interval
    pub fn rotation_due(&self, now: u64) -> bool {
        now.saturating_sub(self.keys.signed_pre_key.created_at) >= self.config.rotation_interval_ms
    }

    fn fill_pool(&mut self, count: u32) {
        for _ in 0..count {
            let id = self.keys.next_one_time_pre_key_id;
            self.keys.next_one_time_pre_key_id = self.keys.next_one_time_pre_key_id.wrapping_add(1);
            self.keys
                .one_time_pre_keys
                .push(OneTimePreKey::generate(id, self.provider.as_ref()));
        }
    }
}
