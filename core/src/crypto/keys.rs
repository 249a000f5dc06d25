//! Key material for the X3DH handshake
//!
//! Identity keys are Ed25519. Their X25519 form, used for Diffie-Hellman,
//! is the Montgomery image of the same point, so a single 32-byte identity
//! key both verifies pre-key signatures and takes part in key agreement.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::crypto::provider::{CryptoProvider, KeyPair};
use crate::util::now_ms;

/// Long-term identity key pair
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    /// X25519 form of the signing scalar
    dh: KeyPair,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let dh = KeyPair::from_private(signing_key.to_scalar_bytes());
        Self { signing_key, dh }
    }

    /// Ed25519 verifying key; this is the identity key published in bundles
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn identity_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// X25519 public key used in the DH computations
    pub fn public_key(&self) -> [u8; 32] {
        self.dh.public
    }

    pub(crate) fn dh_keypair(&self) -> &KeyPair {
        &self.dh
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    /// 32-byte seed, for handing to secure storage
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn from_bytes(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("identity_key", &hex::encode(self.identity_key()))
            .finish_non_exhaustive()
    }
}

/// Convert a published identity key into its X25519 form
pub fn identity_dh_public(identity_key: &[u8; 32]) -> Result<[u8; 32], KeyError> {
    let verifying = VerifyingKey::from_bytes(identity_key).map_err(|_| KeyError::InvalidPublicKey)?;
    Ok(verifying.to_montgomery().to_bytes())
}

/// Signed prekey (medium-term, signed by identity key)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub id: u32,
    #[serde(with = "private_key")]
    keypair: KeyPair,
    #[serde(with = "crate::util::serde_hex::signature")]
    signature: Signature,
    pub created_at: u64,
}

impl SignedPreKey {
    pub fn generate(id: u32, identity: &IdentityKeyPair, provider: &dyn CryptoProvider) -> Self {
        let keypair = provider.generate_keypair();
        let signature = identity.sign(&keypair.public);

        Self {
            id,
            keypair,
            signature,
            created_at: now_ms(),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub(crate) fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn verify(&self, identity_public: &VerifyingKey) -> bool {
        identity_public.verify(&self.keypair.public, &self.signature).is_ok()
    }
}

/// One-time prekey, consumed by at most one responder handshake
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OneTimePreKey {
    pub id: u32,
    #[serde(with = "private_key")]
    keypair: KeyPair,
}

/// Persists only the private half; the public key is recomputed on load
mod private_key {
    use crate::crypto::provider::KeyPair;

    pub fn serialize<S>(keypair: &KeyPair, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        crate::util::serde_hex::bytes32::serialize(&keypair.private, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<KeyPair, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        crate::util::serde_hex::bytes32::deserialize(deserializer).map(KeyPair::from_private)
    }
}

impl OneTimePreKey {
    pub fn generate(id: u32, provider: &dyn CryptoProvider) -> Self {
        Self {
            id,
            keypair: provider.generate_keypair(),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public
    }

    pub(crate) fn keypair(&self) -> &KeyPair {
        &self.keypair
    }
}

/// Public half of a responder's key material
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    #[serde(with = "crate::util::serde_hex::bytes32")]
    pub identity_key: [u8; 32],
    pub signed_pre_key_id: u32,
    #[serde(with = "crate::util::serde_hex::bytes32")]
    pub signed_pre_key: [u8; 32],
    #[serde(with = "crate::util::serde_hex::signature")]
    pub signature: Signature,
    pub one_time_pre_key_id: Option<u32>,
    #[serde(default, with = "crate::util::serde_hex::option_bytes32")]
    pub one_time_pre_key: Option<[u8; 32]>,
}

const BUNDLE_LEN: usize = 32 + 32 + 64 + 4;
const BUNDLE_WITH_OTPK_LEN: usize = BUNDLE_LEN + 32 + 4;

impl PreKeyBundle {
    pub fn one_time(&self) -> Option<(u32, [u8; 32])> {
        self.one_time_pre_key_id.zip(self.one_time_pre_key)
    }

    /// Verify the signed prekey signature against the identity key
    pub fn verify(&self) -> bool {
        match VerifyingKey::from_bytes(&self.identity_key) {
            Ok(vk) => vk.verify(&self.signed_pre_key, &self.signature).is_ok(),
            Err(_) => false,
        }
    }

    /// identityKey ‖ signedPreKey ‖ signature ‖ [oneTimePreKey] ‖ spkId ‖ [opkId]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(BUNDLE_WITH_OTPK_LEN);
        bytes.extend_from_slice(&self.identity_key);
        bytes.extend_from_slice(&self.signed_pre_key);
        bytes.extend_from_slice(&self.signature.to_bytes());
        let one_time = self.one_time();
        if let Some((_, key)) = one_time {
            bytes.extend_from_slice(&key);
        }
        bytes.extend_from_slice(&self.signed_pre_key_id.to_be_bytes());
        if let Some((id, _)) = one_time {
            bytes.extend_from_slice(&id.to_be_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let has_otpk = match bytes.len() {
            BUNDLE_LEN => false,
            BUNDLE_WITH_OTPK_LEN => true,
            _ => return Err(KeyError::InvalidFormat),
        };

        let identity_key = read_32(&bytes[0..32])?;
        let signed_pre_key = read_32(&bytes[32..64])?;
        let sig: [u8; 64] = bytes[64..128].try_into().map_err(|_| KeyError::InvalidFormat)?;
        let signature = Signature::from_bytes(&sig);

        let (one_time_key, rest) = if has_otpk {
            (Some(read_32(&bytes[128..160])?), &bytes[160..])
        } else {
            (None, &bytes[128..])
        };
        let signed_pre_key_id = read_u32(&rest[0..4])?;
        let one_time_pre_key_id = if has_otpk { Some(read_u32(&rest[4..8])?) } else { None };

        Ok(Self {
            identity_key,
            signed_pre_key_id,
            signed_pre_key,
            signature,
            one_time_pre_key_id,
            one_time_pre_key: one_time_key,
        })
    }
}

fn read_32(bytes: &[u8]) -> Result<[u8; 32], KeyError> {
    bytes.try_into().map_err(|_| KeyError::InvalidFormat)
}

fn read_u32(bytes: &[u8]) -> Result<u32, KeyError> {
    let array: [u8; 4] = bytes.try_into().map_err(|_| KeyError::InvalidFormat)?;
    Ok(u32::from_be_bytes(array))
}

/// Key-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid key format")]
    InvalidFormat,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Signature verification failed")]
    SignatureInvalid,
}
