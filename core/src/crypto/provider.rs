//! Cryptographic backend handle
//!
//! X3DH and the ratchet engine never reach for global primitives; they are
//! handed a [`CryptoProvider`] at construction time.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// AES-GCM authentication tag length
pub const TAG_LEN: usize = 16;
/// AES-GCM nonce length
pub const NONCE_LEN: usize = 12;

/// X25519 key pair as raw bytes
#[derive(Clone)]
pub struct KeyPair {
    pub private: [u8; 32],
    pub public: [u8; 32],
}

impl KeyPair {
    pub fn from_private(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { private, public }
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Key derivation failed")]
    KeyDerivation,
    #[error("Encryption failed")]
    Encryption,
    #[error("Authentication failed")]
    Authentication,
}

/// Primitive operations used by the handshake and the ratchet.
pub trait CryptoProvider: Send + Sync {
    /// Fresh X25519 key pair
    fn generate_keypair(&self) -> KeyPair;

    /// X25519 scalar multiplication
    fn diffie_hellman(&self, private: &[u8; 32], public: &[u8; 32]) -> [u8; 32];

    /// HKDF-SHA256 extract-and-expand into `output`
    fn hkdf_sha256(
        &self,
        salt: Option<&[u8]>,
        ikm: &[u8],
        info: &[u8],
        output: &mut [u8],
    ) -> Result<(), CryptoError>;

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError>;

    /// AEAD encryption returning ciphertext and detached tag
    fn aead_seal(
        &self,
        key: &[u8; 32],
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, [u8; TAG_LEN]), CryptoError>;

    /// AEAD decryption; fails with [`CryptoError::Authentication`] on any tamper
    fn aead_open(
        &self,
        key: &[u8; 32],
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        tag: &[u8; TAG_LEN],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn random_bytes(&self, output: &mut [u8]);
}

/// X25519 + HKDF/HMAC-SHA256 + AES-256-GCM
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCryptoProvider;

impl CryptoProvider for DefaultCryptoProvider {
    fn generate_keypair(&self) -> KeyPair {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret).to_bytes();
        KeyPair {
            private: secret.to_bytes(),
            public,
        }
    }

    fn diffie_hellman(&self, private: &[u8; 32], public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(*private);
        let shared = secret.diffie_hellman(&X25519PublicKey::from(*public));
        shared.to_bytes()
    }

    fn hkdf_sha256(
        &self,
        salt: Option<&[u8]>,
        ikm: &[u8],
        info: &[u8],
        output: &mut [u8],
    ) -> Result<(), CryptoError> {
        let hk = Hkdf::<Sha256>::new(salt, ikm);
        hk.expand(info, output).map_err(|_| CryptoError::KeyDerivation)
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|_| CryptoError::KeyDerivation)?;
        mac.update(data);
        let result = mac.finalize().into_bytes();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        Ok(output)
    }

    fn aead_seal(
        &self,
        key: &[u8; 32],
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, [u8; TAG_LEN]), CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encryption)?;
        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut buffer)
            .map_err(|_| CryptoError::Encryption)?;
        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(&tag);
        Ok((buffer, tag_bytes))
    }

    fn aead_open(
        &self,
        key: &[u8; 32],
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        tag: &[u8; TAG_LEN],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Authentication)?;
        let mut buffer = ciphertext.to_vec();
        match cipher.decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            aad,
            &mut buffer,
            Tag::from_slice(tag),
        ) {
            Ok(()) => Ok(buffer),
            Err(_) => {
                buffer.zeroize();
                Err(CryptoError::Authentication)
            }
        }
    }

    fn random_bytes(&self, output: &mut [u8]) {
        OsRng.fill_bytes(output);
    }
}
