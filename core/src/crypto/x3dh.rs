//! X3DH (Extended Triple Diffie-Hellman) Key Agreement Protocol
//!
//! Establishes a shared secret between an initiator holding the responder's
//! published [`PreKeyBundle`] and a responder that may be offline at the time.

use std::sync::Arc;

use zeroize::Zeroize;

use crate::crypto::keys::{identity_dh_public, IdentityKeyPair, KeyError, OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::crypto::provider::{CryptoProvider, KeyPair};

/// Info string for HKDF
const X3DH_INFO: &[u8] = b"SecureChat_X3DH";

/// Output of a completed handshake
pub struct X3DHResult {
    shared_secret: [u8; 32],
    /// AD = IK_A ‖ IK_B
    pub associated_data: Vec<u8>,
}

impl X3DHResult {
    pub fn shared_secret(&self) -> &[u8; 32] {
        &self.shared_secret
    }
}

impl Drop for X3DHResult {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

impl std::fmt::Debug for X3DHResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X3DHResult")
            .field("associated_data", &hex::encode(&self.associated_data))
            .finish_non_exhaustive()
    }
}

/// X3DH errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum X3DHError {
    /// The bundle's signed prekey was not signed by its identity key
    #[error("Invalid prekey bundle signature")]
    InvalidSignature,
    #[error("Missing key material: {0}")]
    MissingKeyMaterial(&'static str),
    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

/// Handshake driver bound to a crypto backend
#[derive(Clone)]
pub struct X3DH {
    provider: Arc<dyn CryptoProvider>,
}

impl X3DH {
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self { provider }
    }

    /// Fresh ephemeral key for one initiator handshake
    pub fn generate_ephemeral(&self) -> KeyPair {
        self.provider.generate_keypair()
    }

    /// Publishable bundle; contains public material only
    pub fn generate_pre_key_bundle(
        &self,
        identity: &IdentityKeyPair,
        signed_pre_key: &SignedPreKey,
        one_time_pre_key: Option<&OneTimePreKey>,
    ) -> PreKeyBundle {
        let signature = identity.sign(&signed_pre_key.public_key());
        PreKeyBundle {
            identity_key: identity.identity_key(),
            signed_pre_key_id: signed_pre_key.id,
            signed_pre_key: signed_pre_key.public_key(),
            signature,
            one_time_pre_key_id: one_time_pre_key.map(|k| k.id),
            one_time_pre_key: one_time_pre_key.map(|k| k.public_key()),
        }
    }

    /// Initiator side: verifies the bundle, then DH1..DH4 through the KDF
    pub fn sender_x3dh(
        &self,
        sender_identity: &IdentityKeyPair,
        sender_ephemeral: &KeyPair,
        receiver_bundle: &PreKeyBundle,
    ) -> Result<X3DHResult, X3DHError> {
        if receiver_bundle.one_time_pre_key_id.is_some() != receiver_bundle.one_time_pre_key.is_some() {
            return Err(X3DHError::MissingKeyMaterial("one-time prekey id without key"));
        }
        if !receiver_bundle.verify() {
            tracing::warn!("X3DH: prekey bundle signature rejected");
            return Err(X3DHError::InvalidSignature);
        }

        let receiver_identity_dh = identity_dh_public(&receiver_bundle.identity_key)?;
        let p = self.provider.as_ref();

        // DH1 = DH(IK_A, SPK_B)
        let dh1 = p.diffie_hellman(&sender_identity.dh_keypair().private, &receiver_bundle.signed_pre_key);
        // DH2 = DH(EK_A, IK_B)
        let dh2 = p.diffie_hellman(&sender_ephemeral.private, &receiver_identity_dh);
        // DH3 = DH(EK_A, SPK_B)
        let dh3 = p.diffie_hellman(&sender_ephemeral.private, &receiver_bundle.signed_pre_key);
        // DH4 = DH(EK_A, OPK_B)
        let dh4 = receiver_bundle
            .one_time_pre_key
            .map(|opk| p.diffie_hellman(&sender_ephemeral.private, &opk));

        let shared_secret = self.derive(dh1, dh2, dh3, dh4)?;

        Ok(X3DHResult {
            shared_secret,
            associated_data: associated_data(&sender_identity.identity_key(), &receiver_bundle.identity_key),
        })
    }

    /// Responder side: mirrors the initiator's computations from private keys
    pub fn receiver_x3dh(
        &self,
        receiver_identity: &IdentityKeyPair,
        receiver_signed_pre_key: &SignedPreKey,
        receiver_one_time_pre_key: Option<&OneTimePreKey>,
        sender_identity_key: &[u8; 32],
        sender_ephemeral_key: &[u8; 32],
    ) -> Result<X3DHResult, X3DHError> {
        let sender_identity_dh = identity_dh_public(sender_identity_key)?;
        let p = self.provider.as_ref();
        let spk = receiver_signed_pre_key.keypair();

        let dh1 = p.diffie_hellman(&spk.private, &sender_identity_dh);
        let dh2 = p.diffie_hellman(&receiver_identity.dh_keypair().private, sender_ephemeral_key);
        let dh3 = p.diffie_hellman(&spk.private, sender_ephemeral_key);
        let dh4 = receiver_one_time_pre_key.map(|opk| p.diffie_hellman(&opk.keypair().private, sender_ephemeral_key));

        let shared_secret = self.derive(dh1, dh2, dh3, dh4)?;

        Ok(X3DHResult {
            shared_secret,
            associated_data: associated_data(sender_identity_key, &receiver_identity.identity_key()),
        })
    }

    fn derive(
        &self,
        mut dh1: [u8; 32],
        mut dh2: [u8; 32],
        mut dh3: [u8; 32],
        mut dh4: Option<[u8; 32]>,
    ) -> Result<[u8; 32], X3DHError> {
        let low_order = [dh1, dh2, dh3].iter().chain(dh4.iter()).any(|dh| dh.iter().all(|b| *b == 0));

        // F = 0xFF * 32 prepended to the DH outputs
        let mut ikm = Vec::with_capacity(32 * 5);
        ikm.extend_from_slice(&[0xFFu8; 32]);
        ikm.extend_from_slice(&dh1);
        ikm.extend_from_slice(&dh2);
        ikm.extend_from_slice(&dh3);
        if let Some(dh4) = dh4.as_ref() {
            ikm.extend_from_slice(dh4);
        }
        dh1.zeroize();
        dh2.zeroize();
        dh3.zeroize();
        if let Some(dh4) = dh4.as_mut() {
            dh4.zeroize();
        }

        if low_order {
            ikm.zeroize();
            return Err(X3DHError::InvalidKey(KeyError::InvalidPublicKey));
        }

        let mut output = [0u8; 32];
        let result = self
            .provider
            .hkdf_sha256(Some(&[0u8; 32]), &ikm, X3DH_INFO, &mut output)
            .map_err(|_| X3DHError::KeyDerivationFailed);
        ikm.zeroize();
        result.map(|_| output)
    }
}

fn associated_data(initiator_identity: &[u8; 32], responder_identity: &[u8; 32]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(64);
    ad.extend_from_slice(initiator_identity);
    ad.extend_from_slice(responder_identity);
    ad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::provider::DefaultCryptoProvider;

    fn x3dh() -> X3DH {
        X3DH::new(Arc::new(DefaultCryptoProvider))
    }

    #[test]
    fn test_x3dh_key_agreement() {
        let x3dh = x3dh();
        let provider = DefaultCryptoProvider;
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let bob_signed_prekey = SignedPreKey::generate(1, &bob_identity, &provider);
        let bob_one_time_prekey = OneTimePreKey::generate(1, &provider);

        let bob_bundle = x3dh.generate_pre_key_bundle(&bob_identity, &bob_signed_prekey, Some(&bob_one_time_prekey));
        let ephemeral = x3dh.generate_ephemeral();

        let alice = x3dh.sender_x3dh(&alice_identity, &ephemeral, &bob_bundle).unwrap();
        let bob = x3dh
            .receiver_x3dh(
                &bob_identity,
                &bob_signed_prekey,
                Some(&bob_one_time_prekey),
                &alice_identity.identity_key(),
                &ephemeral.public,
            )
            .unwrap();

        assert_eq!(alice.shared_secret(), bob.shared_secret());
        assert_eq!(alice.associated_data, bob.associated_data);
    }

    #[test]
    fn test_x3dh_without_one_time_prekey() {
        let x3dh = x3dh();
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let bob_signed_prekey = SignedPreKey::generate(1, &bob_identity, &DefaultCryptoProvider);

        let bob_bundle = x3dh.generate_pre_key_bundle(&bob_identity, &bob_signed_prekey, None);
        assert!(bob_bundle.one_time().is_none());

        let ephemeral = x3dh.generate_ephemeral();
        let alice = x3dh.sender_x3dh(&alice_identity, &ephemeral, &bob_bundle).unwrap();
        let bob = x3dh
            .receiver_x3dh(&bob_identity, &bob_signed_prekey, None, &alice_identity.identity_key(), &ephemeral.public)
            .unwrap();

        assert_eq!(alice.shared_secret(), bob.shared_secret());
    }

    #[test]
    fn test_one_time_prekey_changes_secret() {
        let x3dh = x3dh();
        let provider = DefaultCryptoProvider;
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let spk = SignedPreKey::generate(1, &bob_identity, &provider);
        let opk = OneTimePreKey::generate(7, &provider);
        let ephemeral = x3dh.generate_ephemeral();

        let with = x3dh
            .sender_x3dh(&alice_identity, &ephemeral, &x3dh.generate_pre_key_bundle(&bob_identity, &spk, Some(&opk)))
            .unwrap();
        let without = x3dh
            .sender_x3dh(&alice_identity, &ephemeral, &x3dh.generate_pre_key_bundle(&bob_identity, &spk, None))
            .unwrap();
        assert_ne!(with.shared_secret(), without.shared_secret());
    }

    #[test]
    fn test_x3dh_invalid_signature_fails() {
        let x3dh = x3dh();
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let bob_signed_prekey = SignedPreKey::generate(1, &bob_identity, &DefaultCryptoProvider);

        // Signature made by a different identity
        let wrong_identity = IdentityKeyPair::generate();
        let mut bundle = x3dh.generate_pre_key_bundle(&bob_identity, &bob_signed_prekey, None);
        bundle.signature = wrong_identity.sign(&bob_signed_prekey.public_key());

        let result = x3dh.sender_x3dh(&alice_identity, &x3dh.generate_ephemeral(), &bundle);
        assert_eq!(result.unwrap_err(), X3DHError::InvalidSignature);
    }

    #[test]
    fn test_missing_one_time_key_material() {
        let x3dh = x3dh();
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let spk = SignedPreKey::generate(1, &bob_identity, &DefaultCryptoProvider);

        let mut bundle = x3dh.generate_pre_key_bundle(&bob_identity, &spk, None);
        bundle.one_time_pre_key_id = Some(4);

        let result = x3dh.sender_x3dh(&alice_identity, &x3dh.generate_ephemeral(), &bundle);
        assert!(matches!(result, Err(X3DHError::MissingKeyMaterial(_))));
    }

    #[test]
    fn test_x3dh_associated_data() {
        let x3dh = x3dh();
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let spk = SignedPreKey::generate(1, &bob_identity, &DefaultCryptoProvider);

        let bundle = x3dh.generate_pre_key_bundle(&bob_identity, &spk, None);
        let alice = x3dh.sender_x3dh(&alice_identity, &x3dh.generate_ephemeral(), &bundle).unwrap();

        assert_eq!(alice.associated_data.len(), 64);
        assert_eq!(&alice.associated_data[..32], &alice_identity.identity_key());
        assert_eq!(&alice.associated_data[32..], &bob_identity.identity_key());
    }
}
