//! Signal-style cryptography for SecureChat
//!
//! Provides:
//! - X3DH (Extended Triple Diffie-Hellman) key agreement
//! - Double Ratchet for message encryption
//! - Wire formats for ratchet messages and session bootstrap headers

pub mod keys;
pub mod message;
pub mod provider;
pub mod ratchet;
pub mod x3dh;

pub use keys::{identity_dh_public, IdentityKeyPair, KeyError, OneTimePreKey, PreKeyBundle, SignedPreKey};
pub use message::{InitialMessage, MessageFormatError, RatchetMessage};
pub use provider::{CryptoError, CryptoProvider, DefaultCryptoProvider, KeyPair};
pub use ratchet::{RatchetEngine, RatchetError, RatchetPhase, RatchetState};
pub use x3dh::{X3DHError, X3DHResult, X3DH};
