//! SecureChat end-to-end encryption core
//!
//! Provides X3DH key agreement, Double Ratchet sessions with crash-safe
//! persistence, safety-number verification and a durable offline
//! delivery queue.

pub mod config;
pub mod crypto;
pub mod logger;
pub mod messaging;
pub mod queue;
pub mod session;
pub mod storage;
pub mod util;
pub mod verification;

// Re-export logger types
pub use logger::{init_logger, init_stderr_logger, CoreLogger};

pub use config::{ConfigError, CoreConfig, QueueConfig, RatchetConfig, SessionConfig};

// Re-export crypto types
pub use crypto::{
    CryptoProvider, DefaultCryptoProvider, IdentityKeyPair, InitialMessage, PreKeyBundle, RatchetEngine, RatchetError,
    RatchetMessage, RatchetState, X3DHError, X3DH,
};

pub use session::{SessionError, SessionInfo, SessionManager, SessionStore};

pub use queue::{MessagePriority, OfflineMessageQueue, QueueError, QueueStatistics, QueueStatus};

pub use verification::{TrustState, VerificationError, VerificationManager};

// Re-export messaging types
pub use messaging::{Message, MessageType, MessagingError, MessagingEvent, MessagingService};
pub use messaging::{Transport, TransportError, TransportEvent};

pub use storage::StoreError;

use sha2::{Digest, Sha256};

/// Get a human-readable fingerprint of an identity key
///
/// Returns a truncated SHA-256 hash formatted as groups of 4 hex chars
/// Example: "A1B2-C3D4-E5F6-A7B8"
pub fn public_key_fingerprint(identity_key: &[u8; 32]) -> String {
    let hash = Sha256::digest(identity_key);

    // Take first 8 bytes (16 hex chars) and format nicely
    let hex_str = hex::encode_upper(&hash[..8]);
    hex_str
        .as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}
