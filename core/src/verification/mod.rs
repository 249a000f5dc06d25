//! Safety numbers, session fingerprints and verified-peer state

pub mod manager;
pub mod store;

pub use manager::{format_safety_number, TrustState, VerificationError, VerificationManager};
pub use store::{FileTrustStore, MemoryTrustStore, TrustRecord, TrustStore};
