//! Session management for encrypted communications
//!
//! Combines X3DH and the Double Ratchet into per-peer sessions with
//! crash-safe persistence.

pub mod manager;
pub mod prekeys;
pub mod store;

pub use manager::{Session, SessionError, SessionInfo, SessionManager, SessionRole};
pub use prekeys::{PreKeyRecord, PreKeyRegistry};
pub use store::{
    FilePreKeyStore, FileSessionStore, MemoryPreKeyStore, MemorySessionStore, PreKeyStore, SessionRecord, SessionStore,
};

#[cfg(test)]
mod tests;
