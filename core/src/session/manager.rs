//! Session lifecycle: handshake, ratchet initialization, encrypt/decrypt
//!
//! Each peer has its own async lock. A ratchet transition is persisted
//! before the new state replaces the old one in memory and before its
//! result is returned, so a failed write leaves the session exactly where
//! it was and the message can be delivered again. A handshake only replaces
//! a session once the message that carried it has authenticated.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::crypto::keys::{IdentityKeyPair, PreKeyBundle};
use crate::crypto::message::{InitialMessage, RatchetMessage};
use crate::crypto::provider::{CryptoProvider, KeyPair};
use crate::crypto::ratchet::{RatchetEngine, RatchetError, RatchetPhase, RatchetState};
use crate::crypto::x3dh::{X3DHError, X3DH};
use crate::session::prekeys::PreKeyRegistry;
use crate::session::store::{MemoryPreKeyStore, PreKeyStore, SessionRecord, SessionStore};
use crate::storage::StoreError;
use crate::util::now_ms;

/// A secure messaging session with a peer
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    pub peer_id: String,
    pub is_initiator: bool,
    state: RatchetState,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub send_message_number: u64,
    pub receive_message_number: u64,
    /// Header attached to outbound messages until the responder answers
    pending_initial: Option<InitialMessage>,
    #[serde(with = "crate::util::serde_hex::option_bytes32")]
    remote_identity_key: Option<[u8; 32]>,
    /// Initiator's X3DH ephemeral key, recognises a repeated handshake
    #[serde(with = "crate::util::serde_hex::option_bytes32")]
    remote_base_key: Option<[u8; 32]>,
}

impl Session {
    fn new(peer_id: &str, is_initiator: bool, state: RatchetState) -> Self {
        let now = now_ms();
        Self {
            peer_id: peer_id.to_string(),
            is_initiator,
            state,
            created_at: now,
            last_activity_at: now,
            send_message_number: 0,
            receive_message_number: 0,
            pending_initial: None,
            remote_identity_key: None,
            remote_base_key: None,
        }
    }

    pub fn phase(&self) -> RatchetPhase {
        self.state.phase()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            peer_id: self.peer_id.clone(),
            is_initiator: self.is_initiator,
            phase: self.state.phase(),
            send_message_number: self.send_message_number,
            receive_message_number: self.receive_message_number,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            remote_identity_key: self.remote_identity_key,
            associated_data: self.state.associated_data().to_vec(),
        }
    }

    fn to_record(&self) -> Result<SessionRecord, SessionError> {
        let state = serde_json::to_vec(self).map_err(|e| SessionError::Serialization(e.to_string()))?;
        Ok(SessionRecord {
            peer_id: self.peer_id.clone(),
            state,
            created_at: self.created_at,
            updated_at: self.last_activity_at,
        })
    }

    fn from_record(record: &SessionRecord) -> Result<Self, SessionError> {
        serde_json::from_slice(&record.state).map_err(|e| SessionError::Serialization(e.to_string()))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_id", &self.peer_id)
            .field("is_initiator", &self.is_initiator)
            .field("state", &self.state)
            .field("send_message_number", &self.send_message_number)
            .field("receive_message_number", &self.receive_message_number)
            .finish_non_exhaustive()
    }
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub peer_id: String,
    pub is_initiator: bool,
    pub phase: RatchetPhase,
    pub send_message_number: u64,
    pub receive_message_number: u64,
    pub created_at: u64,
    pub last_activity_at: u64,
    /// Peer's Ed25519 identity key when the session came from a handshake
    pub remote_identity_key: Option<[u8; 32]>,
    pub associated_data: Vec<u8>,
}

/// Which side of the handshake a new session is on
pub enum SessionRole {
    Initiator { remote_signed_pre_key: [u8; 32] },
    Responder { signed_pre_key: KeyPair },
}

/// Session errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("No session with peer {0}")]
    NoSession(String),
    #[error("X3DH error: {0}")]
    X3DH(#[from] X3DHError),
    #[error("Ratchet error: {0}")]
    Ratchet(#[from] RatchetError),
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Decrypted message is not valid UTF-8")]
    InvalidUtf8,
}

type SessionSlot = Arc<Mutex<Option<Session>>>;

/// Longest wait between signed pre-key age checks
const ROTATION_CHECK_PERIOD: Duration = Duration::from_secs(60 * 60);

pub struct SessionManager {
    x3dh: X3DH,
    engine: RatchetEngine,
    store: Arc<dyn SessionStore>,
    config: CoreConfig,
    prekeys: Mutex<PreKeyRegistry>,
    pre_key_store: Arc<dyn PreKeyStore>,
    identity_key: [u8; 32],
    sessions: DashMap<String, SessionSlot>,
    active: watch::Sender<BTreeMap<String, SessionInfo>>,
    rotation_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        identity: IdentityKeyPair,
        provider: Arc<dyn CryptoProvider>,
        store: Arc<dyn SessionStore>,
        config: CoreConfig,
    ) -> Self {
        let identity_key = identity.identity_key();
        let prekeys = PreKeyRegistry::new(identity, provider.clone(), config.session.clone());
        let (active, _) = watch::channel(BTreeMap::new());

        Self {
            x3dh: X3DH::new(provider.clone()),
            engine: RatchetEngine::new(provider, config.ratchet.clone()),
            store,
            config,
            prekeys: Mutex::new(prekeys),
            pre_key_store: Arc::new(MemoryPreKeyStore::new()),
            identity_key,
            sessions: DashMap::new(),
            active,
            rotation_task: Mutex::new(None),
        }
    }

    /// Keep pre-keys in `store` so their ids survive a restart
    pub fn with_pre_key_store(mut self, store: Arc<dyn PreKeyStore>) -> Self {
        self.pre_key_store = store;
        self
    }

    /// Load pre-keys, restore persisted sessions and start signed pre-key rotation.
    ///
    /// Returns the number of sessions restored.
    pub async fn initialize(self: &Arc<Self>, auto_restore: bool, enable_rotation: bool) -> Result<usize, SessionError> {
        self.restore_pre_keys().await?;
        let restored = if auto_restore { self.restore_sessions().await? } else { 0 };

        if enable_rotation {
            let period = self.config.session.rotation_interval().min(ROTATION_CHECK_PERIOD);
            let handle = spawn_rotation(Arc::downgrade(self), period);
            if let Some(previous) = self.rotation_task.lock().await.replace(handle) {
                previous.abort();
            }
        }

        info!("Session manager initialized, {} sessions restored", restored);
        Ok(restored)
    }

    /// Stop background work and close the store
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        if let Some(task) = self.rotation_task.lock().await.take() {
            task.abort();
        }
        self.store.close().await?;
        info!("Session manager shut down");
        Ok(())
    }

    /// Resume the stored pre-key registry, or store the fresh one
    pub async fn restore_pre_keys(&self) -> Result<(), SessionError> {
        let mut prekeys = self.prekeys.lock().await;
        if let Some(record) = self.pre_key_store.load().await? {
            match prekeys.resume(record) {
                Some(stored) => {
                    *prekeys = stored;
                    debug!("Restored pre-keys, signed pre-key id {}", prekeys.signed_pre_key().id);
                    return Ok(());
                }
                None => warn!("Stored pre-keys belong to another identity, replacing them"),
            }
        }
        self.pre_key_store.save(prekeys.record()).await?;
        Ok(())
    }

    /// Load every persisted session that is not already in memory
    pub async fn restore_sessions(&self) -> Result<usize, SessionError> {
        let mut restored = 0;
        for record in self.store.list_all().await? {
            let session = match Session::from_record(&record) {
                Ok(session) => session,
                Err(e) => {
                    warn!("Skipping unreadable session for {}: {}", record.peer_id, e);
                    continue;
                }
            };
            let slot = self.slot(&record.peer_id);
            let mut guard = slot.lock().await;
            if guard.is_none() {
                self.publish(&session);
                *guard = Some(session);
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Our Ed25519 identity key
    pub fn identity_key(&self) -> [u8; 32] {
        self.identity_key
    }

    /// Bundle to publish for peers that want to start a session with us
    pub async fn pre_key_bundle(&self) -> PreKeyBundle {
        self.prekeys.lock().await.bundle(&self.x3dh)
    }

    /// Returns the new signed pre-key id
    pub async fn rotate_signed_pre_key(&self) -> Result<u32, SessionError> {
        let mut prekeys = self.prekeys.lock().await;
        let mut next = prekeys.clone();
        let id = next.rotate_signed_pre_key();
        self.pre_key_store.save(next.record()).await?;
        *prekeys = next;
        Ok(id)
    }

    /// Rotate only when the current signed pre-key is older than the rotation interval
    pub async fn rotate_if_due(&self, now: u64) -> Result<Option<u32>, SessionError> {
        if !self.prekeys.lock().await.rotation_due(now) {
            return Ok(None);
        }
        self.rotate_signed_pre_key().await.map(Some)
    }

    /// Install a fresh session from an already agreed secret
    pub async fn create_session(
        &self,
        peer_id: &str,
        shared_secret: &[u8; 32],
        associated_data: &[u8],
        role: SessionRole,
    ) -> Result<SessionInfo, SessionError> {
        let session = self.new_session(peer_id, shared_secret, associated_data, role)?;
        let slot = self.slot(peer_id);
        let mut guard = slot.lock().await;
        self.commit(&mut guard, session).await
    }

    fn new_session(
        &self,
        peer_id: &str,
        shared_secret: &[u8; 32],
        associated_data: &[u8],
        role: SessionRole,
    ) -> Result<Session, SessionError> {
        let (is_initiator, state) = match role {
            SessionRole::Initiator { remote_signed_pre_key } => (
                true,
                self.engine
                    .initialize_as_initiator(shared_secret, associated_data, &remote_signed_pre_key)?,
            ),
            SessionRole::Responder { signed_pre_key } => (
                false,
                self.engine
                    .initialize_as_responder(shared_secret, associated_data, &signed_pre_key),
            ),
        };
        Ok(Session::new(peer_id, is_initiator, state))
    }

    /// Run X3DH against a peer's bundle and become the initiator
    pub async fn initiate_session(&self, peer_id: &str, bundle: &PreKeyBundle) -> Result<InitialMessage, SessionError> {
        let identity = self.prekeys.lock().await.identity().clone();
        let ephemeral = self.x3dh.generate_ephemeral();
        let result = self.x3dh.sender_x3dh(&identity, &ephemeral, bundle)?;

        let initial = InitialMessage {
            identity_key: identity.identity_key(),
            ephemeral_key: ephemeral.public,
            signed_pre_key_id: bundle.signed_pre_key_id,
            one_time_pre_key_id: bundle.one_time().map(|(id, _)| id),
        };

        let mut session = self.new_session(
            peer_id,
            result.shared_secret(),
            &result.associated_data,
            SessionRole::Initiator {
                remote_signed_pre_key: bundle.signed_pre_key,
            },
        )?;
        session.pending_initial = Some(initial.clone());
        session.remote_identity_key = Some(bundle.identity_key);

        let slot = self.slot(peer_id);
        let mut guard = slot.lock().await;
        self.commit(&mut guard, session).await?;
        info!("Initiated session with {}", peer_id);
        Ok(initial)
    }

    /// Answer a peer's handshake header and open the message that carried it.
    ///
    /// The responder session is built aside and only committed, and the
    /// one-time pre-key only consumed, once `message` authenticates against
    /// it; on any error an existing session for the peer is left as it was.
    /// The flag is `false` when the header was already accepted.
    pub async fn accept_session(
        &self,
        peer_id: &str,
        initial: &InitialMessage,
        message: &RatchetMessage,
    ) -> Result<(Vec<u8>, bool), SessionError> {
        let slot = self.slot(peer_id);
        let mut guard = slot.lock().await;
        if let Some(existing) = guard.as_ref() {
            if existing.remote_base_key == Some(initial.ephemeral_key) {
                debug!("Handshake from {} already accepted", peer_id);
                let (plaintext, next) = self.open(peer_id, existing, message)?;
                self.commit(&mut guard, next).await?;
                return Ok((plaintext, false));
            }
        }

        // Held until the one-time key is consumed so no two peers share it
        let mut prekeys = self.prekeys.lock().await;
        let signed_pre_key = prekeys
            .find_signed_pre_key(initial.signed_pre_key_id)
            .cloned()
            .ok_or(X3DHError::MissingKeyMaterial("signed pre-key"))?;
        let one_time_pre_key = match initial.one_time_pre_key_id {
            Some(id) => Some(
                prekeys
                    .find_one_time_pre_key(id)
                    .cloned()
                    .ok_or(X3DHError::MissingKeyMaterial("one-time pre-key"))?,
            ),
            None => None,
        };

        let result = self.x3dh.receiver_x3dh(
            prekeys.identity(),
            &signed_pre_key,
            one_time_pre_key.as_ref(),
            &initial.identity_key,
            &initial.ephemeral_key,
        )?;

        let mut candidate = self.new_session(
            peer_id,
            result.shared_secret(),
            &result.associated_data,
            SessionRole::Responder {
                signed_pre_key: signed_pre_key.keypair().clone(),
            },
        )?;
        candidate.remote_identity_key = Some(initial.identity_key);
        candidate.remote_base_key = Some(initial.ephemeral_key);

        let (plaintext, session) = self.open(peer_id, &candidate, message)?;
        self.commit(&mut guard, session).await?;

        if let Some(id) = initial.one_time_pre_key_id {
            prekeys.take_one_time_pre_key(id);
            if let Err(e) = self.pre_key_store.save(prekeys.record()).await {
                warn!("One-time pre-key {} consumed but not persisted: {}", id, e);
            }
        }
        info!("Accepted session from {}", peer_id);
        Ok((plaintext, true))
    }

    /// True when an active session exists for the peer
    pub fn has_session(&self, peer_id: &str) -> bool {
        self.active.borrow().contains_key(peer_id)
    }

    pub fn get_session_info(&self, peer_id: &str) -> Option<SessionInfo> {
        self.active.borrow().get(peer_id).cloned()
    }

    /// Observable snapshot of every active session
    pub fn active_sessions(&self) -> watch::Receiver<BTreeMap<String, SessionInfo>> {
        self.active.subscribe()
    }

    /// Handshake header still to be attached to messages for this peer
    pub async fn pending_initial_message(&self, peer_id: &str) -> Option<InitialMessage> {
        let slot = self.existing_slot(peer_id)?;
        let guard = slot.lock().await;
        guard.as_ref().and_then(|s| s.pending_initial.clone())
    }

    pub async fn encrypt(&self, peer_id: &str, plaintext: &[u8]) -> Result<RatchetMessage, SessionError> {
        let slot = self
            .existing_slot(peer_id)
            .ok_or_else(|| SessionError::NoSession(peer_id.to_string()))?;
        let mut guard = slot.lock().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| SessionError::NoSession(peer_id.to_string()))?;

        let (message, state) = self.engine.encrypt(&session.state, plaintext)?;
        let mut next = session.clone();
        next.state = state;
        next.send_message_number += 1;
        next.last_activity_at = now_ms();

        self.commit(&mut guard, next).await?;
        Ok(message)
    }

    pub async fn decrypt(&self, peer_id: &str, message: &RatchetMessage) -> Result<Vec<u8>, SessionError> {
        self.decrypt_with(peer_id, message, Ok).await
    }

    /// Decrypt and require UTF-8; invalid text leaves the session untouched
    pub async fn decrypt_to_string(&self, peer_id: &str, message: &RatchetMessage) -> Result<String, SessionError> {
        self.decrypt_with(peer_id, message, |bytes| {
            String::from_utf8(bytes).map_err(|_| SessionError::InvalidUtf8)
        })
        .await
    }

    async fn decrypt_with<T>(
        &self,
        peer_id: &str,
        message: &RatchetMessage,
        accept: impl FnOnce(Vec<u8>) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let slot = self
            .existing_slot(peer_id)
            .ok_or_else(|| SessionError::NoSession(peer_id.to_string()))?;
        let mut guard = slot.lock().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| SessionError::NoSession(peer_id.to_string()))?;

        let (plaintext, next) = self.open(peer_id, session, message)?;
        let output = accept(plaintext)?;
        self.commit(&mut guard, next).await?;
        Ok(output)
    }

    /// Decrypt against `session` and return its successor, uncommitted
    fn open(&self, peer_id: &str, session: &Session, message: &RatchetMessage) -> Result<(Vec<u8>, Session), SessionError> {
        let (plaintext, state) = self.engine.decrypt(&session.state, message).map_err(|e| {
            if e.is_security_event() {
                warn!("Rejected message from {}: {}", peer_id, e);
            }
            SessionError::from(e)
        })?;

        let mut next = session.clone();
        next.state = state;
        next.receive_message_number += 1;
        next.last_activity_at = now_ms();
        // Any reply proves the responder holds the session
        next.pending_initial = None;
        Ok((plaintext, next))
    }

    /// Purge all key material for the peer from storage and memory
    pub async fn delete_session(&self, peer_id: &str) -> Result<bool, SessionError> {
        let slot = self.slot(peer_id);
        let mut guard = slot.lock().await;
        // Also covers sessions that were never loaded into memory
        let stored = self.store.get(peer_id).await?.is_some();
        self.store.delete(peer_id).await?;
        let existed = guard.take().is_some() || stored;
        self.active.send_modify(|sessions| {
            sessions.remove(peer_id);
        });
        info!("Deleted session with {}", peer_id);
        Ok(existed)
    }

    /// Persist, then swap the new session in
    async fn commit(&self, slot: &mut Option<Session>, session: Session) -> Result<SessionInfo, SessionError> {
        let record = session.to_record()?;
        self.store.put(&record).await?;
        let info = self.publish(&session);
        *slot = Some(session);
        Ok(info)
    }

    fn publish(&self, session: &Session) -> SessionInfo {
        let info = session.info();
        let snapshot = info.clone();
        self.active.send_modify(|sessions| {
            sessions.insert(snapshot.peer_id.clone(), snapshot);
        });
        info
    }

    fn slot(&self, peer_id: &str) -> SessionSlot {
        self.sessions
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone()
    }

    fn existing_slot(&self, peer_id: &str) -> Option<SessionSlot> {
        self.sessions.get(peer_id).map(|slot| slot.value().clone())
    }
}

fn spawn_rotation(manager: Weak<SessionManager>, period: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let Some(manager) = manager.upgrade() else {
                break;
            };
            if let Err(e) = manager.rotate_if_due(now_ms()).await {
                warn!("Signed pre-key rotation failed: {}", e);
            }
        }
    })
}
