//! Integration tests for the session manager

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::CoreConfig;
use crate::crypto::keys::IdentityKeyPair;
use crate::crypto::provider::{CryptoProvider, DefaultCryptoProvider};
use crate::crypto::ratchet::{RatchetError, RatchetPhase};
use crate::crypto::x3dh::X3DHError;
use crate::session::manager::{SessionError, SessionManager, SessionRole};
use crate::session::store::{
    FilePreKeyStore, FileSessionStore, MemorySessionStore, PreKeyStore, SessionRecord, SessionStore,
};
use crate::storage::StoreError;
use crate::util::now_ms;

fn manager_with(identity: IdentityKeyPair, store: Arc<dyn SessionStore>, config: CoreConfig) -> Arc<SessionManager> {
    Arc::new(SessionManager::new(identity, Arc::new(DefaultCryptoProvider), store, config))
}

fn manager() -> Arc<SessionManager> {
    manager_with(IdentityKeyPair::generate(), Arc::new(MemorySessionStore::new()), CoreConfig::default())
}

/// Handshake carried by Alice's first message
async fn establish(alice: &SessionManager, bob: &SessionManager) {
    let bundle = bob.pre_key_bundle().await;
    let initial = alice.initiate_session("bob", &bundle).await.unwrap();
    let first = alice.encrypt("bob", b"hello").await.unwrap();
    assert_eq!(bob.accept_session("alice", &initial, &first).await.unwrap(), (b"hello".to_vec(), true));
}

/// Bob with pre-keys and sessions kept under `dir`
async fn bob_at(dir: &std::path::Path, identity: IdentityKeyPair) -> Arc<SessionManager> {
    let sessions: Arc<dyn SessionStore> = Arc::new(FileSessionStore::open(dir.join("sessions")).await.unwrap());
    let prekeys: Arc<dyn PreKeyStore> = Arc::new(FilePreKeyStore::open(dir.join("prekeys")).await.unwrap());
    let bob = Arc::new(
        SessionManager::new(identity, Arc::new(DefaultCryptoProvider), sessions, CoreConfig::default())
            .with_pre_key_store(prekeys),
    );
    bob.initialize(true, false).await.unwrap();
    bob
}

/// Store whose writes can be made to fail
#[derive(Default)]
struct FlakyStore {
    inner: MemorySessionStore,
    fail_puts: AtomicBool,
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn get(&self, peer_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.inner.get(peer_id).await
    }

    async fn put(&self, record: &SessionRecord) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Io("disk full".into()));
        }
        self.inner.put(record).await
    }

    async fn delete(&self, peer_id: &str) -> Result<(), StoreError> {
        self.inner.delete(peer_id).await
    }

    async fn list_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.inner.list_all().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_hello_scenario() {
    let alice = manager();
    let bob = manager();
    establish(&alice, &bob).await;

    let msg = alice.encrypt("bob", "Hello, Bob!".as_bytes()).await.unwrap();
    assert_eq!(bob.decrypt_to_string("alice", &msg).await.unwrap(), "Hello, Bob!");

    let reply = bob.encrypt("alice", "Hi, Alice!".as_bytes()).await.unwrap();
    assert_eq!(alice.decrypt_to_string("bob", &reply).await.unwrap(), "Hi, Alice!");

    assert_eq!(alice.get_session_info("bob").unwrap().phase, RatchetPhase::Established);
    assert_eq!(bob.get_session_info("alice").unwrap().phase, RatchetPhase::Established);
}

#[tokio::test]
async fn test_session_accounting() {
    let alice = manager();
    let bob = manager();
    establish(&alice, &bob).await;

    let mut messages = Vec::new();
    for i in 0..4 {
        messages.push(alice.encrypt("bob", format!("m{}", i).as_bytes()).await.unwrap());
    }
    assert_eq!(alice.get_session_info("bob").unwrap().send_message_number, 5);
    assert_eq!(bob.get_session_info("alice").unwrap().receive_message_number, 1);

    for msg in &messages {
        bob.decrypt("alice", msg).await.unwrap();
    }
    let info = bob.get_session_info("alice").unwrap();
    assert_eq!(info.receive_message_number, 5);
    assert_eq!(info.send_message_number, 0);
    assert!(!info.is_initiator);
}

#[tokio::test]
async fn test_identity_keys_and_associated_data_agree() {
    let alice = manager();
    let bob = manager();
    establish(&alice, &bob).await;

    let a = alice.get_session_info("bob").unwrap();
    let b = bob.get_session_info("alice").unwrap();
    assert_eq!(a.remote_identity_key, Some(bob.identity_key()));
    assert_eq!(b.remote_identity_key, Some(alice.identity_key()));
    assert_eq!(a.associated_data, b.associated_data);
}

#[tokio::test]
async fn test_responder_waits_for_first_message() {
    let bob = manager();
    let signed_pre_key = DefaultCryptoProvider.generate_keypair();
    bob.create_session("alice", &[7u8; 32], b"ad", SessionRole::Responder { signed_pre_key })
        .await
        .unwrap();

    assert_eq!(
        bob.encrypt("alice", b"too early").await.unwrap_err(),
        SessionError::Ratchet(RatchetError::AwaitingFirstMessage)
    );
}

#[tokio::test]
async fn test_pending_initial_cleared_by_reply() {
    let alice = manager();
    let bob = manager();
    establish(&alice, &bob).await;

    assert!(alice.pending_initial_message("bob").await.is_some());
    assert!(bob.pending_initial_message("alice").await.is_none());

    let msg = alice.encrypt("bob", b"ping").await.unwrap();
    bob.decrypt("alice", &msg).await.unwrap();
    let reply = bob.encrypt("alice", b"pong").await.unwrap();
    alice.decrypt("bob", &reply).await.unwrap();

    assert!(alice.pending_initial_message("bob").await.is_none());
}

#[tokio::test]
async fn test_repeated_handshake_is_noop() {
    let alice = manager();
    let bob = manager();
    let bundle = bob.pre_key_bundle().await;
    let initial = alice.initiate_session("bob", &bundle).await.unwrap();
    let first = alice.encrypt("bob", b"first").await.unwrap();
    let second = alice.encrypt("bob", b"second").await.unwrap();
    assert_eq!(bob.accept_session("alice", &initial, &first).await.unwrap(), (b"first".to_vec(), true));

    // Header arrives again with a later message
    assert_eq!(bob.accept_session("alice", &initial, &second).await.unwrap(), (b"second".to_vec(), false));
    assert_eq!(bob.get_session_info("alice").unwrap().receive_message_number, 2);
}

#[tokio::test]
async fn test_one_time_pre_key_consumed_once() {
    let alice = manager();
    let carol = manager();
    let bob = manager();

    let bundle = bob.pre_key_bundle().await;
    assert!(bundle.one_time_pre_key_id.is_some());

    let from_alice = alice.initiate_session("bob", &bundle).await.unwrap();
    let from_carol = carol.initiate_session("bob", &bundle).await.unwrap();
    let alice_first = alice.encrypt("bob", b"a").await.unwrap();
    let carol_first = carol.encrypt("bob", b"c").await.unwrap();

    bob.accept_session("alice", &from_alice, &alice_first).await.unwrap();
    assert_eq!(
        bob.accept_session("carol", &from_carol, &carol_first).await.unwrap_err(),
        SessionError::X3DH(X3DHError::MissingKeyMaterial("one-time pre-key"))
    );
    assert!(!bob.has_session("carol"));

    // The next bundle offers a different key
    assert_ne!(bob.pre_key_bundle().await.one_time_pre_key_id, bundle.one_time_pre_key_id);
}

#[tokio::test]
async fn test_tamper_and_replay_leave_state_unchanged() {
    let alice = manager();
    let bob = manager();
    establish(&alice, &bob).await;

    let msg = alice.encrypt("bob", b"genuine").await.unwrap();
    let mut tampered = msg.clone();
    tampered.ciphertext[0] ^= 0x01;

    assert_eq!(
        bob.decrypt("alice", &tampered).await.unwrap_err(),
        SessionError::Ratchet(RatchetError::AuthenticationFailed)
    );
    assert_eq!(bob.get_session_info("alice").unwrap().receive_message_number, 1);

    assert_eq!(bob.decrypt("alice", &msg).await.unwrap(), b"genuine");
    assert!(matches!(
        bob.decrypt("alice", &msg).await.unwrap_err(),
        SessionError::Ratchet(RatchetError::Replay { message_number: 1 })
    ));
    assert_eq!(bob.get_session_info("alice").unwrap().receive_message_number, 2);
}

#[tokio::test]
async fn test_forged_handshake_leaves_session_intact() {
    let alice = manager();
    let bob = manager();
    establish(&alice, &bob).await;
    let offered = bob.pre_key_bundle().await.one_time_pre_key_id;

    // Mallory claims to be alice with her own identity and a bad ciphertext
    let mallory = manager();
    let forged_initial = mallory.initiate_session("bob", &bob.pre_key_bundle().await).await.unwrap();
    let mut forged = mallory.encrypt("bob", b"trust me").await.unwrap();
    forged.ciphertext[0] ^= 0x01;

    assert_eq!(
        bob.accept_session("alice", &forged_initial, &forged).await.unwrap_err(),
        SessionError::Ratchet(RatchetError::AuthenticationFailed)
    );
    let info = bob.get_session_info("alice").unwrap();
    assert_eq!(info.remote_identity_key, Some(alice.identity_key()));
    assert_eq!(info.receive_message_number, 1);
    assert_eq!(bob.pre_key_bundle().await.one_time_pre_key_id, offered);

    let msg = alice.encrypt("bob", b"still me").await.unwrap();
    assert_eq!(bob.decrypt("alice", &msg).await.unwrap(), b"still me");
}

#[tokio::test]
async fn test_failed_first_message_creates_no_session() {
    let alice = manager();
    let bob = manager();
    let bundle = bob.pre_key_bundle().await;
    let initial = alice.initiate_session("bob", &bundle).await.unwrap();
    let first = alice.encrypt("bob", b"hello").await.unwrap();
    let mut tampered = first.clone();
    tampered.auth_tag[0] ^= 0x01;

    assert!(bob.accept_session("alice", &initial, &tampered).await.is_err());
    assert!(!bob.has_session("alice"));
    assert_eq!(bob.pre_key_bundle().await.one_time_pre_key_id, bundle.one_time_pre_key_id);

    // The genuine message still opens the session with the same one-time key
    assert_eq!(bob.accept_session("alice", &initial, &first).await.unwrap(), (b"hello".to_vec(), true));
}

#[tokio::test]
async fn test_no_session_errors() {
    let alice = manager();
    assert!(!alice.has_session("nobody"));
    assert_eq!(
        alice.encrypt("nobody", b"x").await.unwrap_err(),
        SessionError::NoSession("nobody".into())
    );
    assert!(alice.get_session_info("nobody").is_none());
    assert!(!alice.delete_session("nobody").await.unwrap());
}

#[tokio::test]
async fn test_invalid_utf8_does_not_consume_message() {
    let alice = manager();
    let bob = manager();
    establish(&alice, &bob).await;

    let msg = alice.encrypt("bob", &[0xff, 0xfe, 0xfd]).await.unwrap();
    assert_eq!(bob.decrypt_to_string("alice", &msg).await.unwrap_err(), SessionError::InvalidUtf8);
    assert_eq!(bob.decrypt("alice", &msg).await.unwrap(), vec![0xff, 0xfe, 0xfd]);
}

#[tokio::test]
async fn test_persistence_failure_keeps_message_redeliverable() {
    let alice = manager();
    let store = Arc::new(FlakyStore::default());
    let bob = manager_with(IdentityKeyPair::generate(), store.clone(), CoreConfig::default());
    establish(&alice, &bob).await;

    let msg = alice.encrypt("bob", b"must survive").await.unwrap();

    store.fail_puts.store(true, Ordering::SeqCst);
    assert!(matches!(
        bob.decrypt("alice", &msg).await.unwrap_err(),
        SessionError::Storage(StoreError::Io(_))
    ));
    assert_eq!(bob.get_session_info("alice").unwrap().receive_message_number, 1);

    store.fail_puts.store(false, Ordering::SeqCst);
    assert_eq!(bob.decrypt("alice", &msg).await.unwrap(), b"must survive");
}

#[tokio::test]
async fn test_sessions_restored_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let alice_identity = IdentityKeyPair::generate();
    let bob = manager();

    let first_store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::open(dir.path()).await.unwrap());
    let alice = manager_with(alice_identity.clone(), first_store, CoreConfig::default());
    establish(&alice, &bob).await;
    let msg = alice.encrypt("bob", b"before restart").await.unwrap();
    bob.decrypt("alice", &msg).await.unwrap();
    alice.shutdown().await.unwrap();
    drop(alice);

    let second_store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::open(dir.path()).await.unwrap());
    let alice = manager_with(alice_identity, second_store, CoreConfig::default());
    assert!(!alice.has_session("bob"));
    assert_eq!(alice.initialize(true, false).await.unwrap(), 1);

    let info = alice.get_session_info("bob").unwrap();
    assert_eq!(info.send_message_number, 2);

    let msg = alice.encrypt("bob", b"after restart").await.unwrap();
    assert_eq!(bob.decrypt("alice", &msg).await.unwrap(), b"after restart");
}

#[tokio::test]
async fn test_delete_session_purges_store() {
    let store = Arc::new(MemorySessionStore::new());
    let alice = manager_with(IdentityKeyPair::generate(), store.clone(), CoreConfig::default());
    let bob = manager();
    establish(&alice, &bob).await;

    assert!(store.get("bob").await.unwrap().is_some());
    assert!(alice.delete_session("bob").await.unwrap());
    assert!(store.get("bob").await.unwrap().is_none());
    assert!(!alice.has_session("bob"));
    assert!(matches!(
        alice.encrypt("bob", b"x").await.unwrap_err(),
        SessionError::NoSession(_)
    ));
}

#[tokio::test]
async fn test_delete_session_not_yet_restored() {
    let store = Arc::new(MemorySessionStore::new());
    let identity = IdentityKeyPair::generate();
    let alice = manager_with(identity.clone(), store.clone(), CoreConfig::default());
    let bob = manager();
    establish(&alice, &bob).await;

    let restarted = manager_with(identity, store.clone(), CoreConfig::default());
    restarted.initialize(false, false).await.unwrap();
    assert!(!restarted.has_session("bob"));

    assert!(restarted.delete_session("bob").await.unwrap());
    assert!(store.get("bob").await.unwrap().is_none());
    assert_eq!(restarted.restore_sessions().await.unwrap(), 0);
}

#[tokio::test]
async fn test_active_sessions_snapshot() {
    let alice = manager();
    let bob = manager();
    let mut active = alice.active_sessions();
    assert!(active.borrow().is_empty());

    establish(&alice, &bob).await;
    assert!(active.has_changed().unwrap());
    assert!(active.borrow_and_update().contains_key("bob"));

    alice.delete_session("bob").await.unwrap();
    assert!(active.borrow().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_encrypts_are_serialized() {
    let alice = manager();
    let bob = manager();
    establish(&alice, &bob).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let alice = alice.clone();
        handles.push(tokio::spawn(async move {
            alice.encrypt("bob", format!("m{}", i).as_bytes()).await.unwrap()
        }));
    }
    let mut messages = Vec::new();
    for handle in handles {
        messages.push(handle.await.unwrap());
    }

    // Number 0 went out with the handshake
    let mut numbers: Vec<u32> = messages.iter().map(|m| m.message_number).collect();
    numbers.sort_unstable();
    assert_eq!(numbers, (1..21).collect::<Vec<_>>());
    assert_eq!(alice.get_session_info("bob").unwrap().send_message_number, 21);

    for msg in &messages {
        bob.decrypt("alice", msg).await.unwrap();
    }
}

#[tokio::test]
async fn test_rotation_task_rotates_signed_pre_key() {
    let mut config = CoreConfig::default();
    config.session.rotation_interval_ms = 100;
    let bob = manager_with(IdentityKeyPair::generate(), Arc::new(MemorySessionStore::new()), config);
    assert_eq!(bob.pre_key_bundle().await.signed_pre_key_id, 1);
    bob.initialize(false, true).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let bundle = bob.pre_key_bundle().await;
    assert!(bundle.signed_pre_key_id > 1);
    assert!(bundle.verify());

    bob.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rotate_only_when_due() {
    let bob = manager();
    let interval = CoreConfig::default().session.rotation_interval_ms;

    assert_eq!(bob.rotate_if_due(now_ms()).await.unwrap(), None);
    assert_eq!(bob.pre_key_bundle().await.signed_pre_key_id, 1);
    assert_eq!(bob.rotate_if_due(now_ms() + interval).await.unwrap(), Some(2));
    assert_eq!(bob.rotate_if_due(now_ms()).await.unwrap(), None);
}

#[tokio::test]
async fn test_handshake_with_rotated_signed_pre_key() {
    let alice = manager();
    let bob = manager();

    let stale_bundle = bob.pre_key_bundle().await;
    assert_eq!(bob.rotate_signed_pre_key().await.unwrap(), 2);

    let initial = alice.initiate_session("bob", &stale_bundle).await.unwrap();
    let msg = alice.encrypt("bob", b"late").await.unwrap();
    assert_eq!(bob.accept_session("alice", &initial, &msg).await.unwrap(), (b"late".to_vec(), true));
}

#[tokio::test]
async fn test_pre_keys_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let identity = IdentityKeyPair::generate();

    let bob = bob_at(dir.path(), identity.clone()).await;
    let used = bob.pre_key_bundle().await;
    let alice = manager();
    establish(&alice, &bob).await;
    let unused = bob.pre_key_bundle().await;
    assert_eq!(bob.rotate_signed_pre_key().await.unwrap(), 2);
    bob.shutdown().await.unwrap();
    drop(bob);

    let bob = bob_at(dir.path(), identity).await;
    assert_eq!(bob.pre_key_bundle().await.signed_pre_key_id, 2);

    // A bundle fetched before the restart still works
    let carol = manager();
    let initial = carol.initiate_session("bob", &unused).await.unwrap();
    let msg = carol.encrypt("bob", b"from carol").await.unwrap();
    assert_eq!(bob.accept_session("carol", &initial, &msg).await.unwrap().0, b"from carol");

    // A one-time key consumed before the restart stays consumed
    let dave = manager();
    let initial = dave.initiate_session("bob", &used).await.unwrap();
    let msg = dave.encrypt("bob", b"from dave").await.unwrap();
    assert_eq!(
        bob.accept_session("dave", &initial, &msg).await.unwrap_err(),
        SessionError::X3DH(X3DHError::MissingKeyMaterial("one-time pre-key"))
    );

    // Ids keep counting
    assert_eq!(bob.rotate_signed_pre_key().await.unwrap(), 3);
}
