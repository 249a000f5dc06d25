//! Session and pre-key persistence
//!
//! The manager only needs get/put/delete/list-all keyed by peer id, plus a
//! single slot for its pre-keys; the storage engine underneath is pluggable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::session::prekeys::PreKeyRecord;
use crate::storage::{JsonDirectory, StoreError};

const PRE_KEY_RECORD: &str = "prekeys";

/// One persisted session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub peer_id: String,
    /// Serialized session state
    #[serde(with = "crate::util::serde_hex")]
    pub state: Vec<u8>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, peer_id: &str) -> Result<Option<SessionRecord>, StoreError>;
    /// Must be durable when it returns
    async fn put(&self, record: &SessionRecord) -> Result<(), StoreError>;
    async fn delete(&self, peer_id: &str) -> Result<(), StoreError>;
    async fn list_all(&self) -> Result<Vec<SessionRecord>, StoreError>;
    async fn close(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, SessionRecord>>,
    closed: AtomicBool,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, peer_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.ensure_open()?;
        Ok(self.records.read().await.get(peer_id).cloned())
    }

    async fn put(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.records.write().await.insert(record.peer_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, peer_id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.records.write().await.remove(peer_id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.ensure_open()?;
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// One JSON file per peer
#[derive(Debug)]
pub struct FileSessionStore {
    dir: JsonDirectory,
}

impl FileSessionStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self {
            dir: JsonDirectory::open(path).await?,
        })
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, peer_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.dir.read(peer_id).await
    }

    async fn put(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.dir.write(&record.peer_id, record).await
    }

    async fn delete(&self, peer_id: &str) -> Result<(), StoreError> {
        self.dir.remove(peer_id).await.map(|_| ())
    }

    async fn list_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.dir.read_all().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.dir.close();
        Ok(())
    }
}

/// Holds the local pre-key registry
#[async_trait]
pub trait PreKeyStore: Send + Sync {
    async fn load(&self) -> Result<Option<PreKeyRecord>, StoreError>;
    /// Must be durable when it returns
    async fn save(&self, record: &PreKeyRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryPreKeyStore {
    record: RwLock<Option<PreKeyRecord>>,
}

impl MemoryPreKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreKeyStore for MemoryPreKeyStore {
    async fn load(&self) -> Result<Option<PreKeyRecord>, StoreError> {
        Ok(self.record.read().await.clone())
    }

    async fn save(&self, record: &PreKeyRecord) -> Result<(), StoreError> {
        *self.record.write().await = Some(record.clone());
        Ok(())
    }
}

/// Pre-keys in their own directory, apart from the session records
#[derive(Debug)]
pub struct FilePreKeyStore {
    dir: JsonDirectory,
}

impl FilePreKeyStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self {
            dir: JsonDirectory::open(path).await?,
        })
    }
}

#[async_trait]
impl PreKeyStore for FilePreKeyStore {
    async fn load(&self) -> Result<Option<PreKeyRecord>, StoreError> {
        self.dir.read(PRE_KEY_RECORD).await
    }

    async fn save(&self, record: &PreKeyRecord) -> Result<(), StoreError> {
        self.dir.write(PRE_KEY_RECORD, record).await
    }
}
