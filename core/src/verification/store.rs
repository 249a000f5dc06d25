//! Persisted trust decisions per peer

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::storage::{JsonDirectory, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub peer_id: String,
    /// Identity key pinned on first use
    #[serde(with = "crate::util::serde_hex::bytes32")]
    pub identity_key: [u8; 32],
    pub verified: bool,
    pub verified_at: Option<u64>,
    pub first_seen_at: u64,
}

#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn get(&self, peer_id: &str) -> Result<Option<TrustRecord>, StoreError>;
    async fn put(&self, record: &TrustRecord) -> Result<(), StoreError>;
    async fn delete(&self, peer_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    records: RwLock<HashMap<String, TrustRecord>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn get(&self, peer_id: &str) -> Result<Option<TrustRecord>, StoreError> {
        Ok(self.records.read().await.get(peer_id).cloned())
    }

    async fn put(&self, record: &TrustRecord) -> Result<(), StoreError> {
        self.records.write().await.insert(record.peer_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, peer_id: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(peer_id);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FileTrustStore {
    dir: JsonDirectory,
}

impl FileTrustStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self {
            dir: JsonDirectory::open(path).await?,
        })
    }
}

#[async_trait]
impl TrustStore for FileTrustStore {
    async fn get(&self, peer_id: &str) -> Result<Option<TrustRecord>, StoreError> {
        self.dir.read(peer_id).await
    }

    async fn put(&self, record: &TrustRecord) -> Result<(), StoreError> {
        self.dir.write(&record.peer_id, record).await
    }

    async fn delete(&self, peer_id: &str) -> Result<(), StoreError> {
        self.dir.remove(peer_id).await.map(|_| ())
    }
}
