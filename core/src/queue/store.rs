//! Queue persistence, one record per entry

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::queue::entry::OfflineQueueEntry;
use crate::storage::{JsonDirectory, StoreError};

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn put(&self, entry: &OfflineQueueEntry) -> Result<(), StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn load_all(&self) -> Result<Vec<OfflineQueueEntry>, StoreError>;
    async fn close(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    entries: RwLock<HashMap<String, OfflineQueueEntry>>,
    closed: AtomicBool,
}

impl MemoryQueueStore {
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
impl QueueStore for MemoryQueueStore {
    async fn put(&self, entry: &OfflineQueueEntry) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.entries.write().await.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.entries.write().await.remove(id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<OfflineQueueEntry>, StoreError> {
        self.ensure_open()?;
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FileQueueStore {
    dir: JsonDirectory,
}

impl FileQueueStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self {
            dir: JsonDirectory::open(path).await?,
        })
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn put(&self, entry: &OfflineQueueEntry) -> Result<(), StoreError> {
        self.dir.write(&entry.id, entry).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.dir.remove(id).await.map(|_| ())
    }

    async fn load_all(&self) -> Result<Vec<OfflineQueueEntry>, StoreError> {
        self.dir.read_all().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.dir.close();
        Ok(())
    }
}
