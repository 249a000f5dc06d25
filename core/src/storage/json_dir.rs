//! One JSON document per key inside a directory.
//!
//! Writes go to a temporary file that is fsynced and then renamed over the
//! target, so a crash leaves either the old record or the new one. The
//! directory itself is fsynced after a rename or removal so the change to
//! its entries is durable too.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::StoreError;

const EXTENSION: &str = "json";
/// Longest hex-encoded key used as a file name as is
const MAX_HEX_NAME: usize = 200;

#[derive(Debug)]
pub struct JsonDirectory {
    root: PathBuf,
    closed: AtomicBool,
}

impl JsonDirectory {
    /// Open (creating if needed) the directory at `root`
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", file_stem(key), EXTENSION))
    }

    #[cfg(unix)]
    async fn sync_dir(&self) -> Result<(), StoreError> {
        tokio::fs::File::open(&self.root).await?.sync_all().await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn sync_dir(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.ensure_open()?;
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", key, e)))
    }

    pub async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.ensure_open()?;
        let content = serde_json::to_vec_pretty(value)?;
        let path = self.path_for(key);
        let tmp_path = self.root.join(format!(".{}.tmp", file_stem(key)));

        {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&content).await?;
            file.sync_all().await?;
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        self.sync_dir().await
    }

    /// Returns whether a record was removed
    pub async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => self.sync_dir().await.map(|_| true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every decodable record; unreadable ones are logged and skipped
    pub async fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>, StoreError> {
        self.ensure_open()?;
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }

    /// Further calls fail with [`StoreError::Closed`]
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Keys are hex encoded so any peer id is a safe file name; keys too long
/// for a file name are hashed instead
fn file_stem(key: &str) -> String {
    let encoded = hex::encode(key.as_bytes());
    if encoded.len() <= MAX_HEX_NAME {
        return encoded;
    }
    format!("sha256-{}", hex::encode(Sha256::digest(key.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirectory::open(dir.path().join("records")).await.unwrap();

        let record = Record { name: "a/b:c".into(), count: 3 };
        store.write("a/b:c", &record).await.unwrap();
        assert_eq!(store.read::<Record>("a/b:c").await.unwrap(), Some(record));

        assert!(store.remove("a/b:c").await.unwrap());
        assert!(!store.remove("a/b:c").await.unwrap());
        assert_eq!(store.read::<Record>("a/b:c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirectory::open(dir.path()).await.unwrap();

        for count in 0..3 {
            store.write("peer", &Record { name: "peer".into(), count }).await.unwrap();
        }
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json"));
        assert_eq!(store.read::<Record>("peer").await.unwrap().unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_read_all_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirectory::open(dir.path()).await.unwrap();
        store.write("one", &Record { name: "one".into(), count: 1 }).await.unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let all: Vec<Record> = store.read_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirectory::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join(format!("{}.json", hex::encode("bad"))), b"[]").unwrap();

        assert!(matches!(store.read::<Record>("bad").await, Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_long_keys_fit_in_a_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirectory::open(dir.path()).await.unwrap();
        let long = "p".repeat(300);
        let longer = "p".repeat(301);

        store.write(&long, &Record { name: long.clone(), count: 1 }).await.unwrap();
        store.write(&longer, &Record { name: longer.clone(), count: 2 }).await.unwrap();
        assert_eq!(store.read::<Record>(&long).await.unwrap().unwrap().count, 1);
        assert_eq!(store.read::<Record>(&longer).await.unwrap().unwrap().count, 2);

        for entry in std::fs::read_dir(dir.path()).unwrap() {
            assert!(entry.unwrap().file_name().len() <= 255);
        }
        assert_eq!(store.read_all::<Record>().await.unwrap().len(), 2);
        assert!(store.remove(&long).await.unwrap());
        assert_eq!(store.read::<Record>(&long).await.unwrap(), None);
    }

    #[test]
    fn test_short_keys_stay_hex() {
        assert_eq!(file_stem("bob"), hex::encode("bob"));
        assert_eq!(file_stem(&"x".repeat(100)).len(), 200);
        assert!(file_stem(&"x".repeat(101)).starts_with("sha256-"));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirectory::open(dir.path()).await.unwrap();
        store.close();
        assert_eq!(store.read::<Record>("x").await.unwrap_err(), StoreError::Closed);
    }
}
