//! Durable outbound queue with priority, TTL and table-driven retry
//!
//! Every mutation is written to the store before it becomes visible in
//! memory. Entries are grouped per peer, each group behind its own lock, so
//! storage I/O for one peer never waits on another. Time-dependent
//! operations have an `*_at(now)` form so sweeps and tests can supply the
//! clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::queue::entry::{retry_delay, MessagePriority, OfflineQueueEntry, QueueStatus};
use crate::queue::store::QueueStore;
use crate::storage::StoreError;
use crate::util::{now_ms, random_id};

/// Queue errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue for {peer_id} is full ({limit} entries)")]
    QueueFull { peer_id: String, limit: usize },
    #[error("Entry {0} expired")]
    Expired(String),
    #[error("Entry {0} not found")]
    NotFound(String),
    #[error("Entry {id} is already {status:?}")]
    AlreadyFinal { id: String, status: QueueStatus },
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Optional enqueue parameters
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: MessagePriority,
    pub require_ack: bool,
    /// Defaults to the configured TTL
    pub expires_in_ms: Option<u64>,
    /// Defaults to the configured retry budget
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    pub total: usize,
    pub pending: usize,
    pub retrying: usize,
    pub sent: usize,
    pub failed: usize,
    pub expired: usize,
    pub by_peer: BTreeMap<String, usize>,
}

/// One peer's entries keyed by id
type PeerEntries = Arc<Mutex<HashMap<String, OfflineQueueEntry>>>;

pub struct OfflineMessageQueue {
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    peers: DashMap<String, PeerEntries>,
    /// Entry id to peer id
    owners: DashMap<String, String>,
    sequence: AtomicU64,
}

impl OfflineMessageQueue {
    /// Load persisted entries from `store`
    pub async fn open(store: Arc<dyn QueueStore>, config: QueueConfig) -> Result<Self, QueueError> {
        let loaded = store.load_all().await?;
        let next_sequence = loaded.iter().map(|e| e.sequence + 1).max().unwrap_or(0);
        info!("Offline queue opened with {} entries", loaded.len());

        let mut grouped: HashMap<String, HashMap<String, OfflineQueueEntry>> = HashMap::new();
        let owners = DashMap::new();
        for entry in loaded {
            owners.insert(entry.id.clone(), entry.peer_id.clone());
            grouped.entry(entry.peer_id.clone()).or_default().insert(entry.id.clone(), entry);
        }
        let peers = grouped
            .into_iter()
            .map(|(peer_id, entries)| (peer_id, Arc::new(Mutex::new(entries))))
            .collect();

        Ok(Self {
            store,
            config,
            peers,
            owners,
            sequence: AtomicU64::new(next_sequence),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn enqueue(
        &self,
        peer_id: &str,
        message_type: &str,
        payload: Vec<u8>,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        self.enqueue_at(peer_id, message_type, payload, options, now_ms()).await
    }

    pub async fn enqueue_at(
        &self,
        peer_id: &str,
        message_type: &str,
        payload: Vec<u8>,
        options: EnqueueOptions,
        now: u64,
    ) -> Result<String, QueueError> {
        let ttl = options.expires_in_ms.unwrap_or(self.config.default_ttl_ms);
        let id = random_id();
        if ttl == 0 {
            return Err(QueueError::Expired(id));
        }

        let peer = self.peer(peer_id);
        let mut entries = peer.lock().await;
        let queued = entries.values().filter(|e| !e.status.is_terminal()).count();
        if queued >= self.config.max_per_peer {
            warn!("Offline queue for {} is full", peer_id);
            return Err(QueueError::QueueFull {
                peer_id: peer_id.to_string(),
                limit: self.config.max_per_peer,
            });
        }

        let entry = OfflineQueueEntry {
            id: id.clone(),
            peer_id: peer_id.to_string(),
            message_type: message_type.to_string(),
            payload,
            priority: options.priority,
            require_ack: options.require_ack,
            status: QueueStatus::Pending,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(self.config.default_max_retries),
            expires_at: now.saturating_add(ttl),
            created_at: now,
            last_attempt_at: None,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        self.store.put(&entry).await?;
        entries.insert(id.clone(), entry);
        self.owners.insert(id.clone(), peer_id.to_string());

        debug!("Queued {} for {}", id, peer_id);
        Ok(id)
    }

    /// Backoff before retry number `retry_count + 1`
    pub fn get_retry_delay(&self, retry_count: u32) -> Duration {
        retry_delay(&self.config.retry_delays_ms, retry_count)
    }

    pub fn can_retry(&self, entry: &OfflineQueueEntry) -> bool {
        entry.can_retry_at(now_ms())
    }

    pub async fn get(&self, id: &str) -> Option<OfflineQueueEntry> {
        let peer = self.owner_of(id)?;
        let entries = peer.lock().await;
        entries.get(id).cloned()
    }

    /// Undelivered, unexpired entries for a peer in delivery order
    pub async fn pending_messages(&self, peer_id: &str) -> Vec<OfflineQueueEntry> {
        self.pending_messages_at(peer_id, now_ms()).await
    }

    pub async fn pending_messages_at(&self, peer_id: &str, now: u64) -> Vec<OfflineQueueEntry> {
        let Some(peer) = self.existing_peer(peer_id) else {
            return Vec::new();
        };
        let entries = peer.lock().await;
        sorted(
            entries
                .values()
                .filter(|e| !e.status.is_terminal() && !e.is_expired_at(now))
                .cloned()
                .collect(),
        )
    }

    /// Entries for a peer whose backoff has elapsed
    pub async fn due_messages_at(&self, peer_id: &str, now: u64) -> Vec<OfflineQueueEntry> {
        let Some(peer) = self.existing_peer(peer_id) else {
            return Vec::new();
        };
        let entries = peer.lock().await;
        sorted(
            entries
                .values()
                .filter(|e| e.is_due_at(now, &self.config.retry_delays_ms))
                .cloned()
                .collect(),
        )
    }

    /// Every entry across all peers that is ready for another attempt
    pub async fn process_retry_queue(&self) -> Vec<OfflineQueueEntry> {
        self.process_retry_queue_at(now_ms()).await
    }

    pub async fn process_retry_queue_at(&self, now: u64) -> Vec<OfflineQueueEntry> {
        let mut due = Vec::new();
        for peer in self.all_peers() {
            let entries = peer.lock().await;
            due.extend(
                entries
                    .values()
                    .filter(|e| e.is_due_at(now, &self.config.retry_delays_ms))
                    .cloned(),
            );
        }
        sorted(due)
    }

    pub async fn mark_as_sent(&self, id: &str) -> Result<(), QueueError> {
        self.mark_as_sent_at(id, now_ms()).await
    }

    pub async fn mark_as_sent_at(&self, id: &str, now: u64) -> Result<(), QueueError> {
        self.update(id, |entry| {
            entry.status = QueueStatus::Sent;
            entry.last_attempt_at = Some(now);
        })
        .await
        .map(|_| ())
    }

    /// Record a failed attempt; returns the resulting status
    pub async fn mark_as_failed(&self, id: &str, should_retry: bool) -> Result<QueueStatus, QueueError> {
        self.mark_as_failed_at(id, should_retry, now_ms()).await
    }

    pub async fn mark_as_failed_at(&self, id: &str, should_retry: bool, now: u64) -> Result<QueueStatus, QueueError> {
        let entry = self
            .update(id, |entry| {
                entry.status = if entry.is_expired_at(now) {
                    QueueStatus::Expired
                } else if should_retry && entry.can_retry_at(now) {
                    entry.retry_count += 1;
                    QueueStatus::Retrying
                } else {
                    QueueStatus::Failed
                };
                entry.last_attempt_at = Some(now);
            })
            .await?;

        if entry.status.is_terminal() {
            warn!("Delivery of {} to {} ended as {:?}", entry.id, entry.peer_id, entry.status);
        }
        Ok(entry.status)
    }

    /// Move every entry past its expiry to `Expired`; returns how many
    pub async fn cleanup_expired_messages(&self) -> Result<usize, QueueError> {
        self.cleanup_expired_messages_at(now_ms()).await
    }

    pub async fn cleanup_expired_messages_at(&self, now: u64) -> Result<usize, QueueError> {
        let mut count = 0;
        for peer in self.all_peers() {
            let mut entries = peer.lock().await;
            let expired: Vec<OfflineQueueEntry> = entries
                .values()
                .filter(|e| !e.status.is_terminal() && e.is_expired_at(now))
                .cloned()
                .collect();

            for mut next in expired {
                next.status = QueueStatus::Expired;
                self.store.put(&next).await?;
                entries.insert(next.id.clone(), next);
                count += 1;
            }
        }

        if count > 0 {
            info!("Expired {} queued messages", count);
        }
        Ok(count)
    }

    /// Remove every entry for the peer, whatever its status
    pub async fn clear_queue(&self, peer_id: &str) -> Result<usize, QueueError> {
        match self.existing_peer(peer_id) {
            Some(peer) => self.remove_where(&peer, |_| true).await,
            None => Ok(0),
        }
    }

    pub async fn clear_all_queues(&self) -> Result<usize, QueueError> {
        let mut count = 0;
        for peer in self.all_peers() {
            count += self.remove_where(&peer, |_| true).await?;
        }
        Ok(count)
    }

    /// Drop terminal entries from memory and storage
    pub async fn purge_finished(&self) -> Result<usize, QueueError> {
        let mut count = 0;
        for peer in self.all_peers() {
            count += self.remove_where(&peer, |e| e.status.is_terminal()).await?;
        }
        Ok(count)
    }

    pub async fn get_statistics(&self) -> QueueStatistics {
        let mut stats = QueueStatistics::default();
        for peer in self.all_peers() {
            let entries = peer.lock().await;
            for entry in entries.values() {
                match entry.status {
                    QueueStatus::Pending => stats.pending += 1,
                    QueueStatus::Retrying => stats.retrying += 1,
                    QueueStatus::Sent => stats.sent += 1,
                    QueueStatus::Failed => stats.failed += 1,
                    QueueStatus::Expired => stats.expired += 1,
                }
                stats.total += 1;
                *stats.by_peer.entry(entry.peer_id.clone()).or_default() += 1;
            }
        }
        stats
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.store.close().await?;
        Ok(())
    }

    /// Apply `change` to a non-terminal entry, persist, then publish
    async fn update(
        &self,
        id: &str,
        change: impl FnOnce(&mut OfflineQueueEntry),
    ) -> Result<OfflineQueueEntry, QueueError> {
        let peer = self.owner_of(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let mut entries = peer.lock().await;
        let current = entries.get(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if current.status.is_terminal() {
            return Err(QueueError::AlreadyFinal {
                id: id.to_string(),
                status: current.status,
            });
        }

        let mut next = current.clone();
        change(&mut next);
        self.store.put(&next).await?;
        entries.insert(id.to_string(), next.clone());
        Ok(next)
    }

    /// Delete matching entries of one peer from storage, then from memory
    async fn remove_where(
        &self,
        peer: &PeerEntries,
        selected: impl Fn(&OfflineQueueEntry) -> bool,
    ) -> Result<usize, QueueError> {
        let mut entries = peer.lock().await;
        let ids: Vec<String> = entries.values().filter(|e| selected(e)).map(|e| e.id.clone()).collect();
        for id in &ids {
            self.store.delete(id).await?;
            entries.remove(id);
            self.owners.remove(id);
        }
        Ok(ids.len())
    }

    fn peer(&self, peer_id: &str) -> PeerEntries {
        self.peers.entry(peer_id.to_string()).or_default().value().clone()
    }

    fn existing_peer(&self, peer_id: &str) -> Option<PeerEntries> {
        self.peers.get(peer_id).map(|peer| peer.value().clone())
    }

    fn owner_of(&self, id: &str) -> Option<PeerEntries> {
        let peer_id = self.owners.get(id)?.value().clone();
        self.existing_peer(&peer_id)
    }

    /// Handles to every peer group, taken without holding the map across awaits
    fn all_peers(&self) -> Vec<PeerEntries> {
        self.peers.iter().map(|peer| peer.value().clone()).collect()
    }
}

fn sorted(mut entries: Vec<OfflineQueueEntry>) -> Vec<OfflineQueueEntry> {
    entries.sort_by_key(|e| e.delivery_order());
    entries
}
