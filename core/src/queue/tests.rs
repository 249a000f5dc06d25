//! Offline queue behaviour

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::config::QueueConfig;
use crate::queue::entry::{MessagePriority, OfflineQueueEntry, QueueStatus};
use crate::queue::manager::{EnqueueOptions, OfflineMessageQueue, QueueError};
use crate::queue::store::{FileQueueStore, MemoryQueueStore, QueueStore};
use crate::storage::StoreError;

const T0: u64 = 1_700_000_000_000;

async fn queue_with(config: QueueConfig) -> OfflineMessageQueue {
    OfflineMessageQueue::open(Arc::new(MemoryQueueStore::new()), config).await.unwrap()
}

async fn queue() -> OfflineMessageQueue {
    queue_with(QueueConfig::default()).await
}

fn with_priority(priority: MessagePriority) -> EnqueueOptions {
    EnqueueOptions {
        priority,
        ..EnqueueOptions::default()
    }
}

#[tokio::test]
async fn test_retry_delay_schedule() {
    let q = queue().await;
    let delays: Vec<u64> = (0..8).map(|n| q.get_retry_delay(n).as_secs()).collect();
    assert_eq!(delays, vec![1, 1, 2, 5, 10, 30, 30, 30]);
}

#[tokio::test]
async fn test_pending_ordered_by_priority_then_fifo() {
    let q = queue().await;
    let low = q.enqueue_at("bob", "text", b"low".to_vec(), with_priority(MessagePriority::Low), T0).await.unwrap();
    let n1 = q.enqueue_at("bob", "text", b"n1".to_vec(), EnqueueOptions::default(), T0).await.unwrap();
    let high = q.enqueue_at("bob", "text", b"high".to_vec(), with_priority(MessagePriority::High), T0 + 5).await.unwrap();
    let n2 = q.enqueue_at("bob", "text", b"n2".to_vec(), EnqueueOptions::default(), T0).await.unwrap();
    q.enqueue_at("carol", "text", b"other".to_vec(), EnqueueOptions::default(), T0).await.unwrap();

    let ids: Vec<String> = q.pending_messages_at("bob", T0 + 10).await.into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![high, n1, n2, low]);
}

#[tokio::test]
async fn test_expired_entries_are_not_pending() {
    let q = queue().await;
    let options = EnqueueOptions {
        expires_in_ms: Some(1_000),
        ..EnqueueOptions::default()
    };
    let id = q.enqueue_at("bob", "text", b"soon gone".to_vec(), options, T0).await.unwrap();

    assert_eq!(q.pending_messages_at("bob", T0 + 999).await.len(), 1);
    assert!(q.pending_messages_at("bob", T0 + 1_000).await.is_empty());
    assert!(q.process_retry_queue_at(T0 + 1_000).await.is_empty());

    assert_eq!(q.cleanup_expired_messages_at(T0 + 1_000).await.unwrap(), 1);
    assert_eq!(q.get(&id).await.unwrap().status, QueueStatus::Expired);
    // Already expired entries are not counted twice
    assert_eq!(q.cleanup_expired_messages_at(T0 + 5_000).await.unwrap(), 0);
}

#[tokio::test]
async fn test_zero_ttl_is_rejected() {
    let q = queue().await;
    let options = EnqueueOptions {
        expires_in_ms: Some(0),
        ..EnqueueOptions::default()
    };
    let result = q.enqueue_at("bob", "text", vec![1], options, T0).await;
    assert!(matches!(result, Err(QueueError::Expired(_))));
    assert_eq!(q.get_statistics().await.total, 0);
}

#[tokio::test]
async fn test_queue_full_counts_only_live_entries() {
    let q = queue_with(QueueConfig {
        max_per_peer: 2,
        ..QueueConfig::default()
    })
    .await;

    let first = q.enqueue_at("bob", "text", vec![1], EnqueueOptions::default(), T0).await.unwrap();
    q.enqueue_at("bob", "text", vec![2], EnqueueOptions::default(), T0).await.unwrap();
    let result = q.enqueue_at("bob", "text", vec![3], EnqueueOptions::default(), T0).await;
    assert_eq!(
        result,
        Err(QueueError::QueueFull {
            peer_id: "bob".into(),
            limit: 2
        })
    );

    // Other peers have their own budget
    q.enqueue_at("carol", "text", vec![1], EnqueueOptions::default(), T0).await.unwrap();

    q.mark_as_sent_at(&first, T0 + 1).await.unwrap();
    q.enqueue_at("bob", "text", vec![3], EnqueueOptions::default(), T0 + 2).await.unwrap();
}

#[tokio::test]
async fn test_failure_walks_retry_budget() {
    let q = queue().await;
    let options = EnqueueOptions {
        max_retries: Some(2),
        ..EnqueueOptions::default()
    };
    let id = q.enqueue_at("bob", "text", vec![9], options, T0).await.unwrap();

    assert_eq!(q.mark_as_failed_at(&id, true, T0 + 10).await.unwrap(), QueueStatus::Retrying);
    let entry = q.get(&id).await.unwrap();
    assert_eq!(entry.retry_count, 1);
    assert_eq!(entry.last_attempt_at, Some(T0 + 10));

    // First retry waits one second after the failed attempt
    assert!(q.process_retry_queue_at(T0 + 1_009).await.is_empty());
    assert_eq!(q.process_retry_queue_at(T0 + 1_010).await.len(), 1);

    assert_eq!(q.mark_as_failed_at(&id, true, T0 + 1_010).await.unwrap(), QueueStatus::Retrying);
    assert_eq!(q.mark_as_failed_at(&id, true, T0 + 3_000).await.unwrap(), QueueStatus::Failed);
    assert_eq!(q.get(&id).await.unwrap().retry_count, 2);
    assert!(q.process_retry_queue_at(T0 + 60_000).await.is_empty());
}

#[tokio::test]
async fn test_failure_without_retry_is_final() {
    let q = queue().await;
    let id = q.enqueue_at("bob", "text", vec![1], EnqueueOptions::default(), T0).await.unwrap();
    assert_eq!(q.mark_as_failed_at(&id, false, T0 + 1).await.unwrap(), QueueStatus::Failed);
}

#[tokio::test]
async fn test_failure_after_expiry_marks_expired() {
    let q = queue().await;
    let options = EnqueueOptions {
        expires_in_ms: Some(100),
        ..EnqueueOptions::default()
    };
    let id = q.enqueue_at("bob", "text", vec![1], options, T0).await.unwrap();
    assert_eq!(q.mark_as_failed_at(&id, true, T0 + 100).await.unwrap(), QueueStatus::Expired);
}

#[tokio::test]
async fn test_terminal_entries_never_change() {
    let q = queue().await;
    let id = q.enqueue_at("bob", "text", vec![1], EnqueueOptions::default(), T0).await.unwrap();
    q.mark_as_sent_at(&id, T0 + 1).await.unwrap();

    assert_eq!(
        q.mark_as_failed_at(&id, true, T0 + 2).await,
        Err(QueueError::AlreadyFinal {
            id: id.clone(),
            status: QueueStatus::Sent
        })
    );
    assert!(matches!(q.mark_as_sent(&id).await, Err(QueueError::AlreadyFinal { .. })));
    assert_eq!(q.mark_as_sent("missing").await, Err(QueueError::NotFound("missing".into())));
    assert!(q.pending_messages_at("bob", T0 + 2).await.is_empty());
}

#[tokio::test]
async fn test_statistics_and_clearing() {
    let q = queue().await;
    let a = q.enqueue_at("bob", "text", vec![1], EnqueueOptions::default(), T0).await.unwrap();
    let b = q.enqueue_at("bob", "text", vec![2], EnqueueOptions::default(), T0).await.unwrap();
    let c = q.enqueue_at("carol", "text", vec![3], EnqueueOptions::default(), T0).await.unwrap();
    q.enqueue_at("carol", "text", vec![4], EnqueueOptions::default(), T0).await.unwrap();

    q.mark_as_sent_at(&a, T0 + 1).await.unwrap();
    q.mark_as_failed_at(&b, true, T0 + 1).await.unwrap();
    q.mark_as_failed_at(&c, false, T0 + 1).await.unwrap();

    let stats = q.get_statistics().await;
    assert_eq!(stats.total, 4);
    assert_eq!((stats.pending, stats.retrying, stats.sent, stats.failed, stats.expired), (1, 1, 1, 1, 0));
    assert_eq!(stats.by_peer.get("bob"), Some(&2));
    assert_eq!(stats.by_peer.get("carol"), Some(&2));

    assert_eq!(q.purge_finished().await.unwrap(), 2);
    assert_eq!(q.get_statistics().await.total, 2);

    assert_eq!(q.clear_queue("bob").await.unwrap(), 1);
    assert!(q.pending_messages_at("bob", T0 + 2).await.is_empty());
    assert_eq!(q.clear_all_queues().await.unwrap(), 1);
    assert_eq!(q.get_statistics().await, Default::default());
}

#[tokio::test]
async fn test_reload_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let (first, second) = {
        let store: Arc<dyn QueueStore> = Arc::new(FileQueueStore::open(dir.path()).await.unwrap());
        let q = OfflineMessageQueue::open(store, QueueConfig::default()).await.unwrap();
        let first = q.enqueue_at("bob", "text", b"one".to_vec(), EnqueueOptions::default(), T0).await.unwrap();
        let second = q.enqueue_at("bob", "text", b"two".to_vec(), EnqueueOptions::default(), T0).await.unwrap();
        q.mark_as_failed_at(&first, true, T0 + 1).await.unwrap();
        q.close().await.unwrap();
        (first, second)
    };

    let store: Arc<dyn QueueStore> = Arc::new(FileQueueStore::open(dir.path()).await.unwrap());
    let q = OfflineMessageQueue::open(store, QueueConfig::default()).await.unwrap();
    let restored = q.get(&first).await.unwrap();
    assert_eq!(restored.status, QueueStatus::Retrying);
    assert_eq!(restored.retry_count, 1);
    assert_eq!(q.get(&second).await.unwrap().payload, b"two".to_vec());

    // New entries keep sorting after the restored ones
    let third = q.enqueue_at("bob", "text", b"three".to_vec(), EnqueueOptions::default(), T0).await.unwrap();
    let ids: Vec<String> = q.pending_messages_at("bob", T0 + 2).await.into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![first, second, third]);
}

#[tokio::test]
async fn test_closed_store_rejects_enqueue() {
    let q = queue().await;
    q.close().await.unwrap();
    let result = q.enqueue("bob", "text", vec![1], EnqueueOptions::default()).await;
    assert!(matches!(result, Err(QueueError::Storage(_))));
    assert_eq!(q.get_retry_delay(0), Duration::from_secs(1));
}

/// Writes for `slow_peer` wait until a permit is released
struct StalledStore {
    inner: MemoryQueueStore,
    slow_peer: &'static str,
    gate: Semaphore,
}

#[async_trait]
impl QueueStore for StalledStore {
    async fn put(&self, entry: &OfflineQueueEntry) -> Result<(), StoreError> {
        if entry.peer_id == self.slow_peer {
            let _permit = self.gate.acquire().await.map_err(|_| StoreError::Closed)?;
        }
        self.inner.put(entry).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn load_all(&self) -> Result<Vec<OfflineQueueEntry>, StoreError> {
        self.inner.load_all().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_slow_write_for_one_peer_does_not_block_others() {
    let store = Arc::new(StalledStore {
        inner: MemoryQueueStore::new(),
        slow_peer: "bob",
        gate: Semaphore::new(0),
    });
    let q = Arc::new(OfflineMessageQueue::open(store.clone(), QueueConfig::default()).await.unwrap());

    let stalled = {
        let q = q.clone();
        tokio::spawn(async move { q.enqueue_at("bob", "text", vec![1], EnqueueOptions::default(), T0).await })
    };
    tokio::task::yield_now().await;

    let carol = tokio::time::timeout(
        Duration::from_secs(1),
        q.enqueue_at("carol", "text", vec![2], EnqueueOptions::default(), T0),
    )
    .await
    .expect("carol's enqueue waited on bob's write")
    .unwrap();
    assert!(q.get(&carol).await.is_some());
    assert_eq!(q.pending_messages_at("carol", T0 + 1).await.len(), 1);

    store.gate.add_permits(1);
    let bob = stalled.await.unwrap().unwrap();
    assert_eq!(q.get(&bob).await.unwrap().peer_id, "bob");
}
