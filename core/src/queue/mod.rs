//! Offline delivery queue
//!
//! Buffers outbound payloads while a peer is unreachable and hands them
//! back for delivery, highest priority first, on a fixed backoff schedule.

pub mod entry;
pub mod manager;
pub mod store;

pub use entry::{retry_delay, MessagePriority, OfflineQueueEntry, QueueStatus};
pub use manager::{EnqueueOptions, OfflineMessageQueue, QueueError, QueueStatistics};
pub use store::{FileQueueStore, MemoryQueueStore, QueueStore};

#[cfg(test)]
mod tests;
