//! Queue entry model

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delivery priority; `High` sorts first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePriority {
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Pending,
    Retrying,
    Sent,
    Failed,
    Expired,
}

impl QueueStatus {
    /// Sent, failed and expired entries never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Sent | QueueStatus::Failed | QueueStatus::Expired)
    }
}

/// Outbound payload waiting for its peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineQueueEntry {
    pub id: String,
    pub peer_id: String,
    pub message_type: String,
    #[serde(with = "crate::util::serde_hex")]
    pub payload: Vec<u8>,
    pub priority: MessagePriority,
    pub require_ack: bool,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub expires_at: u64,
    pub created_at: u64,
    pub last_attempt_at: Option<u64>,
    /// Enqueue order, breaks ties between equal timestamps
    pub sequence: u64,
}

impl OfflineQueueEntry {
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn can_retry_at(&self, now: u64) -> bool {
        !self.status.is_terminal() && self.retry_count < self.max_retries && !self.is_expired_at(now)
    }

    /// Pending entries are due at once; retrying ones after their backoff step
    pub fn is_due_at(&self, now: u64, retry_delays_ms: &[u64]) -> bool {
        if self.is_expired_at(now) {
            return false;
        }
        match (self.status, self.last_attempt_at) {
            (QueueStatus::Pending, _) => true,
            (QueueStatus::Retrying, None) => true,
            (QueueStatus::Retrying, Some(last)) => {
                let delay = retry_delay(retry_delays_ms, self.retry_count.saturating_sub(1));
                now >= last.saturating_add(delay.as_millis() as u64)
            }
            _ => false,
        }
    }

    /// Priority first, then first in first out
    pub(crate) fn delivery_order(&self) -> (MessagePriority, u64, u64) {
        (self.priority, self.created_at, self.sequence)
    }
}

/// Step from the backoff table; counts past the end repeat the last step
pub fn retry_delay(retry_delays_ms: &[u64], retry_count: u32) -> Duration {
    let index = (retry_count as usize).min(retry_delays_ms.len().saturating_sub(1));
    Duration::from_millis(retry_delays_ms.get(index).copied().unwrap_or(0))
}
