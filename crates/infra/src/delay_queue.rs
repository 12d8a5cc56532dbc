//! Delay queue: message ids scored by their next due time (epoch millis).

use std::sync::Arc;

use tracing::warn;

use courier_core::MessageId;

use crate::cache::{CacheError, EphemeralCache};

/// Sorted-set key shared by every instance.
pub const DELAY_QUEUE_KEY: &str = "retry:delay_queue";

/// Score-ordered index of pending message ids.
///
/// Removal doubles as the ownership hand-off: of several instances that read
/// the same due id, only the one whose [`DelayQueue::claim`] returns true may
/// process it.
#[derive(Clone)]
pub struct DelayQueue {
    cache: Arc<dyn EphemeralCache>,
    key: String,
}

impl DelayQueue {
    pub fn new(cache: Arc<dyn EphemeralCache>) -> Self {
        Self::with_key(cache, DELAY_QUEUE_KEY)
    }

    pub fn with_key(cache: Arc<dyn EphemeralCache>, key: impl Into<String>) -> Self {
        Self {
            cache,
            key: key.into(),
        }
    }

    /// Insert (or move) `message_id` to be due at `execute_at_ms`.
    pub async fn schedule(
        &self,
        message_id: &MessageId,
        execute_at_ms: i64,
    ) -> Result<(), CacheError> {
        self.cache
            .sorted_add(&self.key, message_id.as_str(), execute_at_ms)
            .await
    }

    /// Atomically take ownership of a due id.
    pub async fn claim(&self, message_id: &MessageId) -> Result<bool, CacheError> {
        self.cache.sorted_remove(&self.key, message_id.as_str()).await
    }

    pub async fn remove(&self, message_id: &MessageId) -> Result<(), CacheError> {
        self.cache
            .sorted_remove(&self.key, message_id.as_str())
            .await
            .map(|_| ())
    }

    /// Up to `limit` ids due at or before `now_ms`, earliest first.
    pub async fn due(&self, now_ms: i64, limit: usize) -> Result<Vec<MessageId>, CacheError> {
        let members = self
            .cache
            .sorted_range_by_score(&self.key, now_ms, limit)
            .await?;

        let mut due = Vec::with_capacity(members.len());
        for member in members {
            match MessageId::parse(member.as_str()) {
                Ok(id) => due.push(id),
                Err(err) => {
                    warn!(member = %member, error = %err, "dropping unparsable delay queue member");
                    if let Err(err) = self.cache.sorted_remove(&self.key, &member).await {
                        warn!(member = %member, error = %err, "failed to remove unparsable delay queue member");
                    }
                }
            }
        }
        Ok(due)
    }

    pub async fn scheduled_at(&self, message_id: &MessageId) -> Result<Option<i64>, CacheError> {
        self.cache.sorted_score(&self.key, message_id.as_str()).await
    }
}

impl core::fmt::Debug for DelayQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DelayQueue").field("key", &self.key).finish()
    }
}
