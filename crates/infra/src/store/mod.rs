//! Durable retry ledger.
//!
//! The store is the source of truth for delivery state. Every mutation the
//! engine performs is a single conditional write (`WHERE status = PENDING`,
//! `current_retry_count < max_retry_count`), so concurrent instances racing on
//! the same record resolve at the row level instead of through locks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::{AbandonReason, MessageId, RetryLogEntry, RetryRecord};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryRetryStore;
pub use postgres::PostgresRetryStore;

/// Store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("duplicate: {0}")]
    Duplicate(String),
    /// The record cannot be represented by the backend.
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("storage error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Persist a new record. `Duplicate` if its message id already exists.
    async fn insert_record(&self, record: &RetryRecord) -> Result<(), StoreError>;

    async fn find_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<RetryRecord>, StoreError>;

    /// Bump the attempt counter of a pending record that is still below its
    /// maximum and append the log row for the new attempt, as one write.
    /// Returns that row, or `None` when the record is missing, terminal or
    /// exhausted.
    ///
    /// An acknowledgement applied after this returns always finds the row of
    /// the attempt it is stamped with.
    async fn record_attempt(
        &self,
        record: &RetryRecord,
        at: DateTime<Utc>,
    ) -> Result<Option<RetryLogEntry>, StoreError>;

    /// `PENDING -> SUCCESS`, stamping the current attempt as the acknowledged
    /// one. Returns that attempt number, or `None` if the record was not pending.
    async fn mark_success(
        &self,
        message_id: &MessageId,
        at: DateTime<Utc>,
    ) -> Result<Option<u32>, StoreError>;

    /// `PENDING -> FAILED`. Returns false if the record was not pending.
    async fn mark_failed(&self, message_id: &MessageId, at: DateTime<Utc>)
    -> Result<bool, StoreError>;

    /// Batch `PENDING -> ABANDONED`. Non-pending ids are skipped; returns the
    /// number of records transitioned.
    async fn mark_abandoned(
        &self,
        message_ids: &[MessageId],
        reason: AbandonReason,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Append one attempt row. `Duplicate` if `(message_id, attempt_number)`
    /// is already logged.
    async fn append_log(&self, entry: &RetryLogEntry) -> Result<(), StoreError>;

    /// Fill in the response of one attempt. Returns false if no such attempt.
    async fn record_response(
        &self,
        message_id: &MessageId,
        attempt_number: u32,
        response: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Pending records created before `older_than`, oldest first.
    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryRecord>, StoreError>;

    /// Attempt rows of one message, by attempt number.
    async fn logs_for(&self, message_id: &MessageId) -> Result<Vec<RetryLogEntry>, StoreError>;
}

#[async_trait]
impl<S> RetryStore for Arc<S>
where
    S: RetryStore + ?Sized,
{
    async fn insert_record(&self, record: &RetryRecord) -> Result<(), StoreError> {
        (**self).insert_record(record).await
    }

    async fn find_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<RetryRecord>, StoreError> {
        (**self).find_by_message_id(message_id).await
    }

    async fn record_attempt(
        &self,
        record: &RetryRecord,
        at: DateTime<Utc>,
    ) -> Result<Option<RetryLogEntry>, StoreError> {
        (**self).record_attempt(record, at).await
    }

    async fn mark_success(
        &self,
        message_id: &MessageId,
        at: DateTime<Utc>,
    ) -> Result<Option<u32>, StoreError> {
        (**self).mark_success(message_id, at).await
    }

    async fn mark_failed(
        &self,
        message_id: &MessageId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).mark_failed(message_id, at).await
    }

    async fn mark_abandoned(
        &self,
        message_ids: &[MessageId],
        reason: AbandonReason,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        (**self).mark_abandoned(message_ids, reason, at).await
    }

    async fn append_log(&self, entry: &RetryLogEntry) -> Result<(), StoreError> {
        (**self).append_log(entry).await
    }

    async fn record_response(
        &self,
        message_id: &MessageId,
        attempt_number: u32,
        response: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self)
            .record_response(message_id, attempt_number, response, at)
            .await
    }

    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryRecord>, StoreError> {
        (**self).find_stale_pending(older_than, limit).await
    }

    async fn logs_for(&self, message_id: &MessageId) -> Result<Vec<RetryLogEntry>, StoreError> {
        (**self).logs_for(message_id).await
    }
}
