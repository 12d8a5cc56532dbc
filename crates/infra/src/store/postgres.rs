//! Postgres-backed retry store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | StoreError |
//! |------------|-----------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (check violation) | `23514` | `Backend` |
//! | Database (other) | any | `Backend` |
//! | PoolClosed / network / other | n/a | `Backend` |
//!
//! Counts and intervals that do not fit the `INTEGER` / `BIGINT` columns are
//! rejected with `Invalid` before any SQL runs.
//!
//! All state changes are single conditional `UPDATE ... WHERE status = 1`
//! statements, so racing instances are serialized by Postgres row locks.
//! `record_attempt` pairs its `UPDATE` with the log `INSERT` in one
//! transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgExecutor;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use courier_core::{
    AbandonReason, AttemptLogId, AttemptResult, DeviceTarget, MessageId, RetryLogEntry,
    RetryRecord, RetryRecordId, RetryStatus,
};

use super::{RetryStore, StoreError};

const PENDING: i16 = 1;

/// Postgres retry ledger (`message_retry` + `message_retry_log`).
#[derive(Debug, Clone)]
pub struct PostgresRetryStore {
    pool: PgPool,
}

impl PostgresRetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {e}")))
    }
}

#[async_trait]
impl RetryStore for PostgresRetryStore {
    #[instrument(skip(self, record), fields(message_id = %record.message_id), err)]
    async fn insert_record(&self, record: &RetryRecord) -> Result<(), StoreError> {
        let max_retry_count = int_column("max_retry_count", record.max_retry_count)?;
        let current_retry_count = int_column("current_retry_count", record.current_retry_count)?;
        let retry_interval_ms = bigint_column("retry_interval_ms", record.retry_interval_ms)?;

        sqlx::query(
            r#"
            INSERT INTO message_retry (
                id,
                message_id,
                device_id,
                device_mac,
                device_sn,
                net_type,
                message_type,
                message_content,
                max_retry_count,
                current_retry_count,
                retry_interval_ms,
                status,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.message_id.as_str())
        .bind(record.target.device_id)
        .bind(&record.target.mac)
        .bind(&record.target.serial_number)
        .bind(&record.target.net_type)
        .bind(record.message_type)
        .bind(&record.content)
        .bind(max_retry_count)
        .bind(current_retry_count)
        .bind(retry_interval_ms)
        .bind(record.status.code())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_record", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(message_id = %message_id), err)]
    async fn find_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<RetryRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                id, message_id, device_id, device_mac, device_sn, net_type,
                message_type, message_content, max_retry_count, current_retry_count,
                retry_interval_ms, status, success_retry_sequence, success_at,
                abandon_reason, created_at, updated_at
            FROM message_retry
            WHERE message_id = $1
            "#,
        )
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_message_id", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(
        skip(self, record),
        fields(message_id = %record.message_id, attempt = tracing::field::Empty),
        err
    )]
    async fn record_attempt(
        &self,
        record: &RetryRecord,
        at: DateTime<Utc>,
    ) -> Result<Option<RetryLogEntry>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            r#"
            UPDATE message_retry
            SET current_retry_count = current_retry_count + 1,
                updated_at = $2
            WHERE message_id = $1
              AND status = $3
              AND current_retry_count < max_retry_count
            RETURNING current_retry_count
            "#,
        )
        .bind(record.message_id.as_str())
        .bind(at)
        .bind(PENDING)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("record_attempt", e))?;

        // Dropping the transaction rolls it back.
        let Some(row) = row else {
            return Ok(None);
        };
        let attempt = count_from_column("current_retry_count", get(&row, "current_retry_count")?)?;

        let entry = RetryLogEntry::sent(record, attempt, at);
        insert_log(&mut *tx, &entry).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("attempt", attempt);
        Ok(Some(entry))
    }

    #[instrument(skip(self), fields(message_id = %message_id), err)]
    async fn mark_success(
        &self,
        message_id: &MessageId,
        at: DateTime<Utc>,
    ) -> Result<Option<u32>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE message_retry
            SET status = $3,
                success_retry_sequence = current_retry_count,
                success_at = $2,
                updated_at = $2
            WHERE message_id = $1 AND status = $4
            RETURNING success_retry_sequence
            "#,
        )
        .bind(message_id.as_str())
        .bind(at)
        .bind(RetryStatus::Success.code())
        .bind(PENDING)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_success", e))?;

        row.map(|r| {
            count_from_column("success_retry_sequence", get(&r, "success_retry_sequence")?)
        })
        .transpose()
    }

    #[instrument(skip(self), fields(message_id = %message_id), err)]
    async fn mark_failed(
        &self,
        message_id: &MessageId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE message_retry
            SET status = $3, updated_at = $2
            WHERE message_id = $1 AND status = $4
            "#,
        )
        .bind(message_id.as_str())
        .bind(at)
        .bind(RetryStatus::Failed.code())
        .bind(PENDING)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(
        skip(self, message_ids),
        fields(count = message_ids.len(), reason = %reason, abandoned = tracing::field::Empty),
        err
    )]
    async fn mark_abandoned(
        &self,
        message_ids: &[MessageId],
        reason: AbandonReason,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = message_ids.iter().map(|id| id.as_str().to_string()).collect();

        let result = sqlx::query(
            r#"
            UPDATE message_retry
            SET status = $2, abandon_reason = $3, updated_at = $4
            WHERE message_id = ANY($1) AND status = $5
            "#,
        )
        .bind(&ids)
        .bind(RetryStatus::Abandoned.code())
        .bind(reason.as_str())
        .bind(at)
        .bind(PENDING)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_abandoned", e))?;

        Span::current().record("abandoned", result.rows_affected());
        Ok(result.rows_affected())
    }

    #[instrument(
        skip(self, entry),
        fields(message_id = %entry.message_id, attempt = entry.attempt_number),
        err
    )]
    async fn append_log(&self, entry: &RetryLogEntry) -> Result<(), StoreError> {
        insert_log(&self.pool, entry).await
    }

    #[instrument(skip(self, response), fields(message_id = %message_id, attempt = attempt_number), err)]
    async fn record_response(
        &self,
        message_id: &MessageId,
        attempt_number: u32,
        response: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE message_retry_log
            SET result = $3, response = $4, responded_at = $5
            WHERE message_id = $1 AND attempt_number = $2
            "#,
        )
        .bind(message_id.as_str())
        .bind(int_column("attempt_number", attempt_number)?)
        .bind(AttemptResult::Success.code())
        .bind(response)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_response", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                id, message_id, device_id, device_mac, device_sn, net_type,
                message_type, message_content, max_retry_count, current_retry_count,
                retry_interval_ms, status, success_retry_sequence, success_at,
                abandon_reason, created_at, updated_at
            FROM message_retry
            WHERE status = $1 AND created_at < $2
            ORDER BY created_at ASC, message_id ASC
            LIMIT $3
            "#,
        )
        .bind(PENDING)
        .bind(older_than)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_stale_pending", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), fields(message_id = %message_id), err)]
    async fn logs_for(&self, message_id: &MessageId) -> Result<Vec<RetryLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                id, retry_id, message_id, attempt_number, sent_at,
                result, response, responded_at
            FROM message_retry_log
            WHERE message_id = $1
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(message_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("logs_for", e))?;

        rows.iter().map(log_from_row).collect()
    }
}

async fn insert_log<'e, E>(executor: E, entry: &RetryLogEntry) -> Result<(), StoreError>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO message_retry_log (
            id,
            retry_id,
            message_id,
            attempt_number,
            sent_at,
            result,
            response,
            responded_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(entry.retry_id.as_uuid())
    .bind(entry.message_id.as_str())
    .bind(int_column("attempt_number", entry.attempt_number)?)
    .bind(entry.sent_at)
    .bind(entry.result.code())
    .bind(entry.response.as_deref())
    .bind(entry.responded_at)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("append_log", e))?;

    Ok(())
}

/// `u32` to an `INTEGER` column value.
fn int_column(column: &str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Invalid(format!("{column} {value} exceeds {}", i32::MAX)))
}

/// `u64` to a `BIGINT` column value.
fn bigint_column(column: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Invalid(format!("{column} {value} exceeds {}", i64::MAX)))
}

fn count_from_column(column: &str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Backend(format!("stored {column} is negative: {value}")))
}

fn get<'r, T>(row: &'r sqlx::postgres::PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Backend(format!("failed to read {column}: {e}")))
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<RetryRecord, StoreError> {
    let message_id: String = get(row, "message_id")?;
    let message_id = MessageId::parse(message_id)
        .map_err(|e| StoreError::Backend(format!("stored message_id invalid: {e}")))?;
    let status = RetryStatus::from_code(get(row, "status")?)
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let abandon_reason = get::<Option<String>>(row, "abandon_reason")?
        .map(|r| AbandonReason::parse(&r))
        .transpose()
        .map_err(|e| StoreError::Backend(e.to_string()))?;

    Ok(RetryRecord {
        id: RetryRecordId::from_uuid(get(row, "id")?),
        message_id,
        target: DeviceTarget::new(
            get(row, "device_id")?,
            get::<String>(row, "device_mac")?,
            get::<String>(row, "device_sn")?,
        )
        .with_net_type(get::<String>(row, "net_type")?),
        message_type: get(row, "message_type")?,
        content: get(row, "message_content")?,
        max_retry_count: count_from_column("max_retry_count", get(row, "max_retry_count")?)?,
        current_retry_count: count_from_column(
            "current_retry_count",
            get(row, "current_retry_count")?,
        )?,
        retry_interval_ms: u64::try_from(get::<i64>(row, "retry_interval_ms")?)
            .map_err(|_| StoreError::Backend("stored retry_interval_ms is negative".to_string()))?,
        status,
        success_retry_sequence: get::<Option<i32>>(row, "success_retry_sequence")?
            .map(|n| count_from_column("success_retry_sequence", n))
            .transpose()?,
        success_at: get(row, "success_at")?,
        abandon_reason,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn log_from_row(row: &sqlx::postgres::PgRow) -> Result<RetryLogEntry, StoreError> {
    let message_id: String = get(row, "message_id")?;
    Ok(RetryLogEntry {
        id: AttemptLogId::from_uuid(get(row, "id")?),
        retry_id: RetryRecordId::from_uuid(get(row, "retry_id")?),
        message_id: MessageId::parse(message_id)
            .map_err(|e| StoreError::Backend(format!("stored message_id invalid: {e}")))?,
        attempt_number: count_from_column("attempt_number", get(row, "attempt_number")?)?,
        sent_at: get(row, "sent_at")?,
        result: AttemptResult::from_code(get(row, "result")?)
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        response: get(row, "response")?,
        responded_at: get(row, "responded_at")?,
    })
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_counts_are_rejected_not_wrapped() {
        assert_eq!(int_column("max_retry_count", 5).unwrap(), 5);
        assert!(matches!(
            int_column("max_retry_count", u32::MAX),
            Err(StoreError::Invalid(msg)) if msg.contains("max_retry_count")
        ));
        assert_eq!(bigint_column("retry_interval_ms", 1000).unwrap(), 1000);
        assert!(matches!(
            bigint_column("retry_interval_ms", u64::MAX),
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            count_from_column("current_retry_count", -1),
            Err(StoreError::Backend(_))
        ));
    }

    #[test]
    fn non_database_errors_map_to_backend() {
        let err = map_sqlx_error("find_by_message_id", sqlx::Error::PoolClosed);
        assert!(matches!(err, StoreError::Backend(msg) if msg.contains("find_by_message_id")));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
