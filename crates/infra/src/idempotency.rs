//! At-most-once execution per correlation id.
//!
//! A guard inserts a uniquely-constrained marker for the correlation id and
//! runs the caller's action inside the same unit of work. If the marker
//! already exists the action is never invoked; if the action fails the marker
//! is rolled back with it so the id can be retried.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::store::postgres::is_unique_violation;

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    /// The correlation id was already accepted.
    #[error("correlation id {0} already processed")]
    Duplicate(String),

    #[error("idempotency store error: {0}")]
    Store(String),

    /// The guarded action failed; the marker was rolled back.
    #[error("guarded action failed: {0}")]
    Action(anyhow::Error),
}

#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    /// Unit of work handed to the action (e.g. an open transaction).
    type Unit: Send;

    async fn execute<T, F>(&self, correlation_id: &str, action: F) -> Result<T, IdempotencyError>
    where
        T: Send,
        F: for<'u> FnOnce(&'u mut Self::Unit) -> BoxFuture<'u, anyhow::Result<T>> + Send;
}

/// Postgres guard: marker insert and action share one transaction.
///
/// Concurrent callers with the same id block on the unique index until the
/// first transaction finishes; they then see either a duplicate (commit) or
/// an empty slot (rollback).
#[derive(Debug, Clone)]
pub struct PgIdempotencyGuard {
    pool: PgPool,
}

impl PgIdempotencyGuard {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyGuard for PgIdempotencyGuard {
    type Unit = Transaction<'static, Postgres>;

    async fn execute<T, F>(&self, correlation_id: &str, action: F) -> Result<T, IdempotencyError>
    where
        T: Send,
        F: for<'u> FnOnce(&'u mut Self::Unit) -> BoxFuture<'u, anyhow::Result<T>> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IdempotencyError::Store(format!("begin failed: {e}")))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_markers (correlation_id, created_at)
            VALUES ($1, $2)
            "#,
        )
        .bind(correlation_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            let _ = tx.rollback().await;
            return Err(if is_unique_violation(&err) {
                debug!(correlation_id, "duplicate correlation id");
                IdempotencyError::Duplicate(correlation_id.to_string())
            } else {
                IdempotencyError::Store(format!("marker insert failed: {err}"))
            });
        }

        match action(&mut tx).await {
            Ok(value) => {
                tx.commit()
                    .await
                    .map_err(|e| IdempotencyError::Store(format!("commit failed: {e}")))?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback()
                    .await
                    .map_err(|e| IdempotencyError::Store(format!("rollback failed: {e}")))?;
                Err(IdempotencyError::Action(err))
            }
        }
    }
}

/// In-memory guard for tests/dev.
///
/// The marker set is the only state it owns, so "rolling back" means removing
/// the marker again; the action's own effects are the action's business.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyGuard {
    markers: Mutex<HashSet<String>>,
}

impl InMemoryIdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.markers
            .lock()
            .map(|m| m.contains(correlation_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl IdempotencyGuard for InMemoryIdempotencyGuard {
    type Unit = ();

    async fn execute<T, F>(&self, correlation_id: &str, action: F) -> Result<T, IdempotencyError>
    where
        T: Send,
        F: for<'u> FnOnce(&'u mut Self::Unit) -> BoxFuture<'u, anyhow::Result<T>> + Send,
    {
        let inserted = self
            .markers
            .lock()
            .map_err(|_| IdempotencyError::Store("marker set poisoned".to_string()))?
            .insert(correlation_id.to_string());
        if !inserted {
            debug!(correlation_id, "duplicate correlation id");
            return Err(IdempotencyError::Duplicate(correlation_id.to_string()));
        }

        let mut unit = ();
        match action(&mut unit).await {
            Ok(value) => Ok(value),
            Err(err) => {
                if let Ok(mut markers) = self.markers.lock() {
                    markers.remove(correlation_id);
                }
                Err(IdempotencyError::Action(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    #[tokio::test]
    async fn duplicate_does_not_invoke_action() {
        let guard = InMemoryIdempotencyGuard::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let _ = guard
                .execute("corr-1", move |_| {
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        anyhow::Ok(())
                    }
                    .boxed()
                })
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = guard
            .execute("corr-1", |_| async { anyhow::Ok(()) }.boxed())
            .await
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::Duplicate(id) if id == "corr-1"));
    }

    #[tokio::test]
    async fn failed_action_frees_the_id() {
        let guard = InMemoryIdempotencyGuard::new();

        let err = guard
            .execute("corr-1", |_| {
                async { Err::<(), _>(anyhow::anyhow!("boom")) }.boxed()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::Action(_)));
        assert!(!guard.contains("corr-1"));

        let value = guard
            .execute("corr-1", |_| async { anyhow::Ok(7) }.boxed())
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(guard.contains("corr-1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_have_one_winner() {
        let guard = Arc::new(InMemoryIdempotencyGuard::new());
        let executed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = guard.clone();
            let executed = executed.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .execute("shared", move |_| {
                        async move {
                            tokio::task::yield_now().await;
                            executed.fetch_add(1, Ordering::SeqCst);
                            anyhow::Ok(())
                        }
                        .boxed()
                    })
                    .await
            }));
        }

        let mut ok = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(IdempotencyError::Duplicate(_)) => duplicates += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(ok, 1);
        assert_eq!(duplicates, 15);
        assert_eq!(executed.load(Ordering::SeqCst), 1);
    }
}
