//! In-memory retry store for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::{AbandonReason, MessageId, RetryLogEntry, RetryRecord, RetryStatus};

use super::{RetryStore, StoreError};

#[derive(Debug, Default)]
struct State {
    records: HashMap<MessageId, RetryRecord>,
    logs: BTreeMap<(MessageId, u32), RetryLogEntry>,
}

/// In-memory retry store.
///
/// A single lock guards records and logs, so every trait method is atomic
/// with respect to the others (the row-level atomicity a database provides).
#[derive(Debug, Default)]
pub struct InMemoryRetryStore {
    state: RwLock<State>,
}

impl InMemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored records (all statuses).
    pub fn len(&self) -> usize {
        self.read().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("retry store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("retry store lock poisoned".to_string()))
    }
}

#[async_trait]
impl RetryStore for InMemoryRetryStore {
    async fn insert_record(&self, record: &RetryRecord) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if state.records.contains_key(&record.message_id) {
            return Err(StoreError::Duplicate(format!(
                "message_id {} already exists",
                record.message_id
            )));
        }
        state
            .records
            .insert(record.message_id.clone(), record.clone());
        Ok(())
    }

    async fn find_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<RetryRecord>, StoreError> {
        Ok(self.read()?.records.get(message_id).cloned())
    }

    async fn record_attempt(
        &self,
        record: &RetryRecord,
        at: DateTime<Utc>,
    ) -> Result<Option<RetryLogEntry>, StoreError> {
        let mut guard = self.write()?;
        let state = &mut *guard;
        let Some(stored) = state.records.get_mut(&record.message_id) else {
            return Ok(None);
        };
        if !stored.is_pending() || stored.current_retry_count >= stored.max_retry_count {
            return Ok(None);
        }

        let key = (record.message_id.clone(), stored.current_retry_count + 1);
        if state.logs.contains_key(&key) {
            return Err(StoreError::Duplicate(format!(
                "attempt {} of {} already logged",
                key.1, record.message_id
            )));
        }
        let Ok(attempt) = stored.increment_retry_count(at) else {
            return Ok(None);
        };

        let entry = RetryLogEntry::sent(stored, attempt, at);
        state.logs.insert(key, entry.clone());
        Ok(Some(entry))
    }

    async fn mark_success(
        &self,
        message_id: &MessageId,
        at: DateTime<Utc>,
    ) -> Result<Option<u32>, StoreError> {
        let mut state = self.write()?;
        let Some(record) = state.records.get_mut(message_id) else {
            return Ok(None);
        };
        Ok(record
            .mark_success(at)
            .ok()
            .and(record.success_retry_sequence))
    }

    async fn mark_failed(
        &self,
        message_id: &MessageId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        Ok(state
            .records
            .get_mut(message_id)
            .is_some_and(|r| r.transition(RetryStatus::Failed, at).is_ok()))
    }

    async fn mark_abandoned(
        &self,
        message_ids: &[MessageId],
        reason: AbandonReason,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        let mut changed = 0;
        for id in message_ids {
            if let Some(record) = state.records.get_mut(id) {
                if record.mark_abandoned(reason, at).is_ok() {
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn append_log(&self, entry: &RetryLogEntry) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let key = (entry.message_id.clone(), entry.attempt_number);
        if state.logs.contains_key(&key) {
            return Err(StoreError::Duplicate(format!(
                "attempt {} of {} already logged",
                entry.attempt_number, entry.message_id
            )));
        }
        state.logs.insert(key, entry.clone());
        Ok(())
    }

    async fn record_response(
        &self,
        message_id: &MessageId,
        attempt_number: u32,
        response: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        match state.logs.get_mut(&(message_id.clone(), attempt_number)) {
            Some(entry) => {
                entry.record_response(response, at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryRecord>, StoreError> {
        let state = self.read()?;
        let mut stale: Vec<RetryRecord> = state
            .records
            .values()
            .filter(|r| r.is_pending() && r.created_at < older_than)
            .cloned()
            .collect();
        stale.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        stale.truncate(limit);
        Ok(stale)
    }

    async fn logs_for(&self, message_id: &MessageId) -> Result<Vec<RetryLogEntry>, StoreError> {
        let state = self.read()?;
        Ok(state
            .logs
            .range((message_id.clone(), 0)..=(message_id.clone(), u32::MAX))
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::DeviceTarget;

    fn record(id: &str, max: u32, at: DateTime<Utc>) -> RetryRecord {
        RetryRecord::pending(
            MessageId::parse(id).unwrap(),
            DeviceTarget::new(1, "AA", "SN"),
            1003,
            "{}",
            max,
            1000,
            at,
        )
    }

    #[tokio::test]
    async fn message_id_is_unique() {
        let store = InMemoryRetryStore::new();
        let now = Utc::now();

        store.insert_record(&record("m-1", 2, now)).await.unwrap();
        let err = store.insert_record(&record("m-1", 2, now)).await.unwrap_err();

        assert!(matches!(err, StoreError::Duplicate(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn record_attempt_stops_at_max_and_after_terminal() {
        let store = InMemoryRetryStore::new();
        let now = Utc::now();
        let id = MessageId::parse("m-1").unwrap();
        let r = record("m-1", 2, now);
        store.insert_record(&r).await.unwrap();

        let first = store.record_attempt(&r, now).await.unwrap().unwrap();
        assert_eq!(first.attempt_number, 1);
        assert_eq!(first.retry_id, r.id);
        let second = store.record_attempt(&r, now).await.unwrap().unwrap();
        assert_eq!(second.attempt_number, 2);
        assert_eq!(store.record_attempt(&r, now).await.unwrap(), None);
        assert_eq!(store.logs_for(&id).await.unwrap().len(), 2);

        assert!(store.mark_failed(&id, now).await.unwrap());
        assert!(!store.mark_failed(&id, now).await.unwrap());
        assert_eq!(store.mark_success(&id, now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn mark_success_returns_acknowledged_attempt() {
        let store = InMemoryRetryStore::new();
        let now = Utc::now();
        let id = MessageId::parse("m-1").unwrap();
        let r = record("m-1", 3, now);
        store.insert_record(&r).await.unwrap();
        store.record_attempt(&r, now).await.unwrap();

        assert_eq!(store.mark_success(&id, now).await.unwrap(), Some(1));
        assert!(store.record_response(&id, 1, "ok", now).await.unwrap());
        let stored = store.find_by_message_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, RetryStatus::Success);
        assert_eq!(stored.success_at, Some(now));
    }

    #[tokio::test]
    async fn record_attempt_leaves_counter_alone_when_row_exists() {
        let store = InMemoryRetryStore::new();
        let now = Utc::now();
        let r = record("m-1", 3, now);
        store.insert_record(&r).await.unwrap();
        store.append_log(&RetryLogEntry::sent(&r, 1, now)).await.unwrap();

        assert!(matches!(
            store.record_attempt(&r, now).await,
            Err(StoreError::Duplicate(_))
        ));
        let stored = store.find_by_message_id(&r.message_id).await.unwrap().unwrap();
        assert_eq!(stored.current_retry_count, 0);
    }

    #[tokio::test]
    async fn stale_pending_excludes_terminal_and_recent() {
        let store = InMemoryRetryStore::new();
        let old = Utc::now() - chrono::Duration::minutes(10);
        let recent = Utc::now();

        store.insert_record(&record("old-pending", 2, old)).await.unwrap();
        store.insert_record(&record("old-failed", 2, old)).await.unwrap();
        store.insert_record(&record("recent", 2, recent)).await.unwrap();
        store
            .mark_failed(&MessageId::parse("old-failed").unwrap(), recent)
            .await
            .unwrap();

        let stale = store
            .find_stale_pending(recent - chrono::Duration::minutes(1), 10)
            .await
            .unwrap();

        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].message_id.as_str(), "old-pending");

        let ids: Vec<MessageId> = stale.into_iter().map(|r| r.message_id).collect();
        let changed = store
            .mark_abandoned(&ids, AbandonReason::TimeoutAbandoned, recent)
            .await
            .unwrap();
        assert_eq!(changed, 1);
        let again = store
            .mark_abandoned(&ids, AbandonReason::TimeoutAbandoned, recent)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn logs_are_scoped_and_ordered() {
        let store = InMemoryRetryStore::new();
        let now = Utc::now();
        let a = record("a", 3, now);
        let b = record("b", 3, now);
        store.insert_record(&a).await.unwrap();
        store.insert_record(&b).await.unwrap();

        store.append_log(&RetryLogEntry::sent(&a, 1, now)).await.unwrap();
        store.append_log(&RetryLogEntry::sent(&a, 0, now)).await.unwrap();
        store.append_log(&RetryLogEntry::sent(&b, 0, now)).await.unwrap();
        assert!(matches!(
            store.append_log(&RetryLogEntry::sent(&a, 0, now)).await,
            Err(StoreError::Duplicate(_))
        ));

        assert!(store.record_response(&a.message_id, 1, "ok", now).await.unwrap());
        assert!(!store.record_response(&a.message_id, 7, "ok", now).await.unwrap());

        let logs = store.logs_for(&a.message_id).await.unwrap();
        let attempts: Vec<u32> = logs.iter().map(|l| l.attempt_number).collect();
        assert_eq!(attempts, vec![0, 1]);
        assert_eq!(logs[1].response.as_deref(), Some("ok"));
    }
}
