//! Retry manager: the delivery orchestrator.
//!
//! ## Lifecycle of one command
//!
//! ```text
//! submit ─► ledger row (PENDING) ─► cached payload ─► delay queue ─► attempt 0
//!                                                         │
//!        scan (lease held only while reading due ids) ◄───┘
//!          └─► claim (queue removal) ─► re-read ledger ─► FAILED | ABANDONED | count+log, re-enqueue, resend
//!
//! ack ─► PENDING -> SUCCESS ─► response on the acknowledged attempt ─► queue/payload eviction
//! ```
//!
//! The ledger is authoritative. The queue and payload cache are rebuilt from
//! nothing but are allowed to be lost: the sweep abandons whatever they drop.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use courier_core::{
    AbandonReason, Clock, DeviceTarget, MessageId, RetryLogEntry, RetryRecord, RetryRecordId,
    RetryStatus, RetryStep,
};
use courier_transport::Publisher;

use crate::cache::{CacheError, EphemeralCache};
use crate::config::RetryConfig;
use crate::delay_queue::DelayQueue;
use crate::lease::{LeaseLock, SCAN_LOCK_KEY};
use crate::request_cache::{RequestCache, ResendPayload};
use crate::store::{RetryStore, StoreError};
use crate::sweep::{AbandonmentSweep, SweepReport, clear_ephemeral};

/// A command to deliver with retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRequest {
    pub message_id: MessageId,
    pub target: DeviceTarget,
    pub message_type: i32,
    /// Payload published verbatim to the device topic.
    pub content: String,
    pub max_retry_count: Option<u32>,
    pub retry_interval: Option<Duration>,
}

impl RetryRequest {
    pub fn new(
        message_id: MessageId,
        target: DeviceTarget,
        message_type: i32,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            target,
            message_type,
            content: content.into(),
            max_retry_count: None,
            retry_interval: None,
        }
    }

    pub fn with_max_retry_count(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = Some(max_retry_count);
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = Some(retry_interval);
        self
    }
}

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted { record_id: RetryRecordId },
    /// The engine is disabled; nothing was stored or sent.
    Disabled,
}

/// Errors returned to submitters and acknowledgement callers.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("message {0} was already submitted")]
    Duplicate(MessageId),

    #[error("no retry record for message {0}")]
    NotFound(MessageId),

    #[error("retry record for message {message_id} is {status:?}, not PENDING")]
    InvalidState {
        message_id: MessageId,
        status: RetryStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// What happened to one claimed-or-not queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Another instance removed the entry first.
    NotClaimed,
    /// Record missing or already terminal.
    Dropped,
    /// Retries exhausted; record is now FAILED.
    Failed,
    /// Cached payload gone; record is now ABANDONED.
    Abandoned,
    Retried { attempt: u32 },
    /// Infrastructure failure; logged and rescheduled where possible.
    Error,
}

/// Summary of one scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub lock_acquired: bool,
    pub due: usize,
    pub not_claimed: usize,
    pub dropped: usize,
    pub retried: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub errors: usize,
}

impl ScanReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::NotClaimed => self.not_claimed += 1,
            ItemOutcome::Dropped => self.dropped += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Abandoned => self.abandoned += 1,
            ItemOutcome::Retried { .. } => self.retried += 1,
            ItemOutcome::Error => self.errors += 1,
        }
    }
}

/// Ledger row plus its attempts, for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptHistory {
    pub record: RetryRecord,
    pub attempts: Vec<RetryLogEntry>,
}

/// Delivery orchestrator. Share it behind an `Arc`; every method takes `&self`.
pub struct RetryManager {
    config: RetryConfig,
    store: Arc<dyn RetryStore>,
    publisher: Arc<dyn Publisher>,
    queue: DelayQueue,
    payloads: RequestCache,
    lease: LeaseLock,
    sweep: AbandonmentSweep,
    clock: Arc<dyn Clock>,
}

impl RetryManager {
    pub fn new(
        config: RetryConfig,
        store: Arc<dyn RetryStore>,
        cache: Arc<dyn EphemeralCache>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = DelayQueue::new(cache.clone());
        let payloads = RequestCache::new(cache.clone(), config.cache_expire);
        let sweep = AbandonmentSweep::new(
            store.clone(),
            queue.clone(),
            payloads.clone(),
            clock.clone(),
            config.abandon_timeout,
        );

        Self {
            lease: LeaseLock::new(cache),
            config,
            store,
            publisher,
            queue,
            payloads,
            sweep,
            clock,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn delay_queue(&self) -> &DelayQueue {
        &self.queue
    }

    /// Persist, cache, enqueue, then send attempt 0.
    ///
    /// A failed initial publish is logged, not returned: the record is already
    /// queued and the scan will resend it.
    #[instrument(skip(self, request), fields(message_id = %request.message_id), err)]
    pub async fn submit(&self, request: RetryRequest) -> Result<Submission, DeliveryError> {
        if !self.config.enabled {
            info!("retry engine disabled; submission ignored");
            return Ok(Submission::Disabled);
        }

        let now = self.clock.now();
        let max_retry_count = request
            .max_retry_count
            .unwrap_or(self.config.max_retry_count);
        let retry_interval_ms = duration_millis(
            request.retry_interval.unwrap_or(self.config.retry_interval),
        );

        let record = RetryRecord::pending(
            request.message_id,
            request.target,
            request.message_type,
            request.content,
            max_retry_count,
            retry_interval_ms,
            now,
        );

        self.store
            .insert_record(&record)
            .await
            .map_err(|err| match err {
                StoreError::Duplicate(_) => DeliveryError::Duplicate(record.message_id.clone()),
                other => DeliveryError::Store(other),
            })?;

        self.payloads
            .put(&record.message_id, &ResendPayload::from_record(&record))
            .await?;
        self.queue
            .schedule(&record.message_id, due_at(now.timestamp_millis(), retry_interval_ms))
            .await?;

        // The row exists before the device can possibly answer.
        if let Err(err) = self
            .store
            .append_log(&RetryLogEntry::sent(&record, 0, now))
            .await
        {
            error!(error = %err, "failed to append attempt log");
        }
        self.publish_attempt(&record.message_id, &record.target, &record.content, 0)
            .await;

        info!(
            device_mac = %record.target.mac,
            max_retry_count,
            retry_interval_ms,
            "retryable command submitted"
        );
        Ok(Submission::Accepted {
            record_id: record.id,
        })
    }

    /// Record the device's acknowledgement.
    ///
    /// Returns the acknowledged attempt number. Acks for records that are no
    /// longer pending (late ack after FAILED/ABANDONED, duplicate ack) are
    /// discarded with `InvalidState`.
    #[instrument(skip(self, response), fields(message_id = %message_id), err)]
    pub async fn mark_success(
        &self,
        message_id: &MessageId,
        response: &str,
    ) -> Result<u32, DeliveryError> {
        let record = self
            .store
            .find_by_message_id(message_id)
            .await?
            .ok_or_else(|| DeliveryError::NotFound(message_id.clone()))?;

        if !record.is_pending() {
            warn!(status = ?record.status, "acknowledgement for non-pending delivery discarded");
            return Err(DeliveryError::InvalidState {
                message_id: message_id.clone(),
                status: record.status,
            });
        }

        let now = self.clock.now();
        let Some(sequence) = self.store.mark_success(message_id, now).await? else {
            let status = self
                .store
                .find_by_message_id(message_id)
                .await?
                .map_or(record.status, |r| r.status);
            warn!(status = ?status, "delivery left PENDING before acknowledgement was applied");
            return Err(DeliveryError::InvalidState {
                message_id: message_id.clone(),
                status,
            });
        };

        match self
            .store
            .record_response(message_id, sequence, response, now)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(attempt = sequence, "no attempt row for acknowledged attempt"),
            Err(err) => error!(attempt = sequence, error = %err, "failed to record response"),
        }

        clear_ephemeral(&self.queue, &self.payloads, message_id).await;

        info!(retry_count = sequence, "delivery acknowledged");
        Ok(sequence)
    }

    /// Run one scan now: discover due ids under the lease, then process them.
    pub async fn trigger_scan(&self) -> ScanReport {
        match self.discover_due().await {
            Some(due) => {
                let mut report = self.process_batch(due).await;
                report.lock_acquired = true;
                report
            }
            None => ScanReport::default(),
        }
    }

    /// One scan followed by one sweep.
    pub async fn process_pending(&self) -> (ScanReport, SweepReport) {
        let scan = self.trigger_scan().await;
        let sweep = self.run_sweep().await;
        (scan, sweep)
    }

    pub async fn run_sweep(&self) -> SweepReport {
        if !self.config.enabled {
            return SweepReport::default();
        }
        self.sweep.run_once().await
    }

    /// Read due ids while holding the scan lease.
    ///
    /// Returns `None` when the lease is held elsewhere (or unreachable). The
    /// lease is released before returning; processing happens outside it.
    pub async fn discover_due(&self) -> Option<Vec<MessageId>> {
        if !self.config.enabled {
            return None;
        }

        let token = match self
            .lease
            .try_acquire(SCAN_LOCK_KEY, self.config.lock_wait, self.config.lock_lease)
            .await
        {
            Ok(Some(token)) => token,
            Ok(None) => return None,
            Err(err) => {
                error!(error = %err, "failed to acquire scan lease");
                return None;
            }
        };

        let due = self
            .queue
            .due(self.clock.now_millis(), self.config.max_batch_size)
            .await;
        self.lease.release(token).await;

        match due {
            Ok(due) => {
                if !due.is_empty() {
                    debug!(count = due.len(), "due deliveries discovered");
                }
                Some(due)
            }
            Err(err) => {
                error!(error = %err, "failed to read due deliveries");
                None
            }
        }
    }

    /// Process discovered ids one by one. Never fails as a whole.
    pub async fn process_batch(&self, due: Vec<MessageId>) -> ScanReport {
        let mut report = ScanReport {
            due: due.len(),
            ..ScanReport::default()
        };
        for id in &due {
            let outcome = self.process_item(id).await;
            report.record(outcome);
        }
        report
    }

    /// Claim and process one due id.
    #[instrument(skip(self), fields(message_id = %message_id))]
    pub async fn process_item(&self, message_id: &MessageId) -> ItemOutcome {
        match self.queue.claim(message_id).await {
            Ok(true) => {}
            Ok(false) => return ItemOutcome::NotClaimed,
            Err(err) => {
                error!(error = %err, "failed to claim delay queue entry");
                return ItemOutcome::Error;
            }
        }

        let record = match self.store.find_by_message_id(message_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("queued delivery has no ledger row");
                clear_ephemeral(&self.queue, &self.payloads, message_id).await;
                return ItemOutcome::Dropped;
            }
            Err(err) => {
                error!(error = %err, "failed to load retry record");
                self.reschedule(message_id, duration_millis(self.config.retry_interval))
                    .await;
                return ItemOutcome::Error;
            }
        };

        match record.next_step() {
            RetryStep::Drop => {
                clear_ephemeral(&self.queue, &self.payloads, message_id).await;
                ItemOutcome::Dropped
            }
            RetryStep::Exhaust => self.exhaust(&record).await,
            RetryStep::Retry { .. } => self.retry(&record).await,
        }
    }

    /// Ledger row and attempt log of one message.
    pub async fn attempt_history(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<AttemptHistory>, DeliveryError> {
        let Some(record) = self.store.find_by_message_id(message_id).await? else {
            return Ok(None);
        };
        let attempts = self.store.logs_for(message_id).await?;
        Ok(Some(AttemptHistory { record, attempts }))
    }

    async fn exhaust(&self, record: &RetryRecord) -> ItemOutcome {
        let id = &record.message_id;
        match self.store.mark_failed(id, self.clock.now()).await {
            Ok(true) => {
                clear_ephemeral(&self.queue, &self.payloads, id).await;
                error!(
                    device_mac = %record.target.mac,
                    retry_count = record.current_retry_count,
                    max_retry_count = record.max_retry_count,
                    "delivery failed after exhausting retries"
                );
                ItemOutcome::Failed
            }
            Ok(false) => {
                clear_ephemeral(&self.queue, &self.payloads, id).await;
                ItemOutcome::Dropped
            }
            Err(err) => {
                error!(error = %err, "failed to mark delivery failed");
                self.reschedule(id, record.retry_interval_ms).await;
                ItemOutcome::Error
            }
        }
    }

    async fn retry(&self, record: &RetryRecord) -> ItemOutcome {
        let id = &record.message_id;

        // Load before counting: a slot is only spent on an attempt that can be sent.
        let payload = match self.payloads.get(id).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return self.abandon_expired(record).await,
            Err(CacheError::Malformed { reason, .. }) => {
                warn!(reason = %reason, "cached payload unreadable");
                return self.abandon_expired(record).await;
            }
            Err(err) => {
                error!(error = %err, "failed to load cached payload");
                self.reschedule(id, record.retry_interval_ms).await;
                return ItemOutcome::Error;
            }
        };

        let now = self.clock.now();
        let attempt = match self.store.record_attempt(record, now).await {
            Ok(Some(entry)) => entry.attempt_number,
            Ok(None) => {
                // Acknowledged or exhausted by someone else since the re-read.
                clear_ephemeral(&self.queue, &self.payloads, id).await;
                return ItemOutcome::Dropped;
            }
            Err(err) => {
                error!(error = %err, "failed to record retry attempt");
                self.reschedule(id, record.retry_interval_ms).await;
                return ItemOutcome::Error;
            }
        };

        if let Err(err) = self
            .queue
            .schedule(id, due_at(now.timestamp_millis(), payload.retry_interval_ms))
            .await
        {
            error!(error = %err, "failed to re-enqueue delivery");
        }

        // A terminal transition committed after `record_attempt` may have
        // evicted the queue entry before the schedule above re-added it.
        match self.store.find_by_message_id(id).await {
            Ok(Some(current)) if current.is_pending() => {}
            Ok(current) => {
                clear_ephemeral(&self.queue, &self.payloads, id).await;
                debug!(
                    attempt,
                    status = ?current.map(|r| r.status),
                    "delivery finished during retry; resend skipped"
                );
                return ItemOutcome::Dropped;
            }
            Err(err) => {
                warn!(attempt, error = %err, "failed to re-check delivery status; resending");
            }
        }

        self.publish_attempt(&record.message_id, &payload.target, &payload.content, attempt)
            .await;

        info!(
            retry_count = attempt,
            max_retry_count = record.max_retry_count,
            "delivery retried"
        );
        ItemOutcome::Retried { attempt }
    }

    async fn abandon_expired(&self, record: &RetryRecord) -> ItemOutcome {
        let id = &record.message_id;
        match self
            .store
            .mark_abandoned(
                std::slice::from_ref(id),
                AbandonReason::PayloadExpired,
                self.clock.now(),
            )
            .await
        {
            Ok(changed) => {
                clear_ephemeral(&self.queue, &self.payloads, id).await;
                if changed == 0 {
                    return ItemOutcome::Dropped;
                }
                warn!(
                    reason = %AbandonReason::PayloadExpired,
                    retry_count = record.current_retry_count,
                    "cached payload unusable; delivery abandoned"
                );
                ItemOutcome::Abandoned
            }
            Err(err) => {
                error!(error = %err, "failed to abandon delivery with unusable payload");
                self.reschedule(id, record.retry_interval_ms).await;
                ItemOutcome::Error
            }
        }
    }

    async fn publish_attempt(
        &self,
        message_id: &MessageId,
        target: &DeviceTarget,
        content: &str,
        attempt: u32,
    ) {
        let topic = target.topic();
        if let Err(err) = self.publisher.publish(&topic, content.as_bytes()).await {
            warn!(
                message_id = %message_id,
                attempt,
                topic = %topic,
                error = %err,
                "publish failed; attempt still counted"
            );
        }
    }

    async fn reschedule(&self, message_id: &MessageId, interval_ms: u64) {
        let at = due_at(self.clock.now_millis(), interval_ms);
        if let Err(err) = self.queue.schedule(message_id, at).await {
            error!(message_id = %message_id, error = %err, "failed to reschedule delivery; sweep will abandon it");
        }
    }
}

impl core::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryManager")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn due_at(now_ms: i64, interval_ms: u64) -> i64 {
    now_ms.saturating_add(i64::try_from(interval_ms).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::store::InMemoryRetryStore;
    use courier_core::ManualClock;
    use courier_transport::InMemoryPublisher;

    struct Harness {
        manager: RetryManager,
        store: Arc<InMemoryRetryStore>,
        publisher: Arc<InMemoryPublisher>,
        clock: ManualClock,
    }

    fn harness(config: RetryConfig) -> Harness {
        let clock = ManualClock::default();
        let store = InMemoryRetryStore::arc();
        let publisher = Arc::new(InMemoryPublisher::new());
        let cache = Arc::new(InMemoryCache::new(Arc::new(clock.clone())));
        let manager = RetryManager::new(
            config,
            store.clone(),
            cache,
            publisher.clone(),
            Arc::new(clock.clone()),
        );
        Harness {
            manager,
            store,
            publisher,
            clock,
        }
    }

    fn request(id: &str) -> RetryRequest {
        RetryRequest::new(
            MessageId::parse(id).unwrap(),
            DeviceTarget::new(1, "AA:BB", "SN-1"),
            1003,
            r#"{"OptCode":1003}"#,
        )
    }

    #[tokio::test]
    async fn disabled_engine_ignores_submissions() {
        let h = harness(RetryConfig {
            enabled: false,
            ..RetryConfig::default()
        });

        let outcome = h.manager.submit(request("m-1")).await.unwrap();

        assert_eq!(outcome, Submission::Disabled);
        assert!(h.store.is_empty());
        assert_eq!(h.publisher.count(), 0);
    }

    #[tokio::test]
    async fn submit_sends_attempt_zero_and_schedules() {
        let h = harness(RetryConfig::default());
        let id = MessageId::parse("m-1").unwrap();

        h.manager.submit(request("m-1")).await.unwrap();

        let sent = h.publisher.published();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, "NTZ/wifi/AA:BB/SN-1");
        assert_eq!(
            h.manager.delay_queue().scheduled_at(&id).await.unwrap(),
            Some(h.clock.now_millis() + 1000)
        );
        let history = h.manager.attempt_history(&id).await.unwrap().unwrap();
        assert_eq!(history.record.max_retry_count, 2);
        assert_eq!(history.attempts.len(), 1);
        assert_eq!(history.attempts[0].attempt_number, 0);
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let h = harness(RetryConfig::default());
        h.manager.submit(request("m-1")).await.unwrap();

        let err = h.manager.submit(request("m-1")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Duplicate(_)));
        assert_eq!(h.publisher.count(), 1);
    }

    #[tokio::test]
    async fn initial_publish_failure_is_swallowed() {
        let h = harness(RetryConfig::default());
        h.publisher.set_failing(true);

        let outcome = h.manager.submit(request("m-1")).await.unwrap();

        assert!(matches!(outcome, Submission::Accepted { .. }));
        let id = MessageId::parse("m-1").unwrap();
        assert!(h.manager.delay_queue().scheduled_at(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn per_request_overrides_win() {
        let h = harness(RetryConfig::default());
        let id = MessageId::parse("m-1").unwrap();

        h.manager
            .submit(
                request("m-1")
                    .with_max_retry_count(5)
                    .with_retry_interval(Duration::from_millis(250)),
            )
            .await
            .unwrap();

        let record = h.store.find_by_message_id(&id).await.unwrap().unwrap();
        assert_eq!(record.max_retry_count, 5);
        assert_eq!(record.retry_interval_ms, 250);
    }

    #[tokio::test]
    async fn mark_success_unknown_message() {
        let h = harness(RetryConfig::default());
        let err = h
            .manager
            .mark_success(&MessageId::parse("nope").unwrap(), "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound(_)));
    }

    #[tokio::test]
    async fn scan_before_due_time_does_nothing() {
        let h = harness(RetryConfig::default());
        h.manager.submit(request("m-1")).await.unwrap();

        h.clock.advance_millis(999);
        let report = h.manager.trigger_scan().await;

        assert!(report.lock_acquired);
        assert_eq!(report.due, 0);
        assert_eq!(h.publisher.count(), 1);
    }

    #[tokio::test]
    async fn retry_uses_incremented_attempt_number() {
        let h = harness(RetryConfig::default());
        let id = MessageId::parse("m-1").unwrap();
        h.manager.submit(request("m-1")).await.unwrap();

        h.clock.advance_millis(1000);
        let report = h.manager.trigger_scan().await;

        assert_eq!(report.retried, 1);
        let record = h.store.find_by_message_id(&id).await.unwrap().unwrap();
        assert_eq!(record.current_retry_count, 1);
        let logs = h.store.logs_for(&id).await.unwrap();
        assert_eq!(logs.iter().map(|l| l.attempt_number).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(h.publisher.count(), 2);
    }

    #[tokio::test]
    async fn attempt_history_serializes_for_operators() {
        let h = harness(RetryConfig::default());
        let id = MessageId::parse("m-1").unwrap();
        h.manager.submit(request("m-1")).await.unwrap();

        let history = h.manager.attempt_history(&id).await.unwrap().unwrap();
        let json = serde_json::to_value(&history).unwrap();

        assert_eq!(json["record"]["message_id"], "m-1");
        assert_eq!(json["attempts"][0]["attempt_number"], 0);
        assert!(
            h.manager
                .attempt_history(&MessageId::parse("other").unwrap())
                .await
                .unwrap()
                .is_none()
        );
    }
}
