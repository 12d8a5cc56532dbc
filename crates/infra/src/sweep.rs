//! Abandonment sweep: time-based cleanup of deliveries nobody will finish.
//!
//! Independent of retry exhaustion. Catches records whose queue entry was lost
//! (cache flush, crash between ledger write and enqueue) and would otherwise
//! stay PENDING forever.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, warn};

use courier_core::{AbandonReason, Clock, MessageId};

use crate::delay_queue::DelayQueue;
use crate::request_cache::RequestCache;
use crate::store::RetryStore;

/// Records transitioned per store round trip.
pub const SWEEP_BATCH_SIZE: usize = 500;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Stale pending records found.
    pub candidates: usize,
    /// Records actually transitioned to ABANDONED.
    pub abandoned: u64,
}

#[derive(Clone)]
pub struct AbandonmentSweep {
    store: Arc<dyn RetryStore>,
    queue: DelayQueue,
    payloads: RequestCache,
    clock: Arc<dyn Clock>,
    abandon_timeout: Duration,
    batch_size: usize,
}

impl AbandonmentSweep {
    pub fn new(
        store: Arc<dyn RetryStore>,
        queue: DelayQueue,
        payloads: RequestCache,
        clock: Arc<dyn Clock>,
        abandon_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            payloads,
            clock,
            abandon_timeout,
            batch_size: SWEEP_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// One sweep pass. Failures are logged and end the pass early.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = self.clock.now();
        let timeout_ms = i64::try_from(self.abandon_timeout.as_millis()).unwrap_or(i64::MAX);
        let Some(threshold) = now.checked_sub_signed(chrono::Duration::milliseconds(timeout_ms))
        else {
            return report;
        };

        loop {
            let stale = match self
                .store
                .find_stale_pending(threshold, self.batch_size)
                .await
            {
                Ok(stale) => stale,
                Err(err) => {
                    error!(error = %err, "failed to query stale pending deliveries");
                    break;
                }
            };
            if stale.is_empty() {
                break;
            }

            let ids: Vec<MessageId> = stale.into_iter().map(|r| r.message_id).collect();
            report.candidates += ids.len();

            let changed = match self
                .store
                .mark_abandoned(&ids, AbandonReason::TimeoutAbandoned, now)
                .await
            {
                Ok(changed) => changed,
                Err(err) => {
                    error!(error = %err, count = ids.len(), "failed to mark deliveries abandoned");
                    break;
                }
            };
            report.abandoned += changed;

            for id in &ids {
                clear_ephemeral(&self.queue, &self.payloads, id).await;
            }

            if changed == 0 || ids.len() < self.batch_size {
                break;
            }
        }

        if report.abandoned > 0 {
            warn!(
                count = report.abandoned,
                abandon_timeout_ms = timeout_ms,
                "abandoned stale pending deliveries"
            );
        }
        report
    }
}

impl core::fmt::Debug for AbandonmentSweep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AbandonmentSweep")
            .field("abandon_timeout", &self.abandon_timeout)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

/// Drop the queue entry and cached payload of a message. Best-effort.
pub(crate) async fn clear_ephemeral(queue: &DelayQueue, payloads: &RequestCache, id: &MessageId) {
    if let Err(err) = queue.remove(id).await {
        warn!(message_id = %id, error = %err, "failed to remove delay queue entry");
    }
    if let Err(err) = payloads.evict(id).await {
        warn!(message_id = %id, error = %err, "failed to evict cached payload");
    }
}
