//! Uplink acknowledgement handling.
//!
//! Every uplink message carrying a `MsgId` is treated as the device's answer
//! to the command with that id. The guard makes redelivered uplinks no-ops.

use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use courier_core::MessageId;
use courier_transport::UpMsg;

use crate::idempotency::{IdempotencyError, IdempotencyGuard};
use crate::manager::{DeliveryError, RetryManager};

/// What [`AckHandler::handle`] did with one uplink message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Delivery marked SUCCESS on the given attempt.
    Acknowledged { message_id: MessageId, attempt: u32 },
    /// Not JSON, or no usable `MsgId`.
    Ignored,
    /// Same `MsgId` already handled.
    Duplicate,
    /// No ledger row for this `MsgId` (not a retryable command).
    Unknown,
    /// Record already FAILED/ABANDONED/SUCCESS; ack discarded.
    Late,
    /// Store or cache failure; the marker was rolled back.
    Failed,
}

pub struct AckHandler<G> {
    manager: Arc<RetryManager>,
    guard: G,
}

impl<G> AckHandler<G>
where
    G: IdempotencyGuard,
{
    pub fn new(manager: Arc<RetryManager>, guard: G) -> Self {
        Self { manager, guard }
    }

    pub async fn handle(&self, payload: &[u8]) -> AckOutcome {
        let msg = match UpMsg::parse(payload) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(error = %err, "ignoring unparsable uplink message");
                return AckOutcome::Ignored;
            }
        };

        let Some(raw_id) = msg.msg_id() else {
            return AckOutcome::Ignored;
        };
        let message_id = match MessageId::parse(raw_id) {
            Ok(id) => id,
            Err(err) => {
                debug!(msg_id = raw_id, error = %err, "ignoring uplink with invalid MsgId");
                return AckOutcome::Ignored;
            }
        };

        let manager = self.manager.clone();
        let ack_id = message_id.clone();
        let response = msg.data_json();

        let result = self
            .guard
            .execute(message_id.as_str(), move |_unit| {
                async move {
                    let attempt = manager.mark_success(&ack_id, &response).await?;
                    anyhow::Ok(attempt)
                }
                .boxed()
            })
            .await;

        match result {
            Ok(attempt) => {
                info!(message_id = %message_id, opt_code = msg.opt_code, attempt, "acknowledgement applied");
                AckOutcome::Acknowledged {
                    message_id,
                    attempt,
                }
            }
            Err(IdempotencyError::Duplicate(_)) => {
                debug!(message_id = %message_id, "duplicate acknowledgement dropped");
                AckOutcome::Duplicate
            }
            Err(IdempotencyError::Action(err)) => match err.downcast_ref::<DeliveryError>() {
                Some(DeliveryError::NotFound(_)) => {
                    debug!(message_id = %message_id, "uplink for unknown delivery");
                    AckOutcome::Unknown
                }
                Some(DeliveryError::InvalidState { status, .. }) => {
                    warn!(message_id = %message_id, status = ?status, "late acknowledgement discarded");
                    AckOutcome::Late
                }
                _ => {
                    error!(message_id = %message_id, error = %err, "failed to apply acknowledgement");
                    AckOutcome::Failed
                }
            },
            Err(err @ IdempotencyError::Store(_)) => {
                error!(message_id = %message_id, error = %err, "idempotency store failure");
                AckOutcome::Failed
            }
        }
    }
}

impl<G> core::fmt::Debug for AckHandler<G> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AckHandler")
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::config::RetryConfig;
    use crate::idempotency::InMemoryIdempotencyGuard;
    use crate::manager::RetryRequest;
    use crate::store::{InMemoryRetryStore, RetryStore};
    use courier_core::{DeviceTarget, ManualClock, RetryStatus};
    use courier_transport::InMemoryPublisher;

    fn handler() -> (AckHandler<InMemoryIdempotencyGuard>, Arc<InMemoryRetryStore>) {
        let clock = ManualClock::default();
        let store = InMemoryRetryStore::arc();
        let manager = Arc::new(RetryManager::new(
            RetryConfig::default(),
            store.clone(),
            Arc::new(InMemoryCache::new(Arc::new(clock.clone()))),
            Arc::new(InMemoryPublisher::new()),
            Arc::new(clock),
        ));
        (
            AckHandler::new(manager, InMemoryIdempotencyGuard::new()),
            store,
        )
    }

    async fn submit(handler: &AckHandler<InMemoryIdempotencyGuard>, id: &str) {
        handler
            .manager
            .submit(RetryRequest::new(
                MessageId::parse(id).unwrap(),
                DeviceTarget::new(1, "AA", "SN"),
                1003,
                "{}",
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ack_marks_success_once() {
        let (handler, store) = handler();
        submit(&handler, "m-1").await;
        let uplink = br#"{"OptCode":1003,"Data":{"ok":true},"Timestamp":1,"MsgId":"m-1"}"#;

        let first = handler.handle(uplink).await;
        let second = handler.handle(uplink).await;

        assert_eq!(
            first,
            AckOutcome::Acknowledged {
                message_id: MessageId::parse("m-1").unwrap(),
                attempt: 0
            }
        );
        assert_eq!(second, AckOutcome::Duplicate);

        let id = MessageId::parse("m-1").unwrap();
        let record = store.find_by_message_id(&id).await.unwrap().unwrap();
        assert_eq!(record.status, RetryStatus::Success);
        let logs = store.logs_for(&id).await.unwrap();
        assert_eq!(logs[0].response.as_deref(), Some(r#"{"ok":true}"#));
    }

    #[tokio::test]
    async fn uplink_without_msg_id_is_ignored() {
        let (handler, _) = handler();
        assert_eq!(
            handler.handle(br#"{"OptCode":1001,"Data":{}}"#).await,
            AckOutcome::Ignored
        );
        assert_eq!(handler.handle(b"not json").await, AckOutcome::Ignored);
    }

    #[tokio::test]
    async fn unknown_msg_id_frees_the_marker() {
        let (handler, _) = handler();
        let uplink = br#"{"OptCode":1003,"MsgId":"m-9"}"#;

        assert_eq!(handler.handle(uplink).await, AckOutcome::Unknown);
        assert!(!handler.guard.contains("m-9"));
    }
}
