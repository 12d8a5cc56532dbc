//! Retry ledger records and the status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceTarget;
use crate::error::{DomainError, DomainResult};
use crate::id::{AttemptLogId, MessageId, RetryRecordId};

/// Delivery status of a retry record.
///
/// `Pending` is the only non-terminal state; nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStatus {
    /// Awaiting acknowledgement; scheduled in the delay queue.
    Pending,
    /// Acknowledged by the device.
    Success,
    /// Retries exhausted without acknowledgement.
    Failed,
    /// Given up on by the sweep (or because the resend payload was lost).
    Abandoned,
}

impl RetryStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RetryStatus::Pending)
    }

    /// Only `Pending -> {Success, Failed, Abandoned}` edges exist.
    pub fn can_transition_to(self, to: RetryStatus) -> bool {
        self == RetryStatus::Pending && to.is_terminal()
    }

    /// Stable storage code.
    pub fn code(self) -> i16 {
        match self {
            RetryStatus::Pending => 1,
            RetryStatus::Success => 2,
            RetryStatus::Failed => 3,
            RetryStatus::Abandoned => 4,
        }
    }

    pub fn from_code(code: i16) -> DomainResult<Self> {
        match code {
            1 => Ok(RetryStatus::Pending),
            2 => Ok(RetryStatus::Success),
            3 => Ok(RetryStatus::Failed),
            4 => Ok(RetryStatus::Abandoned),
            other => Err(DomainError::validation(format!("unknown retry status code {other}"))),
        }
    }
}

/// Outcome recorded against a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptResult {
    Success,
    /// Default for every attempt until an acknowledgement fills it in.
    Timeout,
}

impl AttemptResult {
    pub fn code(self) -> i16 {
        match self {
            AttemptResult::Success => 1,
            AttemptResult::Timeout => 2,
        }
    }

    pub fn from_code(code: i16) -> DomainResult<Self> {
        match code {
            1 => Ok(AttemptResult::Success),
            2 => Ok(AttemptResult::Timeout),
            other => Err(DomainError::validation(format!("unknown attempt result code {other}"))),
        }
    }
}

/// Why a record ended up `Abandoned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbandonReason {
    /// Still pending after the absolute abandon timeout.
    TimeoutAbandoned,
    /// The cached resend payload expired before retries were exhausted.
    PayloadExpired,
}

impl AbandonReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AbandonReason::TimeoutAbandoned => "TIMEOUT_ABANDONED",
            AbandonReason::PayloadExpired => "PAYLOAD_EXPIRED",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "TIMEOUT_ABANDONED" => Ok(AbandonReason::TimeoutAbandoned),
            "PAYLOAD_EXPIRED" => Ok(AbandonReason::PayloadExpired),
            other => Err(DomainError::validation(format!("unknown abandon reason {other}"))),
        }
    }
}

impl core::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the scan path must do with a claimed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Record is terminal already; drop the queue item.
    Drop,
    /// `current_retry_count == max_retry_count`; transition to `Failed`.
    Exhaust,
    /// Resend as attempt number `attempt`.
    Retry { attempt: u32 },
}

/// Durable ledger row tracking delivery of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub id: RetryRecordId,
    pub message_id: MessageId,
    pub target: DeviceTarget,
    /// Operation code of the command.
    pub message_type: i32,
    /// Serialized command body as published to the device.
    pub content: String,
    pub max_retry_count: u32,
    pub current_retry_count: u32,
    pub retry_interval_ms: u64,
    pub status: RetryStatus,
    /// Attempt number that was acknowledged (0 = first send).
    pub success_retry_sequence: Option<u32>,
    pub success_at: Option<DateTime<Utc>>,
    pub abandon_reason: Option<AbandonReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetryRecord {
    /// Create a fresh pending record (attempt counter at zero).
    pub fn pending(
        message_id: MessageId,
        target: DeviceTarget,
        message_type: i32,
        content: impl Into<String>,
        max_retry_count: u32,
        retry_interval_ms: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RetryRecordId::new(),
            message_id,
            target,
            message_type,
            content: content.into(),
            max_retry_count,
            current_retry_count: 0,
            retry_interval_ms,
            status: RetryStatus::Pending,
            success_retry_sequence: None,
            success_at: None,
            abandon_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == RetryStatus::Pending
    }

    /// Decide the scan-path step for this record.
    pub fn next_step(&self) -> RetryStep {
        if !self.is_pending() {
            RetryStep::Drop
        } else if self.current_retry_count >= self.max_retry_count {
            RetryStep::Exhaust
        } else {
            RetryStep::Retry {
                attempt: self.current_retry_count + 1,
            }
        }
    }

    /// Count one more attempt. Only legal while pending and below the maximum.
    pub fn increment_retry_count(&mut self, now: DateTime<Utc>) -> DomainResult<u32> {
        if !self.is_pending() {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: self.status,
            });
        }
        if self.current_retry_count >= self.max_retry_count {
            return Err(DomainError::RetryCountOutOfRange {
                current: self.current_retry_count + 1,
                max: self.max_retry_count,
            });
        }
        self.current_retry_count += 1;
        self.updated_at = now;
        Ok(self.current_retry_count)
    }

    /// Apply a terminal transition.
    pub fn transition(&mut self, to: RetryStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_success(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(RetryStatus::Success, now)?;
        self.success_retry_sequence = Some(self.current_retry_count);
        self.success_at = Some(now);
        Ok(())
    }

    pub fn mark_abandoned(&mut self, reason: AbandonReason, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(RetryStatus::Abandoned, now)?;
        self.abandon_reason = Some(reason);
        Ok(())
    }
}

/// One delivery attempt of a retry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLogEntry {
    pub id: AttemptLogId,
    pub retry_id: RetryRecordId,
    pub message_id: MessageId,
    /// 0 = initial send, n = n-th retry.
    pub attempt_number: u32,
    pub sent_at: DateTime<Utc>,
    pub result: AttemptResult,
    pub response: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl RetryLogEntry {
    /// Log entry for an attempt that has just been sent.
    pub fn sent(record: &RetryRecord, attempt_number: u32, sent_at: DateTime<Utc>) -> Self {
        Self {
            id: AttemptLogId::new(),
            retry_id: record.id,
            message_id: record.message_id.clone(),
            attempt_number,
            sent_at,
            result: AttemptResult::Timeout,
            response: None,
            responded_at: None,
        }
    }

    pub fn record_response(&mut self, response: impl Into<String>, at: DateTime<Utc>) {
        self.result = AttemptResult::Success;
        self.response = Some(response.into());
        self.responded_at = Some(at);
    }
}
