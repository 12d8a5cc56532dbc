//! Domain error model.

use thiserror::Error;

use crate::record::RetryStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, ledger-level failures (validation,
/// illegal transitions). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A status change that the retry state machine does not allow.
    #[error("illegal status transition {from:?} -> {to:?}")]
    InvalidTransition { from: RetryStatus, to: RetryStatus },

    /// A retry counter would leave `0..=max_retry_count`.
    #[error("retry count {current} is outside 0..={max}")]
    RetryCountOutOfRange { current: u32, max: u32 },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
