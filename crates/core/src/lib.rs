//! `courier-core`: domain building blocks for device command delivery.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the retry ledger records and their status machine, device
//! addressing and the clock abstraction every time-dependent component uses.

pub mod clock;
pub mod device;
pub mod error;
pub mod id;
pub mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use device::{DeviceTarget, TOPIC_PREFIX};
pub use error::{DomainError, DomainResult};
pub use id::{AttemptLogId, MessageId, RetryRecordId};
pub use record::{
    AbandonReason, AttemptResult, RetryLogEntry, RetryRecord, RetryStatus, RetryStep,
};
