//! Infrastructure layer: ledger store, ephemeral cache, delay queue, retry
//! orchestration and the background workers driving it.

pub mod ack_handler;
pub mod cache;
pub mod config;
pub mod delay_queue;
pub mod idempotency;
pub mod lease;
pub mod manager;
pub mod request_cache;
pub mod store;
pub mod sweep;
pub mod workers;

#[cfg(feature = "redis")]
pub mod pubsub;

pub use ack_handler::{AckHandler, AckOutcome};
pub use config::{ConfigError, RetryConfig};
pub use manager::{
    AttemptHistory, DeliveryError, ItemOutcome, RetryManager, RetryRequest, ScanReport, Submission,
};
pub use workers::RetryWorkers;
