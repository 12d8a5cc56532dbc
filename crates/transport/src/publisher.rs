//! Downlink publishing abstraction.
//!
//! The retry engine only ever needs one thing from the device transport:
//! hand a payload to a destination and learn whether the hand-off failed.
//! Connection management, QoS and subscriptions stay inside implementations.
//!
//! A successful `publish` says nothing about delivery; the device confirms
//! receipt through an uplink acknowledgement carrying the same message id.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The broker connection is unavailable.
    #[error("transport connection error: {0}")]
    Connection(String),

    /// The broker rejected or failed the publish.
    #[error("publish to {destination} failed: {reason}")]
    Publish { destination: String, reason: String },

    /// Internal lock poisoning (in-memory implementations).
    #[error("transport state poisoned")]
    Poisoned,
}

/// Narrow downlink interface: `publish(destination, payload)`.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<(), TransportError>;
}

#[async_trait]
impl<P> Publisher for Arc<P>
where
    P: Publisher + ?Sized,
{
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<(), TransportError> {
        (**self).publish(destination, payload).await
    }
}
