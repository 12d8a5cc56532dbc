//! In-memory publisher for tests/dev.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::publisher::{Publisher, TransportError};

/// A single recorded publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub destination: String,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct State {
    sent: Vec<PublishedMessage>,
    fail_all: bool,
    failing_destinations: HashSet<String>,
}

/// Recording publisher.
///
/// - No IO
/// - Every call is recorded, including the ones it is told to fail
/// - Failures can be injected globally or per destination
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    state: Mutex<State>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_all = fail;
        }
    }

    /// Make publishes to one destination fail.
    pub fn fail_destination(&self, destination: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_destinations.insert(destination.into());
        }
    }

    /// Snapshot of every publish call so far, in call order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .map(|s| s.sent.clone())
            .unwrap_or_default()
    }

    pub fn published_to(&self, destination: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.destination == destination)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.state.lock().map(|s| s.sent.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().map_err(|_| TransportError::Poisoned)?;

        state.sent.push(PublishedMessage {
            destination: destination.to_string(),
            payload: payload.to_vec(),
        });

        if state.fail_all || state.failing_destinations.contains(destination) {
            debug!(destination, "injected publish failure");
            return Err(TransportError::Publish {
                destination: destination.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_successful_and_failed_calls() {
        let publisher = InMemoryPublisher::new();

        publisher.publish("NTZ/wifi/a/1", b"one").await.unwrap();
        publisher.fail_destination("NTZ/wifi/b/2");
        let err = publisher.publish("NTZ/wifi/b/2", b"two").await.unwrap_err();

        assert!(matches!(err, TransportError::Publish { .. }));
        assert_eq!(publisher.count(), 2);
        assert_eq!(publisher.published_to("NTZ/wifi/a/1")[0].payload_str(), "one");
    }

    #[tokio::test]
    async fn global_failure_toggle() {
        let publisher = InMemoryPublisher::new();
        publisher.set_failing(true);
        assert!(publisher.publish("d", b"x").await.is_err());
        publisher.set_failing(false);
        assert!(publisher.publish("d", b"x").await.is_ok());
    }
}
