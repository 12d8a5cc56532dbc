//! Lease-based mutual exclusion over the ephemeral cache.
//!
//! A lease is a `SET NX PX` key holding a random owner token. A holder that
//! crashes simply lets the lease expire; nobody has to clean up after it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheError, EphemeralCache};

/// Lease name used to arbitrate the scan step between instances.
pub const SCAN_LOCK_KEY: &str = "retry:scan_lock";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Proof of a held lease; pass it back to [`LeaseLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "an unreleased lease blocks other instances until it expires"]
pub struct LeaseToken {
    name: String,
    owner: String,
}

impl LeaseToken {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Clone)]
pub struct LeaseLock {
    cache: Arc<dyn EphemeralCache>,
    poll_interval: Duration,
}

impl LeaseLock {
    pub fn new(cache: Arc<dyn EphemeralCache>) -> Self {
        Self {
            cache,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Try to take `name` for `lease`, retrying until `wait` has elapsed.
    ///
    /// A zero `wait` makes exactly one attempt.
    pub async fn try_acquire(
        &self,
        name: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LeaseToken>, CacheError> {
        let owner = Uuid::now_v7().to_string();
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if self.cache.set_if_absent(name, &owner, lease).await? {
                return Ok(Some(LeaseToken {
                    name: name.to_string(),
                    owner,
                }));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(lease = name, "lease held elsewhere");
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Best-effort release; failures only delay the next holder until expiry.
    pub async fn release(&self, token: LeaseToken) {
        match self.cache.delete_if_equals(&token.name, &token.owner).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(lease = %token.name, "lease expired before release");
            }
            Err(err) => {
                warn!(lease = %token.name, error = %err, "failed to release lease");
            }
        }
    }
}

impl core::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use courier_core::ManualClock;

    fn lock() -> (LeaseLock, ManualClock) {
        let clock = ManualClock::default();
        let cache = Arc::new(InMemoryCache::new(Arc::new(clock.clone())));
        (LeaseLock::new(cache), clock)
    }

    #[tokio::test]
    async fn second_acquirer_is_refused_until_release() {
        let (lock, _) = lock();
        let lease = Duration::from_secs(2);

        let held = lock
            .try_acquire(SCAN_LOCK_KEY, Duration::ZERO, lease)
            .await
            .unwrap()
            .unwrap();
        assert!(
            lock.try_acquire(SCAN_LOCK_KEY, Duration::from_millis(30), lease)
                .await
                .unwrap()
                .is_none()
        );

        lock.release(held).await;
        let again = lock
            .try_acquire(SCAN_LOCK_KEY, Duration::ZERO, lease)
            .await
            .unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn crashed_holder_self_heals_by_expiry() {
        let (lock, clock) = lock();
        let lease = Duration::from_millis(2000);

        let abandoned = lock
            .try_acquire(SCAN_LOCK_KEY, Duration::ZERO, lease)
            .await
            .unwrap();
        assert!(abandoned.is_some());

        clock.advance(lease);
        let next = lock
            .try_acquire(SCAN_LOCK_KEY, Duration::ZERO, lease)
            .await
            .unwrap()
            .unwrap();

        // The stale token must not delete the new holder's lease.
        lock.release(abandoned.unwrap()).await;
        assert!(
            lock.try_acquire(SCAN_LOCK_KEY, Duration::ZERO, lease)
                .await
                .unwrap()
                .is_none()
        );
        lock.release(next).await;
    }
}
