//! Background loops driving the retry manager.
//!
//! Two independent tasks: the scan loop (every `scan_interval`) and the
//! abandonment sweep (every `cleanup_interval`). Both stop on the shared
//! cancellation token; the scan loop waits for the batches it already
//! dispatched before exiting.

use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::RetryManager;

/// Handle to control and join the background loops.
#[derive(Debug)]
pub struct RetryWorkers {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RetryWorkers {
    /// Spawn the scan and sweep loops. Spawns nothing when the engine is
    /// disabled.
    pub fn spawn(manager: Arc<RetryManager>) -> Self {
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        if manager.config().enabled {
            tasks.push(tokio::spawn(scan_loop(manager.clone(), shutdown.clone())));
            tasks.push(tokio::spawn(sweep_loop(manager, shutdown.clone())));
            info!("retry workers started");
        } else {
            info!("retry engine disabled; workers not started");
        }

        Self { shutdown, tasks }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Request graceful shutdown and wait for both loops to stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "retry worker task ended abnormally");
            }
        }
        info!("retry workers stopped");
    }
}

async fn scan_loop(manager: Arc<RetryManager>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(manager.config().scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(err) = joined {
                    warn!(error = %err, "retry batch task panicked");
                }
            }

            _ = ticker.tick() => {
                let Some(due) = manager.discover_due().await else {
                    continue;
                };
                if due.is_empty() {
                    continue;
                }

                let manager = manager.clone();
                in_flight.spawn(async move {
                    let report = manager.process_batch(due).await;
                    debug!(
                        due = report.due,
                        retried = report.retried,
                        failed = report.failed,
                        abandoned = report.abandoned,
                        errors = report.errors,
                        "retry batch processed"
                    );
                });
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "retry batch task panicked during shutdown");
        }
    }
}

async fn sweep_loop(manager: Arc<RetryManager>, shutdown: CancellationToken) {
    let period = manager.config().cleanup_interval;
    // First sweep one full period after startup.
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            _ = ticker.tick() => {
                let report = manager.run_sweep().await;
                if report.candidates > 0 {
                    debug!(
                        candidates = report.candidates,
                        abandoned = report.abandoned,
                        "abandonment sweep finished"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::config::RetryConfig;
    use crate::manager::RetryRequest;
    use crate::store::InMemoryRetryStore;
    use courier_core::{DeviceTarget, MessageId, SystemClock};
    use courier_transport::InMemoryPublisher;
    use std::time::Duration;

    /// Poll `predicate` until it holds or `timeout` elapses.
    async fn wait_until<F>(timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            retry_interval: Duration::from_millis(20),
            scan_interval: Duration::from_millis(10),
            lock_wait: Duration::ZERO,
            ..RetryConfig::default()
        }
    }

    #[tokio::test]
    async fn disabled_engine_spawns_nothing() {
        let manager = Arc::new(RetryManager::new(
            RetryConfig {
                enabled: false,
                ..RetryConfig::default()
            },
            InMemoryRetryStore::arc(),
            Arc::new(InMemoryCache::default()),
            Arc::new(InMemoryPublisher::new()),
            Arc::new(SystemClock),
        ));

        let workers = RetryWorkers::spawn(manager);
        assert!(!workers.is_running());
        workers.shutdown().await;
    }

    #[tokio::test]
    async fn scan_loop_resends_until_exhausted_then_stops() {
        let publisher = Arc::new(InMemoryPublisher::new());
        let manager = Arc::new(RetryManager::new(
            fast_config(),
            InMemoryRetryStore::arc(),
            Arc::new(InMemoryCache::default()),
            publisher.clone(),
            Arc::new(SystemClock),
        ));
        let workers = RetryWorkers::spawn(manager.clone());

        manager
            .submit(RetryRequest::new(
                MessageId::parse("m-1").unwrap(),
                DeviceTarget::new(1, "AA", "SN"),
                1003,
                "{}",
            ))
            .await
            .unwrap();

        // attempt 0 plus two retries
        assert!(wait_until(Duration::from_secs(2), || publisher.count() == 3).await);
        workers.shutdown().await;

        let history = manager
            .attempt_history(&MessageId::parse("m-1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.attempts.len(), 3);
    }
}
