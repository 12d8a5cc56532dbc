//! Redis pub/sub transport (optional).
//!
//! Downlink commands are `PUBLISH`ed to the device topic. Uplink messages are
//! read from one channel by a blocking subscriber thread and forwarded to the
//! acknowledgement handler on the runtime.
//!
//! Redis pub/sub is not durable: an uplink published while no subscriber is
//! connected is lost, and the delivery is retried like any unanswered one.
//! A dropped subscription is re-established with capped exponential backoff
//! for as long as the subscriber runs.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use courier_transport::{Publisher, TransportError};

use crate::ack_handler::AckHandler;
use crate::idempotency::IdempotencyGuard;

const READ_TIMEOUT: Duration = Duration::from_millis(250);
const RECONNECT_BACKOFF_START: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// [`Publisher`] over Redis `PUBLISH`.
#[derive(Clone)]
pub struct RedisPublisher {
    conn: ConnectionManager,
}

impl core::fmt::Debug for RedisPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisPublisher").finish_non_exhaustive()
    }
}

impl RedisPublisher {
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Publisher for RedisPublisher {
    #[instrument(skip(self, payload), fields(bytes = payload.len()), err)]
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(destination)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Publish {
                destination: destination.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Subscribes to the uplink channel and feeds every message to an
/// [`AckHandler`] until `shutdown` is cancelled.
#[derive(Debug)]
pub struct UplinkSubscriber;

impl UplinkSubscriber {
    pub fn spawn<G>(
        redis_url: impl AsRef<str>,
        channel: impl Into<String>,
        handler: Arc<AckHandler<G>>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, TransportError>
    where
        G: IdempotencyGuard + 'static,
    {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let channel = channel.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let reader_shutdown = shutdown.clone();
        let reader_channel = channel.clone();
        thread::Builder::new()
            .name("uplink-subscriber".to_string())
            .spawn(move || read_loop(client, reader_channel, tx, reader_shutdown))
            .map_err(|e| TransportError::Connection(format!("spawn subscriber thread: {e}")))?;

        info!(channel = %channel, "uplink subscriber started");

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    next = rx.recv() => match next {
                        Some(payload) => {
                            let outcome = handler.handle(&payload).await;
                            debug!(outcome = ?outcome, "uplink handled");
                        }
                        None => break,
                    },
                }
            }
            info!(channel = %channel, "uplink subscriber stopped");
        }))
    }
}

/// Keep a subscription open until `shutdown` is cancelled or the forwarding
/// task is gone, reconnecting with capped exponential backoff.
fn read_loop(
    client: redis::Client,
    channel: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
) {
    let mut backoff = RECONNECT_BACKOFF_START;
    while !shutdown.is_cancelled() {
        match read_session(&client, &channel, &tx, &shutdown, &mut backoff) {
            Ok(()) => return,
            Err(err) => warn!(
                channel = %channel,
                error = %err,
                retry_in_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "uplink subscription lost; reconnecting"
            ),
        }
        if !sleep_unless_cancelled(backoff, &shutdown) {
            return;
        }
        backoff = next_backoff(backoff);
    }
}

/// One connection's worth of reading. `Ok` means stop for good: shutdown was
/// requested or the receiver was dropped.
fn read_session(
    client: &redis::Client,
    channel: &str,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    shutdown: &CancellationToken,
    backoff: &mut Duration,
) -> redis::RedisResult<()> {
    let mut conn = client.get_connection()?;
    let mut pubsub = conn.as_pubsub();
    pubsub.subscribe(channel)?;
    pubsub.set_read_timeout(Some(READ_TIMEOUT))?;
    *backoff = RECONNECT_BACKOFF_START;
    debug!(channel = %channel, "uplink subscribed");

    while !shutdown.is_cancelled() {
        let msg = match pubsub.get_message() {
            Ok(m) => m,
            Err(err) if err.is_timeout() => continue,
            Err(err) => return Err(err),
        };

        if tx.send(msg.get_payload_bytes().to_vec()).is_err() {
            return Ok(());
        }
    }
    Ok(())
}

fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(RECONNECT_BACKOFF_MAX)
}

/// Sleep `total` in `READ_TIMEOUT` slices. Returns false if cancelled first.
fn sleep_unless_cancelled(total: Duration, shutdown: &CancellationToken) -> bool {
    let mut remaining = total;
    while !remaining.is_zero() {
        if shutdown.is_cancelled() {
            return false;
        }
        let step = remaining.min(READ_TIMEOUT);
        thread::sleep(step);
        remaining -= step;
    }
    !shutdown.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = RECONNECT_BACKOFF_START;
        let mut seen = vec![backoff];
        for _ in 0..8 {
            backoff = next_backoff(backoff);
            seen.push(backoff);
        }

        assert_eq!(seen[1], RECONNECT_BACKOFF_START * 2);
        assert_eq!(*seen.last().unwrap(), RECONNECT_BACKOFF_MAX);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn reader_retries_an_unreachable_server_until_cancelled() {
        // Nothing listens on port 1; every session fails to connect.
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let reader_shutdown = shutdown.clone();
        let reader = thread::spawn(move || {
            read_loop(client, "NTZ/uplink".to_string(), tx, reader_shutdown)
        });

        thread::sleep(RECONNECT_BACKOFF_START * 3);
        assert!(!reader.is_finished());

        let cancelled_at = Instant::now();
        shutdown.cancel();
        reader.join().unwrap();
        assert!(cancelled_at.elapsed() < RECONNECT_BACKOFF_MAX);
    }

    #[test]
    fn cancelled_sleep_returns_early() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let started = Instant::now();
        assert!(!sleep_unless_cancelled(Duration::from_secs(30), &shutdown));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
