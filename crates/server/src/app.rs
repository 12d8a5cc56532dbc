//! Wires the engine to its adapters and owns the running background tasks.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use courier_core::SystemClock;
use courier_infra::cache::EphemeralCache;
use courier_infra::idempotency::PgIdempotencyGuard;
use courier_infra::store::PostgresRetryStore;
use courier_infra::{AckHandler, RetryConfig, RetryManager, RetryWorkers};
use courier_transport::Publisher;

use crate::config::ServerConfig;

/// Connected adapters and the manager built on them; nothing running yet.
pub struct Services {
    pub manager: Arc<RetryManager>,
    pub guard: PgIdempotencyGuard,
}

impl Services {
    /// Connect Postgres (running migrations) and the cache/transport backend.
    pub async fn connect(server: &ServerConfig, retry: RetryConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(server.database_max_connections)
            .connect(&server.database_url)
            .await
            .context("failed to connect to Postgres")?;

        let store = PostgresRetryStore::new(pool.clone());
        store.migrate().await.context("failed to run migrations")?;

        let (cache, publisher) = connect_backend(server).await?;

        let manager = Arc::new(RetryManager::new(
            retry,
            Arc::new(store),
            cache,
            publisher,
            Arc::new(SystemClock),
        ));

        Ok(Self {
            manager,
            guard: PgIdempotencyGuard::new(pool),
        })
    }
}

#[cfg(feature = "redis")]
async fn connect_backend(
    server: &ServerConfig,
) -> anyhow::Result<(Arc<dyn EphemeralCache>, Arc<dyn Publisher>)> {
    use courier_infra::cache::RedisCache;
    use courier_infra::pubsub::RedisPublisher;

    let url = server
        .redis_url
        .as_deref()
        .context("COURIER_REDIS_URL must be set")?;
    let cache = RedisCache::connect(url)
        .await
        .context("failed to connect Redis cache")?;
    let publisher = RedisPublisher::connect(url)
        .await
        .context("failed to connect Redis publisher")?;
    Ok((Arc::new(cache), Arc::new(publisher)))
}

#[cfg(not(feature = "redis"))]
async fn connect_backend(
    _server: &ServerConfig,
) -> anyhow::Result<(Arc<dyn EphemeralCache>, Arc<dyn Publisher>)> {
    use courier_infra::cache::InMemoryCache;
    use courier_transport::InMemoryPublisher;

    warn!("built without the redis feature; using process-local cache and a recording publisher");
    Ok((
        Arc::new(InMemoryCache::default()),
        Arc::new(InMemoryPublisher::new()),
    ))
}

/// A running daemon: background loops plus the uplink subscriber.
pub struct Courier {
    manager: Arc<RetryManager>,
    workers: RetryWorkers,
    uplink: Option<JoinHandle<()>>,
}

impl Courier {
    pub fn start(server: &ServerConfig, services: Services) -> anyhow::Result<Self> {
        let Services { manager, guard } = services;
        let workers = RetryWorkers::spawn(manager.clone());
        let handler = Arc::new(AckHandler::new(manager.clone(), guard));
        let uplink = spawn_uplink(server, handler, workers.cancellation_token())?;

        info!(
            enabled = manager.config().enabled,
            uplink_channel = %server.uplink_channel,
            "courier started"
        );
        Ok(Self {
            manager,
            workers,
            uplink,
        })
    }

    pub fn manager(&self) -> &Arc<RetryManager> {
        &self.manager
    }

    /// Stop the loops and the subscriber; in-flight batches finish first.
    pub async fn shutdown(self) {
        self.workers.shutdown().await;
        if let Some(uplink) = self.uplink {
            if let Err(err) = uplink.await {
                warn!(error = %err, "uplink subscriber ended abnormally");
            }
        }
        info!("courier stopped");
    }
}

#[cfg(feature = "redis")]
fn spawn_uplink(
    server: &ServerConfig,
    handler: Arc<AckHandler<PgIdempotencyGuard>>,
    shutdown: CancellationToken,
) -> anyhow::Result<Option<JoinHandle<()>>> {
    use courier_infra::pubsub::UplinkSubscriber;

    let url = server
        .redis_url
        .as_deref()
        .context("COURIER_REDIS_URL must be set")?;
    let handle = UplinkSubscriber::spawn(url, server.uplink_channel.clone(), handler, shutdown)
        .context("failed to start uplink subscriber")?;
    Ok(Some(handle))
}

#[cfg(not(feature = "redis"))]
fn spawn_uplink(
    _server: &ServerConfig,
    _handler: Arc<AckHandler<PgIdempotencyGuard>>,
    _shutdown: CancellationToken,
) -> anyhow::Result<Option<JoinHandle<()>>> {
    warn!("no uplink transport configured; acknowledgements will not be received");
    Ok(None)
}
