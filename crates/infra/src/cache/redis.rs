//! Redis-backed ephemeral cache (optional).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::instrument;

use super::{CacheError, EphemeralCache};

/// Deletes KEYS[1] only while it holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis implementation of [`EphemeralCache`].
///
/// Uses a [`ConnectionManager`], which multiplexes commands over one
/// connection and reconnects transparently; clones share that connection.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    compare_and_delete: redis::Script,
}

impl core::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connect to Redis (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        Ok(Self {
            conn,
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn command_error(op: &str, err: redis::RedisError) -> CacheError {
    if err.is_connection_dropped() || err.is_io_error() || err.is_timeout() {
        CacheError::Connection(format!("{op} failed: {err}"))
    } else {
        CacheError::Command(format!("{op} failed: {err}"))
    }
}

#[async_trait]
impl EphemeralCache for RedisCache {
    #[instrument(skip(self, fields), fields(field_count = fields.len()), err)]
    async fn hash_set(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut hset = redis::cmd("HSET");
        hset.arg(key);
        for (field, value) in fields {
            hset.arg(field).arg(value);
        }

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .add_command(hset)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| command_error("HSET", e))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async::<_, HashMap<String, String>>(&mut conn)
            .await
            .map_err(|e| command_error("HGETALL", e))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| command_error("DEL", e))
    }

    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| command_error("ZADD", e))
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await
            .map(|removed| removed > 0)
            .map_err(|e| command_error("ZREM", e))
    }

    #[instrument(skip(self), err)]
    async fn sorted_range_by_score(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async::<_, Vec<String>>(&mut conn)
            .await
            .map_err(|e| command_error("ZRANGEBYSCORE", e))
    }

    async fn sorted_score(&self, key: &str, member: &str) -> Result<Option<i64>, CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async::<_, Option<f64>>(&mut conn)
            .await
            .map(|score| score.map(|s| s as i64))
            .map_err(|e| command_error("ZSCORE", e))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map(|reply| reply.is_some())
            .map_err(|e| command_error("SET NX", e))
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        self.compare_and_delete
            .key(key)
            .arg(value)
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map(|deleted| deleted > 0)
            .map_err(|e| command_error("compare-and-delete", e))
    }
}
