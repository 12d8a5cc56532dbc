//! Ephemeral key-value / sorted-set cache.
//!
//! The narrow subset of Redis the engine needs: TTL'd hashes (resend
//! payloads), one sorted set (delay queue) and set-if-absent strings (lease
//! locks). Nothing stored here is authoritative; the retry store is.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Connection(String),

    #[error("cache command error: {0}")]
    Command(String),

    #[error("malformed cache entry {key}: {reason}")]
    Malformed { key: String, reason: String },

    #[error("cache state poisoned")]
    Poisoned,
}

#[async_trait]
pub trait EphemeralCache: Send + Sync {
    /// Write hash fields and (re)set the key's TTL in one step.
    async fn hash_set(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// All fields of a hash; empty when the key is missing or expired.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Add or re-score a sorted-set member.
    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> Result<(), CacheError>;

    /// Remove a member. Returns true only for the caller that actually removed
    /// it, which is what makes removal usable as an atomic claim.
    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    /// Members with `score <= max`, lowest score first, at most `limit`.
    async fn sorted_range_by_score(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>, CacheError>;

    async fn sorted_score(&self, key: &str, member: &str) -> Result<Option<i64>, CacheError>;

    /// `SET key value NX PX ttl`. Returns whether the key was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, CacheError>;

    /// Delete `key` only while it still holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, CacheError>;
}

#[async_trait]
impl<C> EphemeralCache for Arc<C>
where
    C: EphemeralCache + ?Sized,
{
    async fn hash_set(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        (**self).hash_set(key, fields, ttl).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        (**self).hash_get_all(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        (**self).delete(key).await
    }

    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> Result<(), CacheError> {
        (**self).sorted_add(key, member, score).await
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        (**self).sorted_remove(key, member).await
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>, CacheError> {
        (**self).sorted_range_by_score(key, max, limit).await
    }

    async fn sorted_score(&self, key: &str, member: &str) -> Result<Option<i64>, CacheError> {
        (**self).sorted_score(key, member).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        (**self).delete_if_equals(key, value).await
    }
}
