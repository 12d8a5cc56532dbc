//! TTL-bounded resend payloads.
//!
//! The scan path resends from this projection instead of the ledger row, so
//! a resend costs one hash read. Entries are versioned: a hash written by a
//! different schema version is treated as missing rather than guessed at.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use courier_core::{DeviceTarget, MessageId, RetryRecord};

use crate::cache::{CacheError, EphemeralCache};

pub const DATA_KEY_PREFIX: &str = "retry:data:";

/// Current layout version of the cached hash.
pub const PAYLOAD_VERSION: u32 = 1;

const F_VERSION: &str = "v";
const F_DEVICE_ID: &str = "device_id";
const F_DEVICE_MAC: &str = "device_mac";
const F_DEVICE_SN: &str = "device_sn";
const F_NET_TYPE: &str = "net_type";
const F_MESSAGE_TYPE: &str = "message_type";
const F_CONTENT: &str = "content";
const F_MAX_RETRY_COUNT: &str = "max_retry_count";
const F_RETRY_INTERVAL_MS: &str = "retry_interval_ms";

/// Everything needed to resend a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendPayload {
    pub target: DeviceTarget,
    pub message_type: i32,
    pub content: String,
    pub max_retry_count: u32,
    pub retry_interval_ms: u64,
}

impl ResendPayload {
    pub fn from_record(record: &RetryRecord) -> Self {
        Self {
            target: record.target.clone(),
            message_type: record.message_type,
            content: record.content.clone(),
            max_retry_count: record.max_retry_count,
            retry_interval_ms: record.retry_interval_ms,
        }
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        [
            (F_VERSION, PAYLOAD_VERSION.to_string()),
            (F_DEVICE_ID, self.target.device_id.to_string()),
            (F_DEVICE_MAC, self.target.mac.clone()),
            (F_DEVICE_SN, self.target.serial_number.clone()),
            (F_NET_TYPE, self.target.net_type.clone()),
            (F_MESSAGE_TYPE, self.message_type.to_string()),
            (F_CONTENT, self.content.clone()),
            (F_MAX_RETRY_COUNT, self.max_retry_count.to_string()),
            (F_RETRY_INTERVAL_MS, self.retry_interval_ms.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// `Ok(None)` for an empty hash or a different layout version.
    fn from_fields(
        key: &str,
        mut fields: HashMap<String, String>,
    ) -> Result<Option<Self>, CacheError> {
        if fields.get(F_VERSION).map(String::as_str) != Some(PAYLOAD_VERSION.to_string().as_str())
        {
            return Ok(None);
        }

        let mut take = |name: &str| {
            fields.remove(name).ok_or_else(|| CacheError::Malformed {
                key: key.to_string(),
                reason: format!("missing field {name}"),
            })
        };
        let malformed = |name: &str| CacheError::Malformed {
            key: key.to_string(),
            reason: format!("unparsable field {name}"),
        };

        let device_id = take(F_DEVICE_ID)?
            .parse::<i64>()
            .map_err(|_| malformed(F_DEVICE_ID))?;
        let mac = take(F_DEVICE_MAC)?;
        let serial_number = take(F_DEVICE_SN)?;
        let net_type = take(F_NET_TYPE)?;
        let message_type = take(F_MESSAGE_TYPE)?
            .parse::<i32>()
            .map_err(|_| malformed(F_MESSAGE_TYPE))?;
        let content = take(F_CONTENT)?;
        let max_retry_count = take(F_MAX_RETRY_COUNT)?
            .parse::<u32>()
            .map_err(|_| malformed(F_MAX_RETRY_COUNT))?;
        let retry_interval_ms = take(F_RETRY_INTERVAL_MS)?
            .parse::<u64>()
            .map_err(|_| malformed(F_RETRY_INTERVAL_MS))?;

        Ok(Some(Self {
            target: DeviceTarget::new(device_id, mac, serial_number).with_net_type(net_type),
            message_type,
            content,
            max_retry_count,
            retry_interval_ms,
        }))
    }
}

/// Typed accessor over the cache hashes holding [`ResendPayload`]s.
#[derive(Clone)]
pub struct RequestCache {
    cache: Arc<dyn EphemeralCache>,
    ttl: Duration,
}

impl RequestCache {
    pub fn new(cache: Arc<dyn EphemeralCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn key(message_id: &MessageId) -> String {
        format!("{DATA_KEY_PREFIX}{message_id}")
    }

    pub async fn put(
        &self,
        message_id: &MessageId,
        payload: &ResendPayload,
    ) -> Result<(), CacheError> {
        self.cache
            .hash_set(&Self::key(message_id), &payload.to_fields(), self.ttl)
            .await
    }

    pub async fn get(&self, message_id: &MessageId) -> Result<Option<ResendPayload>, CacheError> {
        let key = Self::key(message_id);
        let fields = self.cache.hash_get_all(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        ResendPayload::from_fields(&key, fields)
    }

    pub async fn evict(&self, message_id: &MessageId) -> Result<(), CacheError> {
        self.cache.delete(&Self::key(message_id)).await
    }
}

impl core::fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RequestCache").field("ttl", &self.ttl).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use courier_core::ManualClock;

    fn payload() -> ResendPayload {
        ResendPayload {
            target: DeviceTarget::new(42, "AA:BB", "SN-9").with_net_type("4g"),
            message_type: 1003,
            content: r#"{"OptCode":1003}"#.to_string(),
            max_retry_count: 3,
            retry_interval_ms: 1500,
        }
    }

    #[tokio::test]
    async fn put_then_get_returns_same_payload() {
        let cache = RequestCache::new(Arc::new(InMemoryCache::default()), Duration::from_secs(60));
        let id = MessageId::parse("m-1").unwrap();

        cache.put(&id, &payload()).await.unwrap();
        assert_eq!(cache.get(&id).await.unwrap(), Some(payload()));

        cache.evict(&id).await.unwrap();
        assert_eq!(cache.get(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn foreign_version_reads_as_missing() {
        let inner = Arc::new(InMemoryCache::default());
        let cache = RequestCache::new(inner.clone(), Duration::from_secs(60));
        let id = MessageId::parse("m-1").unwrap();
        let fields = vec![
            ("v".to_string(), "0".to_string()),
            ("content".to_string(), "x".to_string()),
        ];
        inner
            .hash_set(&RequestCache::key(&id), &fields, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.get(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn current_version_with_bad_field_is_malformed() {
        let inner = Arc::new(InMemoryCache::default());
        let cache = RequestCache::new(inner.clone(), Duration::from_secs(60));
        let id = MessageId::parse("m-1").unwrap();
        let mut fields = payload().to_fields();
        for (k, v) in fields.iter_mut() {
            if k == "device_id" {
                *v = "not-a-number".to_string();
            }
        }
        inner
            .hash_set(&RequestCache::key(&id), &fields, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(matches!(cache.get(&id).await, Err(CacheError::Malformed { .. })));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let clock = ManualClock::default();
        let cache = RequestCache::new(
            Arc::new(InMemoryCache::new(Arc::new(clock.clone()))),
            Duration::from_secs(600),
        );
        let id = MessageId::parse("m-1").unwrap();
        cache.put(&id, &payload()).await.unwrap();

        clock.advance(Duration::from_secs(600));
        assert_eq!(cache.get(&id).await.unwrap(), None);
    }
}
