//! In-memory cache for tests/dev.
//!
//! Expiry is evaluated lazily against the injected [`Clock`], so tests can
//! expire payloads and leases by advancing a `ManualClock`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use courier_core::{Clock, SystemClock};

use super::{CacheError, EphemeralCache};

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at_ms: i64,
}

#[derive(Debug, Default)]
struct State {
    hashes: HashMap<String, Expiring<HashMap<String, String>>>,
    sorted: HashMap<String, HashMap<String, i64>>,
    strings: HashMap<String, Expiring<String>>,
}

/// In-memory implementation of [`EphemeralCache`].
#[derive(Debug)]
pub struct InMemoryCache {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, CacheError> {
        self.state.lock().map_err(|_| CacheError::Poisoned)
    }

    fn expiry(&self, ttl: Duration) -> i64 {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_millis().saturating_add(ttl_ms)
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl EphemeralCache for InMemoryCache {
    async fn hash_set(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let now = self.clock.now_millis();
        let expires_at_ms = self.expiry(ttl);
        let mut state = self.lock()?;

        let entry = state
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Expiring {
                value: HashMap::new(),
                expires_at_ms,
            });
        if entry.expires_at_ms <= now {
            entry.value.clear();
        }
        entry
            .value
            .extend(fields.iter().map(|(f, v)| (f.clone(), v.clone())));
        entry.expires_at_ms = expires_at_ms;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let now = self.clock.now_millis();
        let mut state = self.lock()?;
        match state.hashes.get(key) {
            Some(entry) if entry.expires_at_ms > now => Ok(entry.value.clone()),
            Some(_) => {
                state.hashes.remove(key);
                Ok(HashMap::new())
            }
            None => Ok(HashMap::new()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut state = self.lock()?;
        state.hashes.remove(key);
        state.sorted.remove(key);
        state.strings.remove(key);
        Ok(())
    }

    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> Result<(), CacheError> {
        let mut state = self.lock()?;
        state
            .sorted
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut state = self.lock()?;
        Ok(state
            .sorted
            .get_mut(key)
            .is_some_and(|set| set.remove(member).is_some()))
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>, CacheError> {
        let state = self.lock()?;
        let Some(set) = state.sorted.get(key) else {
            return Ok(Vec::new());
        };

        let mut due: Vec<(&String, i64)> = set
            .iter()
            .filter(|(_, score)| **score <= max)
            .map(|(member, score)| (member, *score))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        Ok(due
            .into_iter()
            .take(limit)
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn sorted_score(&self, key: &str, member: &str) -> Result<Option<i64>, CacheError> {
        let state = self.lock()?;
        Ok(state.sorted.get(key).and_then(|set| set.get(member).copied()))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = self.clock.now_millis();
        let expires_at_ms = self.expiry(ttl);
        let mut state = self.lock()?;

        if let Some(existing) = state.strings.get(key) {
            if existing.expires_at_ms > now {
                return Ok(false);
            }
        }
        state.strings.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at_ms,
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        let now = self.clock.now_millis();
        let mut state = self.lock()?;
        let holds = state
            .strings
            .get(key)
            .is_some_and(|e| e.expires_at_ms > now && e.value == value);
        if holds {
            state.strings.remove(key);
        }
        Ok(holds)
    }
}
