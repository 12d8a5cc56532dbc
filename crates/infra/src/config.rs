//! Retry engine configuration loaded from environment variables.

use std::time::Duration;

/// Tunables for the retry engine.
///
/// Per-submission `max_retry_count` / `retry_interval` overrides take
/// precedence over the defaults here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// When false, submissions are accepted as no-ops and no loops run.
    pub enabled: bool,
    pub max_retry_count: u32,
    pub retry_interval: Duration,
    pub scan_interval: Duration,
    /// Upper bound on due items read per scan.
    pub max_batch_size: usize,
    /// How long a scan waits for the scan lease before skipping the tick.
    pub lock_wait: Duration,
    pub lock_lease: Duration,
    /// TTL of the cached resend payload.
    pub cache_expire: Duration,
    /// Age after which a still-pending record is abandoned by the sweep.
    pub abandon_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retry_count: 2,
            retry_interval: Duration::from_millis(1000),
            scan_interval: Duration::from_millis(1000),
            max_batch_size: 100,
            lock_wait: Duration::from_millis(100),
            lock_lease: Duration::from_millis(2000),
            cache_expire: Duration::from_secs(10 * 60),
            abandon_timeout: Duration::from_millis(120_000),
            cleanup_interval: Duration::from_millis(300_000),
        }
    }
}

impl RetryConfig {
    /// Load configuration from environment variables.
    ///
    /// All optional; unset variables keep their defaults:
    /// - `COURIER_RETRY_ENABLED`: "true"/"1" or "false"/"0" (default: true)
    /// - `COURIER_RETRY_MAX_RETRY_COUNT` (default: 2)
    /// - `COURIER_RETRY_INTERVAL_MS` (default: 1000)
    /// - `COURIER_RETRY_SCAN_INTERVAL_MS` (default: 1000)
    /// - `COURIER_RETRY_MAX_BATCH_SIZE` (default: 100)
    /// - `COURIER_RETRY_LOCK_WAIT_MS` (default: 100)
    /// - `COURIER_RETRY_LOCK_LEASE_MS` (default: 2000)
    /// - `COURIER_RETRY_CACHE_EXPIRE_MINUTES` (default: 10)
    /// - `COURIER_RETRY_ABANDON_TIMEOUT_MS` (default: 120000)
    /// - `COURIER_RETRY_CLEANUP_INTERVAL_MS` (default: 300000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let enabled = match std::env::var("COURIER_RETRY_ENABLED") {
            Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    return Err(ConfigError::Invalid(
                        "COURIER_RETRY_ENABLED",
                        "must be true/false or 1/0",
                    ));
                }
            },
            Err(_) => defaults.enabled,
        };

        let max_retry_count = parse_var(
            "COURIER_RETRY_MAX_RETRY_COUNT",
            defaults.max_retry_count,
            "must be a non-negative integer",
        )?;
        let retry_interval = millis_var("COURIER_RETRY_INTERVAL_MS", defaults.retry_interval)?;
        let scan_interval = millis_var("COURIER_RETRY_SCAN_INTERVAL_MS", defaults.scan_interval)?;
        let max_batch_size = parse_var(
            "COURIER_RETRY_MAX_BATCH_SIZE",
            defaults.max_batch_size,
            "must be a positive integer",
        )?;
        let lock_wait = millis_var("COURIER_RETRY_LOCK_WAIT_MS", defaults.lock_wait)?;
        let lock_lease = millis_var("COURIER_RETRY_LOCK_LEASE_MS", defaults.lock_lease)?;
        let cache_expire_minutes: u64 = parse_var(
            "COURIER_RETRY_CACHE_EXPIRE_MINUTES",
            defaults.cache_expire.as_secs() / 60,
            "must be a positive number of minutes",
        )?;
        let abandon_timeout =
            millis_var("COURIER_RETRY_ABANDON_TIMEOUT_MS", defaults.abandon_timeout)?;
        let cleanup_interval =
            millis_var("COURIER_RETRY_CLEANUP_INTERVAL_MS", defaults.cleanup_interval)?;

        let cache_expire = cache_expire_minutes
            .checked_mul(60)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .ok_or(ConfigError::Invalid(
                "COURIER_RETRY_CACHE_EXPIRE_MINUTES",
                "must be a positive number of minutes",
            ))?;

        if max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "COURIER_RETRY_MAX_BATCH_SIZE",
                "must be a positive integer",
            ));
        }
        if scan_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "COURIER_RETRY_SCAN_INTERVAL_MS",
                "must be greater than zero",
            ));
        }
        if cleanup_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "COURIER_RETRY_CLEANUP_INTERVAL_MS",
                "must be greater than zero",
            ));
        }

        Ok(Self {
            enabled,
            max_retry_count,
            retry_interval,
            scan_interval,
            max_batch_size,
            lock_wait,
            lock_lease,
            cache_expire,
            abandon_timeout,
            cleanup_interval,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    key: &'static str,
    default: T,
    hint: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().map_err(|_| ConfigError::Invalid(key, hint)),
        Err(_) => Ok(default),
    }
}

fn millis_var(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_var(key, default_ms, "must be a non-negative number of milliseconds")
        .map(Duration::from_millis)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::env;
    use std::sync::Mutex;

    // Serializes tests that touch process environment.
    pub static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Sets env vars for a test and restores them on drop.
    pub struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        pub fn new() -> Self {
            Self { vars: Vec::new() }
        }

        pub fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: callers hold ENV_MUTEX
            unsafe { env::set_var(key, value) };
        }

        pub fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: callers hold ENV_MUTEX
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: callers hold ENV_MUTEX
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_env::{ENV_MUTEX, EnvGuard};
    use super::*;

    const ALL_KEYS: &[&str] = &[
        "COURIER_RETRY_ENABLED",
        "COURIER_RETRY_MAX_RETRY_COUNT",
        "COURIER_RETRY_INTERVAL_MS",
        "COURIER_RETRY_SCAN_INTERVAL_MS",
        "COURIER_RETRY_MAX_BATCH_SIZE",
        "COURIER_RETRY_LOCK_WAIT_MS",
        "COURIER_RETRY_LOCK_LEASE_MS",
        "COURIER_RETRY_CACHE_EXPIRE_MINUTES",
        "COURIER_RETRY_ABANDON_TIMEOUT_MS",
        "COURIER_RETRY_CLEANUP_INTERVAL_MS",
    ];

    fn clean_env() -> EnvGuard {
        let mut guard = EnvGuard::new();
        for key in ALL_KEYS {
            guard.remove(key);
        }
        guard
    }

    #[test]
    fn test_defaults_when_unset() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = clean_env();

        let config = RetryConfig::from_env().unwrap();

        assert_eq!(config, RetryConfig::default());
        assert_eq!(config.max_retry_count, 2);
        assert_eq!(config.cache_expire, Duration::from_secs(600));
        assert_eq!(config.abandon_timeout, Duration::from_millis(120_000));
    }

    #[test]
    fn test_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let mut guard = clean_env();
        guard.set("COURIER_RETRY_ENABLED", "false");
        guard.set("COURIER_RETRY_MAX_RETRY_COUNT", "5");
        guard.set("COURIER_RETRY_INTERVAL_MS", "250");
        guard.set("COURIER_RETRY_CACHE_EXPIRE_MINUTES", "1");

        let config = RetryConfig::from_env().unwrap();

        assert!(!config.enabled);
        assert_eq!(config.max_retry_count, 5);
        assert_eq!(config.retry_interval, Duration::from_millis(250));
        assert_eq!(config.cache_expire, Duration::from_secs(60));
        assert_eq!(config.scan_interval, Duration::from_millis(1000));
    }

    #[test]
    fn test_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let mut guard = clean_env();
        guard.set("COURIER_RETRY_MAX_RETRY_COUNT", "-1");

        let err = RetryConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("COURIER_RETRY_MAX_RETRY_COUNT", _)));

        guard.set("COURIER_RETRY_MAX_RETRY_COUNT", "2");
        guard.set("COURIER_RETRY_MAX_BATCH_SIZE", "0");
        assert!(matches!(
            RetryConfig::from_env(),
            Err(ConfigError::Invalid("COURIER_RETRY_MAX_BATCH_SIZE", _))
        ));

        guard.set("COURIER_RETRY_MAX_BATCH_SIZE", "10");
        for minutes in ["0", "18446744073709551615"] {
            guard.set("COURIER_RETRY_CACHE_EXPIRE_MINUTES", minutes);
            assert!(matches!(
                RetryConfig::from_env(),
                Err(ConfigError::Invalid("COURIER_RETRY_CACHE_EXPIRE_MINUTES", _))
            ));
        }

        guard.set("COURIER_RETRY_CACHE_EXPIRE_MINUTES", "10");
        guard.set("COURIER_RETRY_ENABLED", "maybe");
        assert!(matches!(
            RetryConfig::from_env(),
            Err(ConfigError::Invalid("COURIER_RETRY_ENABLED", _))
        ));
    }
}
