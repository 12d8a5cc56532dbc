//! Process-level settings (connection strings, channels).
//!
//! Engine tunables live in [`courier_infra::RetryConfig`].

use courier_infra::ConfigError;

pub const DEFAULT_UPLINK_CHANNEL: &str = "NTZ/uplink";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub database_url: String,
    /// Required when built with the `redis` feature.
    pub redis_url: Option<String>,
    /// Channel devices publish acknowledgements on.
    pub uplink_channel: String,
    /// Pool size for the ledger database.
    pub database_max_connections: u32,
}

impl ServerConfig {
    /// Load from the process environment:
    /// - `COURIER_DATABASE_URL` (required)
    /// - `COURIER_REDIS_URL` (required with the `redis` feature)
    /// - `COURIER_UPLINK_CHANNEL` (default: `NTZ/uplink`)
    /// - `COURIER_DATABASE_MAX_CONNECTIONS` (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url =
            non_empty("COURIER_DATABASE_URL").ok_or(ConfigError::Missing("COURIER_DATABASE_URL"))?;

        let redis_url = non_empty("COURIER_REDIS_URL");
        if cfg!(feature = "redis") && redis_url.is_none() {
            return Err(ConfigError::Missing("COURIER_REDIS_URL"));
        }

        let uplink_channel = non_empty("COURIER_UPLINK_CHANNEL")
            .unwrap_or_else(|| DEFAULT_UPLINK_CHANNEL.to_string());

        let database_max_connections = match non_empty("COURIER_DATABASE_MAX_CONNECTIONS") {
            Some(v) => v
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::Invalid(
                    "COURIER_DATABASE_MAX_CONNECTIONS",
                    "must be a positive integer",
                ))?,
            None => 10,
        };

        Ok(Self {
            database_url,
            redis_url,
            uplink_channel,
            database_max_connections,
        })
    }
}
