//! Runtime configuration
//!
//! Every section has sensible defaults; a host app may override any subset
//! from a JSON document.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Double Ratchet limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatchetConfig {
    /// Total cached skipped message keys per session; oldest are evicted first
    pub max_skipped_keys: usize,
    /// Largest gap accepted within one receiving chain
    pub max_skip_per_chain: u32,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            max_skipped_keys: 1000,
            max_skip_per_chain: 1000,
        }
    }
}

/// Session manager and pre-key policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Signed pre-key rotation period
    pub rotation_interval_ms: u64,
    /// Rotated-out signed pre-keys still accepted for late handshakes
    pub retained_signed_pre_keys: usize,
    pub one_time_pre_key_pool: u32,
    /// Pool is refilled once it drops below this
    pub one_time_pre_key_low_water: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rotation_interval_ms: 7 * DAY_MS,
            retained_signed_pre_keys: 2,
            one_time_pre_key_pool: 10,
            one_time_pre_key_low_water: 5,
        }
    }
}

impl SessionConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_millis(self.rotation_interval_ms)
    }
}

/// Offline delivery queue policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Non-terminal entries allowed per peer
    pub max_per_peer: usize,
    pub default_max_retries: u32,
    pub default_ttl_ms: u64,
    /// Backoff step table indexed by retry count; the last step repeats
    pub retry_delays_ms: Vec<u64>,
    pub retry_tick_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_per_peer: 500,
            default_max_retries: 6,
            default_ttl_ms: 7 * DAY_MS,
            retry_delays_ms: vec![1_000, 1_000, 2_000, 5_000, 10_000, 30_000],
            retry_tick_ms: 1_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

/// Aggregate configuration for the whole core
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub ratchet: RatchetConfig,
    pub session: SessionConfig,
    pub queue: QueueConfig,
}

impl CoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ratchet.max_skipped_keys == 0 {
            return Err(ConfigError::Invalid("ratchet.max_skipped_keys must be > 0"));
        }
        if self.queue.max_per_peer == 0 {
            return Err(ConfigError::Invalid("queue.max_per_peer must be > 0"));
        }
        if self.queue.retry_delays_ms.is_empty() {
            return Err(ConfigError::Invalid("queue.retry_delays_ms must not be empty"));
        }
        if self.queue.retry_tick_ms == 0 || self.queue.cleanup_interval_ms == 0 {
            return Err(ConfigError::Invalid("queue sweep intervals must be > 0"));
        }
        if self.session.rotation_interval_ms == 0 {
            return Err(ConfigError::Invalid("session.rotation_interval_ms must be > 0"));
        }
        if self.session.one_time_pre_key_low_water > self.session.one_time_pre_key_pool {
            return Err(ConfigError::Invalid("one_time_pre_key_low_water exceeds pool size"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ratchet.max_skipped_keys, 1000);
        assert_eq!(config.queue.retry_delays_ms, vec![1_000, 1_000, 2_000, 5_000, 10_000, 30_000]);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CoreConfig::from_json_str(r#"{"queue":{"max_per_peer":3}}"#).unwrap();
        assert_eq!(config.queue.max_per_peer, 3);
        assert_eq!(config.queue.default_max_retries, 6);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = CoreConfig::from_json_str(r#"{"queue":{"retry_delays_ms":[]}}"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        assert!(matches!(CoreConfig::from_json_str("not json"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.json");
        std::fs::write(&path, r#"{"ratchet":{"max_skipped_keys":50}}"#).unwrap();

        let config = CoreConfig::from_file(&path).unwrap();
        assert_eq!(config.ratchet.max_skipped_keys, 50);
        assert!(matches!(CoreConfig::from_file(dir.path().join("missing.json")), Err(ConfigError::Io(_))));
    }
}
