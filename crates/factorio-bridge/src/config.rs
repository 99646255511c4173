//! Bridge configuration

use crate::backoff::BackoffConfig;
use crate::rcon::MAX_BODY_LEN;
use agent_bridge_core::{BridgeError, Result, ServerEndpoint};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default remote interface registered by the game-side mod
pub const DEFAULT_REMOTE_INTERFACE: &str = "agent_bridge";

/// Configuration for the agent bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Byte budget for one rendered request, kept below the RCON maximum
    pub payload_ceiling: usize,
    /// Sessions per server
    pub pool_size: usize,
    /// How long to wait for a free session
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,
    /// How long one batch may take from send to complete response
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// TCP connect and authentication timeout
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Reconnect backoff
    pub backoff: BackoffConfig,
    /// How long a server stays marked unreachable
    #[serde(with = "duration_ms")]
    pub unreachable_cooldown: Duration,
    /// Default deadline for tickets the bridge registers itself
    #[serde(with = "duration_ms")]
    pub ticket_timeout: Duration,
    /// Capacity of each agent's resolved-ticket channel
    pub notify_capacity: usize,
    /// Remote interface name the mod registers
    pub remote_interface: String,
    /// Known servers
    pub servers: Vec<ServerEndpoint>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            payload_ceiling: 3800,
            pool_size: 2,
            acquire_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
            unreachable_cooldown: Duration::from_secs(30),
            ticket_timeout: Duration::from_secs(60),
            notify_capacity: 64,
            remote_interface: DEFAULT_REMOTE_INTERFACE.to_string(),
            servers: vec![ServerEndpoint::new("local", "127.0.0.1:27015", "factorio")],
        }
    }
}

impl BridgeConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: BridgeConfig = serde_json::from_str(&text).map_err(|e| {
            BridgeError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.payload_ceiling == 0 || self.payload_ceiling > MAX_BODY_LEN {
            return Err(BridgeError::InvalidConfig(format!(
                "payload_ceiling must be between 1 and {}, got {}",
                MAX_BODY_LEN, self.payload_ceiling
            )));
        }
        if self.pool_size == 0 {
            return Err(BridgeError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.notify_capacity == 0 {
            return Err(BridgeError::InvalidConfig(
                "notify_capacity must be at least 1".to_string(),
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(BridgeError::InvalidConfig(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.backoff.multiplier
            )));
        }
        if self.remote_interface.is_empty() {
            return Err(BridgeError::InvalidConfig(
                "remote_interface must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serialize durations as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.payload_ceiling, 3800);
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.servers[0].address, "127.0.0.1:27015");
        assert_eq!(config.servers[0].password, "factorio");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "pool_size": 3,
            "acquire_timeout": 1500,
            "backoff": {"max_retries": 2},
            "servers": [{"id": "a", "address": "10.0.0.5:27015", "password": "pw"}]
        }"#;
        let config: BridgeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.acquire_timeout, Duration::from_millis(1500));
        assert_eq!(config.backoff.max_retries, 2);
        assert_eq!(config.backoff.initial_delay, Duration::from_millis(250));
        assert_eq!(config.payload_ceiling, 3800);
        assert_eq!(config.servers[0].id.as_str(), "a");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = BridgeConfig {
            payload_ceiling: 5000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BridgeConfig {
            pool_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_missing_file() {
        let err = BridgeConfig::from_json_file("/nonexistent/bridge.json").unwrap_err();
        assert_eq!(err.code(), agent_bridge_core::ErrorCode::InvalidConfig);
    }
}
