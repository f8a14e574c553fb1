//! Coordinator configuration.
//!
//! Loaded from environment variables; every field has a default.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default keepalive interval in milliseconds.
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 5_000;

/// Default room id prefix.
pub const DEFAULT_ROOM_ID_PREFIX: &str = "room";

#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of this room (default: generated `room-<host>-<uuid8>`).
    pub room_id: String,

    /// How often every mapped publisher's worker is pinged.
    pub keepalive_interval: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            room_id: generate_room_id(),
            keepalive_interval: Duration::from_millis(DEFAULT_KEEPALIVE_INTERVAL_MS),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let room_id = vars
            .get("ROOM_ID")
            .cloned()
            .unwrap_or_else(generate_room_id);

        let keepalive_ms = match vars.get("ROOM_KEEPALIVE_INTERVAL_MS") {
            None => DEFAULT_KEEPALIVE_INTERVAL_MS,
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue(format!(
                    "ROOM_KEEPALIVE_INTERVAL_MS must be a number of milliseconds: {e}"
                ))
            })?,
        };

        if keepalive_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "ROOM_KEEPALIVE_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        Ok(Config {
            room_id,
            keepalive_interval: Duration::from_millis(keepalive_ms),
        })
    }
}

fn generate_room_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let uuid_suffix = uuid::Uuid::new_v4().to_string();
    let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
    format!("{DEFAULT_ROOM_ID_PREFIX}-{hostname}-{short_suffix}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert!(config.room_id.starts_with("room-"));
        assert_eq!(config.keepalive_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_from_vars_custom_values() {
        let vars = HashMap::from([
            ("ROOM_ID".to_string(), "lobby".to_string()),
            ("ROOM_KEEPALIVE_INTERVAL_MS".to_string(), "250".to_string()),
        ]);

        let config = Config::from_vars(&vars).unwrap();

        assert_eq!(config.room_id, "lobby");
        assert_eq!(config.keepalive_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_zero_keepalive_rejected() {
        let vars = HashMap::from([("ROOM_KEEPALIVE_INTERVAL_MS".to_string(), "0".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_unparseable_keepalive_rejected() {
        let vars = HashMap::from([("ROOM_KEEPALIVE_INTERVAL_MS".to_string(), "5s".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_generated_room_ids_are_unique() {
        assert_ne!(generate_room_id(), generate_room_id());
    }
}
