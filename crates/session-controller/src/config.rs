//! Session controller configuration.
//!
//! Loaded from environment variables; every field has a default so a worker
//! can start with an empty environment.

use std::collections::HashMap;
use std::env;
use thiserror::Error;

/// Default STUN server handed to new connections.
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com";

/// Default STUN port.
pub const DEFAULT_STUN_PORT: u16 = 19302;

/// Default stats collector queue.
pub const DEFAULT_STATS_QUEUE: &str = "stats_handler";

/// Default worker id prefix.
pub const DEFAULT_WORKER_ID_PREFIX: &str = "sc";

#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of this worker (default: generated `sc-<host>-<uuid8>`).
    pub worker_id: String,

    /// STUN server for new connections.
    pub stun_server: String,

    pub stun_port: u16,

    /// UDP port range for media; `0`/`0` lets the engine choose.
    pub min_port: u16,
    pub max_port: u16,

    /// Forward connection statistics to `stats_queue`.
    pub send_stats: bool,

    pub stats_queue: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_id: generate_worker_id(),
            stun_server: DEFAULT_STUN_SERVER.to_string(),
            stun_port: DEFAULT_STUN_PORT,
            min_port: 0,
            max_port: 0,
            send_stats: false,
            stats_queue: DEFAULT_STATS_QUEUE.to_string(),
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
        let worker_id = vars
            .get("SC_WORKER_ID")
            .cloned()
            .unwrap_or_else(generate_worker_id);

        let stun_server = vars
            .get("SC_STUN_SERVER")
            .cloned()
            .unwrap_or_else(|| DEFAULT_STUN_SERVER.to_string());

        let stun_port = parse_port(vars, "SC_STUN_PORT", DEFAULT_STUN_PORT)?;
        let min_port = parse_port(vars, "SC_MIN_PORT", 0)?;
        let max_port = parse_port(vars, "SC_MAX_PORT", 0)?;

        if min_port > max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SC_MIN_PORT ({min_port}) must not exceed SC_MAX_PORT ({max_port})"
            )));
        }

        let send_stats = match vars.get("SC_SEND_STATS").map(String::as_str) {
            None => false,
            Some("true" | "1") => true,
            Some("false" | "0") => false,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "SC_SEND_STATS must be true or false, got {other}"
                )))
            }
        };

        let stats_queue = vars
            .get("SC_STATS_QUEUE")
            .cloned()
            .unwrap_or_else(|| DEFAULT_STATS_QUEUE.to_string());

        Ok(Config {
            worker_id,
            stun_server,
            stun_port,
            min_port,
            max_port,
            send_stats,
            stats_queue,
        })
    }
}

fn parse_port(vars: &HashMap<String, String>, name: &str, default: u16) -> Result<u16, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<u16>().map_err(|e| {
            ConfigError::InvalidValue(format!("{name} must be a port number, got {raw}: {e}"))
        }),
    }
}

fn generate_worker_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let uuid_suffix = uuid::Uuid::new_v4().to_string();
    let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
    format!("{DEFAULT_WORKER_ID_PREFIX}-{hostname}-{short_suffix}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.stun_server, DEFAULT_STUN_SERVER);
        assert_eq!(config.stun_port, DEFAULT_STUN_PORT);
        assert_eq!(config.min_port, 0);
        assert_eq!(config.max_port, 0);
        assert!(!config.send_stats);
        assert_eq!(config.stats_queue, DEFAULT_STATS_QUEUE);
        assert!(config.worker_id.starts_with("sc-"));
    }

    #[test]
    fn test_from_vars_custom_values() {
        let vars = HashMap::from([
            ("SC_WORKER_ID".to_string(), "worker-7".to_string()),
            ("SC_STUN_SERVER".to_string(), "stun.example.org".to_string()),
            ("SC_STUN_PORT".to_string(), "3478".to_string()),
            ("SC_MIN_PORT".to_string(), "30000".to_string()),
            ("SC_MAX_PORT".to_string(), "31000".to_string()),
            ("SC_SEND_STATS".to_string(), "true".to_string()),
            ("SC_STATS_QUEUE".to_string(), "stats_eu".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.worker_id, "worker-7");
        assert_eq!(config.stun_server, "stun.example.org");
        assert_eq!(config.stun_port, 3478);
        assert_eq!(config.min_port, 30000);
        assert_eq!(config.max_port, 31000);
        assert!(config.send_stats);
        assert_eq!(config.stats_queue, "stats_eu");
    }

    #[test]
    fn test_unparseable_port_rejected() {
        for name in ["SC_STUN_PORT", "SC_MIN_PORT", "SC_MAX_PORT"] {
            let vars = HashMap::from([(name.to_string(), "not-a-port".to_string())]);
            let result = Config::from_vars(&vars);
            assert!(
                matches!(&result, Err(ConfigError::InvalidValue(msg)) if msg.contains(name)),
                "{name} should be rejected, got {result:?}"
            );
        }

        let vars = HashMap::from([("SC_MAX_PORT".to_string(), "70000".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let vars = HashMap::from([
            ("SC_MIN_PORT".to_string(), "40000".to_string()),
            ("SC_MAX_PORT".to_string(), "30000".to_string()),
        ]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_invalid_send_stats_rejected() {
        let vars = HashMap::from([("SC_SEND_STATS".to_string(), "maybe".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
