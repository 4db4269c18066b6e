//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

use crate::telemetry::LogFormat;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Capacity of each per-experiment broadcast channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How often the duration-expiry sweep runs
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,

    /// How often idle live channels are released
    #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            sweep_interval: default_sweep_interval(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format (json or pretty)
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_channel_capacity() -> usize {
    256
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("VANTAGE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("VANTAGE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.engine.channel_capacity, 256);
        assert_eq!(config.engine.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_duration_fields_accept_humantime() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "channel_capacity": 64,
            "sweep_interval": "10s",
            "cleanup_interval": "2m"
        }))
        .unwrap();
        assert_eq!(config.sweep_interval, Duration::from_secs(10));
        assert_eq!(config.cleanup_interval, Duration::from_secs(120));
    }
}
