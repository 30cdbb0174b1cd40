//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CORBEL_CONFIG)
//! 3. Environment variables

use crate::error::ConfigError;
use corbel_transport::{BackoffConfig, ReadStrategy, TransportConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Transport tunables.
    pub transport: TransportSettings,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CORBEL_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.transport.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.fragment_threshold == 0 {
            return Err(ConfigError::Validation(
                "fragment_threshold must be positive".to_string(),
            ));
        }
        if self.transport.max_message_size <= self.transport.fragment_threshold {
            return Err(ConfigError::Validation(
                "max_message_size must exceed fragment_threshold".to_string(),
            ));
        }
        Ok(())
    }

    /// The transport configuration this deployment selects.
    pub fn transport(&self) -> TransportConfig {
        self.transport.to_transport_config()
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent accepted connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{}", corbel_protocol::DEFAULT_PORT)
                .parse()
                .unwrap(),
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("CORBEL_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("CORBEL_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }
}

/// Serializable mirror of the transport tunable surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Read buffer size in bytes.
    pub read_buffer_size: usize,
    /// Hard cap on one message (header + body) in bytes.
    pub max_message_size: usize,
    /// Payloads above this size are fragmented.
    pub fragment_threshold: usize,
    /// Reply wait timeout in seconds.
    pub response_timeout_secs: u64,
    /// Connect timeout per endpoint attempt in seconds.
    pub connect_timeout_secs: u64,
    /// Mid-message progress timeout in seconds.
    pub progress_timeout_secs: u64,
    /// First retry wait in milliseconds.
    pub backoff_initial_ms: u64,
    /// Retry wait multiplier (x100; 150 = 1.5x).
    pub backoff_multiplier_pct: u32,
    /// Cap on any single retry wait in milliseconds.
    pub backoff_max_wait_ms: u64,
    /// Total retry budget per invocation in seconds.
    pub backoff_total_budget_secs: u64,
    /// Read strategy for new connections.
    pub read_strategy: ReadStrategySetting,
    /// Connection-cache high-water mark.
    pub cache_high_water_mark: usize,
    /// Connections reclaimed per eviction batch.
    pub cache_reclaim_batch: usize,
    /// Worker tasks consuming the dispatch queue.
    pub worker_count: usize,
    /// Bound of the dispatch queue.
    pub queue_depth: usize,
}

/// Read strategy, spelled for YAML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadStrategySetting {
    #[default]
    Optimized,
    Dedicated,
}

impl From<ReadStrategySetting> for ReadStrategy {
    fn from(v: ReadStrategySetting) -> Self {
        match v {
            ReadStrategySetting::Optimized => ReadStrategy::Optimized,
            ReadStrategySetting::Dedicated => ReadStrategy::Dedicated,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        let defaults = TransportConfig::default();
        Self {
            read_buffer_size: defaults.read_buffer_size,
            max_message_size: defaults.max_message_size,
            fragment_threshold: defaults.fragment_threshold,
            response_timeout_secs: defaults.response_timeout.as_secs(),
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
            progress_timeout_secs: defaults.progress_timeout.as_secs(),
            backoff_initial_ms: defaults.backoff.initial_wait.as_millis() as u64,
            backoff_multiplier_pct: defaults.backoff.multiplier_pct,
            backoff_max_wait_ms: defaults.backoff.max_wait.as_millis() as u64,
            backoff_total_budget_secs: defaults.backoff.total_budget.as_secs(),
            read_strategy: ReadStrategySetting::Optimized,
            cache_high_water_mark: defaults.cache_high_water_mark,
            cache_reclaim_batch: defaults.cache_reclaim_batch,
            worker_count: defaults.worker_count,
            queue_depth: defaults.queue_depth,
        }
    }
}

impl TransportSettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("CORBEL_READ_BUFFER_SIZE") {
            if let Ok(n) = size.parse() {
                self.read_buffer_size = n;
            }
        }

        if let Ok(size) = std::env::var("CORBEL_MAX_MESSAGE_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_message_size = n;
            }
        }

        if let Ok(size) = std::env::var("CORBEL_FRAGMENT_THRESHOLD") {
            if let Ok(n) = size.parse() {
                self.fragment_threshold = n;
            }
        }

        if let Ok(timeout) = std::env::var("CORBEL_RESPONSE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.response_timeout_secs = secs;
            }
        }

        if let Ok(strategy) = std::env::var("CORBEL_READ_STRATEGY") {
            self.read_strategy = match strategy.to_lowercase().as_str() {
                "dedicated" => ReadStrategySetting::Dedicated,
                _ => ReadStrategySetting::Optimized,
            };
        }

        if let Ok(hwm) = std::env::var("CORBEL_CACHE_HWM") {
            if let Ok(n) = hwm.parse() {
                self.cache_high_water_mark = n;
            }
        }

        if let Ok(workers) = std::env::var("CORBEL_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.worker_count = n;
            }
        }

        if let Ok(depth) = std::env::var("CORBEL_QUEUE_DEPTH") {
            if let Ok(n) = depth.parse() {
                self.queue_depth = n;
            }
        }
    }

    fn to_transport_config(&self) -> TransportConfig {
        TransportConfig::new()
            .with_read_buffer_size(self.read_buffer_size)
            .with_max_message_size(self.max_message_size)
            .with_fragment_threshold(self.fragment_threshold)
            .with_response_timeout(Duration::from_secs(self.response_timeout_secs))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .with_progress_timeout(Duration::from_secs(self.progress_timeout_secs))
            .with_backoff(BackoffConfig {
                initial_wait: Duration::from_millis(self.backoff_initial_ms),
                multiplier_pct: self.backoff_multiplier_pct,
                max_wait: Duration::from_millis(self.backoff_max_wait_ms),
                total_budget: Duration::from_secs(self.backoff_total_budget_secs),
            })
            .with_read_strategy(self.read_strategy.into())
            .with_cache_high_water_mark(self.cache_high_water_mark)
            .with_cache_reclaim_batch(self.cache_reclaim_batch)
            .with_worker_count(self.worker_count)
            .with_queue_depth(self.queue_depth)
    }
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), corbel_protocol::DEFAULT_PORT);
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(config.transport.read_strategy, ReadStrategySetting::Optimized);
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(
            parsed.transport.fragment_threshold,
            config.transport.fragment_threshold
        );
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let parsed: Config = serde_yaml::from_str(
            "network:\n  bind_addr: \"0.0.0.0:7000\"\ntransport:\n  worker_count: 8\n",
        )
        .unwrap();
        assert_eq!(parsed.network.bind_addr.port(), 7000);
        assert_eq!(parsed.transport.worker_count, 8);
        // untouched fields fall back to defaults
        assert_eq!(parsed.network.max_connections, 1000);
    }

    #[test]
    fn test_validation_rejects_inverted_sizes() {
        let mut config = Config::default();
        config.transport.max_message_size = 1024;
        config.transport.fragment_threshold = 4096;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_conversion() {
        let mut settings = TransportSettings::default();
        settings.response_timeout_secs = 7;
        settings.read_strategy = ReadStrategySetting::Dedicated;
        let transport = settings.to_transport_config();
        assert_eq!(transport.response_timeout, Duration::from_secs(7));
        assert_eq!(transport.read_strategy, ReadStrategy::Dedicated);
    }
}
