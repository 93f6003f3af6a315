// Configuration management with layered configuration (file, env)

use crate::errors::BridgeError;
use crate::queue::{ConsumerOptions, ProducerOptions};
use crate::scheduler::interval_from_secs;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub producer: ProducerSettings,
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    pub name: String,
    /// Seconds between two drains; fractions allowed
    pub interval_seconds: f64,
    /// Maximum messages drained per tick; unset drains until the queue is empty
    #[serde(default)]
    pub max_batch: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerSettings {
    pub name: String,
    /// Seconds between two publish passes; fractions allowed
    pub interval_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub tracing_endpoint: Option<String>,
}

impl ConsumerSettings {
    pub fn options(&self) -> Result<ConsumerOptions, BridgeError> {
        let mut options =
            ConsumerOptions::new(interval_from_secs(self.interval_seconds)?).with_name(&self.name);
        if let Some(max) = self.max_batch {
            if max == 0 {
                return Err(BridgeError::InvalidBatchSize);
            }
            options = options.with_max_batch(max);
        }
        Ok(options)
    }
}

impl ProducerSettings {
    pub fn options(&self) -> Result<ProducerOptions, BridgeError> {
        Ok(ProducerOptions::new(interval_from_secs(self.interval_seconds)?).with_name(&self.name))
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    ///
    /// Reads `config/default.toml`, then `config/local.toml`, then `APP__*`
    /// environment variables (e.g. `APP__CONSUMER__MAX_BATCH=50`). Missing
    /// files are skipped, and missing sections fall back to their defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    ///
    /// Same layering as [`Settings::load`], rooted at `config_dir`.
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment-specific configuration
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.consumer.name.is_empty() {
            return Err("Consumer name cannot be empty".to_string());
        }
        self.consumer
            .options()
            .map_err(|e| format!("Invalid consumer configuration: {}", e))?;

        if self.producer.name.is_empty() {
            return Err("Producer name cannot be empty".to_string());
        }
        self.producer
            .options()
            .map_err(|e| format!("Invalid producer configuration: {}", e))?;

        if self.broker.exchange.is_empty() {
            return Err("Broker exchange cannot be empty".to_string());
        }
        if self.broker.queue.is_empty() {
            return Err("Broker queue cannot be empty".to_string());
        }

        if self.observability.metrics_port == Some(0) {
            return Err("Metrics port must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            name: "relay-consumer".to_string(),
            interval_seconds: 1.0,
            max_batch: None,
        }
    }
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            name: "relay-producer".to_string(),
            interval_seconds: 1.0,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            exchange: "events".to_string(),
            queue: "events.relay".to_string(),
            routing_key: "heartbeat".to_string(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            consumer: ConsumerSettings::default(),
            producer: ProducerSettings::default(),
            broker: BrokerSettings::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}
