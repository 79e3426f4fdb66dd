//! Controller configuration, loaded from a mounted YAML file.

use crate::bus::BusConfig;
use crate::producer::ProducerConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";
pub const CONFIG_PATH_ENV: &str = "COUNTERMEASURE_CONFIG_PATH";

fn default_reporter() -> String {
    "countermeasure".to_string()
}

/// Main controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Event bus tuning
    #[serde(default)]
    pub bus: BusConfig,

    /// Defaults for alert producers
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Controller name on recorded Kubernetes events
    #[serde(default = "default_reporter")]
    pub reporter: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            producer: ProducerConfig::default(),
            reporter: default_reporter(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, anyhow::Error> {
        serde_yaml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Reject values the bus or producers cannot run with.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.bus.workers == 0 {
            anyhow::bail!("bus.workers must be at least 1");
        }
        if self.bus.consumer_buffer == 0 {
            anyhow::bail!("bus.consumerBuffer must be at least 1");
        }
        if !(self.bus.qps.is_finite() && self.bus.qps > 0.0) {
            anyhow::bail!("bus.qps must be a positive number");
        }
        if self.bus.burst == 0 {
            anyhow::bail!("bus.burst must be at least 1");
        }
        if self.bus.base_delay_millis > self.bus.max_delay_seconds.saturating_mul(1000) {
            anyhow::bail!("bus.baseDelayMillis must not exceed bus.maxDelaySeconds");
        }
        if self.producer.poll_interval_seconds == 0 {
            anyhow::bail!("producer.pollIntervalSeconds must be at least 1");
        }
        if self.producer.request_timeout_seconds == 0 {
            anyhow::bail!("producer.requestTimeoutSeconds must be at least 1");
        }
        if self.reporter.trim().is_empty() {
            anyhow::bail!("reporter must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.bus.workers, 4);
        assert_eq!(config.bus.consumer_buffer, 10);
        assert_eq!(config.bus.base_delay_millis, 5);
        assert_eq!(config.bus.max_delay_seconds, 60);
        assert_eq!(config.bus.burst, 100);
        assert_eq!(config.bus.max_retries, None);
        assert_eq!(config.producer.poll_interval_seconds, 30);
        assert!(!config.producer.include_pending);
        assert_eq!(config.producer.publish_retries, 5);
        assert_eq!(config.reporter, "countermeasure");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = ControllerConfig::from_yaml(
            r"
bus:
  workers: 1
  maxRetries: 20
producer:
  pollIntervalSeconds: 15
  includePending: true
",
        )
        .unwrap();

        assert_eq!(config.bus.workers, 1);
        assert_eq!(config.bus.max_retries, Some(20));
        assert_eq!(config.bus.consumer_buffer, 10);
        assert_eq!(config.producer.poll_interval_seconds, 15);
        assert!(config.producer.include_pending);
        assert_eq!(config.producer.request_timeout_seconds, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = ControllerConfig::default();
        config.bus.workers = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.producer.poll_interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(ControllerConfig::from_mounted_file("/nonexistent/config.yaml").is_err());
    }
}
