//! Worker configuration
//!
//! Built-in defaults, then an optional config file, then `WORKER_*`
//! environment variables (`__` separates nested keys, e.g.
//! `WORKER_DETECTION__CONTAMINATION=0.02`).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use worker_lib::anomaly::{DetectorConfig, ForestParams, SeverityThresholds};
use worker_lib::stream::{ConsumerConfig, PublisherConfig};
use worker_lib::SlotNaming;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Name reported in logs
    #[serde(default = "default_worker_name")]
    pub worker_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    #[serde(default)]
    pub redis: RedisSection,

    #[serde(default)]
    pub stream: StreamSection,

    #[serde(default)]
    pub consumer: ConsumerSection,

    #[serde(default)]
    pub detection: DetectionSection,

    #[serde(default)]
    pub severity: SeverityThresholds,

    #[serde(default)]
    pub models: ModelsSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    pub url: String,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    pub input: String,
    pub output: String,
    pub payload_field: String,
    /// Approximate trim length of the output stream, 0 disables trimming
    pub output_max_len: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            input: "ml_input".to_string(),
            output: "ml_output".to_string(),
            payload_field: "data".to_string(),
            output_max_len: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerSection {
    pub batch_size: usize,
    pub block_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            batch_size: 50,
            block_timeout_ms: 5_000,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionSection {
    pub min_samples: usize,
    pub contamination: f64,
    pub n_estimators: usize,
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for DetectionSection {
    fn default() -> Self {
        let detector = DetectorConfig::default();
        Self {
            min_samples: detector.min_samples,
            contamination: detector.contamination,
            n_estimators: detector.forest.n_estimators,
            max_samples: detector.forest.max_samples,
            seed: detector.forest.seed,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsSection {
    pub dir: PathBuf,
    pub naming: SlotNaming,
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("models"),
            naming: SlotNaming::MetricType,
        }
    }
}

fn default_worker_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "anomaly-worker".to_string())
}

fn default_api_port() -> u16 {
    8081
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

impl WorkerConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("WORKER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: WorkerConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.consumer.batch_size == 0 {
            bail!("consumer.batch_size must be positive");
        }
        // XREAD BLOCK 0 never returns without input
        if self.consumer.block_timeout_ms == 0 {
            bail!("consumer.block_timeout_ms must be positive");
        }
        if self.consumer.backoff_initial_ms > self.consumer.backoff_max_ms {
            bail!(
                "consumer.backoff_initial_ms ({}) exceeds consumer.backoff_max_ms ({})",
                self.consumer.backoff_initial_ms,
                self.consumer.backoff_max_ms
            );
        }
        if self.stream.input.is_empty() || self.stream.output.is_empty() {
            bail!("stream names must not be empty");
        }
        if self.stream.input == self.stream.output {
            bail!("stream.input and stream.output must differ");
        }
        self.detector_config()
            .validate()
            .context("Invalid detection settings")?;
        self.severity
            .validate()
            .context("Invalid severity settings")?;
        Ok(())
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            min_samples: self.detection.min_samples,
            contamination: self.detection.contamination,
            forest: ForestParams {
                n_estimators: self.detection.n_estimators,
                max_samples: self.detection.max_samples,
                seed: self.detection.seed,
            },
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            input_stream: self.stream.input.clone(),
            payload_field: self.stream.payload_field.clone(),
            batch_size: self.consumer.batch_size,
            block_timeout: Duration::from_millis(self.consumer.block_timeout_ms),
            backoff_initial: Duration::from_millis(self.consumer.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.consumer.backoff_max_ms),
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            output_stream: self.stream.output.clone(),
            payload_field: self.stream.payload_field.clone(),
            max_len: (self.stream.output_max_len > 0).then_some(self.stream.output_max_len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn from_toml(toml: &str) -> Result<WorkerConfig> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(toml.as_bytes()).unwrap();
        WorkerConfig::load(Some(file.path()))
    }

    #[test]
    fn test_defaults() {
        let config = from_toml("").unwrap();

        assert_eq!(config.api_port, 8081);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.stream.input, "ml_input");
        assert_eq!(config.stream.output, "ml_output");
        assert_eq!(config.consumer.batch_size, 50);
        assert_eq!(config.detection.min_samples, 10);
        assert_eq!(config.detection.contamination, 0.05);
        assert_eq!(config.detection.n_estimators, 100);
        assert_eq!(config.detection.seed, 42);
        assert_eq!(config.severity, SeverityThresholds::default());
        assert_eq!(config.models.naming, SlotNaming::MetricType);
        assert_eq!(config.publisher_config().max_len, Some(500));
    }

    #[test]
    fn test_file_overrides() {
        let config = from_toml(
            r#"
            log_format = "pretty"

            [detection]
            contamination = 0.1
            seed = 7

            [severity]
            medium = 0.3
            high = 0.5

            [models]
            dir = "/var/lib/worker/models"
            naming = "job_and_metric_type"

            [stream]
            output_max_len = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.detector_config().contamination, 0.1);
        assert_eq!(config.detector_config().forest.seed, 7);
        // Untouched keys in a partial section keep their defaults
        assert_eq!(config.detector_config().forest.n_estimators, 100);
        assert_eq!(config.severity.high, 0.5);
        assert_eq!(config.models.naming, SlotNaming::JobAndMetricType);
        assert_eq!(config.publisher_config().max_len, None);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(from_toml("[consumer]\nbatch_size = 0").is_err());
        assert!(from_toml("[consumer]\nblock_timeout_ms = 0").is_err());
        assert!(from_toml("[detection]\ncontamination = 0.7").is_err());
        assert!(from_toml("[detection]\nmin_samples = 1").is_err());
        assert!(from_toml("[severity]\nmedium = 0.5\nhigh = 0.2").is_err());
        assert!(from_toml("[consumer]\nbackoff_initial_ms = 5000\nbackoff_max_ms = 100").is_err());
        assert!(from_toml("[stream]\ninput = \"same\"\noutput = \"same\"").is_err());
        assert!(from_toml("log_format = \"xml\"").is_err());
    }

    #[test]
    fn test_consumer_config_conversion() {
        let consumer = from_toml("[consumer]\nblock_timeout_ms = 250")
            .unwrap()
            .consumer_config();
        assert_eq!(consumer.block_timeout, Duration::from_millis(250));
        assert_eq!(consumer.backoff_max, Duration::from_secs(30));
        assert_eq!(consumer.payload_field, "data");
    }
}
