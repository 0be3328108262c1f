//! Anomaly detection for sensor readings
//!
//! This module provides:
//! - An isolation forest over scalar or low-dimensional samples
//! - Per-metric fitting with a contamination-derived decision threshold
//! - Severity classification of anomaly scores

mod detector;
mod isolation_forest;
mod severity;

pub use detector::{
    DetectorConfig, FittedModel, MetricDetector, DEFAULT_CONTAMINATION, DEFAULT_MIN_SAMPLES,
};
pub use isolation_forest::{average_path_length, ForestParams, IsolationForest, IsolationTree};
pub use severity::{SeverityClassifier, SeverityThresholds};
