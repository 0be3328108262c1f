//! Core data models for the anomaly worker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named scalar channel, e.g. `temperature_2m`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricType(String);

impl MetricType {
    pub const TEMPERATURE: &'static str = "temperature_2m";
    pub const RELATIVE_HUMIDITY: &'static str = "relative_humidity_2m";
    pub const PRECIPITATION: &'static str = "precipitation";
    pub const WIND_SPEED: &'static str = "wind_speed_10m";
    pub const DEW_POINT: &'static str = "dew_point_2m";

    /// Metric types the upstream weather feed produces
    pub const KNOWN: [&'static str; 5] = [
        Self::TEMPERATURE,
        Self::RELATIVE_HUMIDITY,
        Self::PRECIPITATION,
        Self::WIND_SPEED,
        Self::DEW_POINT,
    ];

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MetricType {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for MetricType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A single sensor reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub metric_type: MetricType,
    pub value: f64,
}

/// One job decoded from the input stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub location: String,
    #[serde(rename = "metrics")]
    pub samples: Vec<MetricSample>,
}

/// Per-sample verdict of the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleLabel {
    Normal,
    Anomalous,
}

/// Detector output for one metric type, aligned 1:1 with its input samples
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub metric_type: MetricType,
    pub labels: Vec<SampleLabel>,
    pub scores: Vec<f64>,
}

impl DetectionResult {
    /// Positions of samples labeled anomalous, in input order
    pub fn anomalous_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, label)| **label == SampleLabel::Anomalous)
            .map(|(i, _)| i)
    }

    pub fn anomaly_count(&self) -> usize {
        self.anomalous_indices().count()
    }
}

/// Severity tier of a flagged sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sample labeled anomalous, as published downstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub metric_type: MetricType,
    pub value: f64,
    pub anomaly_score: f64,
    pub severity: Severity,
}

/// Aggregated outcome of one job, published as a single stream entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub location: String,
    pub models_saved: usize,
    pub total_anomalies_found: usize,
    pub anomalies: Vec<AnomalyRecord>,
    pub metrics_processed: Vec<MetricType>,
}

impl JobResult {
    /// Empty result for a job, before any metric type is processed
    pub fn empty(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            location: job.location.clone(),
            models_saved: 0,
            total_anomalies_found: 0,
            anomalies: Vec::new(),
            metrics_processed: Vec::new(),
        }
    }
}

/// ISO-8601 timestamps on the wire.
///
/// Accepts RFC 3339 with any offset, or a naive `YYYY-MM-DDTHH:MM[:SS[.f]]`
/// which is read as UTC. Always writes RFC 3339 in UTC.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"];

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp '{}'", raw)))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(|naive| Utc.from_utc_datetime(&naive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_parse_variants() {
        let with_offset = timestamp::parse("2024-03-01T12:00:00+02:00").unwrap();
        let utc = timestamp::parse("2024-03-01T10:00:00Z").unwrap();
        let naive = timestamp::parse("2024-03-01T10:00").unwrap();

        assert_eq!(with_offset, utc);
        assert_eq!(naive, utc);
        assert!(timestamp::parse("yesterday").is_none());
    }

    #[test]
    fn test_anomaly_record_wire_format() {
        let record = AnomalyRecord {
            timestamp: timestamp::parse("2024-03-01T10:00:00Z").unwrap(),
            metric_type: MetricType::from(MetricType::TEMPERATURE),
            value: 48.5,
            anomaly_score: 0.21,
            severity: Severity::High,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["timestamp"], "2024-03-01T10:00:00Z");
        assert_eq!(json["metric_type"], "temperature_2m");
        assert_eq!(json["severity"], "high");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
    }

    #[test]
    fn test_detection_result_anomalous_indices() {
        let result = DetectionResult {
            metric_type: MetricType::from("precipitation"),
            labels: vec![
                SampleLabel::Normal,
                SampleLabel::Anomalous,
                SampleLabel::Normal,
                SampleLabel::Anomalous,
            ],
            scores: vec![-0.1, 0.2, -0.05, 0.01],
        };

        assert_eq!(result.anomalous_indices().collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(result.anomaly_count(), 2);
    }
}
