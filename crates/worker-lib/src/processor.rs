//! Job processing
//!
//! Splits a job into per-metric series, runs detection on every eligible
//! series, persists one model per processed metric type and folds the
//! outcome into a single [`JobResult`].

use crate::anomaly::{MetricDetector, SeverityClassifier};
use crate::models::{AnomalyRecord, Job, JobResult, MetricSample, MetricType};
use crate::observability::{StructuredLogger, WorkerMetrics};
use crate::store::{ModelArtifact, ModelStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Result of one job plus the failures that were contained while building it
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub result: JobResult,
    /// Metric types excluded because detection failed
    pub failed_metrics: Vec<MetricType>,
    /// Processed metric types whose artifact could not be written
    pub failed_saves: usize,
}

/// Runs detection and persistence for one job at a time
///
/// All work is synchronous and CPU-bound; callers on an async runtime run it
/// through `spawn_blocking`.
pub struct JobProcessor {
    detector: MetricDetector,
    classifier: SeverityClassifier,
    store: Arc<dyn ModelStore>,
    metrics: WorkerMetrics,
    logger: StructuredLogger,
}

impl JobProcessor {
    pub fn new(
        detector: MetricDetector,
        classifier: SeverityClassifier,
        store: Arc<dyn ModelStore>,
        metrics: WorkerMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            detector,
            classifier,
            store,
            metrics,
            logger,
        }
    }

    pub fn detector(&self) -> &MetricDetector {
        &self.detector
    }

    pub fn process(&self, job: &Job) -> JobOutcome {
        let mut result = JobResult::empty(job);
        let mut failed_metrics = Vec::new();
        let mut failed_saves = 0;

        for (metric_type, samples) in group_by_metric(&job.samples) {
            if !self.detector.is_eligible(samples.len()) {
                debug!(
                    job_id = %job.job_id,
                    metric_type = %metric_type,
                    samples = samples.len(),
                    min_samples = self.detector.config().min_samples,
                    "Skipping metric type below sample threshold"
                );
                continue;
            }

            let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
            let started = Instant::now();
            let detection = self.detector.detect(&metric_type, &values);
            self.metrics.observe_fit_latency(started.elapsed());

            let (detection, model) = match detection {
                Ok(fitted) => fitted,
                Err(e) => {
                    warn!(
                        job_id = %job.job_id,
                        metric_type = %metric_type,
                        error = %e,
                        "Detection failed, excluding metric type"
                    );
                    self.metrics.inc_metric_failures(metric_type.as_str());
                    failed_metrics.push(metric_type);
                    continue;
                }
            };

            for i in detection.anomalous_indices() {
                let sample = samples[i];
                let score = detection.scores[i];
                let record = AnomalyRecord {
                    timestamp: sample.timestamp,
                    metric_type: metric_type.clone(),
                    value: sample.value,
                    anomaly_score: score.abs(),
                    severity: self.classifier.classify(score),
                };
                self.metrics
                    .inc_anomaly(metric_type.as_str(), record.severity.as_str());
                self.logger.log_anomaly(&job.job_id, &job.location, &record);
                result.anomalies.push(record);
            }

            let artifact = ModelArtifact {
                metric_type: metric_type.clone(),
                job_id: job.job_id.clone(),
                trained_at: Utc::now(),
                model,
            };
            match self.store.save(&artifact) {
                Ok(saved) => {
                    self.metrics.inc_models_saved();
                    self.logger
                        .log_model_saved(&job.job_id, metric_type.as_str(), &saved);
                    result.models_saved += 1;
                }
                Err(e) => {
                    warn!(
                        job_id = %job.job_id,
                        metric_type = %metric_type,
                        error = %e,
                        "Failed to persist model artifact"
                    );
                    self.metrics.inc_model_save_errors();
                    failed_saves += 1;
                }
            }

            result.metrics_processed.push(metric_type);
        }

        result.total_anomalies_found = result.anomalies.len();

        JobOutcome {
            result,
            failed_metrics,
            failed_saves,
        }
    }
}

/// Partition samples by metric type, keeping first-seen order of types and
/// input order within each type
fn group_by_metric(samples: &[MetricSample]) -> Vec<(MetricType, Vec<&MetricSample>)> {
    let mut groups: Vec<(MetricType, Vec<&MetricSample>)> = Vec::new();
    let mut index: HashMap<&MetricType, usize> = HashMap::new();

    for sample in samples {
        match index.get(&sample.metric_type) {
            Some(&slot) => groups[slot].1.push(sample),
            None => {
                index.insert(&sample.metric_type, groups.len());
                groups.push((sample.metric_type.clone(), vec![sample]));
            }
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::DetectorConfig;
    use crate::errors::PersistError;
    use crate::models::Severity;
    use crate::store::{FileModelStore, SavedArtifact, SlotNaming};
    use chrono::{Duration, TimeZone};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records saves in memory, optionally failing for one metric type
    #[derive(Default)]
    struct MockStore {
        saved: Mutex<Vec<MetricType>>,
        fail_for: Option<MetricType>,
    }

    impl ModelStore for MockStore {
        fn save(&self, artifact: &ModelArtifact) -> Result<SavedArtifact, PersistError> {
            if self.fail_for.as_ref() == Some(&artifact.metric_type) {
                return Err(PersistError::Io {
                    path: PathBuf::from("/read-only"),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
                });
            }
            self.saved.lock().unwrap().push(artifact.metric_type.clone());
            Ok(SavedArtifact {
                path: PathBuf::from(format!("model_{}.json", artifact.metric_type)),
                checksum: "0".repeat(64),
                size_bytes: 1,
            })
        }
    }

    fn processor(store: Arc<dyn ModelStore>) -> JobProcessor {
        JobProcessor::new(
            MetricDetector::new(DetectorConfig::default()).unwrap(),
            SeverityClassifier::default(),
            store,
            WorkerMetrics::new(),
            StructuredLogger::new("test"),
        )
    }

    fn series(metric: &str, values: &[f64]) -> Vec<MetricSample> {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| MetricSample {
                timestamp: start + Duration::hours(i as i64),
                metric_type: MetricType::from(metric),
                value: *v,
            })
            .collect()
    }

    fn job(samples: Vec<MetricSample>) -> Job {
        Job {
            job_id: "job-42".to_string(),
            location: "Berlin".to_string(),
            samples,
        }
    }

    fn calm(n: usize, base: f64) -> Vec<f64> {
        (0..n).map(|i| base + (i % 4) as f64 * 0.25).collect()
    }

    #[test]
    fn test_group_by_metric_keeps_first_seen_order() {
        let mut samples = series("b", &[1.0, 2.0]);
        samples.extend(series("a", &[3.0]));
        samples.extend(series("b", &[4.0]));

        let groups = group_by_metric(&samples);
        let names: Vec<_> = groups.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);

        let values: Vec<_> = groups[0].1.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 4.0]);
    }

    #[test]
    fn test_single_outlier_reported() {
        let mut values = calm(14, 20.0);
        values.insert(9, 75.0);
        let samples = series(MetricType::TEMPERATURE, &values);
        let outlier_ts = samples[9].timestamp;

        let store = Arc::new(MockStore::default());
        let outcome = processor(store.clone()).process(&job(samples));
        let result = outcome.result;

        assert_eq!(result.anomalies.len(), 1);
        assert_eq!(result.total_anomalies_found, 1);
        let record = &result.anomalies[0];
        assert_eq!(record.timestamp, outlier_ts);
        assert_eq!(record.value, 75.0);
        assert!(record.anomaly_score >= 0.0);
        if record.anomaly_score > 0.15 {
            assert_eq!(record.severity, Severity::High);
        }
        assert_eq!(result.models_saved, 1);
        assert_eq!(store.saved.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_ineligible_metric_skipped() {
        let store = Arc::new(MockStore::default());
        let outcome = processor(store.clone())
            .process(&job(series(MetricType::PRECIPITATION, &[0.0, 0.1, 0.0, 2.0, 0.3])));

        assert!(outcome.result.metrics_processed.is_empty());
        assert!(outcome.result.anomalies.is_empty());
        assert_eq!(outcome.result.models_saved, 0);
        assert!(outcome.failed_metrics.is_empty());
        assert!(store.saved.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failed_metric_does_not_affect_others() {
        let mut samples = series(MetricType::WIND_SPEED, &[3.0; 12]);
        samples.extend(series(MetricType::DEW_POINT, &calm(15, 8.0)));

        let outcome = processor(Arc::new(MockStore::default())).process(&job(samples));

        assert_eq!(
            outcome.result.metrics_processed,
            vec![MetricType::from(MetricType::DEW_POINT)]
        );
        assert_eq!(
            outcome.failed_metrics,
            vec![MetricType::from(MetricType::WIND_SPEED)]
        );
        assert_eq!(outcome.result.models_saved, 1);
    }

    #[test]
    fn test_huge_spread_metric_excluded_others_processed() {
        let huge: Vec<f64> = (0..12)
            .map(|i| if i % 2 == 0 { 1e308 } else { -1e308 })
            .collect();
        let mut samples = series("good", &calm(12, 4.0));
        samples.extend(series("huge", &huge));

        let outcome = processor(Arc::new(MockStore::default())).process(&job(samples));

        assert_eq!(
            outcome.result.metrics_processed,
            vec![MetricType::from("good")]
        );
        assert_eq!(outcome.failed_metrics, vec![MetricType::from("huge")]);
        assert_eq!(outcome.result.models_saved, 1);
    }

    #[test]
    fn test_persist_failure_only_reduces_models_saved() {
        let mut values = calm(14, 55.0);
        values.push(5.0);
        let mut samples = series(MetricType::RELATIVE_HUMIDITY, &values);
        samples.extend(series(MetricType::TEMPERATURE, &calm(12, 18.0)));

        let store = Arc::new(MockStore {
            fail_for: Some(MetricType::from(MetricType::RELATIVE_HUMIDITY)),
            ..MockStore::default()
        });
        let outcome = processor(store).process(&job(samples));
        let result = outcome.result;

        assert_eq!(result.metrics_processed.len(), 2);
        assert_eq!(result.models_saved, 1);
        assert_eq!(outcome.failed_saves, 1);
        assert!(result
            .anomalies
            .iter()
            .any(|a| a.metric_type.as_str() == MetricType::RELATIVE_HUMIDITY));
    }

    #[test]
    fn test_anomalies_ordered_by_metric_then_sample() {
        let mut a = calm(20, 10.0);
        a[3] = 90.0;
        a[15] = -70.0;
        let mut b = calm(20, 1000.0);
        b[0] = 5000.0;

        let mut samples = series("pressure", &b);
        samples.extend(series("level", &a));

        let result = processor(Arc::new(MockStore::default()))
            .process(&job(samples))
            .result;

        let order: Vec<_> = result
            .anomalies
            .iter()
            .map(|r| (r.metric_type.as_str().to_string(), r.timestamp))
            .collect();
        let mut expected = order.clone();
        expected.sort_by_key(|(m, ts)| (if m == "pressure" { 0 } else { 1 }, *ts));
        assert_eq!(order, expected);
        assert_eq!(result.total_anomalies_found, result.anomalies.len());
    }

    #[test]
    fn test_writes_artifacts_to_disk() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileModelStore::new(dir.path(), SlotNaming::MetricType).unwrap());

        let result = processor(store)
            .process(&job(series(MetricType::TEMPERATURE, &calm(12, 21.0))))
            .result;

        assert_eq!(result.models_saved, 1);
        assert!(dir.path().join("model_temperature_2m.json").exists());
    }
}
