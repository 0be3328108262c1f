//! Per-metric outlier detection
//!
//! Fits a fresh isolation forest on the values of one metric type within one
//! job and labels each sample. The decision threshold is the
//! `(1 - contamination)` quantile of the job's own scores, so two jobs with
//! different samples for the same metric type use different thresholds.

use super::isolation_forest::{ForestParams, IsolationForest};
use crate::errors::DetectionError;
use crate::models::{DetectionResult, MetricType, SampleLabel};
use serde::{Deserialize, Serialize};

/// Minimum samples required before a metric type is modeled
pub const DEFAULT_MIN_SAMPLES: usize = 10;

/// Default expected fraction of anomalous samples
pub const DEFAULT_CONTAMINATION: f64 = 0.05;

/// Detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Metric types with fewer samples are skipped
    pub min_samples: usize,
    /// Expected anomalous fraction, in (0, 0.5]
    pub contamination: f64,
    /// Ensemble hyper-parameters
    pub forest: ForestParams,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_samples: DEFAULT_MIN_SAMPLES,
            contamination: DEFAULT_CONTAMINATION,
            forest: ForestParams::default(),
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), DetectionError> {
        if self.min_samples < 2 {
            return Err(DetectionError::InvalidParameter(
                "min_samples must be at least 2".to_string(),
            ));
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(DetectionError::InvalidParameter(format!(
                "contamination {} outside (0, 0.5]",
                self.contamination
            )));
        }
        if self.forest.n_estimators == 0 {
            return Err(DetectionError::InvalidParameter(
                "n_estimators must be positive".to_string(),
            ));
        }
        if self.forest.max_samples < 2 {
            return Err(DetectionError::InvalidParameter(
                "max_samples must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trained state for one metric type in one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedModel {
    pub sample_count: usize,
    pub contamination: f64,
    /// Score above which a sample is labeled anomalous
    pub threshold: f64,
    pub forest: IsolationForest,
}

/// Fits and scores one metric type at a time
#[derive(Debug, Clone)]
pub struct MetricDetector {
    config: DetectorConfig,
}

impl MetricDetector {
    pub fn new(config: DetectorConfig) -> Result<Self, DetectionError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Check if a metric type has enough samples to be modeled
    pub fn is_eligible(&self, sample_count: usize) -> bool {
        sample_count >= self.config.min_samples
    }

    /// Fit on `values` and label each of them
    ///
    /// Raw scores are `s(x) - threshold`: positive means anomalous. Output is
    /// aligned positionally with `values`.
    pub fn detect(
        &self,
        metric_type: &MetricType,
        values: &[f64],
    ) -> Result<(DetectionResult, FittedModel), DetectionError> {
        if !self.is_eligible(values.len()) {
            return Err(DetectionError::InsufficientSamples {
                metric_type: metric_type.clone(),
                required: self.config.min_samples,
                actual: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DetectionError::NonFinite(metric_type.clone()));
        }
        if distinct_count(values) < 2 {
            return Err(DetectionError::Degenerate(metric_type.clone()));
        }
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        if !(max - min).is_finite() {
            return Err(DetectionError::RangeOverflow(metric_type.clone()));
        }

        let points: Vec<Vec<f64>> = values.iter().map(|v| vec![*v]).collect();
        let forest = IsolationForest::fit(&points, &self.config.forest)?;

        let raw: Vec<f64> = points.iter().map(|p| forest.score(p)).collect();
        let threshold = quantile(&raw, 1.0 - self.config.contamination);

        let scores: Vec<f64> = raw.iter().map(|s| s - threshold).collect();
        let labels = scores
            .iter()
            .map(|s| {
                if *s > 0.0 {
                    SampleLabel::Anomalous
                } else {
                    SampleLabel::Normal
                }
            })
            .collect();

        let result = DetectionResult {
            metric_type: metric_type.clone(),
            labels,
            scores,
        };
        let model = FittedModel {
            sample_count: values.len(),
            contamination: self.config.contamination,
            threshold,
            forest,
        };

        Ok((result, model))
    }
}

fn distinct_count(values: &[f64]) -> usize {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted.dedup();
    sorted.len()
}

/// Linear-interpolated quantile, `q` in [0, 1]
fn quantile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> MetricDetector {
        MetricDetector::new(DetectorConfig::default()).unwrap()
    }

    fn temperature() -> MetricType {
        MetricType::from(MetricType::TEMPERATURE)
    }

    #[test]
    fn test_quantile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&values, 0.0), 1.0);
        assert_eq!(quantile(&values, 1.0), 5.0);
        assert!((quantile(&values, 0.5) - 3.0).abs() < 1e-12);
        assert!((quantile(&values, 0.95) - 4.8).abs() < 1e-12);
    }

    #[test]
    fn test_output_aligned_with_input() {
        let values: Vec<f64> = (0..25).map(|i| 10.0 + (i as f64).sin()).collect();
        let (result, model) = detector().detect(&temperature(), &values).unwrap();

        assert_eq!(result.labels.len(), values.len());
        assert_eq!(result.scores.len(), values.len());
        assert_eq!(model.sample_count, values.len());
    }

    #[test]
    fn test_single_extreme_outlier() {
        let mut values: Vec<f64> = (0..14).map(|i| 21.0 + (i % 5) as f64 * 0.2).collect();
        values.insert(6, 60.0);

        let (result, _) = detector().detect(&temperature(), &values).unwrap();

        assert_eq!(result.anomalous_indices().collect::<Vec<_>>(), vec![6]);
        let outlier = result.scores[6];
        assert!(outlier > 0.0);
        for (i, score) in result.scores.iter().enumerate() {
            if i != 6 {
                assert!(*score < outlier);
                assert!(*score <= 0.0);
            }
        }
    }

    #[test]
    fn test_anomaly_count_bounded_by_contamination() {
        let values: Vec<f64> = (0..40).map(|i| 50.0 + ((i * 7) % 11) as f64).collect();
        let (result, _) = detector().detect(&temperature(), &values).unwrap();

        let bound = (0.05 * values.len() as f64).ceil() as usize + 1;
        assert!(result.anomaly_count() <= bound);
    }

    #[test]
    fn test_rejects_too_few_samples() {
        let err = detector().detect(&temperature(), &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(
            err,
            DetectionError::InsufficientSamples { required: 10, actual: 3, .. }
        ));
    }

    #[test]
    fn test_rejects_constant_series() {
        let values = vec![4.2; 12];
        let err = detector().detect(&temperature(), &values).unwrap_err();
        assert!(matches!(err, DetectionError::Degenerate(_)));
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut values: Vec<f64> = (0..12).map(|i| i as f64).collect();
        values[3] = f64::NAN;
        let err = detector().detect(&temperature(), &values).unwrap_err();
        assert!(matches!(err, DetectionError::NonFinite(_)));
    }

    #[test]
    fn test_rejects_overflowing_range() {
        let values: Vec<f64> = (0..12)
            .map(|i| if i % 2 == 0 { 1e308 } else { -1e308 })
            .collect();
        let err = detector().detect(&temperature(), &values).unwrap_err();
        assert!(matches!(err, DetectionError::RangeOverflow(_)));
    }

    #[test]
    fn test_config_validation() {
        let bad = DetectorConfig {
            contamination: 0.0,
            ..DetectorConfig::default()
        };
        assert!(MetricDetector::new(bad).is_err());

        let bad = DetectorConfig {
            contamination: 0.6,
            ..DetectorConfig::default()
        };
        assert!(MetricDetector::new(bad).is_err());

        let bad = DetectorConfig {
            min_samples: 1,
            ..DetectorConfig::default()
        };
        assert!(MetricDetector::new(bad).is_err());
    }

    #[test]
    fn test_reproducible_for_identical_input() {
        let values: Vec<f64> = (0..30).map(|i| (i as f64 * 0.37).cos() * 5.0).collect();
        let (a, _) = detector().detect(&temperature(), &values).unwrap();
        let (b, _) = detector().detect(&temperature(), &values).unwrap();
        assert_eq!(a, b);
    }
}
