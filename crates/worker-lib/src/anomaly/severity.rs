//! Severity classification of anomaly scores

use crate::errors::DetectionError;
use crate::models::Severity;
use serde::{Deserialize, Serialize};

/// Ordered thresholds on `abs(raw_score)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityThresholds {
    /// Scores above this are at least medium
    pub medium: f64,
    /// Scores above this are high
    pub high: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            medium: 0.10,
            high: 0.15,
        }
    }
}

impl SeverityThresholds {
    pub fn validate(&self) -> Result<(), DetectionError> {
        if !self.medium.is_finite() || !self.high.is_finite() {
            return Err(DetectionError::InvalidParameter(
                "severity thresholds must be finite".to_string(),
            ));
        }
        if self.medium < 0.0 {
            return Err(DetectionError::InvalidParameter(
                "severity thresholds must be non-negative".to_string(),
            ));
        }
        if self.medium > self.high {
            return Err(DetectionError::InvalidParameter(format!(
                "medium threshold {} exceeds high threshold {}",
                self.medium, self.high
            )));
        }
        Ok(())
    }
}

/// Maps a raw score to a severity tier
#[derive(Debug, Clone, Copy)]
pub struct SeverityClassifier {
    thresholds: SeverityThresholds,
}

impl SeverityClassifier {
    pub fn new(thresholds: SeverityThresholds) -> Result<Self, DetectionError> {
        thresholds.validate()?;
        Ok(Self { thresholds })
    }

    /// `> high` is high, `(medium, high]` is medium, anything else is low
    pub fn classify(&self, raw_score: f64) -> Severity {
        let magnitude = raw_score.abs();
        if magnitude > self.thresholds.high {
            Severity::High
        } else if magnitude > self.thresholds.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn thresholds(&self) -> SeverityThresholds {
        self.thresholds
    }
}

impl Default for SeverityClassifier {
    fn default() -> Self {
        Self {
            thresholds: SeverityThresholds::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_boundaries() {
        let classifier = SeverityClassifier::default();

        assert_eq!(classifier.classify(0.0), Severity::Low);
        assert_eq!(classifier.classify(0.10), Severity::Low);
        assert_eq!(classifier.classify(0.11), Severity::Medium);
        assert_eq!(classifier.classify(0.15), Severity::Medium);
        assert_eq!(classifier.classify(0.16), Severity::High);
    }

    #[test]
    fn test_uses_magnitude() {
        let classifier = SeverityClassifier::default();
        assert_eq!(classifier.classify(-0.2), Severity::High);
        assert_eq!(classifier.classify(-0.12), Severity::Medium);
    }

    #[test]
    fn test_monotonic_in_score() {
        let classifier = SeverityClassifier::new(SeverityThresholds {
            medium: 0.3,
            high: 0.5,
        })
        .unwrap();

        let mut previous = Severity::Low;
        for step in 0..=1000 {
            let severity = classifier.classify(step as f64 * 0.001);
            assert!(severity >= previous);
            // Pure: same input, same tier
            assert_eq!(severity, classifier.classify(step as f64 * 0.001));
            previous = severity;
        }
        assert_eq!(previous, Severity::High);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let result = SeverityClassifier::new(SeverityThresholds {
            medium: 0.5,
            high: 0.3,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_equal_thresholds_skip_medium() {
        let classifier = SeverityClassifier::new(SeverityThresholds {
            medium: 0.2,
            high: 0.2,
        })
        .unwrap();
        assert_eq!(classifier.classify(0.2), Severity::Low);
        assert_eq!(classifier.classify(0.21), Severity::High);
    }
}
