//! Severity classification policy.
//!
//! Pure lookup from (label, confidence) to a severity tier. The dangerous
//! label set and all thresholds come from config; no hidden state influences
//! the outcome. Threshold comparisons are inclusive.

use crate::config::SeverityConfig;
use crate::detect::Severity;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct SeverityPolicy {
    dangerous: HashSet<String>,
    low_threshold: f64,
    medium_threshold: f64,
    high_threshold: f64,
}

impl SeverityPolicy {
    pub fn new(config: &SeverityConfig) -> Self {
        Self {
            dangerous: config
                .dangerous_labels
                .iter()
                .map(|l| l.to_lowercase())
                .collect(),
            low_threshold: config.low_threshold,
            medium_threshold: config.medium_threshold,
            high_threshold: config.high_threshold,
        }
    }

    /// Classify a detection. `None` means the detection is discarded
    /// entirely. Anything below the low threshold is noise, whatever the
    /// label says; the dangerous set only changes how survivors rank.
    pub fn classify(&self, label: &str, confidence: f64) -> Option<Severity> {
        if confidence < self.low_threshold {
            return None;
        }
        let label = label.to_lowercase();
        if self.is_dangerous(&label) {
            if confidence >= self.high_threshold {
                Some(Severity::Critical)
            } else {
                Some(Severity::High)
            }
        } else if confidence >= self.medium_threshold {
            Some(Severity::Medium)
        } else {
            Some(Severity::Low)
        }
    }

    /// Substring match, so "kitchen knife" still counts as "knife".
    fn is_dangerous(&self, lowered_label: &str) -> bool {
        self.dangerous.iter().any(|d| lowered_label.contains(d))
    }
}
