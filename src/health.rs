//! Health scoring: weighted composite metric and status tiers.
//!
//! The score is a pure function of the current sub-metrics, so identical
//! inputs always reproduce the same score, and the tier thresholds are
//! monotonic in the score.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Weight of the auto-fix success rate.
const W_AUTO_FIX: f64 = 0.30;
/// Weight of the prevention rate.
const W_PREVENTION: f64 = 0.20;
/// Weight of the prediction accuracy.
const W_PREDICTION: f64 = 0.20;
/// Weight of the retry success rate.
const W_RETRY: f64 = 0.15;
/// Weight of the inverted normalized error rate.
const W_ERROR: f64 = 0.15;

/// Sub-metrics feeding the composite health score, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Fraction of handled incidents healed automatically.
    pub auto_fix_success_rate: f64,
    /// Fraction of incidents prevented before task failure.
    pub prevention_rate: f64,
    /// Fraction of recurrence predictions later confirmed.
    pub prediction_accuracy: f64,
    /// Fraction of issued retries that completed successfully.
    pub retry_success_rate: f64,
    /// Normalized incident pressure over the window (1.0 = saturated).
    pub error_rate: f64,
}

impl HealthMetrics {
    /// Neutral starting metrics before any incidents are seen.
    pub fn cold_start() -> Self {
        Self {
            auto_fix_success_rate: 0.5,
            prevention_rate: 0.5,
            prediction_accuracy: 0.5,
            retry_success_rate: 0.5,
            error_rate: 0.0,
        }
    }
}

/// Status tier derived from the health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatusTier {
    /// Score ≥ 0.95.
    Excellent,
    /// Score ≥ 0.80.
    Good,
    /// Score ≥ 0.60.
    Fair,
    /// Score ≥ 0.40.
    Poor,
    /// Score < 0.40.
    Critical,
}

impl HealthStatusTier {
    /// Map a score to its tier. Thresholds are monotonic.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.95 {
            Self::Excellent
        } else if score >= 0.80 {
            Self::Good
        } else if score >= 0.60 {
            Self::Fair
        } else if score >= 0.40 {
            Self::Poor
        } else {
            Self::Critical
        }
    }

    /// Stable lowercase string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Critical => "critical",
        }
    }
}

/// One computed health observation, appended to the health log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Composite score in [0, 1].
    pub score: f64,
    /// Tier derived from the score.
    pub status: HealthStatusTier,
    /// Auto-healing success rate used for the score.
    pub auto_healing_rate: f64,
    /// Prevention rate used for the score.
    pub prevention_rate: f64,
    /// Mean healing time over the window, milliseconds.
    pub avg_healing_time_ms: i64,
    /// Incidents currently being handled.
    pub active_issues: i64,
}

/// Weighted composite health score, clamped to [0, 1].
pub fn health_score(metrics: &HealthMetrics) -> f64 {
    let score = W_AUTO_FIX * metrics.auto_fix_success_rate.clamp(0.0, 1.0)
        + W_PREVENTION * metrics.prevention_rate.clamp(0.0, 1.0)
        + W_PREDICTION * metrics.prediction_accuracy.clamp(0.0, 1.0)
        + W_RETRY * metrics.retry_success_rate.clamp(0.0, 1.0)
        + W_ERROR * (1.0 - metrics.error_rate.clamp(0.0, 1.0));
    score.clamp(0.0, 1.0)
}

/// Build a snapshot from metrics and current load figures.
pub fn take_snapshot(
    metrics: &HealthMetrics,
    avg_healing_time_ms: i64,
    active_issues: i64,
) -> HealthSnapshot {
    let score = health_score(metrics);
    HealthSnapshot {
        timestamp: Utc::now(),
        score,
        status: HealthStatusTier::from_score(score),
        auto_healing_rate: metrics.auto_fix_success_rate,
        prevention_rate: metrics.prevention_rate,
        avg_healing_time_ms,
        active_issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_metrics_score_one() {
        let metrics = HealthMetrics {
            auto_fix_success_rate: 1.0,
            prevention_rate: 1.0,
            prediction_accuracy: 1.0,
            retry_success_rate: 1.0,
            error_rate: 0.0,
        };
        assert!((health_score(&metrics) - 1.0).abs() < 1e-9);
        assert_eq!(
            HealthStatusTier::from_score(health_score(&metrics)),
            HealthStatusTier::Excellent
        );
    }

    #[test]
    fn identical_metrics_reproduce_identical_scores() {
        let metrics = HealthMetrics {
            auto_fix_success_rate: 0.7,
            prevention_rate: 0.3,
            prediction_accuracy: 0.6,
            retry_success_rate: 0.8,
            error_rate: 0.2,
        };
        assert!((health_score(&metrics) - health_score(&metrics)).abs() < f64::EPSILON);
    }

    #[test]
    fn score_stays_in_unit_interval_for_wild_inputs() {
        let metrics = HealthMetrics {
            auto_fix_success_rate: 7.0,
            prevention_rate: -3.0,
            prediction_accuracy: 2.0,
            retry_success_rate: -1.0,
            error_rate: 9.0,
        };
        let score = health_score(&metrics);
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn tier_thresholds_are_monotonic() {
        let mut previous = HealthStatusTier::Critical;
        for step in 0..=100u32 {
            let score = f64::from(step) / 100.0;
            let tier = HealthStatusTier::from_score(score);
            let rank = |t: HealthStatusTier| match t {
                HealthStatusTier::Critical => 0,
                HealthStatusTier::Poor => 1,
                HealthStatusTier::Fair => 2,
                HealthStatusTier::Good => 3,
                HealthStatusTier::Excellent => 4,
            };
            assert!(rank(tier) >= rank(previous));
            previous = tier;
        }
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(HealthStatusTier::from_score(0.95), HealthStatusTier::Excellent);
        assert_eq!(HealthStatusTier::from_score(0.949), HealthStatusTier::Good);
        assert_eq!(HealthStatusTier::from_score(0.80), HealthStatusTier::Good);
        assert_eq!(HealthStatusTier::from_score(0.60), HealthStatusTier::Fair);
        assert_eq!(HealthStatusTier::from_score(0.40), HealthStatusTier::Poor);
        assert_eq!(HealthStatusTier::from_score(0.399), HealthStatusTier::Critical);
    }

    #[test]
    fn error_rate_lowers_the_score() {
        let calm = HealthMetrics {
            error_rate: 0.0,
            ..HealthMetrics::cold_start()
        };
        let stormy = HealthMetrics {
            error_rate: 1.0,
            ..HealthMetrics::cold_start()
        };
        assert!(health_score(&calm) > health_score(&stormy));
    }
}
