//! Strategy scoring backends.
//!
//! [`StrategyPredictor`] hides the optional model backend behind a trait so
//! the learning loop works identically with or without one. The rule-based
//! implementation is always available and is chosen at startup when no model
//! backend is configured; its scores are pure functions of the recorded
//! statistics, which keeps ranking deterministic.

use crate::db::StrategyPerformance;

/// Numeric features extracted from an execution context.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    /// Hour of day the execution happened (0–23).
    pub hour_of_day: f64,
    /// System load reported by the worker, if any.
    pub load: f64,
    /// Memory in use (MB) reported by the worker, if any.
    pub memory_mb: f64,
    /// One-hot encoding of the strategy kind.
    pub kind_one_hot: [f64; 9],
}

impl FeatureVector {
    /// Similarity to another feature vector in [0, 1].
    ///
    /// Hour distance is circular (23:00 and 01:00 are close); load and
    /// memory are compared on a coarse normalized scale.
    pub fn similarity(&self, other: &Self) -> f64 {
        let hour_diff = (self.hour_of_day - other.hour_of_day).abs();
        let hour_dist = hour_diff.min(24.0 - hour_diff) / 12.0;
        let load_dist = ((self.load - other.load).abs() / 4.0).min(1.0);
        let mem_dist = ((self.memory_mb - other.memory_mb).abs() / 8192.0).min(1.0);
        let distance = (hour_dist + load_dist + mem_dist) / 3.0;
        (1.0 - distance).clamp(0.0, 1.0)
    }
}

/// Scoring backend for strategy ranking and recurrence prediction.
pub trait StrategyPredictor: Send + Sync {
    /// Score one strategy's recorded performance, higher is better.
    fn score(&self, performance: &StrategyPerformance) -> f64;

    /// Probability that an error of this type recurs soon, in [0, 1].
    fn recurrence_probability(&self, occurrence_count: i64, recent_failures: i64) -> f64;

    /// Backend name, for logging.
    fn name(&self) -> &'static str;
}

/// Statistics-only predictor used when no model backend is available.
///
/// Scores are Laplace-smoothed success ratios with a mild penalty for slow
/// strategies, so a strategy that succeeds rarely but instantly does not
/// outrank one that succeeds reliably in a few seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedPredictor;

impl StrategyPredictor for RuleBasedPredictor {
    fn score(&self, performance: &StrategyPerformance) -> f64 {
        let total = performance
            .success_count
            .saturating_add(performance.failure_count);
        #[allow(clippy::cast_precision_loss)]
        let smoothed = (performance.success_count as f64 + 1.0) / (total as f64 + 2.0);

        // Normalize execution time against a 60s horizon; at most a 10% penalty.
        let time_penalty = (performance.avg_execution_time_ms / 60_000.0).clamp(0.0, 1.0) * 0.1;

        (smoothed - time_penalty).clamp(0.0, 1.0)
    }

    fn recurrence_probability(&self, occurrence_count: i64, recent_failures: i64) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let occurrence_signal = (occurrence_count as f64 / 20.0).min(1.0) * 0.6;
        #[allow(clippy::cast_precision_loss)]
        let failure_signal = (recent_failures as f64 / 5.0).min(1.0) * 0.4;
        (occurrence_signal + failure_signal).clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "rule_based"
    }
}

/// Pick the predictor backend at startup.
///
/// There is currently only the rule-based backend; a model-backed
/// implementation plugs in here without touching the learner.
pub fn default_predictor() -> std::sync::Arc<dyn StrategyPredictor> {
    std::sync::Arc::new(RuleBasedPredictor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perf(successes: i64, failures: i64, avg_ms: f64) -> StrategyPerformance {
        StrategyPerformance {
            strategy_id: "install_package-0".to_owned(),
            error_type: "dependency".to_owned(),
            success_count: successes,
            failure_count: failures,
            avg_execution_time_ms: avg_ms,
            effectiveness_score: 0.0,
        }
    }

    #[test]
    fn score_prefers_reliable_strategies() {
        let p = RuleBasedPredictor;
        let reliable = p.score(&perf(9, 1, 5_000.0));
        let flaky = p.score(&perf(3, 7, 5_000.0));
        assert!(reliable > flaky);
    }

    #[test]
    fn slow_strategies_are_penalized() {
        let p = RuleBasedPredictor;
        let fast = p.score(&perf(5, 5, 1_000.0));
        let slow = p.score(&perf(5, 5, 120_000.0));
        assert!(fast > slow);
    }

    #[test]
    fn score_is_bounded_and_deterministic() {
        let p = RuleBasedPredictor;
        let performance = perf(2, 0, 500.0);
        let a = p.score(&performance);
        let b = p.score(&performance);
        assert!((a - b).abs() < f64::EPSILON);
        assert!((0.0..=1.0).contains(&a));
    }

    #[test]
    fn recurrence_grows_with_occurrences_and_failures() {
        let p = RuleBasedPredictor;
        assert!(p.recurrence_probability(0, 0) < 0.1);
        assert!(p.recurrence_probability(40, 10) > 0.9);
        let low = p.recurrence_probability(5, 0);
        let high = p.recurrence_probability(5, 4);
        assert!(high > low);
    }

    #[test]
    fn feature_similarity_is_circular_in_hours() {
        let base = FeatureVector {
            hour_of_day: 23.0,
            load: 1.0,
            memory_mb: 1024.0,
            kind_one_hot: [0.0; 9],
        };
        let near_midnight = FeatureVector {
            hour_of_day: 1.0,
            ..base.clone()
        };
        let midday = FeatureVector {
            hour_of_day: 11.0,
            ..base.clone()
        };
        assert!(base.similarity(&near_midnight) > base.similarity(&midday));
    }
}
