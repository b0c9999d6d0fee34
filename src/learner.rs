//! Strategy learning: execution ledger, feature extraction, ranking.
//!
//! Every fix execution is appended to the ledger with extracted features.
//! Once enough new samples arrive for an error type inside the rolling
//! window, that type's strategies are re-ranked through the predictor and
//! persisted. Selection is deterministic when the exploration probability is
//! zero; otherwise a non-top candidate is occasionally tried.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Timelike, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::LearnerConfig;
use crate::db::{LedgerRow, StateDb, StrategyPerformance};
use crate::predictor::{FeatureVector, StrategyPredictor};
use crate::types::{FixExecutionResult, FixStrategy, StrategyKind};

/// Optimization technique, chosen by sample-count tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationTechnique {
    /// Few samples: smooth the success ratio.
    ParameterTuning,
    /// Moderate samples: blend reliability with execution speed.
    Combination,
    /// Many samples: weight the recent window higher.
    ContextAdaptation,
    /// Rich history: tournament over recent cohorts.
    Evolutionary,
}

impl OptimizationTechnique {
    /// Pick the technique for an error type's total sample count.
    pub fn for_sample_count(count: i64) -> Self {
        match count {
            _ if count < 20 => Self::ParameterTuning,
            _ if count < 50 => Self::Combination,
            _ if count < 100 => Self::ContextAdaptation,
            _ => Self::Evolutionary,
        }
    }
}

/// Summary of one optimization pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimizationSummary {
    /// Error types examined.
    pub examined: usize,
    /// Error types whose persisted best strategy changed.
    pub updated: usize,
}

/// Records outcomes and ranks strategies per error type.
pub struct StrategyLearner {
    db: Arc<StateDb>,
    config: LearnerConfig,
    predictor: Arc<dyn StrategyPredictor>,
    /// New samples per error type since the last re-rank.
    pending: Mutex<HashMap<String, usize>>,
}

impl StrategyLearner {
    /// Build a learner on top of the state database and a predictor backend.
    pub fn new(
        db: Arc<StateDb>,
        config: LearnerConfig,
        predictor: Arc<dyn StrategyPredictor>,
    ) -> Self {
        info!(backend = predictor.name(), "strategy learner initialised");
        Self {
            db,
            config,
            predictor,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Append an execution outcome to the ledger and maybe trigger a re-rank.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger write fails; re-rank failures are
    /// logged, not raised.
    pub async fn record_execution(
        &self,
        error_type: &str,
        strategy: &FixStrategy,
        result: &FixExecutionResult,
        context: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let features = extract_features(context, strategy.kind);
        let context_json =
            serde_json::to_string(&feature_json(&features)).unwrap_or_else(|_| "{}".to_owned());
        let strategy_json = serde_json::to_string(strategy).unwrap_or_else(|_| "{}".to_owned());
        let side_effects_json =
            serde_json::to_string(&result.executed_commands).unwrap_or_else(|_| "[]".to_owned());

        let row = LedgerRow {
            execution_id: uuid::Uuid::new_v4().to_string(),
            error_type: error_type.to_owned(),
            strategy_id: strategy.strategy_id(),
            context_json,
            strategy_json,
            exec_time_ms: i64::try_from(result.execution_time.as_millis()).unwrap_or(i64::MAX),
            resource_usage: context
                .get("load")
                .and_then(serde_json::Value::as_f64)
                .map(|load| format!("load={load:.2}")),
            success: result.success,
            side_effects_json,
            feedback_score: None,
            executed_at: Utc::now().to_rfc3339(),
        };
        self.db
            .insert_execution(&row)
            .await
            .context("failed to append execution to ledger")?;

        let due = {
            let mut pending = self.pending.lock().await;
            let count = pending.entry(error_type.to_owned()).or_insert(0);
            *count = count.saturating_add(1);
            *count >= self.config.retrain_min_samples
        };

        if due && self.window_samples_sufficient(error_type).await {
            if let Err(e) = self.rerank(error_type).await {
                warn!(error_type, error = %e, "strategy re-rank failed");
            } else {
                let mut pending = self.pending.lock().await;
                pending.insert(error_type.to_owned(), 0);
            }
        }

        Ok(())
    }

    /// Whether enough samples landed inside the rolling window.
    async fn window_samples_sufficient(&self, error_type: &str) -> bool {
        let now = Utc::now();
        let window_start = now
            .checked_sub_signed(chrono::Duration::hours(
                i64::try_from(self.config.retrain_window_hours).unwrap_or(24),
            ))
            .unwrap_or(now);
        match self
            .db
            .sample_count_since(error_type, &window_start.to_rfc3339())
            .await
        {
            Ok(count) => {
                usize::try_from(count).unwrap_or(0) >= self.config.retrain_min_samples
            }
            Err(e) => {
                warn!(error_type, error = %e, "window sample count failed");
                false
            }
        }
    }

    /// Re-score all strategies for an error type and persist the ranking.
    async fn rerank(&self, error_type: &str) -> anyhow::Result<()> {
        let performances = self.db.strategy_performance(error_type).await?;
        for perf in &performances {
            let score = self.predictor.score(perf);
            let strategy_json = self
                .strategy_json_for(error_type, &perf.strategy_id)
                .await
                .unwrap_or_else(|| "{}".to_owned());
            self.db
                .upsert_learned_strategy(
                    &perf.strategy_id,
                    error_type,
                    &strategy_json,
                    score,
                    perf.success_count.saturating_add(perf.failure_count),
                )
                .await?;
        }
        debug!(
            error_type,
            strategies = performances.len(),
            "strategies re-ranked"
        );
        Ok(())
    }

    /// Latest recorded strategy JSON for a strategy id, from the ledger.
    async fn strategy_json_for(&self, error_type: &str, strategy_id: &str) -> Option<String> {
        let recent = self.db.recent_executions(error_type, 100).await.ok()?;
        recent
            .into_iter()
            .find(|row| row.strategy_id == strategy_id)
            .map(|row| row.strategy_json)
    }

    /// Best stored strategy for an error type, adjusted by context similarity.
    ///
    /// With exploration probability ε a non-top candidate is returned
    /// instead; with ε = 0 the result is fully deterministic (ties broken by
    /// strategy id).
    ///
    /// # Errors
    ///
    /// Returns an error if the strategy store is unreachable.
    pub async fn get_optimized_strategy(
        &self,
        error_type: &str,
        context: &serde_json::Value,
    ) -> anyhow::Result<Option<FixStrategy>> {
        let rows = self.db.learned_strategies_for(error_type).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let current = extract_features(context, StrategyKind::GenericCommand);
        let recent = self.db.recent_executions(error_type, 50).await?;

        let mut scored: Vec<(f64, String, FixStrategy)> = Vec::new();
        for row in &rows {
            let Ok(strategy) = serde_json::from_str::<FixStrategy>(&row.strategy_json) else {
                continue;
            };
            let similarity = context_similarity(&current, &row.strategy_id, &recent);
            let adjusted = row.effectiveness_score * (0.8 + 0.2 * similarity);
            scored.push((adjusted, row.strategy_id.clone(), strategy));
        }
        if scored.is_empty() {
            return Ok(None);
        }

        // Deterministic order: score descending, then strategy id ascending.
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        if self.config.epsilon > 0.0 && scored.len() > 1 {
            let roll: f64 = rand::thread_rng().gen();
            if roll < self.config.epsilon {
                let pick = rand::thread_rng().gen_range(1..scored.len());
                debug!(error_type, pick, "exploration pick");
                return Ok(Some(scored.swap_remove(pick).2));
            }
        }

        Ok(Some(scored.swap_remove(0).2))
    }

    /// Ledger sample count for an error type.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger is unreachable.
    pub async fn history_size(&self, error_type: &str) -> anyhow::Result<i64> {
        self.db.sample_count(error_type).await
    }

    /// Whether the adaptive healing path has enough history to be useful.
    pub async fn has_sufficient_history(&self, error_type: &str) -> bool {
        self.history_size(error_type)
            .await
            .map(|count| count >= self.config.adaptive_min_history)
            .unwrap_or(false)
    }

    /// Re-optimize every error type, picking the technique by sample tier.
    ///
    /// A new best is persisted only when its score improves on the stored
    /// best by at least the configured minimum improvement.
    ///
    /// # Errors
    ///
    /// Returns an error if the strategy store is unreachable.
    pub async fn optimize_all_strategies(&self) -> anyhow::Result<OptimizationSummary> {
        let mut summary = OptimizationSummary::default();

        for (error_type, sample_count) in self.db.error_types_with_counts().await? {
            summary.examined = summary.examined.saturating_add(1);
            let technique = OptimizationTechnique::for_sample_count(sample_count);

            let performances = self.db.strategy_performance(&error_type).await?;
            if performances.is_empty() {
                continue;
            }
            let recent = self.db.recent_executions(&error_type, 100).await?;

            let mut best: Option<(f64, StrategyPerformance)> = None;
            for perf in performances {
                let score = self.technique_score(technique, &perf, &recent);
                let better = match &best {
                    Some((current, _)) => score > *current,
                    None => true,
                };
                if better {
                    best = Some((score, perf));
                }
            }
            let Some((new_score, winner)) = best else {
                continue;
            };

            let stored = self.db.learned_strategies_for(&error_type).await?;
            let stored_best = stored.first().map(|row| row.effectiveness_score);

            let improved = match stored_best {
                Some(old) if old > 0.0 => (new_score - old) / old >= self.config.min_improvement,
                Some(_) => new_score > 0.0,
                None => true,
            };
            if !improved {
                debug!(
                    error_type,
                    technique = ?technique,
                    new_score,
                    "improvement below threshold, keeping stored best"
                );
                continue;
            }

            let strategy_json = self
                .strategy_json_for(&error_type, &winner.strategy_id)
                .await
                .unwrap_or_else(|| "{}".to_owned());
            self.db
                .upsert_learned_strategy(
                    &winner.strategy_id,
                    &error_type,
                    &strategy_json,
                    new_score,
                    winner.success_count.saturating_add(winner.failure_count),
                )
                .await?;
            info!(error_type, technique = ?technique, new_score, "optimized strategy persisted");
            summary.updated = summary.updated.saturating_add(1);
        }

        Ok(summary)
    }

    /// Score a strategy under a specific optimization technique.
    fn technique_score(
        &self,
        technique: OptimizationTechnique,
        perf: &StrategyPerformance,
        recent: &[LedgerRow],
    ) -> f64 {
        let base = self.predictor.score(perf);
        match technique {
            OptimizationTechnique::ParameterTuning => base,
            OptimizationTechnique::Combination => {
                // Blend reliability with speed once enough data exists.
                let speed = 1.0 - (perf.avg_execution_time_ms / 300_000.0).clamp(0.0, 1.0);
                (base * 0.8 + speed * 0.2).clamp(0.0, 1.0)
            }
            OptimizationTechnique::ContextAdaptation => {
                let recent_rate = recent_success_rate(&perf.strategy_id, recent);
                (base * 0.6 + recent_rate * 0.4).clamp(0.0, 1.0)
            }
            OptimizationTechnique::Evolutionary => {
                // Tournament between the long-run score and the latest cohort;
                // the stronger signal wins, damped toward the mean.
                let recent_rate = recent_success_rate(&perf.strategy_id, recent);
                let champion = base.max(recent_rate);
                (champion * 0.9 + base.min(recent_rate) * 0.1).clamp(0.0, 1.0)
            }
        }
    }

    /// Drop in-memory learner caches (emergency load shedding).
    pub async fn clear_cache(&self) {
        let mut pending = self.pending.lock().await;
        pending.clear();
    }
}

/// Success rate of a strategy within the recent ledger slice.
fn recent_success_rate(strategy_id: &str, recent: &[LedgerRow]) -> f64 {
    let mut successes: u32 = 0;
    let mut total: u32 = 0;
    for row in recent {
        if row.strategy_id == strategy_id {
            total = total.saturating_add(1);
            if row.success {
                successes = successes.saturating_add(1);
            }
        }
    }
    if total == 0 {
        return 0.0;
    }
    f64::from(successes) / f64::from(total)
}

/// Extract numeric features from a worker-supplied context.
pub fn extract_features(context: &serde_json::Value, kind: StrategyKind) -> FeatureVector {
    let mut kind_one_hot = [0.0; 9];
    kind_one_hot[kind.one_hot_index()] = 1.0;

    let hour_of_day = f64::from(Utc::now().hour());

    FeatureVector {
        hour_of_day,
        load: context
            .get("load")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0),
        memory_mb: context
            .get("memory_mb")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0),
        kind_one_hot,
    }
}

/// Serialize features for the ledger's context column.
fn feature_json(features: &FeatureVector) -> serde_json::Value {
    serde_json::json!({
        "hour_of_day": features.hour_of_day,
        "load": features.load,
        "memory_mb": features.memory_mb,
        "kind_one_hot": features.kind_one_hot,
    })
}

/// Mean similarity between the current features and a strategy's recorded
/// successful contexts. Neutral (0.5) when there is no usable history.
fn context_similarity(current: &FeatureVector, strategy_id: &str, recent: &[LedgerRow]) -> f64 {
    let mut total = 0.0;
    let mut count: u32 = 0;
    for row in recent {
        if row.strategy_id != strategy_id || !row.success {
            continue;
        }
        let Ok(stored) = serde_json::from_str::<serde_json::Value>(&row.context_json) else {
            continue;
        };
        let features = FeatureVector {
            hour_of_day: stored
                .get("hour_of_day")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(12.0),
            load: stored
                .get("load")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0),
            memory_mb: stored
                .get("memory_mb")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0),
            kind_one_hot: [0.0; 9],
        };
        total += current.similarity(&features);
        count = count.saturating_add(1);
    }
    if count == 0 {
        return 0.5;
    }
    total / f64::from(count)
}
