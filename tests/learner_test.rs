//! Tests for the execution ledger, re-ranking, and strategy selection.

use std::sync::Arc;
use std::time::Duration;

use mender::config::LearnerConfig;
use mender::db::StateDb;
use mender::learner::StrategyLearner;
use mender::predictor::default_predictor;
use mender::types::{FixExecutionResult, FixStrategy, SafetyClass, StrategyKind};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn setup(config: LearnerConfig) -> (StrategyLearner, Arc<StateDb>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Arc::new(
        StateDb::open(&dir.path().join("state.db"))
            .await
            .expect("open db"),
    );
    let learner = StrategyLearner::new(Arc::clone(&db), config, default_predictor());
    (learner, db, dir)
}

fn install_strategy(package: &str) -> FixStrategy {
    FixStrategy {
        kind: StrategyKind::InstallPackage,
        command: format!("pip install {package}"),
        description: format!("install {package}"),
        safety: SafetyClass::Caution,
    }
}

fn result(success: bool) -> FixExecutionResult {
    FixExecutionResult {
        strategy_used: None,
        executed_commands: vec!["pip install x".to_owned()],
        success,
        verification_passed: success,
        rollback_performed: false,
        execution_time: Duration::from_millis(800),
        error: None,
    }
}

/// Record `successes` wins and `failures` losses for a strategy.
async fn seed(
    learner: &StrategyLearner,
    error_type: &str,
    strategy: &FixStrategy,
    successes: usize,
    failures: usize,
) {
    for _ in 0..successes {
        learner
            .record_execution(error_type, strategy, &result(true), &serde_json::Value::Null)
            .await
            .expect("record");
    }
    for _ in 0..failures {
        learner
            .record_execution(error_type, strategy, &result(false), &serde_json::Value::Null)
            .await
            .expect("record");
    }
}

// ---------------------------------------------------------------------------
// Recording and re-ranking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn executions_land_in_the_ledger() {
    let (learner, db, _dir) = setup(LearnerConfig::default()).await;
    let strategy = install_strategy("requests");

    seed(&learner, "dependency", &strategy, 2, 1).await;

    assert_eq!(db.sample_count("dependency").await.expect("count"), 3);
    let perf = db
        .strategy_performance("dependency")
        .await
        .expect("performance");
    assert_eq!(perf.len(), 1);
    assert_eq!(perf[0].success_count, 2);
    assert_eq!(perf[0].failure_count, 1);
}

#[tokio::test]
async fn rerank_triggers_after_enough_samples() {
    let config = LearnerConfig {
        retrain_min_samples: 4,
        ..LearnerConfig::default()
    };
    let (learner, db, _dir) = setup(config).await;

    seed(&learner, "dependency", &install_strategy("requests"), 3, 1).await;

    let stored = db
        .learned_strategies_for("dependency")
        .await
        .expect("learned");
    assert_eq!(stored.len(), 1, "re-rank should persist the strategy");
    assert!(stored[0].effectiveness_score > 0.0);
    assert_eq!(stored[0].sample_count, 4);
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn zero_epsilon_selection_is_deterministic() {
    let config = LearnerConfig {
        retrain_min_samples: 4,
        epsilon: 0.0,
        ..LearnerConfig::default()
    };
    let (learner, _db, _dir) = setup(config).await;

    let good = install_strategy("requests");
    let bad = install_strategy("requests-oauthlib");
    seed(&learner, "dependency", &good, 4, 0).await;
    seed(&learner, "dependency", &bad, 0, 4).await;

    let context = serde_json::json!({"load": 0.5});
    let first = learner
        .get_optimized_strategy("dependency", &context)
        .await
        .expect("select")
        .expect("some strategy");

    for _ in 0..10 {
        let again = learner
            .get_optimized_strategy("dependency", &context)
            .await
            .expect("select")
            .expect("some strategy");
        assert_eq!(first, again);
    }
    assert_eq!(first.command, "pip install requests");
}

#[tokio::test]
async fn no_history_yields_no_strategy() {
    let (learner, _db, _dir) = setup(LearnerConfig::default()).await;
    let picked = learner
        .get_optimized_strategy("dependency", &serde_json::Value::Null)
        .await
        .expect("select");
    assert!(picked.is_none());
}

#[tokio::test]
async fn sufficient_history_threshold() {
    let config = LearnerConfig {
        adaptive_min_history: 3,
        retrain_min_samples: 100,
        ..LearnerConfig::default()
    };
    let (learner, _db, _dir) = setup(config).await;

    assert!(!learner.has_sufficient_history("dependency").await);
    seed(&learner, "dependency", &install_strategy("requests"), 3, 0).await;
    assert!(learner.has_sufficient_history("dependency").await);
}

// ---------------------------------------------------------------------------
// Optimization pass
// ---------------------------------------------------------------------------

#[tokio::test]
async fn optimize_all_persists_best_per_error_type() {
    let config = LearnerConfig {
        retrain_min_samples: 100, // keep automatic re-rank out of the way
        ..LearnerConfig::default()
    };
    let (learner, db, _dir) = setup(config).await;

    let good = install_strategy("requests");
    let bad = install_strategy("urllib3");
    seed(&learner, "dependency", &good, 5, 0).await;
    seed(&learner, "dependency", &bad, 1, 4).await;

    let summary = learner.optimize_all_strategies().await.expect("optimize");
    assert_eq!(summary.examined, 1);
    assert_eq!(summary.updated, 1);

    let stored = db
        .learned_strategies_for("dependency")
        .await
        .expect("learned");
    let best = stored.first().expect("best");
    assert_eq!(best.strategy_id, good.strategy_id());

    // Re-running without new data must not report another improvement.
    let summary = learner.optimize_all_strategies().await.expect("optimize");
    assert_eq!(summary.updated, 0);
}
