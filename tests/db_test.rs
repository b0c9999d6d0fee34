//! Tests for the SQLite state database.

use std::sync::Arc;
use std::time::Duration;

use mender::db::{LedgerRow, StateDb};
use mender::types::{HealingRecord, HealingStrategyClass};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn setup() -> (Arc<StateDb>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Arc::new(
        StateDb::open(&dir.path().join("state.db"))
            .await
            .expect("open db"),
    );
    (db, dir)
}

fn ledger_row(error_type: &str, strategy_id: &str, success: bool, exec_ms: i64) -> LedgerRow {
    LedgerRow {
        execution_id: Uuid::new_v4().to_string(),
        error_type: error_type.to_owned(),
        strategy_id: strategy_id.to_owned(),
        context_json: "{}".to_owned(),
        strategy_json: "{}".to_owned(),
        exec_time_ms: exec_ms,
        resource_usage: None,
        success,
        side_effects_json: "[]".to_owned(),
        feedback_score: None,
        executed_at: chrono::Utc::now().to_rfc3339(),
    }
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pattern_upsert_inserts_then_increments() {
    let (db, _dir) = setup().await;

    db.upsert_pattern(
        "module_not_found",
        "dependency",
        "ModuleNotFoundError: No module named 'requests'",
        "dependency",
        "high",
        "[]",
        true,
    )
    .await
    .expect("upsert");

    let row = db
        .pattern_by_signature("module_not_found")
        .await
        .expect("query")
        .expect("present");
    assert_eq!(row.occurrence_count, 1);
    assert!(row.auto_fixed);

    db.upsert_pattern(
        "module_not_found",
        "dependency",
        "ModuleNotFoundError: No module named 'numpy'",
        "dependency",
        "high",
        "[]",
        true,
    )
    .await
    .expect("upsert");

    let row = db
        .pattern_by_signature("module_not_found")
        .await
        .expect("query")
        .expect("present");
    assert_eq!(row.occurrence_count, 2);
    assert!(row.sample.contains("numpy"), "sample refreshes on upsert");
}

#[tokio::test]
async fn patterns_ordered_by_occurrence() {
    let (db, _dir) = setup().await;

    for _ in 0..3 {
        db.upsert_pattern("frequent", "network", "x", "network", "high", "[]", true)
            .await
            .expect("upsert");
    }
    db.upsert_pattern("rare", "syntax", "y", "syntax", "high", "[]", false)
        .await
        .expect("upsert");

    let rows = db.patterns_by_occurrence().await.expect("query");
    assert_eq!(rows[0].signature, "frequent");
    assert_eq!(rows[0].occurrence_count, 3);
    assert_eq!(rows[1].signature, "rare");
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[tokio::test]
async fn strategy_performance_aggregates_counts_and_times() {
    let (db, _dir) = setup().await;

    for _ in 0..3 {
        db.insert_execution(&ledger_row("dependency", "s-good", true, 1_000))
            .await
            .expect("insert");
    }
    db.insert_execution(&ledger_row("dependency", "s-good", false, 3_000))
        .await
        .expect("insert");
    db.insert_execution(&ledger_row("dependency", "s-bad", false, 500))
        .await
        .expect("insert");

    let mut perf = db
        .strategy_performance("dependency")
        .await
        .expect("performance");
    perf.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));

    assert_eq!(perf.len(), 2);
    let bad = &perf[0];
    assert_eq!(bad.strategy_id, "s-bad");
    assert_eq!(bad.failure_count, 1);
    assert!(bad.effectiveness_score.abs() < f64::EPSILON);

    let good = &perf[1];
    assert_eq!(good.success_count, 3);
    assert_eq!(good.failure_count, 1);
    assert!((good.effectiveness_score - 0.75).abs() < 1e-9);
    assert!((good.avg_execution_time_ms - 1_500.0).abs() < 1e-9);
}

#[tokio::test]
async fn error_types_with_counts_groups_the_ledger() {
    let (db, _dir) = setup().await;

    db.insert_execution(&ledger_row("dependency", "s-1", true, 10))
        .await
        .expect("insert");
    db.insert_execution(&ledger_row("network", "s-2", true, 10))
        .await
        .expect("insert");
    db.insert_execution(&ledger_row("network", "s-2", false, 10))
        .await
        .expect("insert");

    let mut counts = db.error_types_with_counts().await.expect("counts");
    counts.sort();
    assert_eq!(
        counts,
        vec![("dependency".to_owned(), 1), ("network".to_owned(), 2)]
    );
}

// ---------------------------------------------------------------------------
// Learned strategies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn learned_strategies_sorted_best_first() {
    let (db, _dir) = setup().await;

    db.upsert_learned_strategy("s-low", "dependency", "{}", 0.3, 5)
        .await
        .expect("upsert");
    db.upsert_learned_strategy("s-high", "dependency", "{}", 0.9, 12)
        .await
        .expect("upsert");

    let rows = db
        .learned_strategies_for("dependency")
        .await
        .expect("query");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].strategy_id, "s-high");

    // Upsert replaces the score in place.
    db.upsert_learned_strategy("s-low", "dependency", "{}", 0.95, 6)
        .await
        .expect("upsert");
    let rows = db
        .learned_strategies_for("dependency")
        .await
        .expect("query");
    assert_eq!(rows[0].strategy_id, "s-low");
    assert_eq!(rows[0].sample_count, 6);
}

// ---------------------------------------------------------------------------
// Healing records and health log
// ---------------------------------------------------------------------------

#[tokio::test]
async fn healing_aggregates_count_outcomes() {
    let (db, _dir) = setup().await;

    let record = |success: bool, prevented: bool, manual: bool| HealingRecord {
        incident_id: Uuid::new_v4(),
        error_type: "network".to_owned(),
        strategy_class: HealingStrategyClass::Reactive,
        actions_taken: vec!["true".to_owned()],
        duration: Duration::from_millis(200),
        success,
        prevented,
        manual_required: manual,
    };

    db.insert_healing_record(&record(true, false, false))
        .await
        .expect("insert");
    db.insert_healing_record(&record(true, true, false))
        .await
        .expect("insert");
    db.insert_healing_record(&record(false, false, true))
        .await
        .expect("insert");

    let since = chrono::Utc::now()
        .checked_sub_signed(chrono::Duration::hours(1))
        .expect("window")
        .to_rfc3339();
    let aggregates = db.healing_aggregates_since(&since).await.expect("agg");

    assert_eq!(aggregates.total, 3);
    assert_eq!(aggregates.successes, 2);
    assert_eq!(aggregates.prevented, 1);
    assert_eq!(aggregates.manual, 1);
    assert_eq!(aggregates.avg_duration_ms, 200);
}

#[tokio::test]
async fn health_snapshots_append_and_latest_wins() {
    let (db, _dir) = setup().await;

    db.insert_health_snapshot(
        "2026-08-08T10:00:00+00:00",
        "good",
        0.85,
        0.8,
        0.1,
        350,
        2,
        "{}",
    )
    .await
    .expect("insert");
    db.insert_health_snapshot(
        "2026-08-08T10:01:00+00:00",
        "fair",
        0.7,
        0.6,
        0.1,
        420,
        4,
        "{}",
    )
    .await
    .expect("insert");

    let latest = db
        .latest_health_snapshot()
        .await
        .expect("query")
        .expect("present");
    assert_eq!(latest.status, "fair");
    assert!((latest.score - 0.7).abs() < 1e-9);
    assert_eq!(latest.active_issues, 4);
}
