//! Mender state database backed by SQLite.
//!
//! Stores learned error patterns, the execution ledger, optimized strategies,
//! health snapshots, and healing records. Migration is applied inline via
//! `include_str!` on first open. Single pool, single writer per table; reads
//! may be concurrent.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::types::HealingRecord;

/// Mender's SQLite state database.
pub struct StateDb {
    pool: SqlitePool,
}

/// A row from the `patterns` table: one learned error pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRow {
    /// Auto-increment row ID.
    pub id: i64,
    /// Unique pattern signature (rule name or learned hash).
    pub signature: String,
    /// Error category string.
    pub error_type: String,
    /// Representative error sample text.
    pub sample: String,
    /// Category string (same vocabulary as `error_type`).
    pub category: String,
    /// Severity string.
    pub severity: String,
    /// JSON array of candidate strategies.
    pub strategies_json: String,
    /// How many times this pattern has matched.
    pub occurrence_count: i64,
    /// Last match timestamp (RFC 3339).
    pub last_seen: String,
    /// Whether this pattern is auto-fixable.
    pub auto_fixed: bool,
}

/// A row from the `ledger` table: one recorded strategy execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRow {
    /// Unique execution id.
    pub execution_id: String,
    /// Error category string.
    pub error_type: String,
    /// Stable strategy id (kind + command hash).
    pub strategy_id: String,
    /// Extracted feature/context JSON.
    pub context_json: String,
    /// Strategy JSON as executed.
    pub strategy_json: String,
    /// Execution wall-clock time in milliseconds.
    pub exec_time_ms: i64,
    /// Optional resource usage note.
    pub resource_usage: Option<String>,
    /// Whether the execution succeeded.
    pub success: bool,
    /// JSON array of side effects (created files, installed packages).
    pub side_effects_json: String,
    /// Optional operator feedback score.
    pub feedback_score: Option<f64>,
    /// When the execution happened (RFC 3339).
    pub executed_at: String,
}

/// Aggregated performance of one strategy for one error type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPerformance {
    /// Stable strategy id.
    pub strategy_id: String,
    /// Error category string.
    pub error_type: String,
    /// Successful executions.
    pub success_count: i64,
    /// Failed executions.
    pub failure_count: i64,
    /// Mean execution time in milliseconds.
    pub avg_execution_time_ms: f64,
    /// Success ratio in [0, 1].
    pub effectiveness_score: f64,
}

/// A row from the `learned_strategies` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedStrategyRow {
    /// Stable strategy id (primary key).
    pub strategy_id: String,
    /// Error category string.
    pub error_type: String,
    /// Strategy JSON.
    pub strategy_json: String,
    /// Current effectiveness score.
    pub effectiveness_score: f64,
    /// Number of samples behind the score.
    pub sample_count: i64,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Last update timestamp (RFC 3339).
    pub updated_at: String,
}

/// Aggregates over `healing_records` used for health scoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealingAggregates {
    /// Total records in the window.
    pub total: i64,
    /// Records where healing succeeded.
    pub successes: i64,
    /// Records flagged prevented.
    pub prevented: i64,
    /// Records that required manual intervention.
    pub manual: i64,
    /// Mean healing duration in milliseconds (0 when no records).
    pub avg_duration_ms: i64,
}

impl StateDb {
    /// Open (or create) the state database at the given path and apply migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create state db directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open state db at {}", path.display()))?;

        let migration_sql = include_str!("../migrations/001_mender_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply mender schema migration")?;

        Ok(Self { pool })
    }

    // -- patterns --

    /// Upsert a pattern: insert on first sight, otherwise bump
    /// `occurrence_count` and refresh `last_seen` and the sample.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_pattern(
        &self,
        signature: &str,
        error_type: &str,
        sample: &str,
        category: &str,
        severity: &str,
        strategies_json: &str,
        auto_fixed: bool,
    ) -> anyhow::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let auto_int: i64 = if auto_fixed { 1 } else { 0 };

        sqlx::query(
            r"INSERT INTO patterns (signature, error_type, sample, category, severity, strategies_json, occurrence_count, last_seen, auto_fixed)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)
              ON CONFLICT(signature) DO UPDATE SET
                occurrence_count = occurrence_count + 1,
                last_seen = ?7,
                sample = ?3",
        )
        .bind(signature)
        .bind(error_type)
        .bind(sample)
        .bind(category)
        .bind(severity)
        .bind(strategies_json)
        .bind(&now)
        .bind(auto_int)
        .execute(&self.pool)
        .await
        .context("failed to upsert pattern")?;

        Ok(())
    }

    /// Fetch a single pattern by signature.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn pattern_by_signature(&self, signature: &str) -> anyhow::Result<Option<PatternRow>> {
        let row: Option<PatternTuple> = sqlx::query_as(
            "SELECT id, signature, error_type, sample, category, severity, strategies_json, occurrence_count, last_seen, auto_fixed
             FROM patterns WHERE signature = ?1",
        )
        .bind(signature)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query pattern by signature")?;

        Ok(row.map(pattern_tuple_into_row))
    }

    /// All learned patterns ordered by occurrence count descending.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn patterns_by_occurrence(&self) -> anyhow::Result<Vec<PatternRow>> {
        let rows: Vec<PatternTuple> = sqlx::query_as(
            "SELECT id, signature, error_type, sample, category, severity, strategies_json, occurrence_count, last_seen, auto_fixed
             FROM patterns ORDER BY occurrence_count DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to query patterns")?;

        Ok(rows.into_iter().map(pattern_tuple_into_row).collect())
    }

    // -- ledger --

    /// Append one execution record to the ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn insert_execution(&self, row: &LedgerRow) -> anyhow::Result<()> {
        let success_int: i64 = if row.success { 1 } else { 0 };

        sqlx::query(
            "INSERT INTO ledger (execution_id, error_type, strategy_id, context_json, strategy_json, exec_time_ms, resource_usage, success, side_effects_json, feedback_score, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&row.execution_id)
        .bind(&row.error_type)
        .bind(&row.strategy_id)
        .bind(&row.context_json)
        .bind(&row.strategy_json)
        .bind(row.exec_time_ms)
        .bind(&row.resource_usage)
        .bind(success_int)
        .bind(&row.side_effects_json)
        .bind(row.feedback_score)
        .bind(&row.executed_at)
        .execute(&self.pool)
        .await
        .context("failed to insert ledger row")?;

        Ok(())
    }

    /// Number of ledger samples for an error type since a point in time.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn sample_count_since(&self, error_type: &str, since: &str) -> anyhow::Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM ledger WHERE error_type = ?1 AND executed_at >= ?2",
        )
        .bind(error_type)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .context("failed to count ledger samples")?;

        Ok(row.0)
    }

    /// Total ledger samples for an error type.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn sample_count(&self, error_type: &str) -> anyhow::Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ledger WHERE error_type = ?1")
            .bind(error_type)
            .fetch_one(&self.pool)
            .await
            .context("failed to count ledger samples")?;

        Ok(row.0)
    }

    /// Distinct error types present in the ledger with their sample counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn error_types_with_counts(&self) -> anyhow::Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT error_type, COUNT(*) FROM ledger GROUP BY error_type")
                .fetch_all(&self.pool)
                .await
                .context("failed to query ledger error types")?;

        Ok(rows)
    }

    /// Aggregate per-strategy performance for an error type from the ledger.
    ///
    /// Effectiveness is the plain success ratio; the learner adjusts it
    /// further with context similarity and recency.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn strategy_performance(
        &self,
        error_type: &str,
    ) -> anyhow::Result<Vec<StrategyPerformance>> {
        let rows: Vec<(String, i64, i64, f64)> = sqlx::query_as(
            r"SELECT strategy_id,
                     SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END),
                     SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END),
                     AVG(exec_time_ms)
              FROM ledger
              WHERE error_type = ?1
              GROUP BY strategy_id",
        )
        .bind(error_type)
        .fetch_all(&self.pool)
        .await
        .context("failed to query strategy performance")?;

        let perf = rows
            .into_iter()
            .map(|(strategy_id, success_count, failure_count, avg_ms)| {
                let total = success_count.saturating_add(failure_count);
                #[allow(clippy::cast_precision_loss)]
                let effectiveness = if total > 0 {
                    success_count as f64 / total as f64
                } else {
                    0.0
                };
                StrategyPerformance {
                    strategy_id,
                    error_type: error_type.to_owned(),
                    success_count,
                    failure_count,
                    avg_execution_time_ms: avg_ms,
                    effectiveness_score: effectiveness,
                }
            })
            .collect();

        Ok(perf)
    }

    /// Recent ledger rows for an error type, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn recent_executions(
        &self,
        error_type: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<LedgerRow>> {
        let rows: Vec<LedgerTuple> = sqlx::query_as(
            "SELECT execution_id, error_type, strategy_id, context_json, strategy_json, exec_time_ms, resource_usage, success, side_effects_json, feedback_score, executed_at
             FROM ledger WHERE error_type = ?1 ORDER BY executed_at DESC LIMIT ?2",
        )
        .bind(error_type)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to query recent executions")?;

        Ok(rows.into_iter().map(ledger_tuple_into_row).collect())
    }

    // -- learned strategies --

    /// Insert or replace an optimized strategy for an error type.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn upsert_learned_strategy(
        &self,
        strategy_id: &str,
        error_type: &str,
        strategy_json: &str,
        effectiveness_score: f64,
        sample_count: i64,
    ) -> anyhow::Result<()> {
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            r"INSERT INTO learned_strategies (strategy_id, error_type, strategy_json, effectiveness_score, sample_count, created_at, updated_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
              ON CONFLICT(strategy_id) DO UPDATE SET
                strategy_json = ?3,
                effectiveness_score = ?4,
                sample_count = ?5,
                updated_at = ?6",
        )
        .bind(strategy_id)
        .bind(error_type)
        .bind(strategy_json)
        .bind(effectiveness_score)
        .bind(sample_count)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failed to upsert learned strategy")?;

        Ok(())
    }

    /// Learned strategies for an error type, best first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn learned_strategies_for(
        &self,
        error_type: &str,
    ) -> anyhow::Result<Vec<LearnedStrategyRow>> {
        let rows: Vec<(String, String, String, f64, i64, String, String)> = sqlx::query_as(
            "SELECT strategy_id, error_type, strategy_json, effectiveness_score, sample_count, created_at, updated_at
             FROM learned_strategies WHERE error_type = ?1 ORDER BY effectiveness_score DESC",
        )
        .bind(error_type)
        .fetch_all(&self.pool)
        .await
        .context("failed to query learned strategies")?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    strategy_id,
                    error_type,
                    strategy_json,
                    effectiveness_score,
                    sample_count,
                    created_at,
                    updated_at,
                )| LearnedStrategyRow {
                    strategy_id,
                    error_type,
                    strategy_json,
                    effectiveness_score,
                    sample_count,
                    created_at,
                    updated_at,
                },
            )
            .collect())
    }

    // -- healing records --

    /// Append a healing record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn insert_healing_record(&self, record: &HealingRecord) -> anyhow::Result<()> {
        let actions_json =
            serde_json::to_string(&record.actions_taken).unwrap_or_else(|_| "[]".to_owned());
        let duration_ms = i64::try_from(record.duration.as_millis()).unwrap_or(i64::MAX);

        sqlx::query(
            "INSERT OR REPLACE INTO healing_records (incident_id, error_type, strategy_class, actions_json, duration_ms, success, prevented, manual_required, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(record.incident_id.to_string())
        .bind(&record.error_type)
        .bind(record.strategy_class.as_str())
        .bind(actions_json)
        .bind(duration_ms)
        .bind(i64::from(record.success))
        .bind(i64::from(record.prevented))
        .bind(i64::from(record.manual_required))
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to insert healing record")?;

        Ok(())
    }

    /// Aggregate healing outcomes recorded since a point in time.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn healing_aggregates_since(&self, since: &str) -> anyhow::Result<HealingAggregates> {
        let row: (i64, i64, i64, i64, Option<f64>) = sqlx::query_as(
            r"SELECT COUNT(*),
                     SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END),
                     SUM(CASE WHEN prevented = 1 THEN 1 ELSE 0 END),
                     SUM(CASE WHEN manual_required = 1 THEN 1 ELSE 0 END),
                     AVG(duration_ms)
              FROM healing_records WHERE recorded_at >= ?1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .context("failed to aggregate healing records")?;

        #[allow(clippy::cast_possible_truncation)]
        let avg_duration_ms = row.4.unwrap_or(0.0).round() as i64;
        Ok(HealingAggregates {
            total: row.0,
            successes: row.1,
            prevented: row.2,
            manual: row.3,
            avg_duration_ms,
        })
    }

    /// Most recent healing records, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn recent_healing_records(
        &self,
        limit: i64,
    ) -> anyhow::Result<Vec<(String, String, String, bool)>> {
        let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            "SELECT incident_id, error_type, strategy_class, success
             FROM healing_records ORDER BY recorded_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to query healing records")?;

        Ok(rows
            .into_iter()
            .map(|(id, et, class, success)| (id, et, class, success != 0))
            .collect())
    }

    // -- health log --

    /// Append a health snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_health_snapshot(
        &self,
        timestamp: &str,
        status: &str,
        score: f64,
        auto_healing_rate: f64,
        prevention_rate: f64,
        avg_healing_time_ms: i64,
        active_issues: i64,
        metrics_json: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO health_log (timestamp, status, score, auto_healing_rate, prevention_rate, avg_healing_time_ms, active_issues, metrics_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(timestamp)
        .bind(status)
        .bind(score)
        .bind(auto_healing_rate)
        .bind(prevention_rate)
        .bind(avg_healing_time_ms)
        .bind(active_issues)
        .bind(metrics_json)
        .execute(&self.pool)
        .await
        .context("failed to insert health snapshot")?;

        Ok(())
    }

    /// The most recent health snapshot, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn latest_health_snapshot(&self) -> anyhow::Result<Option<HealthLogRow>> {
        let row: Option<(String, String, f64, f64, f64, i64, i64)> = sqlx::query_as(
            "SELECT timestamp, status, score, auto_healing_rate, prevention_rate, avg_healing_time_ms, active_issues
             FROM health_log ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to query latest health snapshot")?;

        Ok(row.map(
            |(
                timestamp,
                status,
                score,
                auto_healing_rate,
                prevention_rate,
                avg_healing_time_ms,
                active_issues,
            )| HealthLogRow {
                timestamp,
                status,
                score,
                auto_healing_rate,
                prevention_rate,
                avg_healing_time_ms,
                active_issues,
            },
        ))
    }
}

/// A row from the `health_log` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthLogRow {
    /// When the snapshot was taken (RFC 3339).
    pub timestamp: String,
    /// Status tier string.
    pub status: String,
    /// Composite score in [0, 1].
    pub score: f64,
    /// Auto-healing success rate at snapshot time.
    pub auto_healing_rate: f64,
    /// Prevention rate at snapshot time.
    pub prevention_rate: f64,
    /// Mean healing duration in milliseconds.
    pub avg_healing_time_ms: i64,
    /// Incidents in flight at snapshot time.
    pub active_issues: i64,
}

/// Raw row tuple from the `patterns` table.
type PatternTuple = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    i64,
);

/// Convert a raw `patterns` row tuple into a [`PatternRow`].
fn pattern_tuple_into_row(row: PatternTuple) -> PatternRow {
    let (
        id,
        signature,
        error_type,
        sample,
        category,
        severity,
        strategies_json,
        occurrence_count,
        last_seen,
        auto_fixed,
    ) = row;
    PatternRow {
        id,
        signature,
        error_type,
        sample,
        category,
        severity,
        strategies_json,
        occurrence_count,
        last_seen,
        auto_fixed: auto_fixed != 0,
    }
}

/// Raw row tuple from the `ledger` table.
type LedgerTuple = (
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    i64,
    String,
    Option<f64>,
    String,
);

/// Convert a raw `ledger` row tuple into a [`LedgerRow`].
fn ledger_tuple_into_row(row: LedgerTuple) -> LedgerRow {
    let (
        execution_id,
        error_type,
        strategy_id,
        context_json,
        strategy_json,
        exec_time_ms,
        resource_usage,
        success,
        side_effects_json,
        feedback_score,
        executed_at,
    ) = row;
    LedgerRow {
        execution_id,
        error_type,
        strategy_id,
        context_json,
        strategy_json,
        exec_time_ms,
        resource_usage,
        success: success != 0,
        side_effects_json,
        feedback_score,
        executed_at,
    }
}
