//! Healing orchestration: strategy-class selection, background loops,
//! per-task serialization, and health accounting.
//!
//! `handle_incident` drives the classify → fix → verify → retry chain for
//! one incident, substituting the preventive, predictive, adaptive, or
//! emergency paths when warranted. Three periodic loops (health-check,
//! optimization, predictive-scan) run alongside on-demand handling. A
//! per-task-id async lock keeps at most one fix/retry cycle in flight per
//! task while different tasks proceed concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MenderConfig;
use crate::db::StateDb;
use crate::fixer::FixExecutor;
use crate::health::{self, HealthMetrics, HealthSnapshot, HealthStatusTier};
use crate::learner::StrategyLearner;
use crate::patterns::{Classification, ErrorClassifier};
use crate::predictor::{default_predictor, StrategyPredictor};
use crate::reporter::Reporter;
use crate::retry::{RetryOrchestrator, RetryOutcome};
use crate::transport::TaskTransport;
use crate::types::{
    ErrorCategory, ErrorIncident, HealingRecord, HealingStrategyClass, RetryStatus,
};
use crate::workers::CommandPool;

/// Incident pressure that saturates the error-rate sub-metric.
const ERROR_RATE_SATURATION: u64 = 100;

/// Counters for sub-metrics not derivable from persisted records.
#[derive(Debug, Clone, Copy, Default)]
struct RuntimeCounters {
    retries_issued: u64,
    retries_succeeded: u64,
    predictions_made: u64,
    predictions_confirmed: u64,
    incidents_seen: u64,
}

/// Top-level coordinator of the healing pipeline.
///
/// Constructed once at startup and shared by reference; owns every
/// component and all mutable runtime state.
pub struct HealingOrchestrator {
    config: MenderConfig,
    db: Arc<StateDb>,
    classifier: ErrorClassifier,
    fixer: Arc<FixExecutor>,
    retry: RetryOrchestrator,
    learner: Arc<StrategyLearner>,
    predictor: Arc<dyn StrategyPredictor>,
    reporter: Mutex<Reporter>,
    pool: CommandPool,

    task_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    seen: Mutex<HashMap<u64, DateTime<Utc>>>,
    counters: Mutex<RuntimeCounters>,
    predicted: Mutex<HashMap<String, DateTime<Utc>>>,
    emergency_times: Mutex<Vec<DateTime<Utc>>>,
    current_health: Mutex<(f64, HealthStatusTier)>,
    intake_paused: AtomicBool,
    active_issues: AtomicI64,
    /// Read-held while an incident is in flight; shutdown takes the write
    /// side so an in-progress strategy (and its rollback) can finish.
    drain: RwLock<()>,
}

impl HealingOrchestrator {
    /// Wire up the full pipeline from config and its external seams.
    ///
    /// # Errors
    ///
    /// Returns an error if a component fails to initialise (bad rule regex,
    /// unusable probe client).
    pub fn new(
        config: MenderConfig,
        db: Arc<StateDb>,
        transport: Arc<dyn TaskTransport>,
        bot_token: &str,
    ) -> anyhow::Result<Self> {
        let pool = CommandPool::new(config.fixer.max_concurrent_commands);
        let classifier = ErrorClassifier::new(Arc::clone(&db), config.classifier.clone())?;
        let fixer = Arc::new(FixExecutor::new(pool.clone(), config.fixer.clone()));
        let retry = RetryOrchestrator::new(&config, Arc::clone(&fixer), transport)?;
        let predictor = default_predictor();
        let learner = Arc::new(StrategyLearner::new(
            Arc::clone(&db),
            config.learner.clone(),
            Arc::clone(&predictor),
        ));
        let reporter = Reporter::new(
            bot_token,
            config.telegram.notify_users.clone(),
            config.reports.prefix.clone(),
            config.reports.alert_cooldown_mins,
        );

        Ok(Self {
            config,
            db,
            classifier,
            fixer,
            retry,
            learner,
            predictor,
            reporter: Mutex::new(reporter),
            pool,
            task_locks: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashMap::new()),
            counters: Mutex::new(RuntimeCounters::default()),
            predicted: Mutex::new(HashMap::new()),
            emergency_times: Mutex::new(Vec::new()),
            current_health: Mutex::new((1.0, HealthStatusTier::Excellent)),
            intake_paused: AtomicBool::new(false),
            active_issues: AtomicI64::new(0),
            drain: RwLock::new(()),
        })
    }

    /// Latest computed health score and tier.
    pub async fn current_health(&self) -> (f64, HealthStatusTier) {
        *self.current_health.lock().await
    }

    /// Whether intake is currently shed (emergency mode).
    pub fn intake_paused(&self) -> bool {
        self.intake_paused.load(Ordering::SeqCst)
    }

    /// Handle one reported incident end to end.
    ///
    /// Returns `None` when the incident is noise, a duplicate inside the
    /// dedup window, or shed during emergency load reduction. Internal
    /// errors are folded into the returned record; they never propagate.
    pub async fn handle_incident(&self, mut incident: ErrorIncident) -> Option<HealingRecord> {
        if ErrorClassifier::should_ignore(&incident.error_text) {
            debug!(task_id = %incident.task_id, "noise line ignored");
            return None;
        }

        if self.intake_paused() && !incident.task_id.starts_with("preventive-") {
            warn!(task_id = %incident.task_id, "intake shed, incident dropped");
            return None;
        }

        if self.is_duplicate(&incident).await {
            debug!(task_id = %incident.task_id, "duplicate incident dropped");
            return None;
        }

        // Keeps shutdown from tearing the runtime down mid-fix.
        let _drain_guard = self.drain.read().await;

        let task_lock = self.lock_for(&incident.task_id).await;
        let _task_guard = task_lock.lock().await;

        self.active_issues.fetch_add(1, Ordering::SeqCst);
        {
            let mut counters = self.counters.lock().await;
            counters.incidents_seen = counters.incidents_seen.saturating_add(1);
        }

        let started = Instant::now();
        let (_score, tier) = self.current_health().await;

        let record = if tier == HealthStatusTier::Critical {
            self.run_emergency(&incident, started).await
        } else {
            self.run_healing_chain(&mut incident, started).await
        };

        if let Err(e) = self.db.insert_healing_record(&record).await {
            warn!(incident = %record.incident_id, error = %e, "failed to persist healing record");
        }

        info!(
            incident = %record.incident_id,
            task_id = %incident.task_id,
            class = record.strategy_class.as_str(),
            success = record.success,
            duration_ms = record.duration.as_millis(),
            "incident handled"
        );

        self.active_issues.fetch_sub(1, Ordering::SeqCst);
        Some(record)
    }

    /// The reactive/preventive/predictive/adaptive chain for one incident.
    async fn run_healing_chain(
        &self,
        incident: &mut ErrorIncident,
        started: Instant,
    ) -> HealingRecord {
        let analysis = match self
            .classifier
            .classify(&incident.error_text, &incident.context)
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(task_id = %incident.task_id, error = %e, "classification failed");
                return self
                    .manual_record(incident, HealingStrategyClass::Reactive, started, "classification error")
                    .await;
            }
        };

        incident.category = Some(analysis.category);
        let error_type = analysis.category.as_str();
        self.confirm_prediction(error_type).await;

        if !analysis.auto_fixable {
            debug!(
                task_id = %incident.task_id,
                category = error_type,
                "not auto-fixable, escalating"
            );
            return self
                .manual_record(incident, HealingStrategyClass::Reactive, started, "not auto-fixable")
                .await;
        }

        let class = self.select_class(incident, &analysis).await;
        let analysis = self.apply_learned_ordering(class, error_type, incident, analysis).await;

        let fix_result = self.fixer.execute(&analysis, incident).await;

        // The learner sees every executed strategy, successful or not.
        if let Some(strategy) = &fix_result.strategy_used {
            if let Err(e) = self
                .learner
                .record_execution(error_type, strategy, &fix_result, &incident.context)
                .await
            {
                warn!(task_id = %incident.task_id, error = %e, "ledger append failed");
            }
        }

        let actions = fix_result.executed_commands.clone();

        if class == HealingStrategyClass::Preventive {
            // Pre-failure fix: the task never failed, so there is no retry.
            return HealingRecord {
                incident_id: incident.id,
                error_type: error_type.to_owned(),
                strategy_class: class,
                actions_taken: actions,
                duration: started.elapsed(),
                success: fix_result.success,
                prevented: fix_result.success,
                manual_required: false,
            };
        }

        let decision = self
            .retry
            .should_retry(analysis.category, incident, &fix_result)
            .await;

        if !decision.retry {
            debug!(task_id = %incident.task_id, reason = %decision.reason, "retry denied");

            if self.retry.status(&incident.task_id).await == Some(RetryStatus::MaxRetriesExceeded) {
                let mut reporter = self.reporter.lock().await;
                if let Err(e) = reporter.send_retry_exhausted(&incident.task_id).await {
                    warn!(error = %e, "retry-exhausted notification failed");
                }
            } else if !fix_result.success {
                let mut reporter = self.reporter.lock().await;
                if let Err(e) = reporter
                    .send_manual_intervention(incident, &decision.reason)
                    .await
                {
                    warn!(error = %e, "manual-intervention notification failed");
                }
            }

            return HealingRecord {
                incident_id: incident.id,
                error_type: error_type.to_owned(),
                strategy_class: class,
                actions_taken: actions,
                duration: started.elapsed(),
                success: false,
                prevented: false,
                manual_required: !fix_result.success,
            };
        }

        {
            let mut counters = self.counters.lock().await;
            counters.retries_issued = counters.retries_issued.saturating_add(1);
        }

        let success = match self
            .retry
            .orchestrate_retry(incident, &fix_result, &decision)
            .await
        {
            Ok(RetryOutcome::Succeeded) => {
                let mut counters = self.counters.lock().await;
                counters.retries_succeeded = counters.retries_succeeded.saturating_add(1);
                true
            }
            Ok(RetryOutcome::FailedAgain { error }) => {
                debug!(task_id = %incident.task_id, error = %error, "task failed after retry");
                false
            }
            Ok(RetryOutcome::TimedOut) => false,
            Err(e) => {
                warn!(task_id = %incident.task_id, error = %e, "retry orchestration failed");
                false
            }
        };

        HealingRecord {
            incident_id: incident.id,
            error_type: error_type.to_owned(),
            strategy_class: class,
            actions_taken: actions,
            duration: started.elapsed(),
            success,
            prevented: false,
            manual_required: false,
        }
    }

    /// Pick the healing path for a classified incident.
    async fn select_class(
        &self,
        incident: &ErrorIncident,
        analysis: &Classification,
    ) -> HealingStrategyClass {
        let pre_failure = incident
            .context
            .get("stage")
            .and_then(serde_json::Value::as_str)
            == Some("pre");
        if pre_failure {
            return HealingStrategyClass::Preventive;
        }

        let error_type = analysis.category.as_str();
        if let Ok(Some(pattern)) = self.db.pattern_by_signature(&analysis.signature).await {
            let recent_failures = self.recent_failures(error_type).await;
            let probability = self
                .predictor
                .recurrence_probability(pattern.occurrence_count, recent_failures);
            if probability >= self.config.health.prediction_threshold {
                return HealingStrategyClass::Predictive;
            }
        }

        if self.learner.has_sufficient_history(error_type).await {
            return HealingStrategyClass::Adaptive;
        }

        HealingStrategyClass::Reactive
    }

    /// For predictive/adaptive paths, put the learner's best strategy first.
    async fn apply_learned_ordering(
        &self,
        class: HealingStrategyClass,
        error_type: &str,
        incident: &ErrorIncident,
        mut analysis: Classification,
    ) -> Classification {
        if !matches!(
            class,
            HealingStrategyClass::Predictive | HealingStrategyClass::Adaptive
        ) {
            return analysis;
        }

        match self
            .learner
            .get_optimized_strategy(error_type, &incident.context)
            .await
        {
            Ok(Some(optimized)) => {
                let optimized_id = optimized.strategy_id();
                analysis
                    .candidates
                    .retain(|candidate| candidate.strategy_id() != optimized_id);
                analysis.candidates.insert(0, optimized);
            }
            Ok(None) => {}
            Err(e) => warn!(error_type, error = %e, "optimized strategy lookup failed"),
        }
        analysis
    }

    /// Emergency path: shed load, clear caches, staged service restarts.
    ///
    /// Bypasses the normal chain entirely and is rate-limited per hour; when
    /// the limit is hit nothing is executed and the incident escalates.
    async fn run_emergency(&self, incident: &ErrorIncident, started: Instant) -> HealingRecord {
        let error_type = incident
            .category
            .unwrap_or(ErrorCategory::Unknown)
            .as_str()
            .to_owned();

        if !self.emergency_budget_available().await {
            warn!(task_id = %incident.task_id, "emergency actions rate-limited, escalating");
            return self
                .manual_record(
                    incident,
                    HealingStrategyClass::Emergency,
                    started,
                    "emergency actions rate-limited",
                )
                .await;
        }

        self.intake_paused.store(true, Ordering::SeqCst);
        self.learner.clear_cache().await;

        let mut actions = vec!["pause_intake".to_owned(), "clear_learner_cache".to_owned()];
        let mut all_ok = true;

        // Staged restarts, one service at a time, in configured order.
        for service in &self.config.emergency.services {
            let command = format!("systemctl restart {service}");
            match self.pool.run_shell(&command, Duration::from_secs(60)).await {
                Ok(result) if result.success() => {
                    info!(service = %service, "emergency restart issued");
                    actions.push(command);
                }
                Ok(result) => {
                    warn!(service = %service, output = %result.output(), "emergency restart failed");
                    actions.push(command);
                    all_ok = false;
                }
                Err(e) => {
                    warn!(service = %service, error = %e, "emergency restart failed");
                    all_ok = false;
                }
            }
        }

        let (score, _) = self.current_health().await;
        {
            let mut reporter = self.reporter.lock().await;
            if let Err(e) = reporter.send_emergency_transition(true, score).await {
                warn!(error = %e, "emergency notification failed");
            }
        }

        HealingRecord {
            incident_id: incident.id,
            error_type,
            strategy_class: HealingStrategyClass::Emergency,
            actions_taken: actions,
            duration: started.elapsed(),
            success: all_ok,
            prevented: false,
            manual_required: !all_ok,
        }
    }

    /// Build a manual-escalation record and send the alert.
    async fn manual_record(
        &self,
        incident: &ErrorIncident,
        class: HealingStrategyClass,
        started: Instant,
        reason: &str,
    ) -> HealingRecord {
        {
            let mut reporter = self.reporter.lock().await;
            if let Err(e) = reporter.send_manual_intervention(incident, reason).await {
                warn!(error = %e, "manual-intervention notification failed");
            }
        }

        HealingRecord {
            incident_id: incident.id,
            error_type: incident
                .category
                .unwrap_or(ErrorCategory::Unknown)
                .as_str()
                .to_owned(),
            strategy_class: class,
            actions_taken: Vec::new(),
            duration: started.elapsed(),
            success: false,
            prevented: false,
            manual_required: true,
        }
    }

    // -- background loops --

    /// Spawn the health-check, optimization, and predictive-scan loops.
    ///
    /// Each loop stops when the shutdown signal flips to `true`.
    pub fn spawn_loops(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let health = {
            let orchestrator = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(
                    orchestrator.config.health.check_interval_secs,
                ));
                let mut checks: u64 = 0;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            checks = checks.saturating_add(1);
                            orchestrator.health_check_tick(checks).await;
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                debug!("health loop stopping");
                                break;
                            }
                        }
                    }
                }
            })
        };

        let optimization = {
            let orchestrator = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(
                    orchestrator.config.health.optimization_interval_secs,
                ));
                // The first tick fires immediately; skip it so a fresh start
                // does not optimize an empty ledger.
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            match orchestrator.learner.optimize_all_strategies().await {
                                Ok(summary) => info!(
                                    examined = summary.examined,
                                    updated = summary.updated,
                                    "optimization pass complete"
                                ),
                                Err(e) => warn!(error = %e, "optimization pass failed"),
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                debug!("optimization loop stopping");
                                break;
                            }
                        }
                    }
                }
            })
        };

        let predictive = {
            let orchestrator = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(
                    orchestrator.config.health.predictive_scan_interval_secs,
                ));
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            orchestrator.predictive_scan_tick().await;
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                debug!("predictive loop stopping");
                                break;
                            }
                        }
                    }
                }
            })
        };

        vec![health, optimization, predictive]
    }

    /// Wait for in-flight incident handling (including any rollback) to end.
    pub async fn drain(&self) {
        let _exclusive = self.drain.write().await;
    }

    /// One health-check cycle: recompute, persist, react to tier changes.
    async fn health_check_tick(&self, checks: u64) {
        let metrics = self.compute_metrics().await;
        let avg_ms = self.window_avg_healing_ms().await;
        let snapshot = health::take_snapshot(
            &metrics,
            avg_ms,
            self.active_issues.load(Ordering::SeqCst),
        );

        let metrics_json = serde_json::to_string(&metrics).unwrap_or_else(|_| "{}".to_owned());
        if let Err(e) = self
            .db
            .insert_health_snapshot(
                &snapshot.timestamp.to_rfc3339(),
                snapshot.status.as_str(),
                snapshot.score,
                snapshot.auto_healing_rate,
                snapshot.prevention_rate,
                snapshot.avg_healing_time_ms,
                snapshot.active_issues,
                &metrics_json,
            )
            .await
        {
            warn!(error = %e, "failed to persist health snapshot");
        }

        let previous = {
            let mut current = self.current_health.lock().await;
            let previous = current.1;
            *current = (snapshot.score, snapshot.status);
            previous
        };

        if previous != HealthStatusTier::Critical && snapshot.status == HealthStatusTier::Critical
        {
            warn!(score = snapshot.score, "health dropped to critical");
            let mut reporter = self.reporter.lock().await;
            if let Err(e) = reporter.send_emergency_transition(true, snapshot.score).await {
                warn!(error = %e, "emergency notification failed");
            }
        } else if previous == HealthStatusTier::Critical
            && snapshot.status != HealthStatusTier::Critical
        {
            info!(score = snapshot.score, "health recovered, resuming intake");
            self.intake_paused.store(false, Ordering::SeqCst);
            let mut reporter = self.reporter.lock().await;
            if let Err(e) = reporter.send_emergency_transition(false, snapshot.score).await {
                warn!(error = %e, "recovery notification failed");
            }
        }

        let summary_every = self.config.reports.summary_every_checks.max(1);
        if checks.checked_rem(summary_every) == Some(0) {
            let mut reporter = self.reporter.lock().await;
            if let Err(e) = reporter.send_health_summary(&snapshot).await {
                warn!(error = %e, "health summary failed");
            }
        }

        debug!(
            score = snapshot.score,
            status = snapshot.status.as_str(),
            "health check complete"
        );
    }

    /// One predictive-scan cycle: proactively fix likely-recurring patterns.
    async fn predictive_scan_tick(&self) {
        let patterns = match self.db.patterns_by_occurrence().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "predictive scan could not load patterns");
                return;
            }
        };

        for pattern in patterns.iter().take(20) {
            if !pattern.auto_fixed || pattern.category == ErrorCategory::Unknown.as_str() {
                continue;
            }
            let recent_failures = self.recent_failures(&pattern.error_type).await;
            let probability = self
                .predictor
                .recurrence_probability(pattern.occurrence_count, recent_failures);
            if probability < self.config.health.prediction_threshold {
                continue;
            }

            {
                let mut counters = self.counters.lock().await;
                counters.predictions_made = counters.predictions_made.saturating_add(1);
            }
            {
                let mut predicted = self.predicted.lock().await;
                predicted.insert(pattern.error_type.clone(), Utc::now());
            }

            debug!(
                signature = %pattern.signature,
                probability,
                "predictive scan triggering preventive fix"
            );
            let incident = ErrorIncident::new(
                pattern.sample.clone(),
                "predictive-scan".to_owned(),
                format!("preventive-{}", pattern.signature),
                serde_json::json!({"stage": "pre"}),
                "internal".to_owned(),
            );
            let _ = self.handle_incident(incident).await;
        }
    }

    // -- metric plumbing --

    /// Assemble the health sub-metrics from persisted and runtime state.
    async fn compute_metrics(&self) -> HealthMetrics {
        let window_start = self.window_start();
        let aggregates = self
            .db
            .healing_aggregates_since(&window_start)
            .await
            .unwrap_or_default();
        let counters = *self.counters.lock().await;

        #[allow(clippy::cast_precision_loss)]
        let auto_fix_success_rate = if aggregates.total > 0 {
            aggregates.successes as f64 / aggregates.total as f64
        } else {
            0.5
        };
        #[allow(clippy::cast_precision_loss)]
        let prevention_rate = if aggregates.total > 0 {
            aggregates.prevented as f64 / aggregates.total as f64
        } else {
            0.5
        };
        #[allow(clippy::cast_precision_loss)]
        let prediction_accuracy = if counters.predictions_made > 0 {
            counters.predictions_confirmed as f64 / counters.predictions_made as f64
        } else {
            0.5
        };
        #[allow(clippy::cast_precision_loss)]
        let retry_success_rate = if counters.retries_issued > 0 {
            counters.retries_succeeded as f64 / counters.retries_issued as f64
        } else {
            0.5
        };
        #[allow(clippy::cast_precision_loss)]
        let error_rate =
            (counters.incidents_seen.min(ERROR_RATE_SATURATION) as f64) / ERROR_RATE_SATURATION as f64;

        HealthMetrics {
            auto_fix_success_rate,
            prevention_rate,
            prediction_accuracy,
            retry_success_rate,
            error_rate,
        }
    }

    /// Mean healing duration over the metrics window.
    async fn window_avg_healing_ms(&self) -> i64 {
        self.db
            .healing_aggregates_since(&self.window_start())
            .await
            .map(|a| a.avg_duration_ms)
            .unwrap_or(0)
    }

    /// RFC 3339 start of the rolling metrics window.
    fn window_start(&self) -> String {
        let now = Utc::now();
        now.checked_sub_signed(chrono::Duration::hours(
            i64::try_from(self.config.health.metrics_window_hours).unwrap_or(24),
        ))
        .unwrap_or(now)
        .to_rfc3339()
    }

    /// Failures for an error type among its recent executions.
    async fn recent_failures(&self, error_type: &str) -> i64 {
        match self.db.recent_executions(error_type, 20).await {
            Ok(rows) => {
                i64::try_from(rows.iter().filter(|row| !row.success).count()).unwrap_or(i64::MAX)
            }
            Err(_) => 0,
        }
    }

    /// Mark a prediction confirmed when its category shows up for real.
    async fn confirm_prediction(&self, error_type: &str) {
        let confirmed = {
            let mut predicted = self.predicted.lock().await;
            predicted.remove(error_type).is_some()
        };
        if confirmed {
            let mut counters = self.counters.lock().await;
            counters.predictions_confirmed = counters.predictions_confirmed.saturating_add(1);
        }
    }

    /// Whether an emergency action fits inside the hourly rate limit.
    async fn emergency_budget_available(&self) -> bool {
        let now = Utc::now();
        let one_hour_ago = now
            .checked_sub_signed(chrono::Duration::hours(1))
            .unwrap_or(now);

        let mut times = self.emergency_times.lock().await;
        times.retain(|t| *t > one_hour_ago);
        let limit = usize::try_from(self.config.emergency.max_actions_per_hour).unwrap_or(usize::MAX);
        if times.len() >= limit {
            return false;
        }
        times.push(now);
        true
    }

    /// Dedup check: identical (error, task) pairs inside the window drop.
    async fn is_duplicate(&self, incident: &ErrorIncident) -> bool {
        let now = Utc::now();
        let window = chrono::Duration::seconds(
            i64::try_from(self.config.intake.dedup_window_secs).unwrap_or(60),
        );
        let cutoff = now.checked_sub_signed(window).unwrap_or(now);

        let mut seen = self.seen.lock().await;
        seen.retain(|_, at| *at > cutoff);
        if seen.contains_key(&incident.dedup_hash) {
            return true;
        }
        seen.insert(incident.dedup_hash, now);
        false
    }

    /// Per-task-id lock, created on first use.
    async fn lock_for(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.task_locks.lock().await;
        Arc::clone(
            locks
                .entry(task_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Most recent health snapshot persisted to the health log.
    ///
    /// # Errors
    ///
    /// Returns an error if the health log is unreachable.
    pub async fn latest_snapshot(&self) -> anyhow::Result<Option<HealthSnapshot>> {
        let Some(row) = self.db.latest_health_snapshot().await? else {
            return Ok(None);
        };
        let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        let status = match row.status.as_str() {
            "excellent" => HealthStatusTier::Excellent,
            "good" => HealthStatusTier::Good,
            "fair" => HealthStatusTier::Fair,
            "poor" => HealthStatusTier::Poor,
            _ => HealthStatusTier::Critical,
        };
        Ok(Some(HealthSnapshot {
            timestamp,
            score: row.score,
            status,
            auto_healing_rate: row.auto_healing_rate,
            prevention_rate: row.prevention_rate,
            avg_healing_time_ms: row.avg_healing_time_ms,
            active_issues: row.active_issues,
        }))
    }
}
