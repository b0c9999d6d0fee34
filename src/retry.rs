//! Retry orchestration: decisions, category backoff, per-task state machine.
//!
//! A task id moves Pending → InProgress → {Success | Failed |
//! MaxRetriesExceeded}. Terminal states are sticky: once a task id lands in
//! one, no further retry is ever issued for it, even if the identical error
//! recurs under the same id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{MenderConfig, ProbesConfig, RetryConfig, RetryPolicyConfig};
use crate::fixer::FixExecutor;
use crate::transport::{TaskCompletion, TaskTransport};
use crate::types::{
    ErrorCategory, ErrorIncident, FixExecutionResult, RetryMessage, RetryMetadata, RetryStatus,
};

/// Decision returned by [`RetryOrchestrator::should_retry`].
#[derive(Debug, Clone)]
pub struct RetryDecision {
    /// Whether a retry will be issued.
    pub retry: bool,
    /// Human-readable reason for the decision.
    pub reason: String,
    /// Delay before resubmission (zero when `retry` is false).
    pub delay: Duration,
    /// Retries already consumed for this task.
    pub retry_count: u32,
    /// Retry budget for this category.
    pub max_retries: u32,
}

/// Terminal outcome of one orchestrated retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The resubmitted task completed successfully.
    Succeeded,
    /// The resubmitted task failed again.
    FailedAgain {
        /// New error text reported by the worker.
        error: String,
    },
    /// No completion arrived within the bounded wait.
    TimedOut,
}

/// Per-task retry bookkeeping.
#[derive(Debug, Clone)]
struct TaskState {
    status: RetryStatus,
    retry_count: u32,
    last_attempt: Option<DateTime<Utc>>,
}

impl TaskState {
    fn fresh() -> Self {
        Self {
            status: RetryStatus::Pending,
            retry_count: 0,
            last_attempt: None,
        }
    }
}

/// Decides whether and when to retry a healed task, and resubmits it.
pub struct RetryOrchestrator {
    retry: RetryConfig,
    probes: ProbesConfig,
    fixer: Arc<FixExecutor>,
    transport: Arc<dyn TaskTransport>,
    http: reqwest::Client,
    states: Mutex<HashMap<String, TaskState>>,
}

impl RetryOrchestrator {
    /// Build the orchestrator from config and its collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe HTTP client cannot be constructed.
    pub fn new(
        config: &MenderConfig,
        fixer: Arc<FixExecutor>,
        transport: Arc<dyn TaskTransport>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probes.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build probe client: {e}"))?;

        Ok(Self {
            retry: config.retry.clone(),
            probes: config.probes.clone(),
            fixer,
            transport,
            http,
            states: Mutex::new(HashMap::new()),
        })
    }

    /// Current retry status for a task id, if it has been seen.
    pub async fn status(&self, task_id: &str) -> Option<RetryStatus> {
        let states = self.states.lock().await;
        states.get(task_id).map(|s| s.status)
    }

    /// Decide whether to retry the original task after a fix attempt.
    ///
    /// Denies when the fix failed, the retry budget is exhausted, a required
    /// pre-retry verification fails, or a required liveness probe fails.
    pub async fn should_retry(
        &self,
        category: ErrorCategory,
        incident: &ErrorIncident,
        fix_result: &FixExecutionResult,
    ) -> RetryDecision {
        let policy = policy_for(&self.retry, category);

        let (status, retry_count) = {
            let mut states = self.states.lock().await;
            let state = states
                .entry(incident.task_id.clone())
                .or_insert_with(TaskState::fresh);
            (state.status, state.retry_count)
        };

        let denied = |reason: String| RetryDecision {
            retry: false,
            reason,
            delay: Duration::ZERO,
            retry_count,
            max_retries: policy.max_retries,
        };

        if status.is_terminal() {
            return denied(format!("task is terminal ({status:?})"));
        }

        if !fix_result.success {
            return denied("fix did not succeed".to_owned());
        }

        if retry_count >= policy.max_retries {
            self.mark(&incident.task_id, RetryStatus::MaxRetriesExceeded)
                .await;
            return denied(format!(
                "retry budget exhausted ({retry_count}/{})",
                policy.max_retries
            ));
        }

        if category.needs_preretry_verification() {
            let verified = match &fix_result.strategy_used {
                Some(strategy) => self.fixer.verify_fix(strategy).await,
                None => false,
            };
            if !verified {
                return denied("pre-retry verification failed".to_owned());
            }
        }

        if category.needs_liveness_probe() {
            let url = match category {
                ErrorCategory::Broker => &self.probes.broker_health_url,
                _ => &self.probes.network_probe_url,
            };
            if !self.probe_ok(url.as_deref()).await {
                return denied("liveness probe failed".to_owned());
            }
        }

        let delay = compute_delay(&policy, retry_count, &mut rand::thread_rng());
        RetryDecision {
            retry: true,
            reason: "fix verified, retry scheduled".to_owned(),
            delay,
            retry_count,
            max_retries: policy.max_retries,
        }
    }

    /// Wait the decided delay, resubmit the task with retry metadata, and
    /// poll for its completion within a bounded window.
    ///
    /// The sleep is a scheduled `tokio` timer, so other incidents keep
    /// flowing while this task waits.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses the resubmission.
    pub async fn orchestrate_retry(
        &self,
        incident: &ErrorIncident,
        fix_result: &FixExecutionResult,
        decision: &RetryDecision,
    ) -> anyhow::Result<RetryOutcome> {
        let attempt = {
            let mut states = self.states.lock().await;
            let state = states
                .entry(incident.task_id.clone())
                .or_insert_with(TaskState::fresh);
            state.status = RetryStatus::InProgress;
            state.retry_count = state.retry_count.saturating_add(1);
            state.last_attempt = Some(Utc::now());
            state.retry_count
        };

        debug!(
            task_id = %incident.task_id,
            attempt,
            delay_secs = decision.delay.as_secs(),
            "retry scheduled"
        );
        tokio::time::sleep(decision.delay).await;

        let message = RetryMessage {
            task_id: incident.task_id.clone(),
            queue: incident.source_queue.clone(),
            payload: incident
                .context
                .get("payload")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            retry_metadata: RetryMetadata {
                original_error: incident.error_text.clone(),
                fix_applied: fix_result.success,
                fix_command: fix_result
                    .strategy_used
                    .as_ref()
                    .map(|s| s.command.clone()),
                retry_timestamp: Utc::now().to_rfc3339(),
                retry_count: attempt,
            },
        };

        self.transport
            .submit(message)
            .await
            .map_err(|e| anyhow::anyhow!("failed to resubmit task: {e}"))?;

        let outcome = self.await_completion(&incident.task_id).await;

        let policy = policy_for(
            &self.retry,
            incident.category.unwrap_or(ErrorCategory::Unknown),
        );
        match &outcome {
            RetryOutcome::Succeeded => {
                info!(task_id = %incident.task_id, attempt, "retry succeeded");
                self.mark(&incident.task_id, RetryStatus::Success).await;
            }
            RetryOutcome::FailedAgain { error } => {
                warn!(task_id = %incident.task_id, attempt, error = %error, "retry failed");
                if attempt >= policy.max_retries {
                    self.mark(&incident.task_id, RetryStatus::MaxRetriesExceeded)
                        .await;
                } else {
                    // Budget remains: the next incident for this task may try again.
                    self.mark(&incident.task_id, RetryStatus::Pending).await;
                }
            }
            RetryOutcome::TimedOut => {
                warn!(task_id = %incident.task_id, attempt, "no completion within deadline");
                self.mark(&incident.task_id, RetryStatus::Failed).await;
            }
        }

        Ok(outcome)
    }

    /// Poll the transport for a completion until the bounded deadline.
    async fn await_completion(&self, task_id: &str) -> RetryOutcome {
        let deadline = Duration::from_secs(self.retry.completion_timeout_secs);
        let poll_every = Duration::from_millis(self.retry.poll_interval_ms);
        let started = tokio::time::Instant::now();

        loop {
            match self.transport.poll_result(task_id).await {
                Ok(Some(TaskCompletion::Succeeded)) => return RetryOutcome::Succeeded,
                Ok(Some(TaskCompletion::Failed(error))) => {
                    return RetryOutcome::FailedAgain { error }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "completion poll failed");
                }
            }

            if started.elapsed() >= deadline {
                return RetryOutcome::TimedOut;
            }
            tokio::time::sleep(poll_every).await;
        }
    }

    /// Transition a task's status, refusing to leave a terminal state.
    async fn mark(&self, task_id: &str, status: RetryStatus) {
        let mut states = self.states.lock().await;
        let state = states
            .entry(task_id.to_owned())
            .or_insert_with(TaskState::fresh);
        if state.status.is_terminal() {
            debug!(task_id = %task_id, current = ?state.status, "ignoring transition out of terminal state");
            return;
        }
        state.status = status;
    }

    /// HTTP liveness probe; an unconfigured probe passes vacuously.
    async fn probe_ok(&self, url: Option<&str>) -> bool {
        let Some(url) = url else { return true };
        match self.http.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url, error = %e, "liveness probe failed");
                false
            }
        }
    }
}

/// Policy for a category, falling back to the "unknown" policy.
fn policy_for(config: &RetryConfig, category: ErrorCategory) -> RetryPolicyConfig {
    config
        .policies
        .get(category.as_str())
        .or_else(|| config.policies.get("unknown"))
        .cloned()
        .unwrap_or(RetryPolicyConfig {
            max_retries: 1,
            base_delay_secs: 30,
            backoff_factor: 1.0,
            max_delay_secs: 30,
            exponential: false,
        })
}

/// Compute the delay before retry attempt `retry_count`.
///
/// Exponential categories get base × factor^count capped at the policy
/// maximum, then widened by 0–10% jitter; flat categories always wait the
/// base delay.
pub fn compute_delay<R: Rng>(
    policy: &RetryPolicyConfig,
    retry_count: u32,
    rng: &mut R,
) -> Duration {
    if !policy.exponential {
        return Duration::from_secs(policy.base_delay_secs);
    }

    #[allow(clippy::cast_precision_loss)]
    let base = policy.base_delay_secs as f64;
    #[allow(clippy::cast_precision_loss)]
    let cap = policy.max_delay_secs as f64;

    let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
    let raw = base * policy.backoff_factor.powi(exponent);
    let capped = raw.min(cap);

    let jitter = rng.gen_range(0.0..0.1);
    Duration::from_secs_f64(capped * (1.0 + jitter))
}
