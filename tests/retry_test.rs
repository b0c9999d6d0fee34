//! Tests for retry decisions, the per-task state machine, and resubmission.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mender::config::{MenderConfig, RetryPolicyConfig};
use mender::fixer::FixExecutor;
use mender::retry::{RetryOrchestrator, RetryOutcome};
use mender::transport::{ChannelTransport, TaskCompletion};
use mender::types::{
    ErrorCategory, ErrorIncident, FixExecutionResult, FixStrategy, RetryStatus, SafetyClass,
    StrategyKind,
};
use mender::workers::CommandPool;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Config with instant delays and short completion windows so tests run fast.
fn fast_config() -> MenderConfig {
    let mut config = MenderConfig::default();
    let mut policies = HashMap::new();
    policies.insert(
        "network".to_owned(),
        RetryPolicyConfig {
            max_retries: 2,
            base_delay_secs: 0,
            backoff_factor: 1.0,
            max_delay_secs: 0,
            exponential: false,
        },
    );
    policies.insert(
        "filesystem".to_owned(),
        RetryPolicyConfig {
            max_retries: 2,
            base_delay_secs: 0,
            backoff_factor: 1.0,
            max_delay_secs: 0,
            exponential: false,
        },
    );
    policies.insert(
        "unknown".to_owned(),
        RetryPolicyConfig {
            max_retries: 1,
            base_delay_secs: 0,
            backoff_factor: 1.0,
            max_delay_secs: 0,
            exponential: false,
        },
    );
    config.retry.policies = policies;
    config.retry.completion_timeout_secs = 1;
    config.retry.poll_interval_ms = 20;
    config
}

fn setup(config: &MenderConfig) -> (RetryOrchestrator, ChannelTransport) {
    let (transport, mut rx) = ChannelTransport::new(16);
    // Drain submissions so the channel never fills.
    tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let fixer = Arc::new(FixExecutor::new(
        CommandPool::new(2),
        config.fixer.clone(),
    ));
    let orchestrator = RetryOrchestrator::new(config, fixer, Arc::new(transport.clone()))
        .expect("orchestrator");
    (orchestrator, transport)
}

fn incident(task_id: &str, category: ErrorCategory) -> ErrorIncident {
    let mut incident = ErrorIncident::new(
        "ConnectionResetError: peer dropped".to_owned(),
        "ingest".to_owned(),
        task_id.to_owned(),
        serde_json::json!({"payload": {"job": "sync"}}),
        "tasks.ingest".to_owned(),
    );
    incident.category = Some(category);
    incident
}

fn successful_fix() -> FixExecutionResult {
    FixExecutionResult {
        strategy_used: Some(FixStrategy {
            kind: StrategyKind::RetryWithDelay,
            command: String::new(),
            description: "wait and retry".to_owned(),
            safety: SafetyClass::Safe,
        }),
        executed_commands: Vec::new(),
        success: true,
        verification_passed: true,
        rollback_performed: false,
        execution_time: Duration::from_millis(5),
        error: None,
    }
}

fn failed_fix() -> FixExecutionResult {
    FixExecutionResult {
        strategy_used: None,
        executed_commands: Vec::new(),
        success: false,
        verification_passed: false,
        rollback_performed: false,
        execution_time: Duration::from_millis(5),
        error: Some("no applicable fix candidate".to_owned()),
    }
}

// ---------------------------------------------------------------------------
// should_retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_fix_denies_retry() {
    let config = fast_config();
    let (orchestrator, _transport) = setup(&config);

    let decision = orchestrator
        .should_retry(
            ErrorCategory::Network,
            &incident("t-1", ErrorCategory::Network),
            &failed_fix(),
        )
        .await;

    assert!(!decision.retry);
    assert!(decision.reason.contains("fix"));
}

#[tokio::test]
async fn retry_allowed_for_verified_fix() {
    let config = fast_config();
    let (orchestrator, _transport) = setup(&config);

    let decision = orchestrator
        .should_retry(
            ErrorCategory::Network,
            &incident("t-2", ErrorCategory::Network),
            &successful_fix(),
        )
        .await;

    assert!(decision.retry);
    assert_eq!(decision.retry_count, 0);
    assert_eq!(decision.max_retries, 2);
}

#[tokio::test]
async fn preretry_verification_gates_filesystem_retries() {
    let config = fast_config();
    let (orchestrator, _transport) = setup(&config);
    let dir = tempfile::tempdir().expect("tempdir");

    // Strategy whose created file exists: verification passes.
    let existing = dir.path().join("present.txt");
    std::fs::write(&existing, b"x").expect("write");
    let mut fix = successful_fix();
    fix.strategy_used = Some(FixStrategy {
        kind: StrategyKind::CreateFile,
        command: format!("touch '{}'", existing.display()),
        description: "create file".to_owned(),
        safety: SafetyClass::Caution,
    });

    let decision = orchestrator
        .should_retry(
            ErrorCategory::Filesystem,
            &incident("t-3", ErrorCategory::Filesystem),
            &fix,
        )
        .await;
    assert!(decision.retry);

    // Strategy pointing at a missing file: verification fails, retry denied.
    let mut broken = successful_fix();
    broken.strategy_used = Some(FixStrategy {
        kind: StrategyKind::CreateFile,
        command: format!("touch '{}'", dir.path().join("gone.txt").display()),
        description: "create file".to_owned(),
        safety: SafetyClass::Caution,
    });

    let decision = orchestrator
        .should_retry(
            ErrorCategory::Filesystem,
            &incident("t-4", ErrorCategory::Filesystem),
            &broken,
        )
        .await;
    assert!(!decision.retry);
    assert!(decision.reason.contains("verification"));
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_retry_reaches_terminal_success() {
    let config = fast_config();
    let (orchestrator, transport) = setup(&config);
    let incident = incident("t-5", ErrorCategory::Network);

    transport
        .post_completion("t-5", TaskCompletion::Succeeded)
        .await;

    let decision = orchestrator
        .should_retry(ErrorCategory::Network, &incident, &successful_fix())
        .await;
    assert!(decision.retry);

    let outcome = orchestrator
        .orchestrate_retry(&incident, &successful_fix(), &decision)
        .await
        .expect("orchestrate");
    assert_eq!(outcome, RetryOutcome::Succeeded);
    assert_eq!(
        orchestrator.status("t-5").await,
        Some(RetryStatus::Success)
    );

    // Terminal: an identical error under the same id is never retried again.
    let decision = orchestrator
        .should_retry(ErrorCategory::Network, &incident, &successful_fix())
        .await;
    assert!(!decision.retry);
    assert!(decision.reason.contains("terminal"));
    assert_eq!(
        orchestrator.status("t-5").await,
        Some(RetryStatus::Success)
    );
}

#[tokio::test]
async fn missing_completion_times_out_to_failed() {
    let config = fast_config();
    let (orchestrator, _transport) = setup(&config);
    let incident = incident("t-6", ErrorCategory::Network);

    let decision = orchestrator
        .should_retry(ErrorCategory::Network, &incident, &successful_fix())
        .await;
    assert!(decision.retry);

    let outcome = orchestrator
        .orchestrate_retry(&incident, &successful_fix(), &decision)
        .await
        .expect("orchestrate");
    assert_eq!(outcome, RetryOutcome::TimedOut);
    assert_eq!(orchestrator.status("t-6").await, Some(RetryStatus::Failed));
}

#[tokio::test]
async fn exhausted_budget_is_terminal() {
    let config = fast_config();
    let (orchestrator, transport) = setup(&config);
    // "unknown" allows a single retry.
    let incident = incident("t-7", ErrorCategory::Unknown);

    transport
        .post_completion("t-7", TaskCompletion::Failed("still broken".to_owned()))
        .await;

    let decision = orchestrator
        .should_retry(ErrorCategory::Unknown, &incident, &successful_fix())
        .await;
    assert!(decision.retry);

    let outcome = orchestrator
        .orchestrate_retry(&incident, &successful_fix(), &decision)
        .await
        .expect("orchestrate");
    assert!(matches!(outcome, RetryOutcome::FailedAgain { .. }));
    assert_eq!(
        orchestrator.status("t-7").await,
        Some(RetryStatus::MaxRetriesExceeded)
    );

    // Budget exhausted regardless of fix success.
    let decision = orchestrator
        .should_retry(ErrorCategory::Unknown, &incident, &successful_fix())
        .await;
    assert!(!decision.retry);
}

#[tokio::test]
async fn resubmission_carries_retry_metadata() {
    let config = fast_config();
    let (transport, mut rx) = ChannelTransport::new(4);
    let fixer = Arc::new(FixExecutor::new(
        CommandPool::new(2),
        config.fixer.clone(),
    ));
    let orchestrator =
        RetryOrchestrator::new(&config, fixer, Arc::new(transport.clone())).expect("orchestrator");

    let incident = incident("t-8", ErrorCategory::Network);
    transport
        .post_completion("t-8", TaskCompletion::Succeeded)
        .await;

    let decision = orchestrator
        .should_retry(ErrorCategory::Network, &incident, &successful_fix())
        .await;
    orchestrator
        .orchestrate_retry(&incident, &successful_fix(), &decision)
        .await
        .expect("orchestrate");

    let message = rx.recv().await.expect("resubmission");
    assert_eq!(message.task_id, "t-8");
    assert_eq!(message.queue, "tasks.ingest");
    assert_eq!(message.retry_metadata.retry_count, 1);
    assert!(message.retry_metadata.fix_applied);
    assert_eq!(
        message.retry_metadata.original_error,
        "ConnectionResetError: peer dropped"
    );
    assert_eq!(message.payload, serde_json::json!({"job": "sync"}));
}
