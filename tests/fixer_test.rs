//! Tests for deny-list gating, fix execution, verification, and rollback.

use std::sync::Arc;

use mender::config::{ClassifierConfig, FixerConfig};
use mender::db::StateDb;
use mender::fixer::FixExecutor;
use mender::patterns::ErrorClassifier;
use mender::types::{ErrorIncident, FixStrategy, SafetyClass, StrategyKind};
use mender::workers::CommandPool;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn executor() -> FixExecutor {
    FixExecutor::new(CommandPool::new(2), FixerConfig::default())
}

fn incident(error_text: &str) -> ErrorIncident {
    ErrorIncident::new(
        error_text.to_owned(),
        "ingest".to_owned(),
        "task-fixer".to_owned(),
        serde_json::Value::Null,
        "tasks.ingest".to_owned(),
    )
}

async fn classification_for(
    error_text: &str,
    dir: &tempfile::TempDir,
) -> mender::patterns::Classification {
    let db = Arc::new(
        StateDb::open(&dir.path().join("state.db"))
            .await
            .expect("open db"),
    );
    let classifier =
        ErrorClassifier::new(Arc::clone(&db), ClassifierConfig::default()).expect("classifier");
    classifier
        .classify(error_text, &serde_json::Value::Null)
        .await
        .expect("classify")
}

fn strategy(kind: StrategyKind, command: &str) -> FixStrategy {
    FixStrategy {
        kind,
        command: command.to_owned(),
        description: "test strategy".to_owned(),
        safety: SafetyClass::Caution,
    }
}

fn analysis_with(candidates: Vec<FixStrategy>) -> mender::patterns::Classification {
    mender::patterns::Classification {
        category: mender::types::ErrorCategory::Filesystem,
        severity: mender::types::Severity::Medium,
        auto_fixable: true,
        confidence: 0.9,
        candidates,
        signature: "test".to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Deny-list
// ---------------------------------------------------------------------------

#[tokio::test]
async fn denied_commands_never_execute() {
    let fixer = executor();
    let analysis = analysis_with(vec![
        strategy(StrategyKind::GenericCommand, "rm -rf /var/lib/app"),
        strategy(StrategyKind::GenericCommand, "psql -c 'DROP DATABASE prod'"),
    ]);

    let result = fixer.execute(&analysis, &incident("boom")).await;

    assert!(result.executed_commands.is_empty());
    assert!(!result.success);
    assert!(result.error.is_some());
    assert!(result.strategy_used.is_none());
}

#[tokio::test]
async fn denied_candidate_is_skipped_but_next_runs() {
    let fixer = executor();
    let analysis = analysis_with(vec![
        strategy(StrategyKind::GenericCommand, "rm -rf /tmp/cache"),
        strategy(StrategyKind::GenericCommand, "true"),
    ]);

    let result = fixer.execute(&analysis, &incident("boom")).await;

    assert!(result.success);
    assert_eq!(result.executed_commands, vec!["true".to_owned()]);
}

// ---------------------------------------------------------------------------
// Execution and verification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_file_fix_verifies_file_exists() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("missing").join("input.csv");
    let error_text = format!(
        "FileNotFoundError: [Errno 2] No such file or directory: '{}'",
        path.display()
    );

    let class_dir = tempfile::tempdir().expect("tempdir");
    let analysis = classification_for(&error_text, &class_dir).await;
    let fixer = executor();

    let result = fixer.execute(&analysis, &incident(&error_text)).await;

    assert!(result.success, "fix failed: {:?}", result.error);
    assert!(result.verification_passed);
    assert!(!result.rollback_performed);
    assert!(path.exists());
}

#[tokio::test]
async fn failing_candidate_falls_through_to_next() {
    let fixer = executor();
    let analysis = analysis_with(vec![
        strategy(StrategyKind::GenericCommand, "exit 9"),
        strategy(StrategyKind::GenericCommand, "true"),
    ]);

    let result = fixer.execute(&analysis, &incident("boom")).await;

    assert!(result.success);
    assert_eq!(
        result.executed_commands,
        vec!["exit 9".to_owned(), "true".to_owned()]
    );
}

#[tokio::test]
async fn missing_env_var_is_a_failed_strategy() {
    let fixer = executor();
    let analysis = analysis_with(vec![strategy(
        StrategyKind::CheckEnv,
        "printenv MENDER_TEST_SURELY_UNSET_VAR",
    )]);

    let result = fixer.execute(&analysis, &incident("boom")).await;

    assert!(!result.success);
    assert_eq!(result.executed_commands.len(), 1);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|e| e.contains("MENDER_TEST_SURELY_UNSET_VAR")));
}

#[tokio::test]
async fn timeout_is_a_failed_strategy_not_a_crash() {
    let fixer = executor();
    // GenericCommand has a 60s deadline, so force the timeout through a
    // retry-with-delay-free single slow candidate instead: use CreateFile's
    // 5s budget via a generic sleep under ChangePermission (5s deadline).
    let analysis = analysis_with(vec![
        strategy(StrategyKind::ChangePermission, "sleep 30 && chmod u+rw 'x'"),
        strategy(StrategyKind::GenericCommand, "true"),
    ]);

    let result = fixer.execute(&analysis, &incident("boom")).await;

    // The slow candidate timed out, the fallback succeeded.
    assert!(result.success);
    assert_eq!(result.executed_commands.len(), 2);
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

/// Stub `pip` that records its arguments, plus an interpreter that always
/// fails imports, force the install→verify→rollback path without touching
/// the real environment.
#[cfg(unix)]
#[tokio::test]
async fn failed_verification_rolls_back_install() {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let bin_dir = dir.path().join("bin");
    std::fs::create_dir_all(&bin_dir).expect("mkdir");

    let log_path = dir.path().join("pip.log");
    let pip_path = bin_dir.join("pip");
    let mut pip = std::fs::File::create(&pip_path).expect("create pip stub");
    writeln!(pip, "#!/bin/sh\necho \"$@\" >> '{}'\nexit 0", log_path.display()).expect("write");
    drop(pip);
    std::fs::set_permissions(&pip_path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod pip");

    let original_path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH", format!("{}:{original_path}", bin_dir.display()));

    let config = FixerConfig {
        // Import verification must fail: point at a missing interpreter.
        python_bin: "/nonexistent/python3".to_owned(),
        ..FixerConfig::default()
    };
    let fixer = FixExecutor::new(CommandPool::new(2), config);

    let analysis = analysis_with(vec![strategy(
        StrategyKind::InstallPackage,
        "pip install requests",
    )]);

    let result = fixer.execute(&analysis, &incident("boom")).await;

    assert!(!result.success);
    assert!(!result.verification_passed);
    assert!(result.rollback_performed);
    assert_eq!(result.executed_commands, vec!["pip install requests".to_owned()]);

    let log = std::fs::read_to_string(&log_path).expect("pip log");
    assert!(log.contains("install requests"));
    assert!(log.contains("uninstall -y requests"));
}
