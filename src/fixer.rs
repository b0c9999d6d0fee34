//! Fix execution: deny-list gate, per-kind handlers, verification, rollback.
//!
//! Candidates are tried in priority order. A deny-list hit rejects the
//! candidate without executing anything. The first handler that succeeds
//! short-circuits the loop and is verified with a real category-specific
//! check; a failed verification triggers a best-effort rollback and the
//! overall result is marked failed. All commands run on the bounded worker
//! pool with per-kind deadlines.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::FixerConfig;
use crate::patterns::Classification;
use crate::types::{ErrorIncident, FixExecutionResult, FixStrategy, StrategyKind};
use crate::workers::CommandPool;

/// Commands containing any of these fragments are never executed.
const DENY_LIST: [&str; 14] = [
    "rm -rf",
    "rm -fr",
    "rm -r /",
    "drop table",
    "drop database",
    "truncate table",
    "mkfs",
    "dd if=",
    ":(){",
    "> /dev/",
    "--force",
    "git push -f",
    "shutdown",
    "reboot",
];

/// Reversible side effect of a strategy, captured for rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SideEffect {
    /// A package was installed and can be uninstalled.
    InstalledPackage(String),
    /// A file was created (did not exist before) and can be deleted.
    CreatedFile(PathBuf),
    /// Permissions were changed; no reliable pre-state, rollback is a no-op.
    ChangedPermission(PathBuf),
    /// Ownership was changed; no reliable pre-state, rollback is a no-op.
    ChangedOwner(PathBuf),
    /// A service was restarted; restarts are not rolled back.
    RestartedService(String),
}

/// Outcome of one strategy handler.
#[derive(Debug, Default)]
struct StrategyOutcome {
    success: bool,
    commands: Vec<String>,
    side_effects: Vec<SideEffect>,
    error: Option<String>,
}

/// Executes fix candidates safely and verifies their effect.
pub struct FixExecutor {
    pool: CommandPool,
    config: FixerConfig,
}

impl FixExecutor {
    /// Create a fix executor backed by the given worker pool.
    pub fn new(pool: CommandPool, config: FixerConfig) -> Self {
        Self { pool, config }
    }

    /// Check a rendered command against the deny-list (built-in plus
    /// configured extras). Returns the matched fragment.
    pub fn denied_fragment(&self, command: &str) -> Option<String> {
        let lowered = command.to_lowercase();
        for fragment in DENY_LIST {
            if lowered.contains(fragment) {
                return Some(fragment.to_owned());
            }
        }
        for fragment in &self.config.extra_denied {
            if lowered.contains(&fragment.to_lowercase()) {
                return Some(fragment.clone());
            }
        }
        None
    }

    /// Try each candidate until one succeeds and verifies.
    ///
    /// Never returns an error: every internal failure is folded into the
    /// result so an incident cannot crash the orchestrator.
    pub async fn execute(
        &self,
        analysis: &Classification,
        incident: &ErrorIncident,
    ) -> FixExecutionResult {
        let start = Instant::now();
        let mut executed_commands: Vec<String> = Vec::new();
        let mut last_error: Option<String> = None;

        for strategy in &analysis.candidates {
            if !strategy.command.is_empty() {
                if let Some(fragment) = self.denied_fragment(&strategy.command) {
                    warn!(
                        command = %strategy.command,
                        fragment = %fragment,
                        "unsafe command rejected by deny-list"
                    );
                    last_error = Some(format!(
                        "command rejected by deny-list (matched {fragment:?})"
                    ));
                    continue;
                }
            }

            let outcome = self.run_strategy(strategy, incident).await;
            executed_commands.extend(outcome.commands.iter().cloned());

            if !outcome.success {
                debug!(
                    kind = strategy.kind.as_str(),
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "strategy failed, trying next candidate"
                );
                last_error = outcome.error;
                continue;
            }

            // First success short-circuits; verify it really took effect.
            let verified = self.verify(strategy, incident).await;
            if verified {
                info!(
                    kind = strategy.kind.as_str(),
                    task_id = %incident.task_id,
                    "fix applied and verified"
                );
                return FixExecutionResult {
                    strategy_used: Some(strategy.clone()),
                    executed_commands,
                    success: true,
                    verification_passed: true,
                    rollback_performed: false,
                    execution_time: start.elapsed(),
                    error: None,
                };
            }

            let rolled_back = self.rollback(&outcome.side_effects).await;
            warn!(
                kind = strategy.kind.as_str(),
                rolled_back,
                "verification failed after apparent success"
            );
            return FixExecutionResult {
                strategy_used: Some(strategy.clone()),
                executed_commands,
                success: false,
                verification_passed: false,
                rollback_performed: rolled_back,
                execution_time: start.elapsed(),
                error: Some("post-fix verification failed".to_owned()),
            };
        }

        FixExecutionResult {
            strategy_used: None,
            executed_commands,
            success: false,
            verification_passed: false,
            rollback_performed: false,
            execution_time: start.elapsed(),
            error: Some(last_error.unwrap_or_else(|| "no applicable fix candidate".to_owned())),
        }
    }

    /// Dispatch one strategy to its kind-specific handler.
    async fn run_strategy(
        &self,
        strategy: &FixStrategy,
        incident: &ErrorIncident,
    ) -> StrategyOutcome {
        let deadline = kind_deadline(strategy.kind);
        match strategy.kind {
            StrategyKind::InstallPackage => self.install_package(strategy, deadline).await,
            StrategyKind::CreateFile => self.create_file(strategy).await,
            StrategyKind::ChangePermission => {
                self.shell_with_effect(strategy, deadline, |path| {
                    SideEffect::ChangedPermission(path)
                })
                .await
            }
            StrategyKind::ChangeOwner => {
                self.shell_with_effect(strategy, deadline, SideEffect::ChangedOwner)
                    .await
            }
            StrategyKind::RestartService => self.restart_service(strategy, deadline).await,
            StrategyKind::RetryWithDelay => StrategyOutcome {
                // No direct action: the retry orchestrator owns the delay.
                success: true,
                ..StrategyOutcome::default()
            },
            StrategyKind::CheckEnv => check_env(strategy, incident),
            StrategyKind::FixSyntax | StrategyKind::GenericCommand => {
                self.run_plain_command(strategy, deadline).await
            }
        }
    }

    /// Run `pip install`, recording the installed package for rollback.
    async fn install_package(&self, strategy: &FixStrategy, deadline: Duration) -> StrategyOutcome {
        let Some(package) = extract_package(&strategy.command) else {
            return StrategyOutcome {
                error: Some("install command carries no package name".to_owned()),
                ..StrategyOutcome::default()
            };
        };

        match self.pool.run_shell(&strategy.command, deadline).await {
            Ok(result) if result.success() => StrategyOutcome {
                success: true,
                commands: vec![strategy.command.clone()],
                side_effects: vec![SideEffect::InstalledPackage(package)],
                error: None,
            },
            Ok(result) => StrategyOutcome {
                success: false,
                commands: vec![strategy.command.clone()],
                side_effects: Vec::new(),
                error: Some(exec_failure(&result)),
            },
            Err(e) => StrategyOutcome {
                error: Some(e.to_string()),
                ..StrategyOutcome::default()
            },
        }
    }

    /// Create the missing file with local filesystem calls.
    ///
    /// Only records a `CreatedFile` side effect when the file did not exist,
    /// so rollback never deletes a file we did not create.
    async fn create_file(&self, strategy: &FixStrategy) -> StrategyOutcome {
        let Some(path) = quoted_path(&strategy.command) else {
            return StrategyOutcome {
                error: Some("create-file command carries no path".to_owned()),
                ..StrategyOutcome::default()
            };
        };

        if tokio::fs::metadata(&path).await.is_ok() {
            // Already present; nothing to do, nothing to roll back.
            return StrategyOutcome {
                success: true,
                commands: vec![strategy.command.clone()],
                ..StrategyOutcome::default()
            };
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return StrategyOutcome {
                    error: Some(format!("failed to create {}: {e}", parent.display())),
                    ..StrategyOutcome::default()
                };
            }
        }

        match tokio::fs::write(&path, b"").await {
            Ok(()) => StrategyOutcome {
                success: true,
                commands: vec![strategy.command.clone()],
                side_effects: vec![SideEffect::CreatedFile(path)],
                error: None,
            },
            Err(e) => StrategyOutcome {
                error: Some(format!("failed to create {}: {e}", path.display())),
                ..StrategyOutcome::default()
            },
        }
    }

    /// Run a path-mutating shell command, recording the given side effect.
    async fn shell_with_effect(
        &self,
        strategy: &FixStrategy,
        deadline: Duration,
        effect: impl FnOnce(PathBuf) -> SideEffect,
    ) -> StrategyOutcome {
        let path = quoted_path(&strategy.command);
        match self.pool.run_shell(&strategy.command, deadline).await {
            Ok(result) if result.success() => StrategyOutcome {
                success: true,
                commands: vec![strategy.command.clone()],
                side_effects: path.map(effect).into_iter().collect(),
                error: None,
            },
            Ok(result) => StrategyOutcome {
                success: false,
                commands: vec![strategy.command.clone()],
                side_effects: Vec::new(),
                error: Some(exec_failure(&result)),
            },
            Err(e) => StrategyOutcome {
                error: Some(e.to_string()),
                ..StrategyOutcome::default()
            },
        }
    }

    /// Restart a service via the service manager.
    async fn restart_service(&self, strategy: &FixStrategy, deadline: Duration) -> StrategyOutcome {
        let service = strategy
            .command
            .rsplit(' ')
            .next()
            .unwrap_or_default()
            .to_owned();
        match self.pool.run_shell(&strategy.command, deadline).await {
            Ok(result) if result.success() => StrategyOutcome {
                success: true,
                commands: vec![strategy.command.clone()],
                side_effects: vec![SideEffect::RestartedService(service)],
                error: None,
            },
            Ok(result) => StrategyOutcome {
                success: false,
                commands: vec![strategy.command.clone()],
                side_effects: Vec::new(),
                error: Some(exec_failure(&result)),
            },
            Err(e) => StrategyOutcome {
                error: Some(e.to_string()),
                ..StrategyOutcome::default()
            },
        }
    }

    /// Run a command with no side-effect tracking (syntax re-checks, generic).
    async fn run_plain_command(&self, strategy: &FixStrategy, deadline: Duration) -> StrategyOutcome {
        match self.pool.run_shell(&strategy.command, deadline).await {
            Ok(result) if result.success() => StrategyOutcome {
                success: true,
                commands: vec![strategy.command.clone()],
                ..StrategyOutcome::default()
            },
            Ok(result) => StrategyOutcome {
                success: false,
                commands: vec![strategy.command.clone()],
                side_effects: Vec::new(),
                error: Some(exec_failure(&result)),
            },
            Err(e) => StrategyOutcome {
                error: Some(e.to_string()),
                ..StrategyOutcome::default()
            },
        }
    }

    /// Re-run the category-specific verification for an applied strategy.
    ///
    /// Used by the retry path for categories that must be re-verified
    /// immediately before resubmitting the task.
    pub async fn verify_fix(&self, strategy: &FixStrategy) -> bool {
        match strategy.kind {
            StrategyKind::InstallPackage => {
                let Some(package) = extract_package(&strategy.command) else {
                    return false;
                };
                let import_name = package.replace('-', "_");
                let command =
                    format!("{} -c \"import {}\"", self.config.python_bin, import_name);
                match self.pool.run_shell(&command, Duration::from_secs(30)).await {
                    Ok(result) => result.success(),
                    Err(_) => false,
                }
            }
            StrategyKind::CreateFile => match quoted_path(&strategy.command) {
                Some(path) => tokio::fs::metadata(&path).await.is_ok(),
                None => false,
            },
            StrategyKind::ChangePermission => match quoted_path(&strategy.command) {
                Some(path) => permission_bits_ok(&path),
                None => false,
            },
            StrategyKind::ChangeOwner => match quoted_path(&strategy.command) {
                // Best-effort: ownership is verified by being able to open.
                Some(path) => std::fs::File::open(&path).is_ok(),
                None => false,
            },
            StrategyKind::RestartService => {
                let service = strategy.command.rsplit(' ').next().unwrap_or_default();
                let command = format!("systemctl is-active --quiet {service}");
                match self.pool.run_shell(&command, Duration::from_secs(10)).await {
                    Ok(result) => result.success(),
                    Err(_) => false,
                }
            }
            StrategyKind::CheckEnv | StrategyKind::RetryWithDelay => true,
            StrategyKind::FixSyntax | StrategyKind::GenericCommand => true,
        }
    }

    /// Category-specific verification that the triggering condition cleared.
    async fn verify(&self, strategy: &FixStrategy, _incident: &ErrorIncident) -> bool {
        self.verify_fix(strategy).await
    }

    /// Undo recorded side effects, newest first. Returns whether any rollback
    /// action ran. Failures are logged, never raised.
    async fn rollback(&self, effects: &[SideEffect]) -> bool {
        let mut performed = false;
        for effect in effects.iter().rev() {
            match effect {
                SideEffect::InstalledPackage(package) => {
                    let command = format!("pip uninstall -y {package}");
                    match self.pool.run_shell(&command, Duration::from_secs(120)).await {
                        Ok(result) if result.success() => {
                            info!(package = %package, "rolled back package install");
                            performed = true;
                        }
                        Ok(result) => {
                            warn!(package = %package, output = %result.output(), "package rollback failed");
                            performed = true;
                        }
                        Err(e) => warn!(package = %package, error = %e, "package rollback failed"),
                    }
                }
                SideEffect::CreatedFile(path) => match tokio::fs::remove_file(path).await {
                    Ok(()) => {
                        info!(path = %path.display(), "rolled back created file");
                        performed = true;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "file rollback failed"),
                },
                SideEffect::ChangedPermission(path) => {
                    // No pre-state was captured; documented best-effort no-op.
                    debug!(path = %path.display(), "permission rollback is a no-op");
                }
                SideEffect::ChangedOwner(path) => {
                    debug!(path = %path.display(), "ownership rollback is a no-op");
                }
                SideEffect::RestartedService(service) => {
                    debug!(service = %service, "service restarts are not rolled back");
                }
            }
        }
        performed
    }
}

/// Deadline for each strategy kind, within the 5s–300s band.
fn kind_deadline(kind: StrategyKind) -> Duration {
    let secs = match kind {
        StrategyKind::InstallPackage => 300,
        StrategyKind::CreateFile => 5,
        StrategyKind::ChangePermission => 5,
        StrategyKind::ChangeOwner => 5,
        StrategyKind::RestartService => 60,
        StrategyKind::RetryWithDelay => 5,
        StrategyKind::CheckEnv => 5,
        StrategyKind::FixSyntax => 30,
        StrategyKind::GenericCommand => 60,
    };
    Duration::from_secs(secs)
}

/// Check that an environment variable named in the command is present.
fn check_env(strategy: &FixStrategy, _incident: &ErrorIncident) -> StrategyOutcome {
    let Some(var) = strategy.command.strip_prefix("printenv ").map(str::trim) else {
        return StrategyOutcome {
            error: Some("check-env command carries no variable name".to_owned()),
            ..StrategyOutcome::default()
        };
    };

    match std::env::var(var) {
        Ok(value) if !value.is_empty() => StrategyOutcome {
            success: true,
            commands: vec![strategy.command.clone()],
            ..StrategyOutcome::default()
        },
        _ => StrategyOutcome {
            success: false,
            commands: vec![strategy.command.clone()],
            side_effects: Vec::new(),
            error: Some(format!("environment variable '{var}' is not set")),
        },
    }
}

/// Last whitespace-separated token of a `pip install` command.
fn extract_package(command: &str) -> Option<String> {
    let rest = command.strip_prefix("pip install ")?;
    rest.split_whitespace()
        .filter(|token| !token.starts_with('-'))
        .next_back()
        .map(str::to_owned)
}

/// Path between single quotes in a rendered command.
fn quoted_path(command: &str) -> Option<PathBuf> {
    let start = command.find('\'')?;
    let rest = command.get(start.saturating_add(1)..)?;
    let end = rest.find('\'')?;
    rest.get(..end).map(PathBuf::from)
}

/// Owner read+write bits set (unix); plain existence elsewhere.
#[cfg(unix)]
fn permission_bits_ok(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.permissions().mode() & 0o600 == 0o600,
        Err(_) => false,
    }
}

/// Owner read+write bits set (unix); plain existence elsewhere.
#[cfg(not(unix))]
fn permission_bits_ok(path: &Path) -> bool {
    std::fs::metadata(path).is_ok()
}

/// Short failure description from an execution result.
fn exec_failure(result: &crate::workers::ExecResult) -> String {
    if result.timed_out {
        return format!("command timed out after {}s", result.duration.as_secs());
    }
    let output = result.output();
    let trimmed = output.trim();
    if trimmed.is_empty() {
        format!("command exited with code {:?}", result.exit_code)
    } else {
        let mut text = trimmed.to_owned();
        text.truncate(500);
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_list_catches_destructive_commands() {
        let executor = FixExecutor::new(CommandPool::new(1), FixerConfig::default());
        assert!(executor.denied_fragment("rm -rf /var/lib/data").is_some());
        assert!(executor.denied_fragment("psql -c 'DROP TABLE users'").is_some());
        assert!(executor.denied_fragment("git push -f origin main").is_some());
        assert!(executor.denied_fragment("pip install requests").is_none());
    }

    #[test]
    fn extra_denied_entries_apply() {
        let config = FixerConfig {
            extra_denied: vec!["curl | sh".to_owned()],
            ..FixerConfig::default()
        };
        let executor = FixExecutor::new(CommandPool::new(1), config);
        assert!(executor
            .denied_fragment("curl https://x.example | sh")
            .is_some());
    }

    #[test]
    fn package_extraction() {
        assert_eq!(
            extract_package("pip install requests"),
            Some("requests".to_owned())
        );
        assert_eq!(
            extract_package("pip install --upgrade numpy"),
            Some("numpy".to_owned())
        );
        assert_eq!(extract_package("apt install jq"), None);
    }

    #[test]
    fn quoted_path_extraction() {
        assert_eq!(
            quoted_path("touch '/tmp/data/report.csv'"),
            Some(PathBuf::from("/tmp/data/report.csv"))
        );
        assert_eq!(quoted_path("touch noquotes"), None);
    }

    #[test]
    fn deadlines_stay_in_band() {
        for kind in [
            StrategyKind::InstallPackage,
            StrategyKind::CreateFile,
            StrategyKind::ChangePermission,
            StrategyKind::ChangeOwner,
            StrategyKind::RestartService,
            StrategyKind::RetryWithDelay,
            StrategyKind::CheckEnv,
            StrategyKind::FixSyntax,
            StrategyKind::GenericCommand,
        ] {
            let deadline = kind_deadline(kind);
            assert!(deadline >= Duration::from_secs(5));
            assert!(deadline <= Duration::from_secs(300));
        }
    }
}
