//! Bounded worker pool for external command execution.
//!
//! Fix commands may block on package managers, service managers, or the
//! network, so they never run on the orchestrator's control tasks. The pool
//! caps concurrency with a semaphore and enforces a per-command deadline;
//! a timeout is reported in the result, not raised.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::Semaphore;

/// Result of one pooled command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Process exit code (`None` when killed or unavailable).
    pub exit_code: Option<i32>,
    /// Captured stdout text.
    pub stdout: String,
    /// Captured stderr text.
    pub stderr: String,
    /// Whether the command exceeded its deadline.
    pub timed_out: bool,
    /// Wall-clock duration of the execution.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` when the command exited successfully (code 0, no timeout).
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Combined stdout+stderr output, separated by a newline when both are non-empty.
    pub fn output(&self) -> String {
        if self.stdout.is_empty() {
            return self.stderr.clone();
        }
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Errors produced by the worker pool itself (not by the commands it runs).
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool is shutting down and no longer accepts work.
    #[error("worker pool is closed")]
    Closed,
    /// The command could not be spawned at all.
    #[error("failed to spawn command: {0}")]
    Spawn(String),
}

/// Bounded pool executing shell commands with per-command deadlines.
#[derive(Debug, Clone)]
pub struct CommandPool {
    permits: Arc<Semaphore>,
}

impl CommandPool {
    /// Create a pool allowing at most `max_concurrent` commands at once.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Run a shell command line under the pool's concurrency cap.
    ///
    /// Waits for a free slot, spawns `sh -c {command}`, and enforces the
    /// deadline. On timeout the child is killed (`kill_on_drop`) and the
    /// result carries `timed_out = true`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool was shut down, or
    /// [`PoolError::Spawn`] if the process could not be started.
    pub async fn run_shell(&self, command: &str, deadline: Duration) -> Result<ExecResult, PoolError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let start = Instant::now();

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        let waited = tokio::time::timeout(deadline, child.wait_with_output()).await;
        let duration = start.elapsed();
        drop(permit);

        match waited {
            Ok(Ok(output)) => Ok(ExecResult {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
                duration,
            }),
            Ok(Err(e)) => Err(PoolError::Spawn(e.to_string())),
            Err(_elapsed) => Ok(ExecResult {
                exit_code: None,
                stdout: String::new(),
                stderr: format!("command exceeded deadline of {}s", deadline.as_secs()),
                timed_out: true,
                duration,
            }),
        }
    }

    /// Number of currently free execution slots.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_succeeds() {
        let pool = CommandPool::new(2);
        let result = pool
            .run_shell("echo hello", Duration::from_secs(5))
            .await
            .expect("spawn");
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_success() {
        let pool = CommandPool::new(1);
        let result = pool
            .run_shell("exit 3", Duration::from_secs(5))
            .await
            .expect("spawn");
        assert!(!result.success());
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn deadline_marks_timed_out() {
        let pool = CommandPool::new(1);
        let result = pool
            .run_shell("sleep 5", Duration::from_millis(100))
            .await
            .expect("spawn");
        assert!(result.timed_out);
        assert!(!result.success());
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn pool_caps_concurrency() {
        let pool = CommandPool::new(1);
        assert_eq!(pool.available_slots(), 1);
        let first = pool.run_shell("sleep 0.2", Duration::from_secs(5));
        let second = pool.run_shell("echo second", Duration::from_secs(5));
        let (a, b) = tokio::join!(first, second);
        assert!(a.expect("first").success());
        assert!(b.expect("second").success());
        assert_eq!(pool.available_slots(), 1);
    }
}
