//! Core data types shared across the healing pipeline.
//!
//! Wire messages (`IncidentMessage`, `RetryMessage`) are schema-validated at
//! ingress; everything else is internal state passed between components.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category an error is classified into. Drives fix candidates, verification
/// requirements, and the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Missing or broken package/module dependency.
    Dependency,
    /// Missing file or directory.
    Filesystem,
    /// Insufficient file or resource permissions.
    Permission,
    /// Transient network failure (DNS, connection reset, timeout).
    Network,
    /// Task-queue broker unreachable or refusing connections.
    Broker,
    /// Source-level syntax or parse error.
    Syntax,
    /// Memory or disk exhaustion.
    Resource,
    /// Missing or malformed environment variable.
    Environment,
    /// A collaborating service is down.
    Service,
    /// No rule or learned pattern matched.
    Unknown,
}

impl ErrorCategory {
    /// Stable string form used as the `error_type` key in persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dependency => "dependency",
            Self::Filesystem => "filesystem",
            Self::Permission => "permission",
            Self::Network => "network",
            Self::Broker => "broker",
            Self::Syntax => "syntax",
            Self::Resource => "resource",
            Self::Environment => "environment",
            Self::Service => "service",
            Self::Unknown => "unknown",
        }
    }

    /// Parse the stable string form back into a category.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dependency" => Some(Self::Dependency),
            "filesystem" => Some(Self::Filesystem),
            "permission" => Some(Self::Permission),
            "network" => Some(Self::Network),
            "broker" => Some(Self::Broker),
            "syntax" => Some(Self::Syntax),
            "resource" => Some(Self::Resource),
            "environment" => Some(Self::Environment),
            "service" => Some(Self::Service),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Categories whose fix must be re-verified immediately before a retry.
    pub fn needs_preretry_verification(self) -> bool {
        matches!(self, Self::Dependency | Self::Filesystem | Self::Permission)
    }

    /// Categories that require a liveness probe before a retry is allowed.
    pub fn needs_liveness_probe(self) -> bool {
        matches!(self, Self::Broker | Self::Network)
    }
}

/// Severity level for a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Information only, no action needed.
    Low,
    /// May need attention soon.
    Medium,
    /// Needs attention now.
    High,
    /// System is down or at risk.
    Critical,
}

impl Severity {
    /// Stable lowercase string form for persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse the stable string form back into a severity.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Numeric rank for sorting (higher = more severe).
    pub fn rank(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

/// Kind of remedial strategy. Each kind dispatches to a dedicated fixer
/// handler with its own timeout and rollback behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Install a missing package.
    InstallPackage,
    /// Create a missing file (and parent directories).
    CreateFile,
    /// Make a path readable/writable for the worker.
    ChangePermission,
    /// Change ownership of a path.
    ChangeOwner,
    /// Restart a named service.
    RestartService,
    /// No direct action; wait and let the retry path handle it.
    RetryWithDelay,
    /// Check that an environment variable is present.
    CheckEnv,
    /// Report a syntax error location for manual fixing.
    FixSyntax,
    /// Run an arbitrary single command.
    GenericCommand,
}

impl StrategyKind {
    /// Stable string form used in strategy ids and one-hot features.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InstallPackage => "install_package",
            Self::CreateFile => "create_file",
            Self::ChangePermission => "change_permission",
            Self::ChangeOwner => "change_owner",
            Self::RestartService => "restart_service",
            Self::RetryWithDelay => "retry_with_delay",
            Self::CheckEnv => "check_env",
            Self::FixSyntax => "fix_syntax",
            Self::GenericCommand => "generic_command",
        }
    }

    /// Index into the strategy-kind one-hot feature vector.
    pub fn one_hot_index(self) -> usize {
        match self {
            Self::InstallPackage => 0,
            Self::CreateFile => 1,
            Self::ChangePermission => 2,
            Self::ChangeOwner => 3,
            Self::RestartService => 4,
            Self::RetryWithDelay => 5,
            Self::CheckEnv => 6,
            Self::FixSyntax => 7,
            Self::GenericCommand => 8,
        }
    }
}

/// How dangerous a strategy's command is considered before deny-list checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyClass {
    /// Read-only or trivially reversible.
    Safe,
    /// Mutates state but has a known inverse.
    Caution,
    /// Mutation without a reliable inverse; rollback is best-effort.
    BestEffort,
}

/// A named, parameterized remedial action with a rendered command.
///
/// Immutable once produced for an incident: the classifier generates
/// candidates deterministically from the matched rule and capture groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixStrategy {
    /// What kind of action this is.
    pub kind: StrategyKind,
    /// Fully rendered command line (empty for non-command strategies).
    pub command: String,
    /// Human-readable description.
    pub description: String,
    /// Safety classification.
    pub safety: SafetyClass,
}

impl FixStrategy {
    /// Stable identifier for persistence keys: kind plus command hash.
    pub fn strategy_id(&self) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.command.hash(&mut hasher);
        format!("{}-{:016x}", self.kind.as_str(), hasher.finish())
    }
}

/// A single reported error occurrence submitted for healing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorIncident {
    /// Unique incident id.
    pub id: Uuid,
    /// Raw error text as reported by the worker.
    pub error_text: String,
    /// Classified category; `None` until classification runs.
    pub category: Option<ErrorCategory>,
    /// Worker kind that produced the error (e.g. "ingest", "render").
    pub worker_kind: String,
    /// Task the error belongs to. Healing is serialized per task id.
    pub task_id: String,
    /// When the error was reported.
    pub timestamp: DateTime<Utc>,
    /// Free-form context captured by the worker.
    pub context: serde_json::Value,
    /// Queue the original task came from; retries are resubmitted there.
    pub source_queue: String,
    /// Hash over normalized error text + task id, for duplicate dropping.
    pub dedup_hash: u64,
}

impl ErrorIncident {
    /// Build an incident, computing its dedup hash.
    pub fn new(
        error_text: String,
        worker_kind: String,
        task_id: String,
        context: serde_json::Value,
        source_queue: String,
    ) -> Self {
        let dedup_hash = dedup_hash(&error_text, &task_id);
        Self {
            id: Uuid::new_v4(),
            error_text,
            category: None,
            worker_kind,
            task_id,
            timestamp: Utc::now(),
            context,
            source_queue,
            dedup_hash,
        }
    }
}

/// Stable hash of (normalized error text, task id).
///
/// Normalization lowercases and collapses whitespace so that identical errors
/// with incidental formatting differences dedup together.
pub fn dedup_hash(error_text: &str, task_id: &str) -> u64 {
    let normalized: String = error_text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    normalized.hash(&mut hasher);
    task_id.hash(&mut hasher);
    hasher.finish()
}

/// Inbound wire message on the error-intake queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentMessage {
    /// Raw error text.
    pub error_text: String,
    /// Task the error belongs to.
    pub task_id: String,
    /// Worker kind that produced the error.
    pub worker_type: String,
    /// When the error occurred (RFC 3339).
    pub timestamp: String,
    /// Optional free-form context.
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    /// Queue to resubmit the task to after a successful fix.
    pub reply_queue: String,
}

impl IncidentMessage {
    /// Validate the message and convert it into an [`ErrorIncident`].
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are empty or the timestamp is not
    /// valid RFC 3339.
    pub fn into_incident(self) -> anyhow::Result<ErrorIncident> {
        anyhow::ensure!(!self.error_text.trim().is_empty(), "error_text is empty");
        anyhow::ensure!(!self.task_id.trim().is_empty(), "task_id is empty");
        anyhow::ensure!(!self.reply_queue.trim().is_empty(), "reply_queue is empty");
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| anyhow::anyhow!("invalid timestamp {:?}: {e}", self.timestamp))?
            .with_timezone(&Utc);

        let dedup = dedup_hash(&self.error_text, &self.task_id);
        Ok(ErrorIncident {
            id: Uuid::new_v4(),
            error_text: self.error_text,
            category: None,
            worker_kind: self.worker_type,
            task_id: self.task_id,
            timestamp,
            context: self.context.unwrap_or(serde_json::Value::Null),
            source_queue: self.reply_queue,
            dedup_hash: dedup,
        })
    }
}

/// Retry context attached to a resubmitted task payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryMetadata {
    /// The error that triggered healing.
    pub original_error: String,
    /// Whether a fix was applied before this retry.
    pub fix_applied: bool,
    /// The fix command that was executed, if any.
    pub fix_command: Option<String>,
    /// When the retry was issued (RFC 3339).
    pub retry_timestamp: String,
    /// 1-based retry attempt number.
    pub retry_count: u32,
}

/// Outbound wire message: the original task plus retry metadata, republished
/// to the task's originating queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryMessage {
    /// Task id being retried.
    pub task_id: String,
    /// Destination queue (the task's original source).
    pub queue: String,
    /// Original task payload, passed through untouched.
    pub payload: serde_json::Value,
    /// Retry context block.
    pub retry_metadata: RetryMetadata,
}

/// One result per `FixExecutor::execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixExecutionResult {
    /// The strategy that ran last (successfully or not); `None` when every
    /// candidate was rejected before execution.
    pub strategy_used: Option<FixStrategy>,
    /// Commands actually executed, in order.
    pub executed_commands: Vec<String>,
    /// Whether a strategy succeeded and passed verification.
    pub success: bool,
    /// Whether post-fix verification passed.
    pub verification_passed: bool,
    /// Whether a rollback was performed after a failed verification.
    pub rollback_performed: bool,
    /// Wall-clock time spent executing.
    pub execution_time: Duration,
    /// Error description when `success` is false.
    pub error: Option<String>,
}

impl FixExecutionResult {
    /// An empty failed result with the given error, nothing executed.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            strategy_used: None,
            executed_commands: Vec::new(),
            success: false,
            verification_passed: false,
            rollback_performed: false,
            execution_time: Duration::ZERO,
            error: Some(error.into()),
        }
    }
}

/// Status of a task's retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    /// Retry decided but not yet started.
    Pending,
    /// Retry submitted, waiting for completion.
    InProgress,
    /// Task completed successfully on retry.
    Success,
    /// Task failed again and no further retry is allowed.
    Failed,
    /// Retry budget exhausted.
    MaxRetriesExceeded,
}

impl RetryStatus {
    /// Terminal states are never left once entered.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::MaxRetriesExceeded
        )
    }
}

/// Orchestrator-level choice of healing path for an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingStrategyClass {
    /// Normal classify → fix → verify → retry chain.
    Reactive,
    /// Category known fixable ahead of failure.
    Preventive,
    /// Predictor rates recurrence probability high.
    Predictive,
    /// Learner has enough history to pick an optimized strategy.
    Adaptive,
    /// Health is critical: shed load, clear caches, staged restarts.
    Emergency,
}

impl HealingStrategyClass {
    /// Stable string form for persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reactive => "reactive",
            Self::Preventive => "preventive",
            Self::Predictive => "predictive",
            Self::Adaptive => "adaptive",
            Self::Emergency => "emergency",
        }
    }
}

/// Outcome record for one handled incident, appended regardless of success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingRecord {
    /// Incident this record belongs to.
    pub incident_id: Uuid,
    /// Classified error type (category string).
    pub error_type: String,
    /// Which healing path handled it.
    pub strategy_class: HealingStrategyClass,
    /// Actions taken, in order (command lines or action names).
    pub actions_taken: Vec<String>,
    /// Total healing duration.
    pub duration: Duration,
    /// Whether healing succeeded end-to-end.
    pub success: bool,
    /// Whether the incident was prevented before task failure.
    pub prevented: bool,
    /// Whether manual intervention was requested.
    pub manual_required: bool,
}
