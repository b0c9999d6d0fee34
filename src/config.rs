//! Configuration loading for the Mender supervisor.
//!
//! Loads `mender.toml` with per-section defaults. All sections use
//! `#[serde(default)]` so a minimal or empty config file is valid.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Top-level Mender configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MenderConfig {
    /// Error-intake settings.
    #[serde(default)]
    pub intake: IntakeConfig,

    /// Classifier tuning.
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Fix execution limits.
    #[serde(default)]
    pub fixer: FixerConfig,

    /// Retry policies, keyed by error category.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Strategy learning parameters.
    #[serde(default)]
    pub learner: LearnerConfig,

    /// Health scoring and background loop intervals.
    #[serde(default)]
    pub health: HealthConfig,

    /// Emergency-mode behavior.
    #[serde(default)]
    pub emergency: EmergencyConfig,

    /// Liveness probe targets for retry gating.
    #[serde(default)]
    pub probes: ProbesConfig,

    /// Reporting and notification settings.
    #[serde(default)]
    pub reports: ReportsConfig,

    /// Telegram notification targets.
    #[serde(default)]
    pub telegram: TelegramConfig,
}

/// Error-intake queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConfig {
    /// Buffered capacity of the intake channel.
    #[serde(default = "default_intake_capacity")]
    pub capacity: usize,

    /// Seconds within which an identical (error, task) pair is dropped as a
    /// duplicate.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            capacity: default_intake_capacity(),
            dedup_window_secs: default_dedup_window_secs(),
        }
    }
}

/// Classifier tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Confidence cap applied to learned-pattern fallback matches.
    #[serde(default = "default_learned_confidence_cap")]
    pub learned_confidence_cap: f64,

    /// Minimum token-overlap similarity for a learned-pattern match.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            learned_confidence_cap: default_learned_confidence_cap(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

/// Fix execution limits.
#[derive(Debug, Clone, Deserialize)]
pub struct FixerConfig {
    /// Maximum commands running concurrently on the worker pool.
    #[serde(default = "default_max_concurrent_commands")]
    pub max_concurrent_commands: usize,

    /// Interpreter used for package importability verification.
    #[serde(default = "default_python_bin")]
    pub python_bin: String,

    /// Extra deny-list entries appended to the built-in list.
    #[serde(default)]
    pub extra_denied: Vec<String>,
}

impl Default for FixerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_commands: default_max_concurrent_commands(),
            python_bin: default_python_bin(),
            extra_denied: Vec::new(),
        }
    }
}

/// One category's retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicyConfig {
    /// Maximum retry attempts for this category.
    pub max_retries: u32,
    /// Base delay in seconds.
    pub base_delay_secs: u64,
    /// Multiplier applied per retry when `exponential` is set.
    pub backoff_factor: f64,
    /// Upper bound on the computed delay in seconds.
    pub max_delay_secs: u64,
    /// Exponential backoff with jitter; otherwise a flat base delay.
    pub exponential: bool,
}

/// Retry policies and completion polling.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Per-category policies; unlisted categories fall back to "unknown".
    #[serde(default = "default_retry_policies")]
    pub policies: HashMap<String, RetryPolicyConfig>,

    /// Upper bound on waiting for a resubmitted task's completion.
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,

    /// Poll interval while waiting for completion, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policies: default_retry_policies(),
            completion_timeout_secs: default_completion_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Strategy learning parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct LearnerConfig {
    /// New samples per error type required to trigger re-ranking.
    #[serde(default = "default_retrain_min_samples")]
    pub retrain_min_samples: usize,

    /// Rolling window (hours) in which those samples must arrive.
    #[serde(default = "default_retrain_window_hours")]
    pub retrain_window_hours: u64,

    /// Exploration probability; 0.0 makes selection deterministic.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Minimum relative improvement required to persist a new best strategy.
    #[serde(default = "default_min_improvement")]
    pub min_improvement: f64,

    /// Ledger samples per error type before the adaptive path is eligible.
    #[serde(default = "default_adaptive_min_history")]
    pub adaptive_min_history: i64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            retrain_min_samples: default_retrain_min_samples(),
            retrain_window_hours: default_retrain_window_hours(),
            epsilon: default_epsilon(),
            min_improvement: default_min_improvement(),
            adaptive_min_history: default_adaptive_min_history(),
        }
    }
}

/// Health scoring and background loop intervals.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Seconds between health score recomputations.
    #[serde(default = "default_health_interval_secs")]
    pub check_interval_secs: u64,

    /// Seconds between strategy optimization passes.
    #[serde(default = "default_optimization_interval_secs")]
    pub optimization_interval_secs: u64,

    /// Seconds between predictive scans.
    #[serde(default = "default_predictive_interval_secs")]
    pub predictive_scan_interval_secs: u64,

    /// Rolling window (hours) over which rates are computed.
    #[serde(default = "default_metrics_window_hours")]
    pub metrics_window_hours: u64,

    /// Recurrence probability above which the predictive path is chosen.
    #[serde(default = "default_prediction_threshold")]
    pub prediction_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_health_interval_secs(),
            optimization_interval_secs: default_optimization_interval_secs(),
            predictive_scan_interval_secs: default_predictive_interval_secs(),
            metrics_window_hours: default_metrics_window_hours(),
            prediction_threshold: default_prediction_threshold(),
        }
    }
}

/// Emergency-mode behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct EmergencyConfig {
    /// Services restarted (in order) during a staged emergency restart.
    #[serde(default)]
    pub services: Vec<String>,

    /// Maximum emergency actions allowed per hour before escalating.
    #[serde(default = "default_max_emergency_per_hour")]
    pub max_actions_per_hour: u32,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            max_actions_per_hour: default_max_emergency_per_hour(),
        }
    }
}

/// Liveness probe targets for retry gating.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbesConfig {
    /// HTTP health endpoint of the task-queue broker, if any.
    #[serde(default)]
    pub broker_health_url: Option<String>,

    /// HTTP endpoint probed for general network liveness.
    #[serde(default)]
    pub network_probe_url: Option<String>,

    /// Probe timeout in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            broker_health_url: None,
            network_probe_url: None,
            timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// Reporting and notification timing.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportsConfig {
    /// Minutes to wait before repeating the same alert.
    #[serde(default = "default_alert_cooldown_mins")]
    pub alert_cooldown_mins: u64,

    /// Health checks between periodic health summaries.
    #[serde(default = "default_summary_every_checks")]
    pub summary_every_checks: u64,

    /// Prefix prepended to all notifications.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            alert_cooldown_mins: default_alert_cooldown_mins(),
            summary_every_checks: default_summary_every_checks(),
            prefix: default_prefix(),
        }
    }
}

/// Telegram notification targets.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Environment variable name holding the bot token.
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,

    /// User IDs to receive Mender notifications.
    #[serde(default)]
    pub notify_users: Vec<i64>,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token_env: default_bot_token_env(),
            notify_users: Vec::new(),
        }
    }
}

/// Resolved filesystem paths for Mender's own state.
#[derive(Debug, Clone)]
pub struct MenderPaths {
    /// Root directory (`~/.mender/`).
    pub root: PathBuf,
    /// SQLite state database.
    pub state_db: PathBuf,
    /// Log directory.
    pub logs_dir: PathBuf,
}

impl MenderConfig {
    /// Validate that configuration values are within sane bounds.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first out-of-bounds value.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.intake.capacity >= 1, "intake.capacity must be >= 1");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.classifier.learned_confidence_cap),
            "classifier.learned_confidence_cap must be in [0.0, 1.0]"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.classifier.similarity_threshold),
            "classifier.similarity_threshold must be in [0.0, 1.0]"
        );
        anyhow::ensure!(
            (1..=64).contains(&self.fixer.max_concurrent_commands),
            "fixer.max_concurrent_commands must be in [1, 64]"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.learner.epsilon),
            "learner.epsilon must be in [0.0, 1.0]"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.learner.min_improvement),
            "learner.min_improvement must be in [0.0, 1.0]"
        );
        anyhow::ensure!(
            self.health.check_interval_secs >= 5,
            "health.check_interval_secs must be >= 5"
        );
        anyhow::ensure!(
            self.health.optimization_interval_secs >= 30,
            "health.optimization_interval_secs must be >= 30"
        );
        anyhow::ensure!(
            self.health.predictive_scan_interval_secs >= 30,
            "health.predictive_scan_interval_secs must be >= 30"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.health.prediction_threshold),
            "health.prediction_threshold must be in [0.0, 1.0]"
        );
        anyhow::ensure!(
            self.emergency.max_actions_per_hour <= 20,
            "emergency.max_actions_per_hour must be <= 20"
        );
        for (category, policy) in &self.retry.policies {
            anyhow::ensure!(
                policy.backoff_factor >= 1.0,
                "retry.policies.{category}.backoff_factor must be >= 1.0"
            );
            anyhow::ensure!(
                policy.max_delay_secs >= policy.base_delay_secs,
                "retry.policies.{category}.max_delay_secs must be >= base_delay_secs"
            );
            anyhow::ensure!(
                policy.max_retries <= 20,
                "retry.policies.{category}.max_retries must be <= 20"
            );
        }
        anyhow::ensure!(
            self.retry.completion_timeout_secs >= 1,
            "retry.completion_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.retry.poll_interval_ms >= 10,
            "retry.poll_interval_ms must be >= 10"
        );
        Ok(())
    }

    /// Policy for a category string, falling back to the "unknown" policy.
    pub fn retry_policy(&self, category: &str) -> RetryPolicyConfig {
        if let Some(p) = self.retry.policies.get(category) {
            return p.clone();
        }
        self.retry
            .policies
            .get("unknown")
            .cloned()
            .unwrap_or(RetryPolicyConfig {
                max_retries: 1,
                base_delay_secs: 30,
                backoff_factor: 1.0,
                max_delay_secs: 30,
                exponential: false,
            })
    }
}

/// Load Mender configuration from a TOML file.
///
/// A missing file yields the defaults; a present but invalid file is an error.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, parsed, or fails
/// validation.
pub fn load_config(path: &Path) -> anyhow::Result<MenderConfig> {
    let config: MenderConfig = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config at {}", path.display()))?
    } else {
        MenderConfig::default()
    };
    config.validate()?;
    Ok(config)
}

/// Resolve Mender's filesystem paths under `~/.mender/`.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn mender_paths() -> anyhow::Result<MenderPaths> {
    let base = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?;
    let root = base.home_dir().join(".mender");
    Ok(MenderPaths {
        state_db: root.join("state.db"),
        logs_dir: root.join("logs"),
        root,
    })
}

// Default value functions for serde.

fn default_intake_capacity() -> usize {
    256
}

fn default_dedup_window_secs() -> u64 {
    60
}

fn default_learned_confidence_cap() -> f64 {
    0.7
}

fn default_similarity_threshold() -> f64 {
    0.35
}

fn default_max_concurrent_commands() -> usize {
    4
}

fn default_python_bin() -> String {
    "python3".to_owned()
}

fn default_completion_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_retrain_min_samples() -> usize {
    10
}

fn default_retrain_window_hours() -> u64 {
    24
}

fn default_epsilon() -> f64 {
    0.1
}

fn default_min_improvement() -> f64 {
    0.05
}

fn default_adaptive_min_history() -> i64 {
    25
}

fn default_health_interval_secs() -> u64 {
    60
}

fn default_optimization_interval_secs() -> u64 {
    3600
}

fn default_predictive_interval_secs() -> u64 {
    900
}

fn default_metrics_window_hours() -> u64 {
    24
}

fn default_prediction_threshold() -> f64 {
    0.7
}

fn default_max_emergency_per_hour() -> u32 {
    3
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_alert_cooldown_mins() -> u64 {
    30
}

fn default_summary_every_checks() -> u64 {
    60
}

fn default_prefix() -> String {
    "\u{1f527} Mender".to_owned()
}

fn default_bot_token_env() -> String {
    "MENDER_TELEGRAM_TOKEN".to_owned()
}

/// Built-in retry policies per error category.
fn default_retry_policies() -> HashMap<String, RetryPolicyConfig> {
    let mut policies = HashMap::new();
    policies.insert(
        "dependency".to_owned(),
        RetryPolicyConfig {
            max_retries: 3,
            base_delay_secs: 10,
            backoff_factor: 2.0,
            max_delay_secs: 300,
            exponential: true,
        },
    );
    policies.insert(
        "filesystem".to_owned(),
        RetryPolicyConfig {
            max_retries: 2,
            base_delay_secs: 5,
            backoff_factor: 1.0,
            max_delay_secs: 5,
            exponential: false,
        },
    );
    policies.insert(
        "permission".to_owned(),
        RetryPolicyConfig {
            max_retries: 2,
            base_delay_secs: 5,
            backoff_factor: 1.0,
            max_delay_secs: 5,
            exponential: false,
        },
    );
    policies.insert(
        "network".to_owned(),
        RetryPolicyConfig {
            max_retries: 5,
            base_delay_secs: 30,
            backoff_factor: 2.0,
            max_delay_secs: 600,
            exponential: true,
        },
    );
    policies.insert(
        "broker".to_owned(),
        RetryPolicyConfig {
            max_retries: 4,
            base_delay_secs: 60,
            backoff_factor: 1.5,
            max_delay_secs: 600,
            exponential: true,
        },
    );
    policies.insert(
        "syntax".to_owned(),
        RetryPolicyConfig {
            max_retries: 1,
            base_delay_secs: 30,
            backoff_factor: 1.0,
            max_delay_secs: 30,
            exponential: false,
        },
    );
    policies.insert(
        "resource".to_owned(),
        RetryPolicyConfig {
            max_retries: 3,
            base_delay_secs: 120,
            backoff_factor: 2.0,
            max_delay_secs: 900,
            exponential: true,
        },
    );
    policies.insert(
        "environment".to_owned(),
        RetryPolicyConfig {
            max_retries: 2,
            base_delay_secs: 10,
            backoff_factor: 1.0,
            max_delay_secs: 10,
            exponential: false,
        },
    );
    policies.insert(
        "service".to_owned(),
        RetryPolicyConfig {
            max_retries: 3,
            base_delay_secs: 60,
            backoff_factor: 2.0,
            max_delay_secs: 600,
            exponential: true,
        },
    );
    policies.insert(
        "unknown".to_owned(),
        RetryPolicyConfig {
            max_retries: 1,
            base_delay_secs: 30,
            backoff_factor: 1.0,
            max_delay_secs: 30,
            exponential: false,
        },
    );
    policies
}
