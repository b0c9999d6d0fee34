//! Error classification: ordered regex rules with a learned-pattern fallback.
//!
//! Rules are tried top to bottom; the first match wins, bumps the matching
//! pattern's occurrence count, and produces fix candidates deterministically
//! from the rule name and capture groups. When no rule matches, previously
//! seen patterns are searched by token-overlap similarity, with confidence
//! capped so learned matches never outrank a direct rule hit.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::ClassifierConfig;
use crate::db::StateDb;
use crate::types::{ErrorCategory, FixStrategy, SafetyClass, Severity, StrategyKind};

/// Markers that identify log noise rather than real failures.
const IGNORE_MARKERS: [&str; 6] = [
    "DEBUG:",
    "TRACE:",
    "INFO:",
    "UserWarning:",
    "DeprecationWarning",
    "FutureWarning",
];

/// Result of classifying one error text.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Category the error was assigned to.
    pub category: ErrorCategory,
    /// How severe the error is.
    pub severity: Severity,
    /// Whether the fixer should be invoked at all.
    pub auto_fixable: bool,
    /// Confidence in the classification, in [0, 1].
    pub confidence: f64,
    /// Fix candidates in priority order.
    pub candidates: Vec<FixStrategy>,
    /// Signature of the matched rule or learned pattern.
    pub signature: String,
}

/// One named classification rule.
struct Rule {
    name: &'static str,
    regex: Regex,
    category: ErrorCategory,
    severity: Severity,
    auto_fixable: bool,
    confidence: f64,
}

/// Regex-first error classifier with persisted pattern history.
pub struct ErrorClassifier {
    rules: Vec<Rule>,
    config: ClassifierConfig,
    db: Arc<StateDb>,
}

impl ErrorClassifier {
    /// Build the classifier, compiling the rule set.
    ///
    /// # Errors
    ///
    /// Returns an error if a rule regex fails to compile.
    pub fn new(db: Arc<StateDb>, config: ClassifierConfig) -> anyhow::Result<Self> {
        Ok(Self {
            rules: build_rules()?,
            config,
            db,
        })
    }

    /// Returns `true` for known noise lines (warnings, debug output) that
    /// must be dropped before any other processing.
    pub fn should_ignore(text: &str) -> bool {
        IGNORE_MARKERS.iter().any(|marker| text.contains(marker))
    }

    /// Classify an error text, updating the pattern history.
    ///
    /// The `context` may carry a `service` hint used when the error text
    /// itself does not name the failing service.
    ///
    /// # Errors
    ///
    /// Returns an error only when the pattern store is unreachable; a text
    /// that matches nothing yields an `Unknown`, non-auto-fixable result.
    pub async fn classify(
        &self,
        text: &str,
        context: &serde_json::Value,
    ) -> anyhow::Result<Classification> {
        for rule in &self.rules {
            if let Some(caps) = rule.regex.captures(text) {
                // Rules with alternations may bind either of two groups.
                let capture = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str().to_owned());
                let candidates = build_candidates(rule.name, capture.as_deref(), context);

                let strategies_json =
                    serde_json::to_string(&candidates).unwrap_or_else(|_| "[]".to_owned());
                self.db
                    .upsert_pattern(
                        rule.name,
                        rule.category.as_str(),
                        text,
                        rule.category.as_str(),
                        rule.severity.as_str(),
                        &strategies_json,
                        rule.auto_fixable,
                    )
                    .await
                    .context("failed to record pattern match")?;

                debug!(rule = rule.name, category = rule.category.as_str(), "rule matched");
                return Ok(Classification {
                    category: rule.category,
                    severity: rule.severity,
                    auto_fixable: rule.auto_fixable,
                    confidence: rule.confidence,
                    candidates,
                    signature: rule.name.to_owned(),
                });
            }
        }

        if let Some(learned) = self.classify_from_history(text).await? {
            return Ok(learned);
        }

        // Nothing matched: record the unknown so history accumulates, then
        // escalate to manual handling.
        let signature = format!("unclassified-{:016x}", crate::types::dedup_hash(text, ""));
        self.db
            .upsert_pattern(
                &signature,
                ErrorCategory::Unknown.as_str(),
                text,
                ErrorCategory::Unknown.as_str(),
                Severity::Medium.as_str(),
                "[]",
                false,
            )
            .await
            .context("failed to record unclassified pattern")?;

        Ok(Classification {
            category: ErrorCategory::Unknown,
            severity: Severity::Medium,
            auto_fixable: false,
            confidence: 0.0,
            candidates: Vec::new(),
            signature,
        })
    }

    /// Search learned patterns by similarity, ranked by occurrence count.
    async fn classify_from_history(&self, text: &str) -> anyhow::Result<Option<Classification>> {
        let rows = self
            .db
            .patterns_by_occurrence()
            .await
            .context("failed to load pattern history")?;

        // Rows arrive sorted by occurrence_count desc, so the first row that
        // clears the similarity threshold is the winner.
        for row in &rows {
            if row.category == ErrorCategory::Unknown.as_str() {
                continue;
            }
            let similarity = token_similarity(text, &row.sample);
            if similarity < self.config.similarity_threshold {
                continue;
            }

            let category = ErrorCategory::parse(&row.category).unwrap_or(ErrorCategory::Unknown);
            let severity = Severity::parse(&row.severity).unwrap_or(Severity::Medium);
            let candidates: Vec<FixStrategy> =
                serde_json::from_str(&row.strategies_json).unwrap_or_default();

            let confidence = (0.4_f64
                + 0.3_f64 * similarity)
                .min(self.config.learned_confidence_cap);

            self.db
                .upsert_pattern(
                    &row.signature,
                    &row.error_type,
                    text,
                    &row.category,
                    &row.severity,
                    &row.strategies_json,
                    row.auto_fixed,
                )
                .await
                .context("failed to bump learned pattern")?;

            debug!(
                signature = %row.signature,
                similarity,
                confidence,
                "learned pattern matched"
            );
            return Ok(Some(Classification {
                category,
                severity,
                auto_fixable: row.auto_fixed,
                confidence,
                candidates,
                signature: row.signature.clone(),
            }));
        }

        Ok(None)
    }
}

/// Token-overlap similarity between two error texts.
///
/// Jaccard over lowercase whitespace tokens, with a containment shortcut:
/// if one normalized text contains the other, similarity is 1.0.
pub fn token_similarity(a: &str, b: &str) -> f64 {
    let norm_a = a.to_lowercase();
    let norm_b = b.to_lowercase();
    if norm_a.contains(norm_b.trim()) || norm_b.contains(norm_a.trim()) {
        return 1.0;
    }

    let tokens_a: HashSet<&str> = norm_a.split_whitespace().collect();
    let tokens_b: HashSet<&str> = norm_b.split_whitespace().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    if union == 0 {
        return 0.0;
    }

    #[allow(clippy::cast_precision_loss)]
    let similarity = intersection as f64 / union as f64;
    similarity
}

/// Compile the ordered rule set. First match wins.
fn build_rules() -> anyhow::Result<Vec<Rule>> {
    let specs: Vec<(&'static str, &'static str, ErrorCategory, Severity, bool, f64)> = vec![
        (
            "module_not_found",
            r"ModuleNotFoundError: No module named '([A-Za-z0-9_.\-]+)'",
            ErrorCategory::Dependency,
            Severity::High,
            true,
            0.95,
        ),
        (
            "import_error",
            r"ImportError: cannot import name '([A-Za-z0-9_]+)'",
            ErrorCategory::Dependency,
            Severity::High,
            true,
            0.85,
        ),
        (
            "file_not_found",
            r"No such file or directory[:\s]*'?([^'\s]+)'?",
            ErrorCategory::Filesystem,
            Severity::Medium,
            true,
            0.9,
        ),
        (
            "permission_denied",
            r"[Pp]ermission denied[:\s]*'?([^'\s]+)'?",
            ErrorCategory::Permission,
            Severity::High,
            true,
            0.9,
        ),
        (
            "broker_unreachable",
            r"(?i)(?:amqp|rabbitmq|redis|broker)[^\n]*connection\s+(?:refused|reset|closed)|connection\s+refused[^\n]*(?::5672|:6379)",
            ErrorCategory::Broker,
            Severity::Critical,
            true,
            0.85,
        ),
        (
            "connection_error",
            r"(?:ConnectionError|ConnectionResetError|ConnectionRefusedError|Temporary failure in name resolution|Network is unreachable)",
            ErrorCategory::Network,
            Severity::High,
            true,
            0.8,
        ),
        (
            "operation_timed_out",
            r"(?i)(?:TimeoutError|timed out)",
            ErrorCategory::Network,
            Severity::Medium,
            true,
            0.75,
        ),
        (
            "syntax_error",
            r"SyntaxError:[^(]*\(([^,]+), line \d+\)",
            ErrorCategory::Syntax,
            Severity::High,
            true,
            0.9,
        ),
        (
            "out_of_memory",
            r"(?i)(?:MemoryError|Cannot allocate memory|out of memory)",
            ErrorCategory::Resource,
            Severity::Critical,
            true,
            0.8,
        ),
        (
            "disk_full",
            r"(?i)(?:No space left on device|Disk quota exceeded)",
            ErrorCategory::Resource,
            Severity::Critical,
            false,
            0.9,
        ),
        (
            "env_var_missing",
            r"(?:KeyError: '([A-Z][A-Z0-9_]*)'|environment variable '?([A-Z][A-Z0-9_]*)'? (?:is )?(?:not set|missing))",
            ErrorCategory::Environment,
            Severity::Medium,
            true,
            0.7,
        ),
        (
            "service_down",
            r"(?i)service '?([a-z0-9_.\-]+)'? (?:is )?(?:down|unavailable|not running|failed)",
            ErrorCategory::Service,
            Severity::High,
            true,
            0.8,
        ),
    ];

    let mut rules = Vec::with_capacity(specs.len());
    for (name, pattern, category, severity, auto_fixable, confidence) in specs {
        let regex = Regex::new(pattern)
            .with_context(|| format!("invalid classifier rule regex '{name}'"))?;
        rules.push(Rule {
            name,
            regex,
            category,
            severity,
            auto_fixable,
            confidence,
        });
    }
    Ok(rules)
}

/// Generate fix candidates for a matched rule.
///
/// Deterministic: the same rule name, capture, and context always produce the
/// same candidate list in the same order.
fn build_candidates(
    rule: &str,
    capture: Option<&str>,
    context: &serde_json::Value,
) -> Vec<FixStrategy> {
    match rule {
        "module_not_found" | "import_error" => {
            let Some(package) = capture else {
                return vec![retry_with_delay()];
            };
            // Imports use the top-level module; pip installs the same name in
            // the overwhelming majority of cases.
            let package = package.split('.').next().unwrap_or(package);
            if !is_safe_name(package) {
                warn!(package, "suspicious package name, skipping install candidate");
                return vec![retry_with_delay()];
            }
            vec![
                FixStrategy {
                    kind: StrategyKind::InstallPackage,
                    command: format!("pip install {package}"),
                    description: format!("install missing package '{package}'"),
                    safety: SafetyClass::Caution,
                },
                retry_with_delay(),
            ]
        }
        "file_not_found" => {
            let Some(path) = capture else {
                return vec![retry_with_delay()];
            };
            vec![FixStrategy {
                kind: StrategyKind::CreateFile,
                command: format!("touch '{path}'"),
                description: format!("create missing file '{path}'"),
                safety: SafetyClass::Caution,
            }]
        }
        "permission_denied" => {
            let Some(path) = capture else {
                return Vec::new();
            };
            vec![
                FixStrategy {
                    kind: StrategyKind::ChangePermission,
                    command: format!("chmod u+rw '{path}'"),
                    description: format!("grant read/write on '{path}'"),
                    safety: SafetyClass::BestEffort,
                },
                FixStrategy {
                    kind: StrategyKind::ChangeOwner,
                    command: format!("chown \"$(id -un)\" '{path}'"),
                    description: format!("take ownership of '{path}'"),
                    safety: SafetyClass::BestEffort,
                },
            ]
        }
        "broker_unreachable" => {
            let mut candidates = vec![retry_with_delay()];
            if let Some(service) = context_service(context) {
                candidates.push(restart_service(&service));
            }
            candidates
        }
        "connection_error" | "operation_timed_out" => vec![retry_with_delay()],
        "syntax_error" => {
            let Some(file) = capture else {
                return Vec::new();
            };
            vec![FixStrategy {
                kind: StrategyKind::FixSyntax,
                command: format!("python3 -m py_compile '{file}'"),
                description: format!("re-check syntax of '{file}'"),
                safety: SafetyClass::Safe,
            }]
        }
        "out_of_memory" => {
            let mut candidates = vec![retry_with_delay()];
            if let Some(service) = context_service(context) {
                candidates.push(restart_service(&service));
            }
            candidates
        }
        "env_var_missing" => {
            let Some(var) = capture else {
                return Vec::new();
            };
            vec![FixStrategy {
                kind: StrategyKind::CheckEnv,
                command: format!("printenv {var}"),
                description: format!("check environment variable '{var}'"),
                safety: SafetyClass::Safe,
            }]
        }
        "service_down" => {
            let Some(service) = capture else {
                return Vec::new();
            };
            if !is_safe_name(service) {
                return Vec::new();
            }
            vec![restart_service(service)]
        }
        _ => Vec::new(),
    }
}

/// Service name hint from incident context, if present and safe.
fn context_service(context: &serde_json::Value) -> Option<String> {
    let service = context.get("service")?.as_str()?;
    if is_safe_name(service) {
        Some(service.to_owned())
    } else {
        None
    }
}

/// Names interpolated into commands must be plain identifiers.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn retry_with_delay() -> FixStrategy {
    FixStrategy {
        kind: StrategyKind::RetryWithDelay,
        command: String::new(),
        description: "wait for the condition to clear, then retry".to_owned(),
        safety: SafetyClass::Safe,
    }
}

fn restart_service(service: &str) -> FixStrategy {
    FixStrategy {
        kind: StrategyKind::RestartService,
        command: format!("systemctl restart {service}"),
        description: format!("restart service '{service}'"),
        safety: SafetyClass::Caution,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_markers_filter_noise() {
        assert!(ErrorClassifier::should_ignore("DEBUG: retrying connection"));
        assert!(ErrorClassifier::should_ignore(
            "UserWarning: pandas version mismatch"
        ));
        assert!(!ErrorClassifier::should_ignore(
            "ModuleNotFoundError: No module named 'requests'"
        ));
    }

    #[test]
    fn similarity_is_symmetric_and_bounded() {
        let a = "ConnectionError: could not reach host alpha";
        let b = "ConnectionError: could not reach host beta";
        let s1 = token_similarity(a, b);
        let s2 = token_similarity(b, a);
        assert!((s1 - s2).abs() < f64::EPSILON);
        assert!((0.0..=1.0).contains(&s1));
        assert!(s1 > 0.5);
    }

    #[test]
    fn containment_is_full_similarity() {
        let full = "PermissionError: [Errno 13] Permission denied: '/var/data'";
        assert!((token_similarity(full, full) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn candidates_are_deterministic() {
        let ctx = serde_json::Value::Null;
        let a = build_candidates("module_not_found", Some("requests"), &ctx);
        let b = build_candidates("module_not_found", Some("requests"), &ctx);
        assert_eq!(a, b);
        assert_eq!(a[0].kind, StrategyKind::InstallPackage);
        assert_eq!(a[0].command, "pip install requests");
    }

    #[test]
    fn hostile_capture_never_reaches_a_command() {
        let ctx = serde_json::Value::Null;
        let candidates = build_candidates("module_not_found", Some("requests; rm -rf /"), &ctx);
        assert!(candidates
            .iter()
            .all(|c| c.kind != StrategyKind::InstallPackage));
    }
}
