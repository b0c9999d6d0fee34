//! Mender — self-healing error-recovery supervisor.
//!
//! Classifies worker errors, executes safe remedial actions with
//! verification and rollback, retries the original task with
//! category-specific backoff, and learns which strategies work per error
//! type. A central orchestrator tracks an aggregate health score and swaps
//! in preventive, predictive, adaptive, or emergency healing paths.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Configuration loading and validation.
pub mod config;
/// SQLite state database for patterns, ledger, strategies, and health.
pub mod db;
/// Fix lifecycle: deny-list gate, execute, verify, rollback.
pub mod fixer;
/// Health scoring and status tiers.
pub mod health;
/// Error-intake tailing and message validation.
pub mod intake;
/// Execution ledger and strategy ranking.
pub mod learner;
/// Structured logging setup.
pub mod logging;
/// Top-level healing coordination and background loops.
pub mod orchestrator;
/// Rule-based error classification with learned fallback.
pub mod patterns;
/// Strategy scoring backends.
pub mod predictor;
/// Telegram notification reporter.
pub mod reporter;
/// Retry decisions, backoff, and per-task state machine.
pub mod retry;
/// Task transport seam to the queue broker.
pub mod transport;
/// Core data types shared across the pipeline.
pub mod types;
/// Bounded worker pool for external commands.
pub mod workers;
