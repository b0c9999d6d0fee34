//! Mender CLI entry point.
//!
//! Provides `start`, `check`, and `report` subcommands for running the
//! supervisor daemon, dry-running classification of a single error text,
//! and printing the latest health state.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use mender::config::{load_config, mender_paths};
use mender::db::StateDb;
use mender::intake::IntakeTailer;
use mender::orchestrator::HealingOrchestrator;
use mender::patterns::ErrorClassifier;
use mender::transport::ChannelTransport;

/// Mender — self-healing error-recovery supervisor.
#[derive(Parser)]
#[command(name = "mender", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the supervisor daemon.
    Start,
    /// Classify an error text without executing anything.
    Check {
        /// The error text to classify.
        #[arg(long)]
        error: String,
    },
    /// Print the latest health snapshot and recent healing records.
    Report,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start => handle_start().await,
        Command::Check { error } => handle_check(&error).await,
        Command::Report => handle_report().await,
    }
}

/// Run the supervisor daemon until interrupted.
async fn handle_start() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let paths = mender_paths()?;
    std::fs::create_dir_all(&paths.root)
        .with_context(|| format!("failed to create {}", paths.root.display()))?;

    let _logging_guard = mender::logging::init_production(&paths.logs_dir)?;

    let config_path = paths.root.join("mender.toml");
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let db = Arc::new(StateDb::open(&paths.state_db).await?);

    let bot_token = std::env::var(&config.telegram.bot_token_env).unwrap_or_default();

    // The channel transport is the seam to the task queue; the receiving
    // half goes to whatever adapter bridges Mender to the real broker. The
    // standalone binary logs resubmissions so the flow is observable.
    let (transport, mut retry_rx) = ChannelTransport::new(config.intake.capacity);
    tokio::spawn(async move {
        while let Some(message) = retry_rx.recv().await {
            info!(
                task_id = %message.task_id,
                queue = %message.queue,
                retry_count = message.retry_metadata.retry_count,
                "task resubmitted to queue"
            );
        }
    });

    let intake_path = paths.root.join("intake.jsonl");
    let mut tailer = IntakeTailer::new(intake_path.clone());

    let orchestrator = Arc::new(HealingOrchestrator::new(
        config,
        Arc::clone(&db),
        Arc::new(transport),
        &bot_token,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loops = orchestrator.spawn_loops(shutdown_rx);

    info!(
        config = %config_path.display(),
        state_db = %paths.state_db.display(),
        intake = %intake_path.display(),
        "mender supervisor started"
    );

    // Main intake loop: tail the intake file and dispatch incidents.
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let messages = tailer.poll().unwrap_or_default();
                for message in messages {
                    match message.into_incident() {
                        Ok(incident) => {
                            let orchestrator = Arc::clone(&orchestrator);
                            tokio::spawn(async move {
                                orchestrator.handle_incident(incident).await;
                            });
                        }
                        Err(e) => debug!(error = %e, "invalid intake message dropped"),
                    }
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "signal listener failed, shutting down");
                }
                info!("shutdown requested");
                break;
            }
        }
    }

    // Stop the loops, then let any in-flight fix (and its rollback) finish.
    shutdown_tx.send(true).ok();
    orchestrator.drain().await;
    for handle in loops {
        handle.abort();
    }

    info!("mender supervisor stopped");
    Ok(())
}

/// Classify a single error text and print the result. Nothing is executed.
async fn handle_check(error_text: &str) -> anyhow::Result<()> {
    mender::logging::init_cli();

    let paths = mender_paths()?;
    let config_path = paths.root.join("mender.toml");
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let db = Arc::new(StateDb::open(&paths.state_db).await?);
    let classifier = ErrorClassifier::new(Arc::clone(&db), config.classifier.clone())?;

    if ErrorClassifier::should_ignore(error_text) {
        info!("text is log noise and would be ignored");
        return Ok(());
    }

    let classification = classifier
        .classify(error_text, &serde_json::Value::Null)
        .await?;

    info!(
        category = classification.category.as_str(),
        severity = classification.severity.as_str(),
        auto_fixable = classification.auto_fixable,
        confidence = classification.confidence,
        signature = %classification.signature,
        "classification"
    );
    for (index, candidate) in classification.candidates.iter().enumerate() {
        info!(
            rank = index,
            kind = candidate.kind.as_str(),
            command = %candidate.command,
            description = %candidate.description,
            "candidate"
        );
    }

    Ok(())
}

/// Print the latest health snapshot and recent healing records.
async fn handle_report() -> anyhow::Result<()> {
    mender::logging::init_cli();

    let paths = mender_paths()?;
    let db = Arc::new(StateDb::open(&paths.state_db).await?);

    match db.latest_health_snapshot().await? {
        Some(row) => info!(
            timestamp = %row.timestamp,
            status = %row.status,
            score = row.score,
            auto_healing_rate = row.auto_healing_rate,
            prevention_rate = row.prevention_rate,
            avg_healing_time_ms = row.avg_healing_time_ms,
            active_issues = row.active_issues,
            "latest health"
        ),
        None => info!("no health snapshots recorded yet"),
    }

    let records = db.recent_healing_records(10).await?;
    if records.is_empty() {
        info!("no healing records yet");
    } else {
        for (incident_id, error_type, strategy_class, success) in records {
            info!(
                incident = %incident_id,
                error_type = %error_type,
                class = %strategy_class,
                success,
                "healing record"
            );
        }
    }

    Ok(())
}
