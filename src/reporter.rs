//! Telegram reporting for manual-intervention alerts, emergency transitions,
//! and periodic health summaries.
//!
//! Uses a teloxide Bot directly (send-only, no dispatcher). Notifications
//! are best-effort: a delivery failure is the caller's to log and never
//! fails the healing flow. Routine auto-heals are log-only and never come
//! through here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::{debug, warn};

use crate::health::HealthSnapshot;
use crate::types::ErrorIncident;

/// Telegram reporter with per-key alert cooldowns.
pub struct Reporter {
    bot: Option<Bot>,
    notify_users: Vec<i64>,
    prefix: String,
    /// Cooldown tracker to prevent duplicate alerts.
    cooldowns: HashMap<String, DateTime<Utc>>,
    cooldown_mins: u64,
}

impl Reporter {
    /// Create a new reporter. An empty token disables delivery entirely
    /// (every send becomes a logged no-op).
    pub fn new(
        bot_token: &str,
        notify_users: Vec<i64>,
        prefix: String,
        cooldown_mins: u64,
    ) -> Self {
        let bot = if bot_token.is_empty() {
            debug!("no bot token configured, reporter disabled");
            None
        } else {
            Some(Bot::new(bot_token))
        };
        Self {
            bot,
            notify_users,
            prefix,
            cooldowns: HashMap::new(),
            cooldown_mins,
        }
    }

    /// Alert that an incident needs manual intervention.
    ///
    /// Respects cooldown: repeats for the same task id within the window are
    /// silently skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the Telegram API call fails.
    pub async fn send_manual_intervention(
        &mut self,
        incident: &ErrorIncident,
        reason: &str,
    ) -> anyhow::Result<()> {
        let key = format!("manual:{}", incident.task_id);
        if self.is_in_cooldown(&key) {
            debug!(key = %key, "alert in cooldown, skipping");
            return Ok(());
        }

        let text = format!(
            "<b>{prefix} \u{2014} Manual intervention needed</b>\n\n\
             Task: <code>{task}</code>\n\
             Worker: {worker}\n\
             Reason: {reason}\n\n\
             <code>{error}</code>",
            prefix = html_escape(&self.prefix),
            task = html_escape(&incident.task_id),
            worker = html_escape(&incident.worker_kind),
            reason = html_escape(reason),
            error = html_escape(truncated(&incident.error_text, 400)),
        );

        self.send_to_all(&text).await?;
        self.record_cooldown(&key);
        Ok(())
    }

    /// Announce an emergency-mode transition (entered or left).
    ///
    /// # Errors
    ///
    /// Returns an error if the Telegram API call fails.
    pub async fn send_emergency_transition(
        &mut self,
        entering: bool,
        score: f64,
    ) -> anyhow::Result<()> {
        let key = format!("emergency:{entering}");
        if self.is_in_cooldown(&key) {
            debug!(key = %key, "alert in cooldown, skipping");
            return Ok(());
        }

        let headline = if entering {
            "Entering emergency mode"
        } else {
            "Leaving emergency mode"
        };
        let text = format!(
            "<b>{prefix} \u{2014} {headline}</b>\n\nHealth score: {score:.2}",
            prefix = html_escape(&self.prefix),
        );

        self.send_to_all(&text).await?;
        self.record_cooldown(&key);
        Ok(())
    }

    /// Notify that a task exhausted its retry budget.
    ///
    /// # Errors
    ///
    /// Returns an error if the Telegram API call fails.
    pub async fn send_retry_exhausted(&mut self, task_id: &str) -> anyhow::Result<()> {
        let key = format!("exhausted:{task_id}");
        if self.is_in_cooldown(&key) {
            return Ok(());
        }

        let text = format!(
            "<b>{prefix} \u{2014} Retries exhausted</b>\n\n\
             Task <code>{task}</code> will not be retried again.",
            prefix = html_escape(&self.prefix),
            task = html_escape(task_id),
        );

        self.send_to_all(&text).await?;
        self.record_cooldown(&key);
        Ok(())
    }

    /// Send the periodic health summary.
    ///
    /// # Errors
    ///
    /// Returns an error if the Telegram API call fails.
    pub async fn send_health_summary(&mut self, snapshot: &HealthSnapshot) -> anyhow::Result<()> {
        let icon = match snapshot.status {
            crate::health::HealthStatusTier::Excellent | crate::health::HealthStatusTier::Good => {
                "\u{2705}"
            }
            crate::health::HealthStatusTier::Fair => "\u{1f7e1}",
            crate::health::HealthStatusTier::Poor | crate::health::HealthStatusTier::Critical => {
                "\u{26a0}\u{fe0f}"
            }
        };

        let text = format!(
            "<b>{prefix} \u{2014} Health</b>\n\n\
             {icon} Status: {status} (score {score:.2})\n\
             Auto-healing rate: {auto:.0}%\n\
             Prevention rate: {prevent:.0}%\n\
             Avg healing time: {avg_ms} ms\n\
             Active issues: {active}",
            prefix = html_escape(&self.prefix),
            status = snapshot.status.as_str(),
            score = snapshot.score,
            auto = snapshot.auto_healing_rate * 100.0,
            prevent = snapshot.prevention_rate * 100.0,
            avg_ms = snapshot.avg_healing_time_ms,
            active = snapshot.active_issues,
        );

        self.send_to_all(&text).await
    }

    /// Send a message to every configured user.
    async fn send_to_all(&self, text: &str) -> anyhow::Result<()> {
        let Some(bot) = &self.bot else {
            debug!("reporter disabled, dropping notification");
            return Ok(());
        };

        for user_id in &self.notify_users {
            let chat = ChatId(*user_id);
            if let Err(e) = bot
                .send_message(chat, text)
                .parse_mode(ParseMode::Html)
                .await
            {
                warn!(user = user_id, error = %e, "failed to deliver notification");
            }
        }
        Ok(())
    }

    /// Whether a key is inside its cooldown window.
    fn is_in_cooldown(&self, key: &str) -> bool {
        match self.cooldowns.get(key) {
            Some(last) => {
                let elapsed = Utc::now().signed_duration_since(*last);
                elapsed.num_minutes() < i64::try_from(self.cooldown_mins).unwrap_or(i64::MAX)
            }
            None => false,
        }
    }

    /// Record that a key was alerted now.
    fn record_cooldown(&mut self, key: &str) {
        self.cooldowns.insert(key.to_owned(), Utc::now());
    }
}

/// Escape HTML-special characters for Telegram HTML parse mode.
fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Truncate on a char boundary.
fn truncated(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    &text[..end]
}
