//! Outbound mailbox commands: drain the propagation queue.
//!
//! Every disposition change leaves a row in `propagation_queue`. The worker
//! replays due rows through a `MailboxPropagator`, backing off on failure and
//! giving up after `maxAttempts`. Delivery to the mailbox is best-effort;
//! the stored disposition is authoritative either way.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::TriageError;
use crate::google_api::{self, gmail};
use crate::state::SharedDb;
use crate::types::{DispositionAction, PropagationConfig};

/// Commands replayed per drain pass.
const DRAIN_BATCH: usize = 50;

#[async_trait]
pub trait MailboxPropagator: Send + Sync {
    async fn propagate(&self, provider_id: &str, action: DispositionAction)
        -> Result<(), TriageError>;

    fn name(&self) -> &'static str;
}

/// Leaves the mailbox untouched. Commands are marked done so the queue
/// doubles as a record of what would have been sent.
pub struct NoopPropagator;

#[async_trait]
impl MailboxPropagator for NoopPropagator {
    async fn propagate(
        &self,
        provider_id: &str,
        action: DispositionAction,
    ) -> Result<(), TriageError> {
        log::debug!("propagation: noop {} for {}", action, provider_id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Mirrors dispositions into Gmail: keep marks read, discard trashes,
/// flag stars.
pub struct GmailPropagator;

#[async_trait]
impl MailboxPropagator for GmailPropagator {
    async fn propagate(
        &self,
        provider_id: &str,
        action: DispositionAction,
    ) -> Result<(), TriageError> {
        let to_propagation_error = |e: google_api::GoogleApiError| {
            TriageError::ActionPropagation(format!("{} {}: {}", action, provider_id, e))
        };

        let token = google_api::get_valid_access_token()
            .await
            .map_err(to_propagation_error)?;

        match action {
            DispositionAction::Keep => {
                gmail::modify_labels(&token, provider_id, &[], &["UNREAD"]).await
            }
            DispositionAction::Discard => gmail::trash_message(&token, provider_id).await,
            DispositionAction::Flag => {
                gmail::modify_labels(&token, provider_id, &["STARRED"], &[]).await
            }
        }
        .map_err(to_propagation_error)
    }

    fn name(&self) -> &'static str {
        "gmail"
    }
}

/// Pick the propagator for this configuration.
pub fn propagator_for(config: &PropagationConfig) -> Arc<dyn MailboxPropagator> {
    if config.enabled {
        Arc::new(GmailPropagator)
    } else {
        Arc::new(NoopPropagator)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub delivered: usize,
    pub rescheduled: usize,
    pub abandoned: usize,
}

/// Delay before retry number `attempt` (1-based): doubling from
/// `initialBackoffSecs`, capped at `maxBackoffSecs`.
pub fn backoff_delay(attempt: u32, config: &PropagationConfig) -> Duration {
    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let secs = config
        .initial_backoff_secs
        .saturating_mul(exponent)
        .min(config.max_backoff_secs);
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

/// Replay every command due at `now` once.
pub async fn drain_once(
    db: &SharedDb,
    propagator: &dyn MailboxPropagator,
    config: &PropagationConfig,
    now: DateTime<Utc>,
) -> Result<DrainReport, TriageError> {
    let due = db.lock().due_commands(now, DRAIN_BATCH)?;
    let mut report = DrainReport::default();

    for command in due {
        let result = propagator.propagate(&command.provider_id, command.action).await;
        let attempt = command.attempts + 1;

        let write = match result {
            Ok(()) => {
                report.delivered += 1;
                db.lock().mark_command_done(&command.id, now)
            }
            Err(e) if attempt >= config.max_attempts.max(1) => {
                log::error!(
                    "propagation: giving up on {} {} after {} attempts: {}",
                    command.action,
                    command.provider_id,
                    attempt,
                    e
                );
                report.abandoned += 1;
                db.lock().mark_command_failed(&command.id, &e.to_string(), now)
            }
            Err(e) => {
                let next = now + backoff_delay(attempt, config);
                log::warn!(
                    "propagation: {} {} failed (attempt {}), retrying at {}: {}",
                    command.action,
                    command.provider_id,
                    attempt,
                    next,
                    e
                );
                report.rescheduled += 1;
                db.lock()
                    .mark_command_retry(&command.id, &e.to_string(), next, now)
            }
        };

        if let Err(e) = write {
            log::warn!(
                "propagation: could not record outcome for {}: {}",
                command.id,
                e
            );
        }
    }

    Ok(report)
}

/// Drain the queue every `pollSecs` until the process exits.
pub async fn run_worker(
    db: SharedDb,
    propagator: Arc<dyn MailboxPropagator>,
    config: PropagationConfig,
) {
    log::info!(
        "propagation: worker started ({} propagator, poll every {}s)",
        propagator.name(),
        config.poll_secs
    );
    let mut interval = tokio::time::interval(StdDuration::from_secs(config.poll_secs.max(1)));

    loop {
        interval.tick().await;
        match drain_once(&db, propagator.as_ref(), &config, Utc::now()).await {
            Ok(report) if report != DrainReport::default() => {
                log::info!(
                    "propagation: {} delivered, {} rescheduled, {} abandoned",
                    report.delivered,
                    report.rescheduled,
                    report.abandoned
                );
            }
            Ok(_) => {}
            Err(e) => log::warn!("propagation: drain failed: {}", e),
        }
    }
}
