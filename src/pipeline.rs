//! Ingestion pipeline: fetch, dedup, summarize, write.
//!
//! One pass per run. The stored-id snapshot is read once after the fetch;
//! concurrent runs stay correct because the writer upserts by key.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::db::{DbError, TriageDb, UpsertOutcome};
use crate::dedup::filter_new;
use crate::error::TriageError;
use crate::fetcher::{fetch_with_backoff, window_start, MailboxProvider};
use crate::state::SharedDb;
use crate::summarizer::Summarizer;
use crate::types::{Config, FetchedMessage, MessageRecord, Triage};

/// One message written during a run, for the morning summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestedMessage {
    pub provider_id: String,
    pub sender: String,
    pub subject: String,
    pub summary: String,
    pub important: bool,
    pub action_note: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub window_start: Option<DateTime<Utc>>,
    pub fetched: usize,
    pub already_stored: usize,
    pub inserted: usize,
    pub updated: usize,
    pub stale: usize,
    pub storage_failures: usize,
    /// Summaries that fell back to a body excerpt.
    pub degraded: usize,
    pub truncated: usize,
    /// Newly written messages in received order, newest first.
    pub messages: Vec<IngestedMessage>,
}

impl IngestReport {
    pub fn important_count(&self) -> usize {
        self.messages.iter().filter(|m| m.important).count()
    }

    pub fn action_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.action_note.is_some())
            .count()
    }
}

/// Run the pipeline once for `config.owner`.
///
/// Fails only when the fetch fails (auth, or transient errors that outlast
/// the retry budget) or the stored-id snapshot cannot be read. Model and
/// per-record storage failures are absorbed and counted.
pub async fn run_ingest(
    db: &SharedDb,
    provider: &dyn MailboxProvider,
    summarizer: Arc<Summarizer>,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<IngestReport, TriageError> {
    let owner = config.owner.as_str();
    let since = window_start(now, config.lookback_hours);

    let fetched = fetch_with_backoff(provider, since, config.max_results, &config.fetch_retry).await?;

    let mut report = IngestReport {
        window_start: Some(since),
        fetched: fetched.len(),
        ..IngestReport::default()
    };

    let snapshot_owner = owner.to_string();
    let existing = with_db(db, move |db| db.existing_provider_ids(&snapshot_owner)).await?;
    let mut fresh = filter_new(fetched, &existing);
    report.already_stored = report.fetched - fresh.len();
    fresh.sort_by(|a, b| b.received_at.cmp(&a.received_at));

    log::info!(
        "pipeline: {} fetched, {} new, {} already stored",
        report.fetched,
        fresh.len(),
        report.already_stored
    );

    let triaged = summarize_all(fresh, summarizer, config.summarizer.concurrency).await;

    for (message, triage) in triaged {
        if triage.degraded {
            report.degraded += 1;
        }
        if triage.truncated {
            report.truncated += 1;
        }

        let record = MessageRecord::from_triage(owner, &message, &triage, Utc::now());
        let outcome = with_db(db, move |db| db.upsert_message(&record)).await;
        match outcome {
            Ok(UpsertOutcome::Inserted) => report.inserted += 1,
            Ok(UpsertOutcome::Updated) => report.updated += 1,
            Ok(UpsertOutcome::Stale) => {
                report.stale += 1;
                continue;
            }
            Err(e) => {
                log::warn!("pipeline: failed to store {}: {}", message.provider_id, e);
                report.storage_failures += 1;
                continue;
            }
        }

        report.messages.push(IngestedMessage {
            provider_id: message.provider_id,
            sender: message.sender,
            subject: message.subject,
            summary: triage.summary,
            important: triage.important,
            action_note: triage.action_note,
        });
    }

    log::info!(
        "pipeline: {} inserted, {} updated, {} stale, {} storage failures, {} fallback summaries",
        report.inserted,
        report.updated,
        report.stale,
        report.storage_failures,
        report.degraded
    );

    Ok(report)
}

/// Run a storage call on the blocking pool so waiting on the connection
/// lock never stalls the runtime.
async fn with_db<T, F>(db: &SharedDb, op: F) -> Result<T, TriageError>
where
    T: Send + 'static,
    F: FnOnce(&TriageDb) -> Result<T, DbError> + Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || op(&db.lock()))
        .await
        .map_err(|e| TriageError::Storage(format!("storage task failed: {}", e)))?
        .map_err(TriageError::from)
}

/// Summarize with at most `concurrency` model calls in flight. Output keeps
/// input order.
async fn summarize_all(
    messages: Vec<FetchedMessage>,
    summarizer: Arc<Summarizer>,
    concurrency: usize,
) -> Vec<(FetchedMessage, Triage)> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for (index, message) in messages.into_iter().enumerate() {
        let summarizer = Arc::clone(&summarizer);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let triage = summarizer.summarize(&message).await;
            (index, message, triage)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => log::error!("pipeline: summarize task failed: {}", e),
        }
    }

    results.sort_by_key(|(index, _, _)| *index);
    results
        .into_iter()
        .map(|(_, message, triage)| (message, triage))
        .collect()
}
