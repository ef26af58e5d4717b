//! Message Fetcher: unread messages inside the lookback window.
//!
//! The provider is a trait so the pipeline can run against Gmail in
//! production and an in-memory mailbox in tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::TriageError;
use crate::google_api::{self, gmail, RetryPolicy};
use crate::types::{FetchRetryConfig, FetchedMessage};

#[async_trait]
pub trait MailboxProvider: Send + Sync {
    /// Unread messages received after `since`, at most `max_results`.
    async fn fetch_unread(
        &self,
        since: DateTime<Utc>,
        max_results: u32,
    ) -> Result<Vec<FetchedMessage>, TriageError>;
}

/// Gmail over the REST API, authorized by the stored token file.
pub struct GmailProvider;

#[async_trait]
impl MailboxProvider for GmailProvider {
    async fn fetch_unread(
        &self,
        since: DateTime<Utc>,
        max_results: u32,
    ) -> Result<Vec<FetchedMessage>, TriageError> {
        let access_token = google_api::get_valid_access_token().await?;
        let messages = gmail::fetch_unread_messages(&access_token, since, max_results).await?;
        Ok(messages)
    }
}

/// Start of the lookback window ending at `now`.
pub fn window_start(now: DateTime<Utc>, lookback_hours: u32) -> DateTime<Utc> {
    now - Duration::hours(i64::from(lookback_hours))
}

impl From<&FetchRetryConfig> for RetryPolicy {
    fn from(config: &FetchRetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

/// Run-level retry around one fetch.
///
/// Transient failures are retried with exponential backoff until
/// `retry.max_attempts` is spent. Anything else (auth above all) returns
/// at once.
pub async fn fetch_with_backoff(
    provider: &dyn MailboxProvider,
    since: DateTime<Utc>,
    max_results: u32,
    retry: &FetchRetryConfig,
) -> Result<Vec<FetchedMessage>, TriageError> {
    let policy = RetryPolicy::from(retry);
    let attempts = policy.max_attempts.max(1);

    let mut attempt = 1;
    loop {
        match provider.fetch_unread(since, max_results).await {
            Ok(messages) => return Ok(messages),
            Err(TriageError::TransientFetch(msg)) if attempt < attempts => {
                let delay = google_api::retry_delay(attempt, &policy, None);
                log::warn!(
                    "fetcher: attempt {}/{} failed: {} (retrying in {:?})",
                    attempt,
                    attempts,
                    msg,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                log::error!("fetcher: giving up after {} attempt(s): {}", attempt, e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Mailbox that fails a scripted number of times, then serves `messages`.
    pub struct FakeMailbox {
        pub messages: Vec<FetchedMessage>,
        pub transient_failures: u32,
        pub auth_failure: bool,
        pub calls: AtomicU32,
    }

    impl FakeMailbox {
        pub fn serving(messages: Vec<FetchedMessage>) -> Self {
            Self {
                messages,
                transient_failures: 0,
                auth_failure: false,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MailboxProvider for FakeMailbox {
        async fn fetch_unread(
            &self,
            since: DateTime<Utc>,
            max_results: u32,
        ) -> Result<Vec<FetchedMessage>, TriageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.auth_failure {
                return Err(TriageError::Auth("token revoked".to_string()));
            }
            if call < self.transient_failures {
                return Err(TriageError::TransientFetch("503 backend".to_string()));
            }
            Ok(self
                .messages
                .iter()
                .filter(|m| m.received_at > since)
                .take(max_results as usize)
                .cloned()
                .collect())
        }
    }

    pub fn message(id: &str, received_at: DateTime<Utc>) -> FetchedMessage {
        FetchedMessage {
            provider_id: id.to_string(),
            thread_id: format!("t-{id}"),
            sender: "Jane <jane@example.com>".to_string(),
            subject: format!("Subject {id}"),
            snippet: "Snippet text".to_string(),
            body: format!("Hi, this is the body of message {id}. Can you take a look?"),
            received_at,
            provider_important: false,
        }
    }
}
