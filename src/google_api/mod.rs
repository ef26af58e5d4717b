//! Gmail REST client over reqwest: error type, retrying transport and the
//! OAuth token file.

pub mod gmail;
pub mod token;

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::HeaderValue;
use reqwest::{RequestBuilder, Response, StatusCode};

pub use token::{GoogleToken, TokenStore};

/// OAuth2 scope the token must carry (read plus label changes and trash).
pub const GMAIL_MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";

/// Upper bound on a server-supplied `Retry-After`.
const MAX_RETRY_AFTER_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum GoogleApiError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Token expired or revoked")]
    AuthExpired,
    #[error("Token not found at {0}")]
    TokenNotFound(PathBuf),
    #[error("Invalid token file: {0}")]
    InvalidToken(String),
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

/// 408, 429 and 5xx are worth another try.
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Doubling backoff from `initial_backoff_ms`, capped, plus up to 150ms of
/// clock jitter. A numeric `Retry-After` replaces the computed delay.
pub(crate) fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&HeaderValue>,
) -> Duration {
    let server_hint = retry_after
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if let Some(secs) = server_hint {
        return Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS));
    }

    let base = policy
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(policy.max_backoff_ms);
    let jitter = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()) % 150)
        .unwrap_or(0);
    Duration::from_millis(base.saturating_add(jitter))
}

/// Send `request`, retrying retryable statuses and connect or timeout
/// failures until `policy.max_attempts` is spent. The last response or
/// error is returned as-is.
pub async fn send_with_retry(
    request: RequestBuilder,
    policy: &RetryPolicy,
) -> Result<Response, GoogleApiError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        // Streaming bodies cannot be replayed
        let Some(this_try) = request.try_clone() else {
            return Ok(request.send().await?);
        };
        let last = attempt >= attempts;

        let delay = match this_try.send().await {
            Ok(resp) if !last && is_retryable_status(resp.status()) => {
                let delay = retry_delay(
                    attempt,
                    policy,
                    resp.headers().get(reqwest::header::RETRY_AFTER),
                );
                log::warn!(
                    "gmail: status {} on try {}/{}, retrying in {:?}",
                    resp.status(),
                    attempt,
                    attempts,
                    delay
                );
                delay
            }
            Ok(resp) => return Ok(resp),
            Err(e) if !last && (e.is_timeout() || e.is_connect()) => {
                let delay = retry_delay(attempt, policy, None);
                log::warn!(
                    "gmail: {} on try {}/{}, retrying in {:?}",
                    e,
                    attempt,
                    attempts,
                    delay
                );
                delay
            }
            Err(e) => return Err(e.into()),
        };

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// 401 means the token is no good; other failures keep their status and body.
pub(crate) async fn check_status(resp: Response) -> Result<Response, GoogleApiError> {
    match resp.status() {
        s if s.is_success() => Ok(resp),
        StatusCode::UNAUTHORIZED => Err(GoogleApiError::AuthExpired),
        s => Err(GoogleApiError::ApiError {
            status: s.as_u16(),
            message: resp.text().await.unwrap_or_default(),
        }),
    }
}

/// Access token from the default token file, refreshed if needed.
pub async fn get_valid_access_token() -> Result<String, GoogleApiError> {
    TokenStore::default_location()?.access_token().await
}
