use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Configuration
// =============================================================================

/// Main configuration loaded from `~/.inbox-triage/config.json`.
///
/// Every field has a default so a missing file or a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Mailbox owner every record is partitioned by (single account).
    #[serde(default = "default_owner")]
    pub owner: String,
    /// How far back the fetcher looks for unread mail.
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,
    /// Upper bound on messages listed per ingest run.
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    /// Query Gateway page size.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Explicit database path. Defaults to `~/.inbox-triage/triage.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub propagation: PropagationConfig,
    #[serde(default)]
    pub fetch_retry: FetchRetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            lookback_hours: default_lookback_hours(),
            max_results: default_max_results(),
            page_size: default_page_size(),
            db_path: None,
            summarizer: SummarizerConfig::default(),
            server: ServerConfig::default(),
            propagation: PropagationConfig::default(),
            fetch_retry: FetchRetryConfig::default(),
        }
    }
}

fn default_owner() -> String {
    "default".to_string()
}

fn default_lookback_hours() -> u32 {
    24
}

fn default_max_results() -> u32 {
    100
}

fn default_page_size() -> usize {
    20
}

/// Language-model settings for the summarizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizerConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// OpenAI-compatible API base (chat/completions is appended).
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Body text beyond this many characters is truncated before submission.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    /// Length of the raw-body excerpt used when the model call fails.
    #[serde(default = "default_fallback_chars")]
    pub fallback_chars: usize,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum summarizer calls in flight per batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Reply budget passed to the model, in tokens.
    #[serde(default = "default_max_summary_tokens")]
    pub max_summary_tokens: u32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
            max_input_chars: default_max_input_chars(),
            fallback_chars: default_fallback_chars(),
            timeout_secs: default_model_timeout_secs(),
            concurrency: default_concurrency(),
            max_summary_tokens: default_max_summary_tokens(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_input_chars() -> usize {
    4000
}

fn default_fallback_chars() -> usize {
    200
}

fn default_model_timeout_secs() -> u64 {
    15
}

fn default_concurrency() -> usize {
    4
}

fn default_max_summary_tokens() -> u32 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Per-request budget for storage work.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_operation_timeout_ms() -> u64 {
    2500
}

/// Mailbox-side propagation of dispositions (queued, best-effort).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationConfig {
    /// When false the queue drains through the no-op propagator.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_propagation_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_propagation_initial_backoff")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_propagation_max_backoff")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_propagation_poll")]
    pub poll_secs: u64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_propagation_attempts(),
            initial_backoff_secs: default_propagation_initial_backoff(),
            max_backoff_secs: default_propagation_max_backoff(),
            poll_secs: default_propagation_poll(),
        }
    }
}

fn default_propagation_attempts() -> u32 {
    5
}

fn default_propagation_initial_backoff() -> u64 {
    30
}

fn default_propagation_max_backoff() -> u64 {
    3600
}

fn default_propagation_poll() -> u64 {
    15
}

/// Run-level retry for transient fetch failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRetryConfig {
    #[serde(default = "default_fetch_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_fetch_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_fetch_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for FetchRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_fetch_attempts(),
            initial_backoff_ms: default_fetch_initial_backoff(),
            max_backoff_ms: default_fetch_max_backoff(),
        }
    }
}

fn default_fetch_attempts() -> u32 {
    3
}

fn default_fetch_initial_backoff() -> u64 {
    1_000
}

fn default_fetch_max_backoff() -> u64 {
    8_000
}

// =============================================================================
// Disposition
// =============================================================================

/// The single current user-facing state of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Unread,
    Kept,
    Discarded,
    Flagged,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Unread => "unread",
            Disposition::Kept => "kept",
            Disposition::Discarded => "discarded",
            Disposition::Flagged => "flagged",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Disposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unread" => Ok(Disposition::Unread),
            "kept" => Ok(Disposition::Kept),
            "discarded" => Ok(Disposition::Discarded),
            "flagged" => Ok(Disposition::Flagged),
            other => Err(format!("Unknown disposition: '{other}'")),
        }
    }
}

/// A client-submitted swipe action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispositionAction {
    Keep,
    Discard,
    Flag,
}

impl DispositionAction {
    /// The disposition this action transitions a record to.
    pub fn target(&self) -> Disposition {
        match self {
            DispositionAction::Keep => Disposition::Kept,
            DispositionAction::Discard => Disposition::Discarded,
            DispositionAction::Flag => Disposition::Flagged,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispositionAction::Keep => "keep",
            DispositionAction::Discard => "discard",
            DispositionAction::Flag => "flag",
        }
    }
}

impl fmt::Display for DispositionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispositionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep" => Ok(DispositionAction::Keep),
            "discard" => Ok(DispositionAction::Discard),
            "flag" => Ok(DispositionAction::Flag),
            other => Err(format!(
                "Invalid action: '{other}'. Must be 'keep', 'discard', or 'flag'."
            )),
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// A message as returned by the mailbox provider, before triage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedMessage {
    pub provider_id: String,
    #[serde(default)]
    pub thread_id: String,
    pub sender: String,
    pub subject: String,
    #[serde(default)]
    pub snippet: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    /// Provider-side importance label, passed to the model as a hint.
    #[serde(default)]
    pub provider_important: bool,
}

/// Summarizer output for one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Triage {
    pub summary: String,
    pub important: bool,
    pub action_note: Option<String>,
    /// Input exceeded the character cap and was cut before submission.
    pub truncated: bool,
    /// The model call failed and the summary is the body excerpt.
    pub degraded: bool,
}

/// A stored, triaged message.
///
/// `received_at` is kept as stored text: rows written by older builds (or
/// by hand) may carry values that do not parse, and readers must cope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub owner: String,
    pub provider_id: String,
    pub thread_id: String,
    pub subject: String,
    pub sender: String,
    pub received_at: Option<String>,
    pub raw_body: String,
    pub summary: String,
    pub important: bool,
    pub action_note: Option<String>,
    pub disposition: Disposition,
    pub disposed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl MessageRecord {
    /// Build the record the writer upserts for a freshly triaged message.
    pub fn from_triage(
        owner: &str,
        message: &FetchedMessage,
        triage: &Triage,
        written_at: DateTime<Utc>,
    ) -> Self {
        let now = written_at.to_rfc3339();
        Self {
            owner: owner.to_string(),
            provider_id: message.provider_id.clone(),
            thread_id: message.thread_id.clone(),
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            received_at: Some(message.received_at.to_rfc3339()),
            raw_body: message.body.clone(),
            summary: triage.summary.clone(),
            important: triage.important,
            action_note: triage.action_note.clone(),
            disposition: Disposition::Unread,
            disposed_at: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Wire shape served to the review surface (`GET /emails`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailCard {
    pub id: String,
    pub subject: String,
    pub sender: String,
    pub summary: String,
    pub full_content: String,
    pub received_date: DateTime<Utc>,
    pub action_required: bool,
    #[serde(default)]
    pub action_description: String,
    pub status: Disposition,
    #[serde(default)]
    pub important: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailList {
    pub emails: Vec<EmailCard>,
}

/// `POST /email-action` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub email_id: String,
    pub action: String,
}

/// `POST /email-action` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}
