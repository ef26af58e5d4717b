//! Summarizer: one model call per message, turned into a `Triage`.
//!
//! Body text is cleaned (HTML, quoted replies, signatures) and cut at
//! `maxInputChars` before submission. Every model failure, and every reply
//! too thin to show a user, falls back to an excerpt of the raw body so a
//! stored summary is never empty.

pub mod openai;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::error::TriageError;
use crate::types::{FetchedMessage, SummarizerConfig, Triage};

pub use openai::OpenAiModel;

/// Replies shorter than this are treated as unusable.
const MIN_SUMMARY_CHARS: usize = 15;

/// Prepared text shorter than this is not worth a model call.
const MIN_CONTENT_CHARS: usize = 20;

const REFUSAL_PHRASES: &[&str] = &["i cannot", "sorry", "unable to"];

const NO_ACTION: &str = "no action required.";

const PLACEHOLDER_SUMMARY: &str = "Email content preview not available.";

/// What the model is asked to judge.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub text: String,
    /// Upper bound on the reply length, in model tokens.
    pub max_length: u32,
    /// The provider already labelled this message important.
    pub provider_important: bool,
}

/// Raw model judgment, before cleaning.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub summary: String,
    pub important: bool,
    pub action: Option<String>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, TriageError>;
}

/// Stand-in used when no API key is configured: every call fails, so every
/// summary is the body excerpt.
pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    async fn complete(&self, _request: &ModelRequest) -> Result<ModelReply, TriageError> {
        Err(TriageError::ModelUnavailable(
            "no language model configured".to_string(),
        ))
    }
}

pub struct Summarizer {
    model: Arc<dyn LanguageModel>,
    config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(model: Arc<dyn LanguageModel>, config: SummarizerConfig) -> Self {
        Self { model, config }
    }

    /// Summarize one message. Never fails.
    pub async fn summarize(&self, message: &FetchedMessage) -> Triage {
        let (text, truncated) = prepare_input(message, self.config.max_input_chars);
        if truncated {
            log::debug!(
                "summarizer: {} body truncated to {} chars",
                message.provider_id,
                self.config.max_input_chars
            );
        }

        if text.chars().count() < MIN_CONTENT_CHARS {
            return self.fallback(message, truncated);
        }

        let request = ModelRequest {
            text,
            max_length: self.config.max_summary_tokens,
            provider_important: message.provider_important,
        };

        let reply = match self.call_with_retry(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!(
                    "summarizer: model failed for {}, using excerpt: {}",
                    message.provider_id,
                    e
                );
                return self.fallback(message, truncated);
            }
        };

        let summary = clean_summary_text(&reply.summary);
        if !is_usable_summary(&summary) {
            log::warn!(
                "summarizer: unusable reply for {} ({:?}), using excerpt",
                message.provider_id,
                reply.summary
            );
            return self.fallback(message, truncated);
        }

        Triage {
            summary,
            important: reply.important,
            action_note: reply.action.as_deref().and_then(clean_action_text),
            truncated,
            degraded: false,
        }
    }

    /// One call, plus a single retry when the first one timed out.
    async fn call_with_retry(&self, request: &ModelRequest) -> Result<ModelReply, TriageError> {
        match self.call_once(request).await {
            Err(TriageError::ModelTimeout(secs)) => {
                log::info!("summarizer: model timed out after {}s, retrying once", secs);
                self.call_once(request).await
            }
            other => other,
        }
    }

    async fn call_once(&self, request: &ModelRequest) -> Result<ModelReply, TriageError> {
        let secs = self.config.timeout_secs;
        match tokio::time::timeout(Duration::from_secs(secs), self.model.complete(request)).await
        {
            Ok(result) => result,
            Err(_) => Err(TriageError::ModelTimeout(secs)),
        }
    }

    fn fallback(&self, message: &FetchedMessage, truncated: bool) -> Triage {
        Triage {
            summary: fallback_summary(message, self.config.fallback_chars),
            important: false,
            action_note: None,
            truncated,
            degraded: true,
        }
    }
}

/// Subject line plus cleaned body, the body cut to `max_chars` characters.
/// Returns the text and whether the body was cut.
pub fn prepare_input(message: &FetchedMessage, max_chars: usize) -> (String, bool) {
    let mut body = clean_email_text(&message.body);
    if body.is_empty() {
        body = clean_email_text(&message.snippet);
    }

    let truncated = body.chars().count() > max_chars;
    if truncated {
        body = body.chars().take(max_chars).collect();
    }

    let subject = clean_email_text(&message.subject);
    let text = match (subject.is_empty(), body.is_empty()) {
        (true, _) => body,
        (false, true) => format!("Subject: {subject}"),
        (false, false) => format!("Subject: {subject}\n\n{body}"),
    };
    (text, truncated)
}

/// Deterministic excerpt used whenever the model result is not usable.
///
/// The leading `max_chars` characters of the raw body with trailing
/// whitespace removed, so the result stays a prefix of the body. A blank
/// body falls back to the snippet, then the subject, then a placeholder.
pub fn fallback_summary(message: &FetchedMessage, max_chars: usize) -> String {
    let excerpt: String = message.body.chars().take(max_chars).collect();
    let excerpt = excerpt.trim_end();
    if !excerpt.is_empty() {
        return excerpt.to_string();
    }

    let snippet = clean_email_text(&message.snippet);
    if !snippet.is_empty() {
        return clean_summary_text(&snippet);
    }

    let subject = clean_email_text(&message.subject);
    if !subject.is_empty() {
        return format!("Regarding: {}", clean_summary_text(&subject));
    }

    PLACEHOLDER_SUMMARY.to_string()
}

fn html_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").unwrap())
}

fn reply_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*on\s.+wrote:\s*$").unwrap())
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

fn summary_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(summary|tldr)\s*:\s*").unwrap())
}

fn action_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(action needed|actions?)\s*:\s*").unwrap())
}

/// Strip markup, quoted replies and signatures; collapse whitespace.
pub fn clean_email_text(text: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for line in text.lines() {
        let trimmed_end = line.trim_end();
        if trimmed_end == "--" || line == "-- " {
            break;
        }
        if reply_header_re().is_match(line) {
            break;
        }
        if line.trim_start().starts_with('>') {
            continue;
        }
        kept.push(line);
    }

    let joined = kept.join("\n");
    let no_tags = html_tag_re().replace_all(&joined, " ");
    whitespace_re().replace_all(&no_tags, " ").trim().to_string()
}

/// Drop wrapping quotes and a `Summary:` prefix, flatten to one paragraph,
/// capitalize, and end with punctuation.
pub fn clean_summary_text(text: &str) -> String {
    let text = text.trim().trim_matches(|c| c == '"' || c == '\'');
    let text = summary_prefix_re().replace(text, "");
    let text = whitespace_re().replace_all(&text, " ");
    finish_sentence(text.trim())
}

/// `None` when the model says no action is needed.
pub fn clean_action_text(text: &str) -> Option<String> {
    let text = text.trim().trim_matches(|c| c == '"' || c == '\'');
    let text = action_prefix_re().replace(text, "");
    let text = whitespace_re().replace_all(&text, " ");
    let text = text.trim();

    if text.is_empty() {
        return None;
    }
    let lowered = text.to_lowercase();
    if lowered == NO_ACTION || lowered == NO_ACTION.trim_end_matches('.') || lowered == "none" {
        return None;
    }
    Some(finish_sentence(text))
}

fn finish_sentence(text: &str) -> String {
    let mut chars = text.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };
    let mut out: String = first.to_uppercase().collect();
    out.push_str(chars.as_str());
    if !out.ends_with(['.', '!', '?']) {
        out.push('.');
    }
    out
}

fn is_usable_summary(summary: &str) -> bool {
    if summary.chars().count() < MIN_SUMMARY_CHARS {
        return false;
    }
    let lowered = summary.to_lowercase();
    !REFUSAL_PHRASES.iter().any(|p| lowered.contains(p))
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use chrono::Utc;

    use super::fakes::{reply, ScriptedModel};
    use super::*;
    use crate::fetcher::fakes::message;

    fn summarizer(model: ScriptedModel) -> (Summarizer, Arc<ScriptedModel>) {
        let model = Arc::new(model);
        let config = SummarizerConfig {
            timeout_secs: 1,
            ..SummarizerConfig::default()
        };
        (Summarizer::new(model.clone(), config), model)
    }

    #[tokio::test]
    async fn test_successful_reply_is_cleaned() {
        let (summarizer, _) = summarizer(ScriptedModel::replying(
            "\"summary: i'm moving our sync to Friday at 10\"",
            true,
            Some("Action: confirm the new time"),
        ));
        let triage = summarizer.summarize(&message("m1", Utc::now())).await;

        assert_eq!(triage.summary, "I'm moving our sync to Friday at 10.");
        assert!(triage.important);
        assert_eq!(triage.action_note.as_deref(), Some("Confirm the new time."));
        assert!(!triage.degraded);
    }

    #[tokio::test]
    async fn test_no_action_required_maps_to_none() {
        let (summarizer, _) = summarizer(ScriptedModel::replying(
            "I wanted to share the quarterly numbers with you.",
            false,
            Some("No action required."),
        ));
        let triage = summarizer.summarize(&message("m1", Utc::now())).await;
        assert!(triage.action_note.is_none());
    }

    #[tokio::test]
    async fn test_model_down_with_long_body_falls_back_to_truncated_excerpt() {
        let (summarizer, _) = summarizer(ScriptedModel::new(vec![Err(
            TriageError::ModelUnavailable("503".into()),
        )]));
        let mut long = message("m1", Utc::now());
        long.body = "x".repeat(10_000);

        let triage = summarizer.summarize(&long).await;

        assert!(triage.truncated);
        assert!(triage.degraded);
        assert!(!triage.important);
        assert!(triage.action_note.is_none());
        assert_eq!(triage.summary, "x".repeat(200));
        assert!(long.body.starts_with(&triage.summary));
    }

    #[tokio::test]
    async fn test_quota_error_falls_back() {
        let (summarizer, _) = summarizer(ScriptedModel::new(vec![Err(
            TriageError::ModelQuota("429".into()),
        )]));
        let msg = message("m1", Utc::now());
        let triage = summarizer.summarize(&msg).await;
        assert_eq!(triage.summary, fallback_summary(&msg, 200));
        assert!(!triage.summary.is_empty());
    }

    #[tokio::test]
    async fn test_refusal_and_short_replies_fall_back() {
        for bad in ["Sorry, I cannot help with that request.", "Ok", ""] {
            let (summarizer, _) = summarizer(ScriptedModel::replying(bad, true, Some("Reply")));
            let triage = summarizer.summarize(&message("m1", Utc::now())).await;
            assert!(triage.degraded, "reply {bad:?} should fall back");
            assert!(!triage.important);
            assert!(triage.action_note.is_none());
        }
    }

    #[tokio::test]
    async fn test_timeout_is_retried_once() {
        let (summarizer, model) = summarizer(ScriptedModel::new(vec![
            Err(TriageError::ModelTimeout(1)),
            Ok(reply("I need the signed contract by Monday.", true, None)),
        ]));
        let triage = summarizer.summarize(&message("m1", Utc::now())).await;

        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        assert!(!triage.degraded);
        assert_eq!(triage.summary, "I need the signed contract by Monday.");
    }

    #[tokio::test]
    async fn test_slow_model_times_out_then_falls_back() {
        let mut slow = ScriptedModel::replying("I will never arrive in time.", true, None);
        slow.delay = Some(Duration::from_secs(5));
        let (summarizer, model) = summarizer(slow);

        let triage = summarizer.summarize(&message("m1", Utc::now())).await;
        assert!(triage.degraded);
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_importance_hint_is_forwarded() {
        let (summarizer, model) = summarizer(ScriptedModel::replying(
            "I need your sign-off on the budget.",
            true,
            None,
        ));
        let mut msg = message("m1", Utc::now());
        msg.provider_important = true;
        summarizer.summarize(&msg).await;

        let seen = model.seen.lock().unwrap();
        assert!(seen[0].provider_important);
        assert!(seen[0].text.starts_with("Subject: Subject m1"));
        assert_eq!(seen[0].max_length, SummarizerConfig::default().max_summary_tokens);
    }

    #[test]
    fn test_fallback_chain() {
        let mut msg = message("m1", Utc::now());
        msg.body = "   ".to_string();
        msg.snippet = "see you at the offsite".to_string();
        assert_eq!(fallback_summary(&msg, 200), "See you at the offsite.");

        msg.snippet.clear();
        msg.subject = "offsite plans".to_string();
        assert_eq!(fallback_summary(&msg, 200), "Regarding: Offsite plans.");

        msg.subject.clear();
        assert_eq!(fallback_summary(&msg, 200), PLACEHOLDER_SUMMARY);
    }

    #[test]
    fn test_fallback_keeps_leading_whitespace_of_body() {
        let mut msg = message("m1", Utc::now());
        msg.body = "\n\n  Hello team, the offsite moved to Thursday.  \n".to_string();
        let summary = fallback_summary(&msg, 200);
        assert!(msg.body.starts_with(&summary));
        assert_eq!(summary, "\n\n  Hello team, the offsite moved to Thursday.");
    }

    #[test]
    fn test_fallback_counts_chars_not_bytes() {
        let mut msg = message("m1", Utc::now());
        msg.body = "é".repeat(300);
        assert_eq!(fallback_summary(&msg, 200).chars().count(), 200);
    }

    #[test]
    fn test_clean_email_text() {
        let body = "<p>Hi team,</p>\nThe deck is attached.\n> old quoted line\n\nOn Tue, Jan 6, 2026 at 9:00 AM Bob wrote:\n> earlier thread";
        assert_eq!(clean_email_text(body), "Hi team, The deck is attached.");

        let signed = "Lunch at noon?\n-- \nJane Doe\nVP Sales";
        assert_eq!(clean_email_text(signed), "Lunch at noon?");
    }

    #[test]
    fn test_prepare_input_truncates_by_chars() {
        let mut msg = message("m1", Utc::now());
        msg.body = "ü".repeat(50);
        let (text, truncated) = prepare_input(&msg, 10);
        assert!(truncated);
        assert!(text.ends_with(&"ü".repeat(10)));
        assert!(!text.contains(&"ü".repeat(11)));

        let (_, truncated) = prepare_input(&msg, 50);
        assert!(!truncated);
    }

    #[test]
    fn test_clean_action_text_variants() {
        assert_eq!(clean_action_text("none"), None);
        assert_eq!(clean_action_text("No action required"), None);
        assert_eq!(
            clean_action_text("actions: rsvp by friday!"),
            Some("Rsvp by friday!".to_string())
        );
    }
}
