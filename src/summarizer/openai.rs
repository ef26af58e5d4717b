//! OpenAI-compatible chat-completions client.
//!
//! Asks for a JSON object `{"summary", "important", "action"}` written from
//! the sender's point of view. Works against any server exposing
//! `/chat/completions` with `response_format: json_object`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{LanguageModel, ModelReply, ModelRequest};
use crate::error::TriageError;
use crate::types::SummarizerConfig;

const SYSTEM_PROMPT: &str = r#"You triage email for a busy reader.

Rewrite the email as a concise first-person summary (at most 150 words), as if the sender were speaking directly to the recipient. Do not write "The email" or "The sender"; start with the content itself.

Decide whether the email is important to the recipient.

Identify any specific action the recipient must take (RSVPs, documents to review, decisions, replies, deadlines, forms, appointments). Describe it in one or two sentences, or answer "No action required."

Respond with ONLY a JSON object:
{"summary": "<first-person summary>", "important": true|false, "action": "<action or No action required.>"}"#;

const IMPORTANT_HINT: &str = "The mailbox provider has marked this email as important.";

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct TriageReply {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    important: bool,
    #[serde(default)]
    action: Option<String>,
}

pub struct OpenAiModel {
    client: Client,
    api_base: String,
    model: String,
    api_key: String,
    timeout_secs: u64,
}

impl OpenAiModel {
    /// Build from config, reading the key from `config.api_key_env`.
    pub fn from_config(config: &SummarizerConfig) -> Result<Self, TriageError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                TriageError::Config(format!(
                    "{} is not set; summaries will use message excerpts",
                    config.api_key_env
                ))
            })?;
        Self::new(config, api_key)
    }

    pub fn new(config: &SummarizerConfig, api_key: String) -> Result<Self, TriageError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TriageError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            timeout_secs: config.timeout_secs,
        })
    }

    fn request_body(&self, request: &ModelRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "temperature": 0.3,
            "max_tokens": request.max_length.max(1),
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": Self::user_prompt(request) }
            ]
        })
    }

    fn user_prompt(request: &ModelRequest) -> String {
        if request.provider_important {
            format!("{}\n\n{}", IMPORTANT_HINT, request.text)
        } else {
            request.text.clone()
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, TriageError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = self.request_body(request);

        log::debug!("summarizer: calling {} with model {}", url, self.model);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TriageError::ModelTimeout(self.timeout_secs)
                } else {
                    TriageError::ModelUnavailable(format!("request failed: {}", e))
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let text = resp.text().await.unwrap_or_default();
            return Err(TriageError::ModelQuota(text));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(TriageError::ModelUnavailable(format!(
                "status {}: {}",
                status, text
            )));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| TriageError::ModelUnavailable(format!("unreadable response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        parse_reply(&content)
    }
}

/// Parse the model's JSON object, tolerating a Markdown code fence.
fn parse_reply(content: &str) -> Result<ModelReply, TriageError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let reply: TriageReply = serde_json::from_str(unfenced).map_err(|e| {
        TriageError::ModelUnavailable(format!("garbled reply ({}): {}", e, trimmed))
    })?;

    Ok(ModelReply {
        summary: reply.summary,
        important: reply.important,
        action: reply.action,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_plain_json() {
        let reply = parse_reply(
            r#"{"summary": "I need the deck by Friday.", "important": true, "action": "Send the deck."}"#,
        )
        .unwrap();
        assert_eq!(reply.summary, "I need the deck by Friday.");
        assert!(reply.important);
        assert_eq!(reply.action.as_deref(), Some("Send the deck."));
    }

    #[test]
    fn test_parse_reply_fenced_and_partial() {
        let reply = parse_reply("```json\n{\"summary\": \"Just checking in.\"}\n```").unwrap();
        assert_eq!(reply.summary, "Just checking in.");
        assert!(!reply.important);
        assert!(reply.action.is_none());
    }

    #[test]
    fn test_parse_reply_garbled() {
        let err = parse_reply("I think this email is about lunch").unwrap_err();
        assert!(matches!(err, TriageError::ModelUnavailable(_)));
    }

    #[test]
    fn test_user_prompt_carries_importance_hint() {
        let request = ModelRequest {
            text: "Subject: Budget".to_string(),
            max_length: 300,
            provider_important: true,
        };
        assert!(OpenAiModel::user_prompt(&request).starts_with(IMPORTANT_HINT));

        let plain = ModelRequest {
            provider_important: false,
            ..request
        };
        assert_eq!(OpenAiModel::user_prompt(&plain), "Subject: Budget");
    }

    #[test]
    fn test_request_body_uses_reply_budget() {
        let config = SummarizerConfig {
            max_summary_tokens: 120,
            ..SummarizerConfig::default()
        };
        let model = OpenAiModel::new(&config, "sk-test".to_string()).unwrap();
        let request = ModelRequest {
            text: "Subject: Budget".to_string(),
            max_length: config.max_summary_tokens,
            provider_important: false,
        };
        let body = model.request_body(&request);
        assert_eq!(body["max_tokens"], 120);
        assert_eq!(body["model"], config.model.as_str());
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = SummarizerConfig {
            api_key_env: "INBOX_TRIAGE_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..SummarizerConfig::default()
        };
        assert!(matches!(
            OpenAiModel::from_config(&config),
            Err(TriageError::Config(_))
        ));
    }
}
