//! Gmail API v1: unread fetch plus the label/trash calls used to mirror
//! dispositions back to the mailbox.
//!
//! Lists `is:unread after:<epoch>` page by page, then fetches each message
//! with `format=full` and flattens it into a `FetchedMessage`.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use super::{check_status, send_with_retry, GoogleApiError, RetryPolicy};
use crate::types::FetchedMessage;

const GMAIL_MESSAGES_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me/messages";

/// Gmail caps `maxResults` per list page at 500.
const MAX_PAGE_SIZE: u32 = 500;

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDetail {
    #[serde(default)]
    id: String,
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    label_ids: Vec<String>,
    /// Epoch milliseconds, serialized by Gmail as a string.
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PayloadBody>,
    #[serde(default)]
    parts: Vec<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct PayloadBody {
    #[serde(default)]
    data: Option<String>,
}

// ============================================================================
// Fetch
// ============================================================================

/// Fetch unread messages received after `after`, at most `max_results`.
///
/// An expired token aborts the whole fetch. Any other failure on a single
/// message is logged and that message skipped; the next run picks it up
/// because nothing was stored for it.
pub async fn fetch_unread_messages(
    access_token: &str,
    after: DateTime<Utc>,
    max_results: u32,
) -> Result<Vec<FetchedMessage>, GoogleApiError> {
    let client = reqwest::Client::new();
    let policy = RetryPolicy::default();
    let query = format!("is:unread after:{}", after.timestamp());

    let mut ids: Vec<String> = Vec::new();
    let mut page_token: Option<String> = None;

    while (ids.len() as u32) < max_results {
        let remaining = (max_results - ids.len() as u32).min(MAX_PAGE_SIZE);
        let mut params: Vec<(&str, String)> = vec![
            ("q", query.clone()),
            ("maxResults", remaining.to_string()),
        ];
        if let Some(ref token) = page_token {
            params.push(("pageToken", token.clone()));
        }

        let resp = send_with_retry(
            client
                .get(GMAIL_MESSAGES_URL)
                .bearer_auth(access_token)
                .query(&params),
            &policy,
        )
        .await?;
        let list: MessageListResponse = check_status(resp).await?.json().await?;

        ids.extend(list.messages.into_iter().map(|m| m.id));

        match list.next_page_token {
            Some(next) if !next.is_empty() => page_token = Some(next),
            _ => break,
        }
    }
    ids.truncate(max_results as usize);

    log::info!("Gmail listed {} unread messages ({})", ids.len(), query);

    let mut messages = Vec::with_capacity(ids.len());
    for id in &ids {
        match fetch_message(&client, access_token, id, &policy).await {
            Ok(message) => messages.push(message),
            Err(GoogleApiError::AuthExpired) => return Err(GoogleApiError::AuthExpired),
            Err(e) => {
                log::warn!("Skipping message {}: {}", id, e);
                continue;
            }
        }
    }

    Ok(messages)
}

async fn fetch_message(
    client: &reqwest::Client,
    access_token: &str,
    message_id: &str,
    policy: &RetryPolicy,
) -> Result<FetchedMessage, GoogleApiError> {
    let url = format!("{}/{}", GMAIL_MESSAGES_URL, message_id);
    let resp = send_with_retry(
        client
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("format", "full")]),
        policy,
    )
    .await?;

    let detail: MessageDetail = check_status(resp).await?.json().await?;
    Ok(to_fetched_message(detail))
}

fn to_fetched_message(detail: MessageDetail) -> FetchedMessage {
    let headers = detail
        .payload
        .as_ref()
        .map(|p| &p.headers[..])
        .unwrap_or(&[]);

    let get_header = |name: &str| -> String {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
            .unwrap_or_default()
    };

    let body = detail
        .payload
        .as_ref()
        .and_then(message_body_text)
        .unwrap_or_default();

    let received_at = detail
        .internal_date
        .as_deref()
        .and_then(parse_internal_date)
        .unwrap_or_else(Utc::now);

    FetchedMessage {
        provider_id: detail.id,
        thread_id: detail.thread_id,
        sender: get_header("From"),
        subject: get_header("Subject"),
        snippet: detail.snippet,
        body,
        received_at,
        provider_important: detail.label_ids.iter().any(|l| l == "IMPORTANT"),
    }
}

/// Plain text wins; HTML is converted to text when no plain part exists.
fn message_body_text(payload: &MessagePayload) -> Option<String> {
    if let Some(text) = extract_body_text(payload, "text/plain") {
        return Some(text);
    }
    let html = extract_body_text(payload, "text/html")?;
    match html2text::from_read(html.as_bytes(), 80) {
        Ok(text) => Some(text),
        Err(e) => {
            log::debug!("HTML body conversion failed, keeping raw markup: {}", e);
            Some(html)
        }
    }
}

/// Recursively walk MIME parts to find body data matching the target MIME type.
fn extract_body_text(payload: &MessagePayload, target_mime: &str) -> Option<String> {
    if payload.mime_type == target_mime {
        if let Some(data) = payload.body.as_ref().and_then(|b| b.data.as_deref()) {
            return decode_url_safe_base64(data);
        }
    }
    payload
        .parts
        .iter()
        .find_map(|part| extract_body_text(part, target_mime))
}

/// Decode URL-safe base64 as used by Gmail (padding tolerated).
fn decode_url_safe_base64(data: &str) -> Option<String> {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn parse_internal_date(ms: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = ms.trim().parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

// ============================================================================
// Mailbox mutations (disposition propagation)
// ============================================================================

/// Add and remove labels on one message.
pub async fn modify_labels(
    access_token: &str,
    message_id: &str,
    add: &[&str],
    remove: &[&str],
) -> Result<(), GoogleApiError> {
    let client = reqwest::Client::new();
    let url = format!("{}/{}/modify", GMAIL_MESSAGES_URL, message_id);
    let body = serde_json::json!({
        "addLabelIds": add,
        "removeLabelIds": remove,
    });

    let resp = send_with_retry(
        client.post(&url).bearer_auth(access_token).json(&body),
        &RetryPolicy::default(),
    )
    .await?;
    check_status(resp).await?;
    Ok(())
}

/// Move one message to Trash. Recoverable in Gmail for 30 days.
pub async fn trash_message(access_token: &str, message_id: &str) -> Result<(), GoogleApiError> {
    let client = reqwest::Client::new();
    let url = format!("{}/{}/trash", GMAIL_MESSAGES_URL, message_id);

    let resp = send_with_retry(
        client.post(&url).bearer_auth(access_token),
        &RetryPolicy::default(),
    )
    .await?;
    check_status(resp).await?;
    Ok(())
}
