//! Review-surface client: talks to the HTTP service and drives a
//! `ReviewSession` through its confirmation calls.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::review::{ActionTicket, Resolution, ReviewError, ReviewSession, RevertPolicy};
use crate::types::{ActionRequest, ActionResponse, DispositionAction, EmailCard, EmailList};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Server rejected the action: {0}")]
    Rejected(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait ActionClient: Send + Sync {
    /// Current unread page, newest first.
    async fn fetch_unread(&self) -> Result<Vec<EmailCard>, ClientError>;

    async fn submit(
        &self,
        email_id: &str,
        action: DispositionAction,
    ) -> Result<ActionResponse, ClientError>;
}

/// `ActionClient` over the service's JSON API.
pub struct HttpReviewClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReviewClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn error_for(resp: reqwest::Response) -> ClientError {
        let status = resp.status().as_u16();
        let message = match resp.json::<ActionResponse>().await {
            Ok(body) => body.message,
            Err(_) => String::new(),
        };
        ClientError::Status { status, message }
    }
}

#[async_trait]
impl ActionClient for HttpReviewClient {
    async fn fetch_unread(&self) -> Result<Vec<EmailCard>, ClientError> {
        let resp = self
            .client
            .get(format!("{}/emails", self.base_url))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp).await);
        }
        let list: EmailList = resp.json().await?;
        Ok(list.emails)
    }

    async fn submit(
        &self,
        email_id: &str,
        action: DispositionAction,
    ) -> Result<ActionResponse, ClientError> {
        let body = ActionRequest {
            email_id: email_id.to_string(),
            action: action.as_str().to_string(),
        };
        let resp = self
            .client
            .post(format!("{}/email-action", self.base_url))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp).await);
        }
        Ok(resp.json().await?)
    }
}

/// Start a session from the server's current unread page.
pub async fn open_session(
    client: &dyn ActionClient,
    policy: RevertPolicy,
    confirm_timeout: Duration,
) -> Result<ReviewSession, ClientError> {
    let cards = client.fetch_unread().await?;
    let timeout = chrono::Duration::from_std(confirm_timeout)
        .unwrap_or_else(|_| chrono::Duration::seconds(30));
    Ok(ReviewSession::new(cards, policy, timeout))
}

/// Send the server call for `ticket` under `timeout` and feed the result
/// back into the session. Any error or timeout reverts the item.
pub async fn confirm(
    session: &mut ReviewSession,
    client: &dyn ActionClient,
    ticket: &ActionTicket,
    timeout: Duration,
) -> Result<Resolution, ReviewError> {
    let result = match tokio::time::timeout(timeout, client.submit(&ticket.email_id, ticket.action))
        .await
    {
        Ok(Ok(resp)) if resp.success => Ok(resp),
        Ok(Ok(resp)) => Err(ClientError::Rejected(resp.message)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ClientError::Timeout(timeout)),
    };

    if let Err(ref e) = result {
        log::warn!(
            "client: {} {} failed: {}",
            ticket.action,
            ticket.email_id,
            e
        );
    }
    session.resolve(ticket.id, result.is_ok())
}

/// Act on the visible card and confirm it in one step.
pub async fn act_and_confirm(
    session: &mut ReviewSession,
    client: &dyn ActionClient,
    action: DispositionAction,
    timeout: Duration,
) -> Result<Resolution, ReviewError> {
    let ticket = session.act(action, Utc::now())?;
    confirm(session, client, &ticket, timeout).await
}
