//! OAuth2 token file for the Gmail account.
//!
//! The file is provisioned out of band in the JSON shape Google's auth
//! libraries write; this module only reads it, refreshes the access token
//! when it nears expiry, and writes the refreshed copy back.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::GoogleApiError;

/// Tokens expiring within this window are refreshed before use.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleToken {
    #[serde(alias = "access_token")]
    pub token: String,
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default, alias = "email")]
    pub account: Option<String>,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl GoogleToken {
    /// Parse a token file body. A file with neither token is useless.
    pub fn parse(content: &str) -> Result<Self, GoogleApiError> {
        let token: GoogleToken = serde_json::from_str(content)
            .map_err(|e| GoogleApiError::InvalidToken(e.to_string()))?;
        if token.token.trim().is_empty() && token.refresh_token.is_none() {
            return Err(GoogleApiError::InvalidToken(
                "neither an access token nor a refresh token".to_string(),
            ));
        }
        Ok(token)
    }

    /// `expiry` as UTC. Naive timestamps are read as UTC.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.expiry.as_deref()?.trim();
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            })
    }

    /// Missing or unreadable expiry counts as expired.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(at) => at <= now + Duration::seconds(EXPIRY_SKEW_SECS),
            None => true,
        }
    }
}

/// One refresh at a time across the fetcher and the propagation worker.
fn refresh_lock() -> &'static Mutex<()> {
    static LOCK: std::sync::OnceLock<Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Location of the token file.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.inbox-triage/google/token.json`
    pub fn default_location() -> Result<Self, GoogleApiError> {
        let home = dirs::home_dir()
            .ok_or_else(|| GoogleApiError::TokenNotFound(PathBuf::from("~")))?;
        Ok(Self::new(
            home.join(".inbox-triage").join("google").join("token.json"),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<GoogleToken, GoogleApiError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => GoogleToken::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GoogleApiError::TokenNotFound(self.path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write the token back, readable by the owner only on Unix.
    pub fn save(&self, token: &GoogleToken) -> Result<(), GoogleApiError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(token)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// A usable access token, refreshing and persisting it first if needed.
    pub async fn access_token(&self) -> Result<String, GoogleApiError> {
        let token = self.load()?;
        if !token.needs_refresh(Utc::now()) {
            return Ok(token.token);
        }

        let _guard = refresh_lock().lock().await;
        // Another task may have refreshed while we waited.
        let token = self.load()?;
        if !token.needs_refresh(Utc::now()) {
            return Ok(token.token);
        }
        let refreshed = refresh(&token).await?;
        self.save(&refreshed)?;
        Ok(refreshed.token)
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

async fn refresh(token: &GoogleToken) -> Result<GoogleToken, GoogleApiError> {
    let refresh_token = token
        .refresh_token
        .as_deref()
        .ok_or(GoogleApiError::AuthExpired)?;

    let mut form = vec![
        ("client_id", token.client_id.as_str()),
        ("refresh_token", refresh_token),
        ("grant_type", "refresh_token"),
    ];
    if let Some(secret) = token.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }

    let resp = reqwest::Client::new()
        .post(&token.token_uri)
        .form(&form)
        .send()
        .await?;
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    if !(200..300).contains(&status) {
        return Err(refresh_error(status, &body));
    }

    let parsed: RefreshResponse = serde_json::from_str(&body)
        .map_err(|e| GoogleApiError::RefreshFailed(format!("unexpected response: {}", e)))?;
    let expiry = Utc::now() + Duration::seconds(parsed.expires_in.unwrap_or(3600));
    log::info!("google: access token refreshed, valid until {}", expiry);

    Ok(GoogleToken {
        token: parsed.access_token,
        expiry: Some(expiry.to_rfc3339()),
        ..token.clone()
    })
}

/// A revoked or expired grant needs re-consent; anything else may pass.
fn refresh_error(status: u16, body: &str) -> GoogleApiError {
    let revoked = matches!(status, 400 | 401) && {
        let lowered = body.to_lowercase();
        lowered.contains("invalid_grant") || lowered.contains("token has been expired")
    };
    if revoked {
        GoogleApiError::AuthExpired
    } else {
        GoogleApiError::RefreshFailed(format!("HTTP {}: {}", status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::google_api::GMAIL_MODIFY_SCOPE;

    fn token(expiry: Option<&str>) -> GoogleToken {
        GoogleToken {
            token: "ya29.test".to_string(),
            refresh_token: None,
            token_uri: default_token_uri(),
            client_id: "c".to_string(),
            client_secret: None,
            scopes: vec![GMAIL_MODIFY_SCOPE.to_string()],
            expiry: expiry.map(str::to_string),
            account: None,
        }
    }

    #[test]
    fn test_parse_google_auth_file() {
        let json = r#"{
            "token": "ya29.token",
            "refresh_token": "1//refresh",
            "token_uri": "https://oauth2.googleapis.com/token",
            "client_id": "client.apps.googleusercontent.com",
            "client_secret": "secret",
            "scopes": ["https://www.googleapis.com/auth/gmail.modify"],
            "expiry": "2026-02-08T12:00:00.000000Z",
            "account": "user@company.com",
            "universe_domain": "googleapis.com"
        }"#;

        let token = GoogleToken::parse(json).unwrap();
        assert_eq!(token.token, "ya29.token");
        assert_eq!(token.account.as_deref(), Some("user@company.com"));
        assert_eq!(
            token.expires_at().unwrap().to_rfc3339(),
            "2026-02-08T12:00:00+00:00"
        );
    }

    #[test]
    fn test_parse_accepts_access_token_and_rejects_empty() {
        let alias = r#"{"access_token": "ya29.alias", "client_id": "c"}"#;
        assert_eq!(GoogleToken::parse(alias).unwrap().token, "ya29.alias");

        assert!(matches!(
            GoogleToken::parse("not json"),
            Err(GoogleApiError::InvalidToken(_))
        ));
        assert!(matches!(
            GoogleToken::parse(r#"{"token": "", "client_id": "c"}"#),
            Err(GoogleApiError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_needs_refresh() {
        let now = Utc::now();
        assert!(token(None).needs_refresh(now));
        assert!(token(Some("soon")).needs_refresh(now));

        let later = (now + Duration::hours(1)).to_rfc3339();
        assert!(!token(Some(&later)).needs_refresh(now));

        let naive = (now + Duration::hours(1))
            .naive_utc()
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string();
        assert!(!token(Some(&naive)).needs_refresh(now));

        let nearly = (now + Duration::seconds(30)).to_rfc3339();
        assert!(token(Some(&nearly)).needs_refresh(now));
    }

    #[test]
    fn test_store_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("google").join("token.json"));
        assert!(matches!(store.load(), Err(GoogleApiError::TokenNotFound(_))));

        store.save(&token(Some("2030-01-01T00:00:00Z"))).unwrap();
        assert_eq!(store.load().unwrap().token, "ya29.test");
    }

    #[tokio::test]
    async fn test_fresh_token_is_used_without_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        let later = (Utc::now() + Duration::hours(1)).to_rfc3339();
        store.save(&token(Some(&later))).unwrap();

        assert_eq!(store.access_token().await.unwrap(), "ya29.test");
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_needs_consent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        store.save(&token(Some("2020-01-01T00:00:00Z"))).unwrap();

        assert!(matches!(
            store.access_token().await,
            Err(GoogleApiError::AuthExpired)
        ));
    }

    #[test]
    fn test_refresh_error_mapping() {
        assert!(matches!(
            refresh_error(400, r#"{"error": "invalid_grant"}"#),
            GoogleApiError::AuthExpired
        ));
        assert!(matches!(
            refresh_error(500, "boom"),
            GoogleApiError::RefreshFailed(_)
        ));
    }
}
