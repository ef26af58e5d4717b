//! Error taxonomy for ingestion and disposition
//!
//! Errors are classified by how the caller recovers:
//! - Retryable: transient fetch failures (network, rate limits, 5xx)
//! - Recovered locally: model failures, replaced by a fallback summary
//! - Isolated: storage failures, scoped to a single record
//! - RequiresUserAction: auth failures, fixed only by re-authenticating

use thiserror::Error;

use crate::db::DbError;
use crate::google_api::GoogleApiError;

/// Crate-wide error type for the triage pipeline and its services
#[derive(Debug, Error)]
pub enum TriageError {
    // Requires user action
    #[error("Mailbox authentication failed: {0}")]
    Auth(String),

    // Retryable
    #[error("Transient fetch failure: {0}")]
    TransientFetch(String),

    // Recovered locally by the summarizer fallback
    #[error("Language model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Language model quota exceeded: {0}")]
    ModelQuota(String),

    #[error("Language model timed out after {0} seconds")]
    ModelTimeout(u64),

    // Isolated per record
    #[error("Storage error: {0}")]
    Storage(String),

    // Swallowed; disposal success is reported regardless
    #[error("Failed to propagate action to mailbox: {0}")]
    ActionPropagation(String),

    #[error("Email not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TriageError {
    /// Returns true if retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TriageError::TransientFetch(_)
                | TriageError::ModelTimeout(_)
                | TriageError::ActionPropagation(_)
        )
    }

    /// Returns true for failures the summarizer absorbs with a fallback
    pub fn is_model_failure(&self) -> bool {
        matches!(
            self,
            TriageError::ModelUnavailable(_)
                | TriageError::ModelQuota(_)
                | TriageError::ModelTimeout(_)
        )
    }

    /// Returns true if this error requires user action to resolve
    pub fn requires_user_action(&self) -> bool {
        matches!(self, TriageError::Auth(_) | TriageError::Config(_))
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            TriageError::Auth(_) => {
                "Re-authorize mailbox access and save a fresh token to ~/.inbox-triage/google/token.json"
            }
            TriageError::TransientFetch(_) => "Check your internet connection and run ingest again.",
            TriageError::ModelUnavailable(_) | TriageError::ModelTimeout(_) => {
                "Summaries fell back to message excerpts. They will improve once the model is reachable."
            }
            TriageError::ModelQuota(_) => {
                "The language model quota is exhausted. Wait or raise the quota."
            }
            TriageError::Storage(_) => "Check disk space and permissions on ~/.inbox-triage.",
            TriageError::ActionPropagation(_) => {
                "The mailbox was not updated. The action will be retried automatically."
            }
            TriageError::NotFound(_) => "Refresh the email list and try again.",
            TriageError::Config(_) => "Check your configuration in ~/.inbox-triage/config.json",
        }
    }
}

impl From<DbError> for TriageError {
    fn from(err: DbError) -> Self {
        TriageError::Storage(err.to_string())
    }
}

impl From<GoogleApiError> for TriageError {
    fn from(err: GoogleApiError) -> Self {
        match err {
            GoogleApiError::AuthExpired
            | GoogleApiError::TokenNotFound(_)
            | GoogleApiError::InvalidToken(_)
            | GoogleApiError::Io(_)
            | GoogleApiError::Json(_) => TriageError::Auth(err.to_string()),
            GoogleApiError::ApiError { status, .. } if status == 401 || status == 403 => {
                TriageError::Auth(err.to_string())
            }
            other => TriageError::TransientFetch(other.to_string()),
        }
    }
}

/// Serializable error representation for HTTP responses and reports
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
    RequiresUserAction,
}

impl From<&TriageError> for ErrorReport {
    fn from(err: &TriageError) -> Self {
        let error_type = if err.requires_user_action() {
            ErrorType::RequiresUserAction
        } else if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };

        ErrorReport {
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_requires_user_action() {
        let err = TriageError::Auth("token revoked".into());
        assert!(err.requires_user_action());
        assert!(!err.is_retryable());
        let report = ErrorReport::from(&err);
        assert_eq!(report.error_type, ErrorType::RequiresUserAction);
        assert!(!report.can_retry);
    }

    #[test]
    fn test_model_failures_are_recoverable() {
        assert!(TriageError::ModelQuota("429".into()).is_model_failure());
        assert!(TriageError::ModelUnavailable("503".into()).is_model_failure());
        assert!(TriageError::ModelTimeout(15).is_model_failure());
        assert!(!TriageError::Storage("disk".into()).is_model_failure());
    }

    #[test]
    fn test_google_errors_map_to_taxonomy() {
        let auth: TriageError = GoogleApiError::AuthExpired.into();
        assert!(matches!(auth, TriageError::Auth(_)));

        let forbidden: TriageError = GoogleApiError::ApiError {
            status: 401,
            message: "unauthorized".into(),
        }
        .into();
        assert!(matches!(forbidden, TriageError::Auth(_)));

        let transient: TriageError = GoogleApiError::ApiError {
            status: 503,
            message: "backend".into(),
        }
        .into();
        assert!(matches!(transient, TriageError::TransientFetch(_)));
        assert!(transient.is_retryable());
    }

    #[test]
    fn test_unreadable_token_file_needs_user_action() {
        let io: TriageError = GoogleApiError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "token.json",
        ))
        .into();
        assert!(matches!(io, TriageError::Auth(_)));
        assert!(!io.is_retryable());

        let corrupt = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let json: TriageError = GoogleApiError::Json(corrupt).into();
        assert!(matches!(json, TriageError::Auth(_)));
        assert!(json.requires_user_action());
    }
}
