//! HTTP service for the review surface.
//!
//! Routes:
//! - `GET  /emails`            unread page, newest first
//! - `GET  /emails/flagged`    flagged records
//! - `GET  /emails/discarded`  discarded records
//! - `POST /email-action`      `{emailId, action}` -> `{success, message}`
//! - `GET  /health`
//!
//! Storage work runs on the blocking pool under `operationTimeoutMs`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::db::TriageDb;
use crate::disposition::apply_action;
use crate::error::TriageError;
use crate::queries;
use crate::state::{AppState, SharedDb};
use crate::types::{ActionRequest, ActionResponse, Config, DispositionAction, EmailList};

/// Records returned by the flagged and discarded views.
const HISTORY_LIMIT: usize = 100;

#[derive(Clone)]
pub struct ServiceState {
    config: Arc<Config>,
    db: SharedDb,
    operation_timeout: Duration,
}

impl ServiceState {
    pub fn new(config: Config, db: SharedDb) -> Self {
        let operation_timeout = Duration::from_millis(config.server.operation_timeout_ms);
        Self {
            config: Arc::new(config),
            db,
            operation_timeout,
        }
    }

    /// Run `op` against the database on the blocking pool, bounded by the
    /// operation timeout.
    async fn run_blocking<T, F>(&self, label: &'static str, op: F) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&TriageDb) -> Result<T, TriageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let handle = tokio::task::spawn_blocking(move || {
            let guard = db.lock();
            op(&guard)
        });

        let joined = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                log::warn!(
                    "server: {} timed out after {} ms",
                    label,
                    self.operation_timeout.as_millis()
                );
                ServiceFailure::new(
                    StatusCode::GATEWAY_TIMEOUT,
                    format!(
                        "{} timed out after {} ms",
                        label,
                        self.operation_timeout.as_millis()
                    ),
                )
            })?;

        let result = joined.map_err(|e| {
            ServiceFailure::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{} join failure: {}", label, e),
            )
        })?;

        result.map_err(|e| ServiceFailure::from_error(label, &e))
    }
}

impl From<AppState> for ServiceState {
    fn from(state: AppState) -> Self {
        Self::new(state.config, state.db)
    }
}

/// Error response, in the same `{success, message}` shape as a successful
/// action so clients parse one body type.
#[derive(Debug)]
pub struct ServiceFailure {
    status: StatusCode,
    message: String,
}

impl ServiceFailure {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn from_error(label: &str, err: &TriageError) -> Self {
        let status = match err {
            TriageError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("server: {} failed: {}", label, err);
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let body = ActionResponse {
            success: false,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    owner: String,
}

pub fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/emails", get(list_unread))
        .route("/emails/flagged", get(list_flagged))
        .route("/emails/discarded", get(list_discarded))
        .route("/email-action", post(email_action))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `bind` and serve until the process exits.
pub async fn serve(state: ServiceState, bind: &str) -> Result<(), TriageError> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| TriageError::Config(format!("Failed to bind {}: {}", bind, e)))?;
    log::info!("server: listening on http://{}", bind);
    axum::serve(listener, app(state))
        .await
        .map_err(|e| TriageError::Config(format!("Server error: {}", e)))
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        owner: state.config.owner.clone(),
    })
}

async fn list_unread(State(state): State<ServiceState>) -> Result<Json<EmailList>, ServiceFailure> {
    let owner = state.config.owner.clone();
    let page_size = state.config.page_size;
    let emails = state
        .run_blocking("list_unread", move |db| {
            Ok(queries::unread_page(db, &owner, page_size, Utc::now())?)
        })
        .await?;
    Ok(Json(EmailList { emails }))
}

async fn list_flagged(
    State(state): State<ServiceState>,
) -> Result<Json<EmailList>, ServiceFailure> {
    let owner = state.config.owner.clone();
    let emails = state
        .run_blocking("list_flagged", move |db| {
            Ok(queries::flagged(db, &owner, HISTORY_LIMIT, Utc::now())?)
        })
        .await?;
    Ok(Json(EmailList { emails }))
}

async fn list_discarded(
    State(state): State<ServiceState>,
) -> Result<Json<EmailList>, ServiceFailure> {
    let owner = state.config.owner.clone();
    let emails = state
        .run_blocking("list_discarded", move |db| {
            Ok(queries::discarded(db, &owner, HISTORY_LIMIT, Utc::now())?)
        })
        .await?;
    Ok(Json(EmailList { emails }))
}

async fn email_action(
    State(state): State<ServiceState>,
    payload: Result<Json<ActionRequest>, JsonRejection>,
) -> Result<Json<ActionResponse>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| {
        ServiceFailure::bad_request(format!("Invalid request: {}", rejection.body_text()))
    })?;

    let email_id = request.email_id.trim().to_string();
    if email_id.is_empty() {
        return Err(ServiceFailure::bad_request("emailId must not be empty"));
    }
    let action: DispositionAction = request
        .action
        .parse()
        .map_err(|e: String| ServiceFailure::bad_request(e))?;

    let owner = state.config.owner.clone();
    let outcome = state
        .run_blocking("email_action", move |db| {
            apply_action(db, &owner, &email_id, action, Utc::now())
        })
        .await?;

    Ok(Json(ActionResponse {
        success: true,
        message: outcome.message(),
    }))
}
