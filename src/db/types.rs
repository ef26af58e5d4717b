//! Shared type definitions for the database layer.

use serde::Serialize;
use thiserror::Error;

use crate::types::{Disposition, DispositionAction};

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(#[from] crate::migrations::MigrationError),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

/// Result of an idempotent upsert keyed by `(owner, provider_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored row carries a newer `updated_at`; nothing was written.
    Stale,
}

/// Result of a disposition write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionChange {
    Changed { from: Disposition, to: Disposition },
    /// The record already had the requested disposition.
    Unchanged(Disposition),
}

/// Lifecycle of a queued mailbox propagation command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Done,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Done => "done",
            QueueStatus::Failed => "failed",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, DbError> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "done" => Ok(QueueStatus::Done),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(DbError::CorruptRow(format!("queue status '{other}'"))),
        }
    }
}

/// A row from `propagation_queue`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedCommand {
    pub id: String,
    pub owner: String,
    pub provider_id: String,
    pub action: DispositionAction,
    pub status: QueueStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: String,
    pub created_at: String,
    pub updated_at: String,
}
