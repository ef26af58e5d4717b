use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;

use super::*;
use crate::types::DispositionAction;

const QUEUE_COLUMNS: &str = "id, owner, provider_id, action, status, attempts, last_error,
     next_attempt_at, created_at, updated_at";

impl TriageDb {
    /// Queue a mailbox command for a disposition change. Due immediately.
    pub fn enqueue_propagation(
        &self,
        owner: &str,
        provider_id: &str,
        action: DispositionAction,
        at: DateTime<Utc>,
    ) -> Result<String, DbError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = queue_ts(at);
        self.conn.execute(
            "INSERT INTO propagation_queue (
                id, owner, provider_id, action, status, attempts,
                last_error, next_attempt_at, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, NULL, ?5, ?5, ?5)",
            params![id, owner, provider_id, action.as_str(), now],
        )?;
        Ok(id)
    }

    /// Pending commands whose `next_attempt_at` has passed, oldest first.
    pub fn due_commands(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueuedCommand>, DbError> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM propagation_queue
             WHERE status = 'pending' AND next_attempt_at <= ?1
             ORDER BY created_at ASC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![queue_ts(now), limit as i64], read_queue_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(decode_queue_row(row?)?);
        }
        Ok(results)
    }

    /// Every command for `owner`, newest first.
    pub fn list_queue(&self, owner: &str) -> Result<Vec<QueuedCommand>, DbError> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM propagation_queue
             WHERE owner = ?1
             ORDER BY created_at DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner], read_queue_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(decode_queue_row(row?)?);
        }
        Ok(results)
    }

    pub fn mark_command_done(&self, id: &str, at: DateTime<Utc>) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE propagation_queue
             SET status = 'done', attempts = attempts + 1, last_error = NULL, updated_at = ?1
             WHERE id = ?2",
            params![queue_ts(at), id],
        )?;
        Ok(())
    }

    /// Record a failed attempt and push the command back to `next_attempt_at`.
    pub fn mark_command_retry(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE propagation_queue
             SET attempts = attempts + 1, last_error = ?1, next_attempt_at = ?2, updated_at = ?3
             WHERE id = ?4",
            params![error, queue_ts(next_attempt_at), queue_ts(at), id],
        )?;
        Ok(())
    }

    /// Give up on a command after its final attempt.
    pub fn mark_command_failed(
        &self,
        id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE propagation_queue
             SET status = 'failed', attempts = attempts + 1, last_error = ?1, updated_at = ?2
             WHERE id = ?3",
            params![error, queue_ts(at), id],
        )?;
        Ok(())
    }
}

/// Fixed-width timestamps so `next_attempt_at` compares correctly as text.
fn queue_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Raw column tuple; decoded outside the rusqlite closure so enum parse
/// failures surface as `DbError::CorruptRow`.
struct QueueRow {
    id: String,
    owner: String,
    provider_id: String,
    action: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    next_attempt_at: String,
    created_at: String,
    updated_at: String,
}

fn read_queue_row(row: &rusqlite::Row) -> rusqlite::Result<QueueRow> {
    Ok(QueueRow {
        id: row.get(0)?,
        owner: row.get(1)?,
        provider_id: row.get(2)?,
        action: row.get(3)?,
        status: row.get(4)?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
        next_attempt_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn decode_queue_row(row: QueueRow) -> Result<QueuedCommand, DbError> {
    let action: DispositionAction = row.action.parse().map_err(DbError::CorruptRow)?;
    Ok(QueuedCommand {
        id: row.id,
        owner: row.owner,
        provider_id: row.provider_id,
        action,
        status: QueueStatus::parse(&row.status)?,
        attempts: row.attempts.max(0) as u32,
        last_error: row.last_error,
        next_attempt_at: row.next_attempt_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
