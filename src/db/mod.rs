//! SQLite-backed document store for triaged messages.
//!
//! The database lives at `~/.inbox-triage/triage.db` unless `dbPath` is
//! configured. It holds one row per `(owner, provider_id)` plus the queue of
//! outbound mailbox commands. Rows are never deleted: disposal is a state
//! transition, so the table doubles as an audit trail.

use std::path::PathBuf;

use rusqlite::Connection;

mod emails;
mod queue;
pub mod types;

pub use types::*;

pub struct TriageDb {
    conn: Connection,
}

impl TriageDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) a database at an explicit path and apply the schema.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL lets the ingest binary write while the service reads
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        crate::migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::TriageDb;

    /// Create a temporary database for testing.
    ///
    /// We leak the `TempDir` so the directory persists for the duration of the test.
    pub fn test_db() -> TriageDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        TriageDb::open_at(path).expect("Failed to open test database")
    }
}
