//! Versioned schema for the triage store.
//!
//! SQL files under `migrations/` are compiled in and applied in order. The
//! `schema_version` table records which ones have run; each one commits
//! together with its version row.

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline",
        sql: include_str!("migrations/001_baseline.sql"),
    },
    Migration {
        version: 2,
        name: "propagation_queue",
        sql: include_str!("migrations/002_propagation_queue.sql"),
    },
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("schema version {found} is newer than this build ({known}); upgrade inbox-triage")]
    FromTheFuture { found: i32, known: i32 },

    #[error("migration {version} ({name}) failed: {source}")]
    Apply {
        version: i32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("snapshot before migrating failed: {0}")]
    Snapshot(rusqlite::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

fn latest_known() -> i32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Highest applied version; 0 for an empty database.
pub(crate) fn current_version(conn: &Connection) -> Result<i32, MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Copy the file-backed database to `<path>.pre-migration.bak`.
fn snapshot(conn: &Connection) -> Result<(), MigrationError> {
    let path: String = conn.query_row("PRAGMA database_list", [], |row| row.get(2))?;
    if path.is_empty() {
        return Ok(());
    }
    let target = format!("{}.pre-migration.bak", path);

    let mut dest = Connection::open(&target).map_err(MigrationError::Snapshot)?;
    rusqlite::backup::Backup::new(conn, &mut dest)
        .and_then(|b| b.step(-1).map(|_| ()))
        .map_err(MigrationError::Snapshot)?;

    log::info!("migrations: snapshot written to {}", target);
    Ok(())
}

/// Bring the schema up to date. Returns how many migrations ran.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    let current = current_version(conn)?;
    let known = latest_known();
    if current > known {
        return Err(MigrationError::FromTheFuture {
            found: current,
            known,
        });
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }
    if current > 0 {
        snapshot(conn)?;
    }

    for m in &pending {
        let apply = |source| MigrationError::Apply {
            version: m.version,
            name: m.name,
            source,
        };
        let tx = conn.unchecked_transaction().map_err(apply)?;
        tx.execute_batch(m.sql).map_err(apply)?;
        tx.execute(
            "INSERT INTO schema_version (version, name) VALUES (?1, ?2)",
            rusqlite::params![m.version, m.name],
        )
        .map_err(apply)?;
        tx.commit().map_err(apply)?;
        log::info!("migrations: applied {} ({})", m.version, m.name);
    }

    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn test_empty_database_gets_every_table() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), MIGRATIONS.len());
        assert_eq!(current_version(&conn).unwrap(), latest_known());
        assert_eq!(count(&conn, "emails"), 0);
        assert_eq!(count(&conn, "propagation_queue"), 0);

        let again = run_migrations(&conn).unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn test_constraints_on_emails() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let bad_disposition = conn.execute(
            "INSERT INTO emails (owner, provider_id, summary, disposition, created_at, updated_at)
             VALUES ('u1', 'm1', 'summary', 'archived', '2026-01-01', '2026-01-01')",
            [],
        );
        assert!(bad_disposition.is_err());

        let empty_summary = conn.execute(
            "INSERT INTO emails (owner, provider_id, summary, created_at, updated_at)
             VALUES ('u1', 'm2', '', '2026-01-01', '2026-01-01')",
            [],
        );
        assert!(empty_summary.is_err());
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        current_version(&conn).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (999)", [])
            .unwrap();

        let err = run_migrations(&conn).unwrap_err();
        assert!(matches!(err, MigrationError::FromTheFuture { found: 999, .. }));
    }

    #[test]
    fn test_upgrade_snapshots_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triage.db");
        let conn = Connection::open(&path).unwrap();

        current_version(&conn).unwrap();
        conn.execute_batch(MIGRATIONS[0].sql).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])
            .unwrap();

        assert_eq!(run_migrations(&conn).unwrap(), 1);
        assert!(dir.path().join("triage.db.pre-migration.bak").exists());
    }
}
