use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::*;
use crate::types::{Disposition, MessageRecord};

const EMAIL_COLUMNS: &str = "owner, provider_id, thread_id, subject, sender, received_at,
     raw_body, summary, important, action_note, disposition, disposed_at,
     created_at, updated_at";

impl TriageDb {
    // =========================================================================
    // Record Writer
    // =========================================================================

    /// Insert or refresh a triaged message, keyed by `(owner, provider_id)`.
    ///
    /// On conflict every field except `disposition`, `disposed_at` and
    /// `created_at` is overwritten, but only when the incoming `updated_at` is
    /// not older than the stored one (last writer wins). A stale write
    /// changes nothing and reports `UpsertOutcome::Stale`.
    pub fn upsert_message(&self, record: &MessageRecord) -> Result<UpsertOutcome, DbError> {
        self.with_transaction(|db| {
            let stored_updated_at: Option<String> = db
                .conn
                .query_row(
                    "SELECT updated_at FROM emails WHERE owner = ?1 AND provider_id = ?2",
                    params![record.owner, record.provider_id],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(ref stored) = stored_updated_at {
                if is_newer(stored, &record.updated_at) {
                    log::debug!(
                        "upsert_message: skipping stale write for {} ({} < {})",
                        record.provider_id,
                        record.updated_at,
                        stored
                    );
                    return Ok(UpsertOutcome::Stale);
                }
            }

            db.conn
                .execute(
                    "INSERT INTO emails (
                        owner, provider_id, thread_id, subject, sender, received_at,
                        raw_body, summary, important, action_note, disposition,
                        disposed_at, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'unread', NULL, ?11, ?12)
                     ON CONFLICT(owner, provider_id) DO UPDATE SET
                        thread_id = excluded.thread_id,
                        subject = excluded.subject,
                        sender = excluded.sender,
                        received_at = excluded.received_at,
                        raw_body = excluded.raw_body,
                        summary = excluded.summary,
                        important = excluded.important,
                        action_note = excluded.action_note,
                        updated_at = excluded.updated_at",
                    params![
                        record.owner,
                        record.provider_id,
                        record.thread_id,
                        record.subject,
                        record.sender,
                        record.received_at,
                        record.raw_body,
                        record.summary,
                        record.important as i32,
                        record.action_note,
                        record.created_at,
                        record.updated_at,
                    ],
                )?;

            Ok(if stored_updated_at.is_some() {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Inserted
            })
        })
    }

    /// Snapshot of every provider id already stored for `owner`.
    pub fn existing_provider_ids(&self, owner: &str) -> Result<HashSet<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT provider_id FROM emails WHERE owner = ?1")?;
        let rows = stmt.query_map(params![owner], |row| row.get::<_, String>(0))?;

        let mut ids = HashSet::new();
        for row in rows {
            ids.insert(row?);
        }
        Ok(ids)
    }

    pub fn get_message(
        &self,
        owner: &str,
        provider_id: &str,
    ) -> Result<Option<MessageRecord>, DbError> {
        let sql = format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE owner = ?1 AND provider_id = ?2");
        let record = self
            .conn
            .query_row(&sql, params![owner, provider_id], map_email_row)
            .optional()?;
        Ok(record)
    }

    // =========================================================================
    // Query Gateway reads
    // =========================================================================

    /// Records for `owner` in one disposition, newest `received_at` first.
    ///
    /// Rows whose `received_at` is missing or not a date rank as newest,
    /// since readers show them at query time. A row that fails to decode
    /// is logged and skipped so one bad record never takes down the page.
    pub fn list_by_disposition(
        &self,
        owner: &str,
        disposition: Disposition,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DbError> {
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails
             WHERE owner = ?1 AND disposition = ?2
             ORDER BY julianday(received_at) IS NULL DESC,
                      julianday(received_at) DESC
             LIMIT ?3"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![owner, disposition.as_str(), limit as i64],
            map_email_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            match row {
                Ok(record) => results.push(record),
                Err(e) => log::warn!("list_by_disposition: skipping unreadable row: {e}"),
            }
        }
        Ok(results)
    }

    // =========================================================================
    // Disposition Handler writes
    // =========================================================================

    /// Set the disposition of one record.
    ///
    /// Returns `Ok(None)` when the record does not exist. Re-applying the
    /// current disposition is a no-op reported as `Unchanged`.
    pub fn set_disposition(
        &self,
        owner: &str,
        provider_id: &str,
        disposition: Disposition,
        at: DateTime<Utc>,
    ) -> Result<Option<DispositionChange>, DbError> {
        self.with_transaction(|db| {
            let current: Option<String> = db
                .conn
                .query_row(
                    "SELECT disposition FROM emails WHERE owner = ?1 AND provider_id = ?2",
                    params![owner, provider_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(current) = current else {
                return Ok(None);
            };
            let current: Disposition = current
                .parse()
                .map_err(|e: String| DbError::CorruptRow(e))?;

            if current == disposition {
                return Ok(Some(DispositionChange::Unchanged(current)));
            }

            let now = at.to_rfc3339();
            db.conn.execute(
                "UPDATE emails SET disposition = ?1, disposed_at = ?2, updated_at = ?2
                 WHERE owner = ?3 AND provider_id = ?4",
                params![disposition.as_str(), now, owner, provider_id],
            )?;

            Ok(Some(DispositionChange::Changed {
                from: current,
                to: disposition,
            }))
        })
    }
}

/// True when `stored` is strictly newer than `incoming`.
///
/// Unparseable timestamps never block a write.
fn is_newer(stored: &str, incoming: &str) -> bool {
    match (
        DateTime::parse_from_rfc3339(stored),
        DateTime::parse_from_rfc3339(incoming),
    ) {
        (Ok(stored), Ok(incoming)) => stored > incoming,
        _ => false,
    }
}

/// Row mapper for emails SELECT queries (14 columns, see `EMAIL_COLUMNS`).
fn map_email_row(row: &rusqlite::Row) -> rusqlite::Result<MessageRecord> {
    let disposition_text: String = row.get(10)?;
    let disposition = disposition_text.parse::<Disposition>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            10,
            rusqlite::types::Type::Text,
            Box::new(DbError::CorruptRow(e)),
        )
    })?;

    Ok(MessageRecord {
        owner: row.get(0)?,
        provider_id: row.get(1)?,
        thread_id: row.get(2)?,
        subject: row.get(3)?,
        sender: row.get(4)?,
        received_at: row.get(5)?,
        raw_body: row.get(6)?,
        summary: row.get(7)?,
        important: row.get::<_, i32>(8)? != 0,
        action_note: row.get(9)?,
        disposition,
        disposed_at: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;
    use chrono::Duration;

    fn sample_record(owner: &str, id: &str, received_at: DateTime<Utc>) -> MessageRecord {
        let now = Utc::now().to_rfc3339();
        MessageRecord {
            owner: owner.to_string(),
            provider_id: id.to_string(),
            thread_id: format!("t-{id}"),
            subject: format!("Subject {id}"),
            sender: "Jane <jane@example.com>".to_string(),
            received_at: Some(received_at.to_rfc3339()),
            raw_body: "Body text".to_string(),
            summary: "I wanted to share an update.".to_string(),
            important: false,
            action_note: None,
            disposition: Disposition::Unread,
            disposed_at: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    fn count_rows(db: &TriageDb, owner: &str, id: &str) -> i64 {
        db.conn_ref()
            .query_row(
                "SELECT COUNT(*) FROM emails WHERE owner = ?1 AND provider_id = ?2",
                params![owner, id],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn test_upsert_inserts_then_updates() {
        let db = test_db();
        let mut record = sample_record("u1", "m1", Utc::now());

        assert_eq!(db.upsert_message(&record).unwrap(), UpsertOutcome::Inserted);

        record.summary = "I changed my mind about Friday.".to_string();
        record.updated_at = (Utc::now() + Duration::seconds(1)).to_rfc3339();
        assert_eq!(db.upsert_message(&record).unwrap(), UpsertOutcome::Updated);

        assert_eq!(count_rows(&db, "u1", "m1"), 1);
        let stored = db.get_message("u1", "m1").unwrap().unwrap();
        assert_eq!(stored.summary, "I changed my mind about Friday.");
    }

    #[test]
    fn test_upsert_preserves_disposition() {
        let db = test_db();
        let record = sample_record("u1", "m1", Utc::now());
        db.upsert_message(&record).unwrap();
        db.set_disposition("u1", "m1", Disposition::Flagged, Utc::now())
            .unwrap();

        let mut refreshed = sample_record("u1", "m1", Utc::now());
        refreshed.updated_at = (Utc::now() + Duration::seconds(5)).to_rfc3339();
        db.upsert_message(&refreshed).unwrap();

        let stored = db.get_message("u1", "m1").unwrap().unwrap();
        assert_eq!(stored.disposition, Disposition::Flagged);
        assert!(stored.disposed_at.is_some());
    }

    #[test]
    fn test_upsert_stale_write_is_ignored() {
        let db = test_db();
        let mut newer = sample_record("u1", "m1", Utc::now());
        newer.summary = "Newer summary text.".to_string();
        newer.updated_at = Utc::now().to_rfc3339();
        db.upsert_message(&newer).unwrap();

        let mut older = sample_record("u1", "m1", Utc::now());
        older.summary = "Older summary text.".to_string();
        older.updated_at = (Utc::now() - Duration::hours(1)).to_rfc3339();
        assert_eq!(db.upsert_message(&older).unwrap(), UpsertOutcome::Stale);

        let stored = db.get_message("u1", "m1").unwrap().unwrap();
        assert_eq!(stored.summary, "Newer summary text.");
    }

    #[test]
    fn test_same_provider_id_is_partitioned_by_owner() {
        let db = test_db();
        db.upsert_message(&sample_record("u1", "m1", Utc::now()))
            .unwrap();
        db.upsert_message(&sample_record("u2", "m1", Utc::now()))
            .unwrap();

        assert_eq!(count_rows(&db, "u1", "m1"), 1);
        assert_eq!(count_rows(&db, "u2", "m1"), 1);
        assert_eq!(db.existing_provider_ids("u1").unwrap().len(), 1);
    }

    #[test]
    fn test_existing_provider_ids_is_case_sensitive() {
        let db = test_db();
        db.upsert_message(&sample_record("u1", "AbC", Utc::now()))
            .unwrap();
        let ids = db.existing_provider_ids("u1").unwrap();
        assert!(ids.contains("AbC"));
        assert!(!ids.contains("abc"));
    }

    #[test]
    fn test_list_by_disposition_orders_newest_first_with_limit() {
        let db = test_db();
        let base = Utc::now();
        for i in 0..5 {
            db.upsert_message(&sample_record(
                "u1",
                &format!("m{i}"),
                base - Duration::minutes(i),
            ))
            .unwrap();
        }

        let page = db.list_by_disposition("u1", Disposition::Unread, 3).unwrap();
        let ids: Vec<&str> = page.iter().map(|r| r.provider_id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2"]);
    }

    #[test]
    fn test_set_disposition_transitions_and_is_idempotent() {
        let db = test_db();
        db.upsert_message(&sample_record("u1", "m1", Utc::now()))
            .unwrap();

        let first = db
            .set_disposition("u1", "m1", Disposition::Discarded, Utc::now())
            .unwrap();
        assert_eq!(
            first,
            Some(DispositionChange::Changed {
                from: Disposition::Unread,
                to: Disposition::Discarded
            })
        );

        let second = db
            .set_disposition("u1", "m1", Disposition::Discarded, Utc::now())
            .unwrap();
        assert_eq!(
            second,
            Some(DispositionChange::Unchanged(Disposition::Discarded))
        );

        let stored = db.get_message("u1", "m1").unwrap().unwrap();
        assert_eq!(stored.disposition, Disposition::Discarded);
    }

    #[test]
    fn test_set_disposition_missing_record() {
        let db = test_db();
        let result = db
            .set_disposition("u1", "nope", Disposition::Kept, Utc::now())
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_is_newer() {
        let now = Utc::now();
        let earlier = now - Duration::seconds(1);
        assert!(is_newer(&now.to_rfc3339(), &earlier.to_rfc3339()));
        assert!(!is_newer(&earlier.to_rfc3339(), &now.to_rfc3339()));
        assert!(!is_newer(&now.to_rfc3339(), &now.to_rfc3339()));
        assert!(!is_newer("garbage", &now.to_rfc3339()));
    }
}
