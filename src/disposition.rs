//! Disposition Handler: apply keep/discard/flag to one stored message.

use chrono::{DateTime, Utc};

use crate::db::{DispositionChange, TriageDb};
use crate::error::TriageError;
use crate::types::{Disposition, DispositionAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionOutcome {
    Applied { from: Disposition, to: Disposition },
    /// The message already had this disposition; nothing changed.
    AlreadyApplied(Disposition),
}

impl DispositionOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            DispositionOutcome::Applied { to, .. } => *to,
            DispositionOutcome::AlreadyApplied(d) => *d,
        }
    }

    /// Client-facing confirmation text.
    pub fn message(&self) -> String {
        match self {
            DispositionOutcome::Applied { to, .. } => format!("Email marked as {}", to),
            DispositionOutcome::AlreadyApplied(d) => format!("Email already {}", d),
        }
    }
}

/// Set the disposition for `action` and queue the mailbox-side command.
///
/// Idempotent: repeating the current disposition succeeds without queueing
/// anything. The queue write is best-effort; its failure is logged and the
/// stored disposition stands.
pub fn apply_action(
    db: &TriageDb,
    owner: &str,
    provider_id: &str,
    action: DispositionAction,
    now: DateTime<Utc>,
) -> Result<DispositionOutcome, TriageError> {
    let change = db
        .set_disposition(owner, provider_id, action.target(), now)?
        .ok_or_else(|| TriageError::NotFound(provider_id.to_string()))?;

    match change {
        DispositionChange::Unchanged(current) => {
            log::debug!(
                "disposition: {} already {}, nothing to do",
                provider_id,
                current
            );
            Ok(DispositionOutcome::AlreadyApplied(current))
        }
        DispositionChange::Changed { from, to } => {
            log::info!("disposition: {} {} -> {}", provider_id, from, to);
            if let Err(e) = db.enqueue_propagation(owner, provider_id, action, now) {
                let err = TriageError::ActionPropagation(e.to_string());
                log::warn!("disposition: {}", err);
            }
            Ok(DispositionOutcome::Applied { from, to })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::types::MessageRecord;

    fn seed(db: &TriageDb, id: &str) {
        let now = Utc::now().to_rfc3339();
        db.upsert_message(&MessageRecord {
            owner: "u1".to_string(),
            provider_id: id.to_string(),
            thread_id: String::new(),
            subject: "Hello".to_string(),
            sender: "jane@example.com".to_string(),
            received_at: Some(now.clone()),
            raw_body: "Body".to_string(),
            summary: "I wanted to say hello.".to_string(),
            important: false,
            action_note: None,
            disposition: Disposition::Unread,
            disposed_at: None,
            created_at: now.clone(),
            updated_at: now,
        })
        .unwrap();
    }

    #[test]
    fn test_each_action_sets_its_disposition() {
        let db = test_db();
        for (id, action, expected) in [
            ("m1", DispositionAction::Keep, Disposition::Kept),
            ("m2", DispositionAction::Discard, Disposition::Discarded),
            ("m3", DispositionAction::Flag, Disposition::Flagged),
        ] {
            seed(&db, id);
            let outcome = apply_action(&db, "u1", id, action, Utc::now()).unwrap();
            assert_eq!(outcome.disposition(), expected);
            let stored = db.get_message("u1", id).unwrap().unwrap();
            assert_eq!(stored.disposition, expected);
        }
    }

    #[test]
    fn test_same_action_twice_is_idempotent() {
        let db = test_db();
        seed(&db, "m1");

        let first = apply_action(&db, "u1", "m1", DispositionAction::Discard, Utc::now()).unwrap();
        let second = apply_action(&db, "u1", "m1", DispositionAction::Discard, Utc::now()).unwrap();

        assert_eq!(
            first,
            DispositionOutcome::Applied {
                from: Disposition::Unread,
                to: Disposition::Discarded
            }
        );
        assert_eq!(second, DispositionOutcome::AlreadyApplied(Disposition::Discarded));
        assert_eq!(db.list_queue("u1").unwrap().len(), 1, "only the change is queued");
    }

    #[test]
    fn test_unknown_message_is_not_found() {
        let db = test_db();
        let err = apply_action(&db, "u1", "ghost", DispositionAction::Keep, Utc::now()).unwrap_err();
        assert!(matches!(err, TriageError::NotFound(id) if id == "ghost"));
        assert!(db.list_queue("u1").unwrap().is_empty());
    }

    #[test]
    fn test_change_enqueues_propagation() {
        let db = test_db();
        seed(&db, "m1");
        apply_action(&db, "u1", "m1", DispositionAction::Flag, Utc::now()).unwrap();

        let queued = db.list_queue("u1").unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].provider_id, "m1");
        assert_eq!(queued[0].action, DispositionAction::Flag);
    }

    #[test]
    fn test_queue_failure_does_not_fail_the_action() {
        let db = test_db();
        seed(&db, "m1");
        db.conn_ref()
            .execute_batch("DROP TABLE propagation_queue")
            .unwrap();

        let outcome = apply_action(&db, "u1", "m1", DispositionAction::Keep, Utc::now()).unwrap();
        assert_eq!(outcome.disposition(), Disposition::Kept);
    }

    #[test]
    fn test_outcome_messages() {
        let applied = DispositionOutcome::Applied {
            from: Disposition::Unread,
            to: Disposition::Flagged,
        };
        assert_eq!(applied.message(), "Email marked as flagged");
        assert_eq!(
            DispositionOutcome::AlreadyApplied(Disposition::Kept).message(),
            "Email already kept"
        );
    }
}
