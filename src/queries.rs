//! Query Gateway: stored records projected into review cards.

use chrono::{DateTime, Utc};

use crate::db::{DbError, TriageDb};
use crate::types::{Disposition, EmailCard, MessageRecord};

/// Unread cards for `owner`, newest first, at most `page_size`.
pub fn unread_page(
    db: &TriageDb,
    owner: &str,
    page_size: usize,
    now: DateTime<Utc>,
) -> Result<Vec<EmailCard>, DbError> {
    cards_with_disposition(db, owner, Disposition::Unread, page_size, now)
}

/// Flagged cards for `owner`, newest first.
pub fn flagged(
    db: &TriageDb,
    owner: &str,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<Vec<EmailCard>, DbError> {
    cards_with_disposition(db, owner, Disposition::Flagged, limit, now)
}

/// Discarded cards for `owner`, newest first.
pub fn discarded(
    db: &TriageDb,
    owner: &str,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<Vec<EmailCard>, DbError> {
    cards_with_disposition(db, owner, Disposition::Discarded, limit, now)
}

fn cards_with_disposition(
    db: &TriageDb,
    owner: &str,
    disposition: Disposition,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<Vec<EmailCard>, DbError> {
    let records = db.list_by_disposition(owner, disposition, limit)?;
    let mut cards: Vec<EmailCard> = records.into_iter().map(|r| to_card(r, now)).collect();
    // Stable, so storage order breaks ties
    cards.sort_by(|a, b| b.received_date.cmp(&a.received_date));
    Ok(cards)
}

/// Project a record into its wire shape. A missing or unparseable
/// `received_at` becomes `now`.
pub fn to_card(record: MessageRecord, now: DateTime<Utc>) -> EmailCard {
    let received_date = record
        .received_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|| {
            log::debug!(
                "queries: {} has unusable received_at {:?}, using query time",
                record.provider_id,
                record.received_at
            );
            now
        });

    EmailCard {
        id: record.provider_id,
        subject: record.subject,
        sender: record.sender,
        summary: record.summary,
        full_content: record.raw_body,
        received_date,
        action_required: record.action_note.is_some(),
        action_description: record.action_note.unwrap_or_default(),
        status: record.disposition,
        important: record.important,
    }
}
