//! Review state machine for the swipe surface.
//!
//! Exactly one card is visible: the last element of an ordered stack. An
//! action removes it at once (optimistically) and hands back a ticket for
//! the server call. Resolving the ticket either confirms the item (it is
//! dropped for good) or reverts it, re-inserting it per `RevertPolicy`.
//!
//! ```text
//! visible --act--> pending(action) --ok--> confirmed
//!                        |
//!                        +--fail/expire--> reverted --policy--> visible
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DispositionAction, EmailCard};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReviewError {
    #[error("No email is visible")]
    Empty,
    #[error("Unknown or already resolved ticket {0}")]
    UnknownTicket(u64),
}

/// Where a reverted item goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RevertPolicy {
    /// Straight back on top; the user sees it again immediately.
    #[default]
    ImmediateTop,
    /// Held aside and re-surfaced once the stack drains.
    EndOfSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Visible,
    Pending(DispositionAction),
    Confirmed,
    Reverted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewItem {
    pub card: EmailCard,
    pub expanded: bool,
    pub state: ItemState,
}

impl ReviewItem {
    pub fn new(card: EmailCard) -> Self {
        Self {
            card,
            expanded: false,
            state: ItemState::Visible,
        }
    }

    pub fn id(&self) -> &str {
        &self.card.id
    }
}

/// Handle for one in-flight server call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTicket {
    pub id: u64,
    pub email_id: String,
    pub action: DispositionAction,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Confirmed { email_id: String },
    Reverted { email_id: String },
}

/// Ordered stack of cards. The top (visible) item is the last element.
#[derive(Debug, Clone, Default)]
pub struct ReviewStack {
    items: Vec<ReviewItem>,
}

impl ReviewStack {
    /// Build from a Query Gateway page (newest first), so the newest card
    /// ends up on top.
    pub fn from_page(cards: Vec<EmailCard>) -> Self {
        let mut items: Vec<ReviewItem> = cards.into_iter().map(ReviewItem::new).collect();
        items.reverse();
        Self { items }
    }

    pub fn push(&mut self, item: ReviewItem) {
        self.items.push(item);
    }

    pub fn pop(&mut self) -> Option<ReviewItem> {
        self.items.pop()
    }

    pub fn top(&self) -> Option<&ReviewItem> {
        self.items.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut ReviewItem> {
        self.items.last_mut()
    }

    /// Insert under everything already stacked.
    pub fn push_bottom(&mut self, item: ReviewItem) {
        self.items.insert(0, item);
    }

    pub fn contains(&self, email_id: &str) -> bool {
        self.items.iter().any(|i| i.id() == email_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items from top to bottom.
    pub fn iter_from_top(&self) -> impl Iterator<Item = &ReviewItem> {
        self.items.iter().rev()
    }
}

struct PendingAction {
    ticket: ActionTicket,
    item: ReviewItem,
}

/// Client-side review session. Single-threaded; the async confirmation
/// calls live outside and report back through `resolve`.
pub struct ReviewSession {
    stack: ReviewStack,
    pending: HashMap<u64, PendingAction>,
    deferred: Vec<ReviewItem>,
    policy: RevertPolicy,
    confirm_timeout: Duration,
    next_ticket: u64,
    confirmed: usize,
}

impl ReviewSession {
    pub fn new(cards: Vec<EmailCard>, policy: RevertPolicy, confirm_timeout: Duration) -> Self {
        Self {
            stack: ReviewStack::from_page(cards),
            pending: HashMap::new(),
            deferred: Vec::new(),
            policy,
            confirm_timeout,
            next_ticket: 1,
            confirmed: 0,
        }
    }

    pub fn visible(&self) -> Option<&ReviewItem> {
        self.stack.top()
    }

    pub fn stack(&self) -> &ReviewStack {
        &self.stack
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed
    }

    /// Nothing left to show and nothing in flight.
    pub fn is_finished(&self) -> bool {
        self.stack.is_empty() && self.pending.is_empty() && self.deferred.is_empty()
    }

    /// Flip the expanded flag on the visible card. Returns the new value.
    pub fn toggle_expanded(&mut self) -> Result<bool, ReviewError> {
        let item = self.stack.top_mut().ok_or(ReviewError::Empty)?;
        item.expanded = !item.expanded;
        Ok(item.expanded)
    }

    /// Apply `action` to the visible card: remove it now, return the ticket
    /// for the server call. Cannot be cancelled once issued.
    pub fn act(
        &mut self,
        action: DispositionAction,
        now: DateTime<Utc>,
    ) -> Result<ActionTicket, ReviewError> {
        let mut item = self.stack.pop().ok_or(ReviewError::Empty)?;
        item.state = ItemState::Pending(action);
        item.expanded = false;

        let ticket = ActionTicket {
            id: self.next_ticket,
            email_id: item.card.id.clone(),
            action,
            issued_at: now,
        };
        self.next_ticket += 1;

        log::debug!("review: {} {} (ticket {})", action, ticket.email_id, ticket.id);
        self.pending.insert(
            ticket.id,
            PendingAction {
                ticket: ticket.clone(),
                item,
            },
        );
        self.surface_deferred_if_drained();
        Ok(ticket)
    }

    /// Feed back the server result for `ticket_id`.
    pub fn resolve(&mut self, ticket_id: u64, success: bool) -> Result<Resolution, ReviewError> {
        let PendingAction { ticket, mut item } = self
            .pending
            .remove(&ticket_id)
            .ok_or(ReviewError::UnknownTicket(ticket_id))?;

        if success {
            item.state = ItemState::Confirmed;
            self.confirmed += 1;
            log::debug!("review: {} confirmed", ticket.email_id);
            return Ok(Resolution::Confirmed {
                email_id: ticket.email_id,
            });
        }

        self.revert(item);
        Ok(Resolution::Reverted {
            email_id: ticket.email_id,
        })
    }

    /// Revert every pending ticket issued more than the confirmation
    /// timeout before `now`. Returns the expired tickets.
    pub fn expire_pending(&mut self, now: DateTime<Utc>) -> Vec<ActionTicket> {
        let mut expired: Vec<u64> = self
            .pending
            .values()
            .filter(|p| now - p.ticket.issued_at > self.confirm_timeout)
            .map(|p| p.ticket.id)
            .collect();
        expired.sort_unstable();

        let mut tickets = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(PendingAction { ticket, item }) = self.pending.remove(&id) {
                log::warn!(
                    "review: {} {} not confirmed in time, reverting",
                    ticket.action,
                    ticket.email_id
                );
                self.revert(item);
                tickets.push(ticket);
            }
        }
        tickets
    }

    /// Merge a fresh Query Gateway page. Cards already stacked, pending or
    /// deferred are skipped; new ones go under the current stack so the
    /// visible card does not change. Returns how many were added.
    pub fn refresh(&mut self, cards: Vec<EmailCard>) -> usize {
        let mut added = 0;
        for card in cards {
            if self.is_known(&card.id) {
                continue;
            }
            self.stack.push_bottom(ReviewItem::new(card));
            added += 1;
        }
        added
    }

    fn is_known(&self, email_id: &str) -> bool {
        self.stack.contains(email_id)
            || self.pending.values().any(|p| p.ticket.email_id == email_id)
            || self.deferred.iter().any(|i| i.id() == email_id)
    }

    fn revert(&mut self, mut item: ReviewItem) {
        item.state = ItemState::Reverted;
        match self.policy {
            RevertPolicy::ImmediateTop => {
                log::debug!("review: {} back on top", item.id());
                self.stack.push(item);
            }
            RevertPolicy::EndOfSession => {
                log::debug!("review: {} deferred to end of session", item.id());
                self.deferred.push(item);
                self.surface_deferred_if_drained();
            }
        }
    }

    /// Deferred items come back, first-deferred on top, once nothing else
    /// is left to show.
    fn surface_deferred_if_drained(&mut self) {
        if !self.stack.is_empty() || self.deferred.is_empty() {
            return;
        }
        for item in self.deferred.drain(..).rev() {
            self.stack.push(item);
        }
    }
}
