//! Deduplicator: drop fetched messages that are already stored.

use std::collections::HashSet;

use crate::types::FetchedMessage;

/// Messages from `fetched` whose `provider_id` is not in `existing`.
///
/// Matching is exact and case-sensitive. Repeats inside `fetched` keep
/// their first occurrence. Order is preserved.
pub fn filter_new(
    fetched: Vec<FetchedMessage>,
    existing: &HashSet<String>,
) -> Vec<FetchedMessage> {
    let mut seen: HashSet<String> = HashSet::with_capacity(fetched.len());
    fetched
        .into_iter()
        .filter(|m| !existing.contains(&m.provider_id) && seen.insert(m.provider_id.clone()))
        .collect()
}
