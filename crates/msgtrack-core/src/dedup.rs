use crate::status::StatusEvent;
use std::collections::HashSet;

/// Merges stored history with newly observed events.
///
/// Existing entries are always kept. Incoming events are accepted in
/// observation order when their identity has not been seen yet, which also
/// collapses duplicates within the same batch. The result is ordered by
/// timestamp; equal timestamps keep their encounter order (existing before
/// incoming).
pub fn merge_history(existing: &[StatusEvent], incoming: &[StatusEvent]) -> Vec<StatusEvent> {
    let mut seen = HashSet::with_capacity(existing.len() + incoming.len());
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());

    for entry in existing.iter().chain(incoming.iter()) {
        if seen.insert(entry.identity()) {
            merged.push(entry.clone());
        }
    }

    // stable: ties keep encounter order
    merged.sort_by_key(|entry| entry.timestamp);
    merged
}
