//! Total order over waiting entries.

use core::cmp::Ordering;

use crate::entry::QueueEntry;

/// Priority descending, then `queued_at` ascending, then insertion sequence.
///
/// The sequence tie-breaker makes the order total, so positions are stable for
/// entries enqueued within the same instant.
pub fn queue_order(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.queued_at.cmp(&b.queued_at))
        .then_with(|| a.seq.cmp(&b.seq))
}

/// Sort a snapshot of queued entries into admission order.
pub fn sort_queued<'a>(entries: impl IntoIterator<Item = &'a QueueEntry>) -> Vec<&'a QueueEntry> {
    let mut queued: Vec<&QueueEntry> = entries.into_iter().filter(|e| e.is_queued()).collect();
    queued.sort_by(|a, b| queue_order(a, b));
    queued
}

/// 1-based rank of `target` among the queued entries accepted by `in_scope`.
///
/// Returns `None` when `target` is not queued. Counting entries that sort
/// strictly ahead avoids materializing a sorted copy.
pub fn position_of<'a>(
    entries: impl IntoIterator<Item = &'a QueueEntry>,
    target: &QueueEntry,
    in_scope: impl Fn(&QueueEntry) -> bool,
) -> Option<usize> {
    if !target.is_queued() {
        return None;
    }
    let ahead = entries
        .into_iter()
        .filter(|e| e.is_queued() && e.id != target.id && in_scope(e))
        .filter(|e| queue_order(e, target) == Ordering::Less)
        .count();
    Some(ahead + 1)
}
