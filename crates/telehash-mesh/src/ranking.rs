//! Pipe ranking.
//!
//! A pipe seen at or after the last resync answered the latest handshake.
//! Those come first, earliest responder first. The rest follow, most
//! recently seen first, never-seen last.

use std::cmp::Ordering;
use std::time::Instant;

fn is_fresh(seen: Option<Instant>, synced_at: Instant) -> bool {
    seen.is_some_and(|at| at >= synced_at)
}

/// Order two pipes by their last-seen times relative to `synced_at`.
#[must_use]
pub fn compare(a: Option<Instant>, b: Option<Instant>, synced_at: Instant) -> Ordering {
    match (is_fresh(a, synced_at), is_fresh(b, synced_at)) {
        (true, true) => a.cmp(&b),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => b.cmp(&a),
    }
}

/// Stable in-place sort of `items` best-first.
pub fn rank_by<T>(items: &mut [T], synced_at: Instant, seen: impl Fn(&T) -> Option<Instant>) {
    items.sort_by(|a, b| compare(seen(a), seen(b), synced_at));
}
