//! Relay loop suppression with a whole-window reset.
//!
//! The cache holds fingerprints of recently relayed packets. Instead of
//! expiring entries one by one, the entire set is cleared once the window
//! has elapsed. Membership stays O(1) and memory is bounded by the traffic of
//! one window; a duplicate that straddles a reset is let through once.
//!
//! Only relay forwarding consults the cache. Direct delivery is protected
//! against replay by the exchange.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use telehash_core::Fingerprint;

/// Default interval between whole-cache resets.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Time-windowed set of recently seen packet fingerprints.
pub struct DedupCache {
    seen: HashSet<Fingerprint>,
    window: Duration,
    window_start: Instant,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::with_window(DEDUP_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    /// Cache whose first window opens at `start`.
    pub fn starting_at(window: Duration, start: Instant) -> Self {
        Self {
            seen: HashSet::new(),
            window,
            window_start: start,
        }
    }

    /// Record `fingerprint`; `true` if it was already seen in this window.
    pub fn is_duplicate(&mut self, fingerprint: Fingerprint) -> bool {
        self.is_duplicate_at(fingerprint, Instant::now())
    }

    /// [`is_duplicate`](Self::is_duplicate) at an explicit time.
    pub fn is_duplicate_at(&mut self, fingerprint: Fingerprint, now: Instant) -> bool {
        self.maybe_reset(now);
        !self.seen.insert(fingerprint)
    }

    fn maybe_reset(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) >= self.window {
            if !self.seen.is_empty() {
                tracing::trace!(entries = self.seen.len(), "dedup window reset");
            }
            self.seen.clear();
            self.window_start = now;
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}
