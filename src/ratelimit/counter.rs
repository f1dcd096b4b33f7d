//! Counter records and the keys they are stored under.

use std::fmt;

use super::policy::Policy;

/// Identifies one counter: an operation paired with a caller identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    /// The protected operation, e.g. `LOGIN`
    pub operation: String,
    /// The caller being limited (user id, IP address, ...)
    pub identifier: String,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(operation: &str, identifier: &str) -> Self {
        Self {
            operation: operation.to_string(),
            identifier: identifier.to_string(),
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.operation, self.identifier)
    }
}

/// Requests observed for one key in its current fixed window.
///
/// Records are only created by a request (or an explicit block), so `count`
/// is always at least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    /// Requests counted in the current window
    pub count: u64,
    /// When the current window opened (ms since epoch)
    pub window_start: u64,
    /// If in the future, every request for this key is denied
    pub blocked_until: Option<u64>,
}

impl CounterRecord {
    /// A record for the first request of a fresh window.
    pub fn opened_at(now: u64) -> Self {
        Self {
            count: 1,
            window_start: now,
            blocked_until: None,
        }
    }

    /// Whether a block is in force at `now`.
    pub fn is_blocked_at(&self, now: u64) -> bool {
        matches!(self.blocked_until, Some(until) if until > now)
    }

    /// End of the current window.
    pub fn window_end(&self, window_ms: u64) -> u64 {
        self.window_start.saturating_add(window_ms)
    }

    /// Whether the next request should open a fresh window.
    ///
    /// A lapsed block starts over; otherwise the window must have run out.
    pub fn needs_fresh_window(&self, now: u64, window_ms: u64) -> bool {
        match self.blocked_until {
            Some(until) => until <= now,
            None => now >= self.window_end(window_ms),
        }
    }

    /// Whether the sweeper may drop this record.
    pub fn is_stale(&self, now: u64, window_ms: u64) -> bool {
        let window_elapsed = now.saturating_sub(self.window_start) > window_ms;
        let unblocked = match self.blocked_until {
            Some(until) => until < now,
            None => true,
        };
        window_elapsed && unblocked
    }

    /// Count one more request, opening a fresh window when one is due.
    pub fn advance(&mut self, now: u64, policy: &Policy) {
        if self.needs_fresh_window(now, policy.window_ms) {
            *self = Self::opened_at(now);
        } else {
            self.count = self.count.saturating_add(1);
        }
    }

    /// Block until `until`, never shortening a later block already in place.
    pub fn block_until(&mut self, until: u64) {
        self.blocked_until = Some(match self.blocked_until {
            Some(existing) => existing.max(until),
            None => until,
        });
    }
}
