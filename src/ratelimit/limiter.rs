//! Core rate limiter implementation.
//!
//! The limiter is a fixed-window counter: a burst of `max_requests` at the
//! tail of one window followed by another at the head of the next is
//! admitted. Overflowing a policy that carries a block duration escalates to
//! a block covering every request for that key until it lapses.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::counter::CounterRecord;
use super::policy::{Policy, PolicyRegistry};
use super::snapshot::Snapshot;
use super::store::{CounterStore, Hit, LimiterStats};
use crate::error::Result;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the window ends or the block lapses (ms since epoch)
    pub reset_at: u64,
    /// How long a denied caller should wait
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl Decision {
    fn allow(remaining: u64, reset_at: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at,
            retry_after_ms: None,
        }
    }

    fn deny(reset_at: u64, now: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at,
            retry_after_ms: Some(reset_at.saturating_sub(now)),
        }
    }
}

/// The rate limiter that owns the counter store and the policy table.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter<C: Clock = SystemClock> {
    /// Counter records indexed by operation and identifier
    store: CounterStore,
    /// Named policies
    policies: RwLock<PolicyRegistry>,
    /// Last override policy seen per operation, consulted when sweeping.
    /// Entries are dropped once their operation has no records left.
    overrides: DashMap<String, Policy>,
    clock: C,
}

impl RateLimiter<SystemClock> {
    /// Create a rate limiter driven by the system clock.
    pub fn new(policies: PolicyRegistry) -> Self {
        Self::with_clock(policies, SystemClock)
    }
}

impl Default for RateLimiter<SystemClock> {
    fn default() -> Self {
        Self::new(PolicyRegistry::defaults())
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a rate limiter with an explicit time source.
    pub fn with_clock(policies: PolicyRegistry, clock: C) -> Self {
        Self {
            store: CounterStore::new(),
            policies: RwLock::new(policies),
            overrides: DashMap::new(),
            clock,
        }
    }

    /// Current time according to the limiter's clock.
    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Replace the policy table. Existing counters are kept.
    pub fn set_policies(&self, policies: PolicyRegistry) {
        info!(policies = policies.len(), "Replacing rate limit policies");
        *self.policies.write() = policies;
    }

    /// Get a copy of the current policy table.
    pub fn policies(&self) -> PolicyRegistry {
        self.policies.read().clone()
    }

    /// Check the rate limit for an identifier performing an operation.
    pub fn check_limit(
        &self,
        identifier: &str,
        operation: &str,
        override_policy: Option<Policy>,
    ) -> Result<Decision> {
        self.check_limit_at(identifier, operation, self.now(), override_policy)
    }

    /// Check the rate limit as of `now`.
    ///
    /// Requests arriving during an active block are denied without touching
    /// the counter, so they neither extend the block nor inflate the count.
    pub fn check_limit_at(
        &self,
        identifier: &str,
        operation: &str,
        now: u64,
        override_policy: Option<Policy>,
    ) -> Result<Decision> {
        let policy = self.resolve_policy(operation, override_policy)?;

        trace!(
            operation = %operation,
            identifier = %identifier,
            now = now,
            "Checking rate limit"
        );

        let decision = match self.store.record_hit(operation, identifier, now, &policy) {
            Hit::Allowed(record) => Decision::allow(
                policy.max_requests - record.count,
                record.window_end(policy.window_ms),
            ),
            Hit::Blocked(record) => {
                let until = record.blocked_until.unwrap_or(now);
                debug!(
                    operation = %operation,
                    identifier = %identifier,
                    blocked_until = until,
                    "Request denied by active block"
                );
                Decision::deny(until, now)
            }
            Hit::Escalated(record) => {
                let until = record.blocked_until.unwrap_or(now);
                info!(
                    operation = %operation,
                    identifier = %identifier,
                    count = record.count,
                    blocked_until = until,
                    "Rate limit exceeded, identifier blocked"
                );
                Decision::deny(until, now)
            }
            Hit::Denied(record) => {
                debug!(
                    operation = %operation,
                    identifier = %identifier,
                    count = record.count,
                    limit = policy.max_requests,
                    "Rate limit exceeded"
                );
                Decision::deny(record.window_end(policy.window_ms), now)
            }
        };

        Ok(decision)
    }

    /// Whether `identifier` is currently blocked for `operation`.
    pub fn is_blocked(&self, identifier: &str, operation: &str) -> bool {
        self.is_blocked_at(identifier, operation, self.now())
    }

    pub fn is_blocked_at(&self, identifier: &str, operation: &str, now: u64) -> bool {
        self.store
            .get(operation, identifier)
            .is_some_and(|record| record.is_blocked_at(now))
    }

    /// Block an identifier for an operation regardless of its count.
    pub fn block_user(&self, identifier: &str, operation: &str, duration_ms: u64) -> Result<()> {
        let policy = self.resolve_policy(operation, None)?;
        let record = self
            .store
            .set_block(operation, identifier, self.now(), duration_ms, &policy);

        info!(
            operation = %operation,
            identifier = %identifier,
            blocked_until = ?record.blocked_until,
            "Identifier blocked manually"
        );
        Ok(())
    }

    /// Forget an identifier's counter for one operation, or for all of them.
    ///
    /// Returns the number of records removed.
    pub fn reset_limit(&self, identifier: &str, operation: Option<&str>) -> usize {
        let removed = match operation {
            Some(operation) => usize::from(self.store.clear(operation, identifier)),
            None => self.store.clear_identifier(identifier),
        };

        info!(
            identifier = %identifier,
            operation = ?operation,
            removed = removed,
            "Rate limit reset"
        );
        removed
    }

    /// Aggregate counts, optionally for a single identifier.
    pub fn get_stats(&self, identifier: Option<&str>) -> LimiterStats {
        self.store.stats(self.now(), identifier)
    }

    /// Get the current record for a key, if any.
    pub fn record(&self, identifier: &str, operation: &str) -> Option<CounterRecord> {
        self.store.get(operation, identifier)
    }

    /// Get the number of stored records.
    pub fn counter_count(&self) -> usize {
        self.store.len()
    }

    /// Evict stale records as of the clock's current time.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(self.now())
    }

    /// Evict stale records as of `now`.
    ///
    /// A record is judged against the longer of its operation's registered
    /// window and the last override window used for it. Overrides whose
    /// operation no longer has any record are forgotten afterwards.
    pub fn sweep_expired_at(&self, now: u64) -> usize {
        let evicted = {
            let policies = self.policies.read();
            self.store.sweep_expired(now, |operation| {
                let registered = policies.get(operation).map(|p| p.window_ms);
                let adhoc = self.overrides.get(operation).map(|p| p.window_ms);
                registered.max(adhoc)
            })
        };

        let live = self.store.operations();
        self.overrides.retain(|operation, _| live.contains(operation));
        evicted
    }

    /// Serialize every record.
    pub fn export_records(&self) -> Snapshot {
        Snapshot::from_records(self.store.snapshot(), self.now())
    }

    /// Replace every record with the contents of `snapshot`.
    ///
    /// The snapshot is validated in full first; on error the store is left
    /// as it was. Keys carried by the snapshot stay visible throughout the
    /// replacement, so an imported block is never briefly lifted.
    pub fn import_records(&self, snapshot: Snapshot) -> Result<usize> {
        let records = snapshot.into_records()?;
        let imported = records.len();
        self.store.restore(records);

        info!(records = imported, "Rate limit records imported");
        Ok(imported)
    }

    fn resolve_policy(&self, operation: &str, override_policy: Option<Policy>) -> Result<Policy> {
        if let Some(policy) = override_policy {
            policy.validate(operation)?;
            self.overrides.insert(operation.to_string(), policy);
            return Ok(policy);
        }

        self.policies.read().get_policy(operation)
    }
}
