//! Concurrent storage for counter records.
//!
//! Records live in a sharded [`DashMap`]. Every mutation of a key happens
//! under that key's shard lock, so increments on one key are linearizable
//! while keys on other shards proceed independently.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;

use super::counter::{CounterKey, CounterRecord};
use super::policy::Policy;

/// What happened to a request that reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hit {
    /// An active block was in force; nothing was mutated.
    Blocked(CounterRecord),
    /// Counted and within the ceiling.
    Allowed(CounterRecord),
    /// Counted, over the ceiling, no block configured.
    Denied(CounterRecord),
    /// Counted, over the ceiling, and a block was placed.
    Escalated(CounterRecord),
}

/// Aggregate view of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    /// Distinct operations with at least one record
    pub tracked_operations: usize,
    /// Distinct identifiers with at least one record
    pub tracked_identifiers: usize,
    /// Records currently under an active block
    pub blocked: usize,
}

/// Thread-safe home of every [`CounterRecord`].
#[derive(Debug, Default)]
pub struct CounterStore {
    records: DashMap<CounterKey, CounterRecord>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a record without side effects.
    pub fn get(&self, operation: &str, identifier: &str) -> Option<CounterRecord> {
        self.records
            .get(&CounterKey::new(operation, identifier))
            .map(|r| *r.value())
    }

    /// Count one request, opening a fresh window when one is due.
    pub fn upsert_increment(
        &self,
        operation: &str,
        identifier: &str,
        now: u64,
        policy: &Policy,
    ) -> CounterRecord {
        match self.records.entry(CounterKey::new(operation, identifier)) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().advance(now, policy);
                *entry.get()
            }
            Entry::Vacant(entry) => *entry.insert(CounterRecord::opened_at(now)),
        }
    }

    /// Check the block, count the request and escalate, all under one lock.
    pub fn record_hit(
        &self,
        operation: &str,
        identifier: &str,
        now: u64,
        policy: &Policy,
    ) -> Hit {
        match self.records.entry(CounterKey::new(operation, identifier)) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.is_blocked_at(now) {
                    return Hit::Blocked(*record);
                }
                record.advance(now, policy);
                Self::judge(record, now, policy)
            }
            Entry::Vacant(entry) => {
                let mut record = CounterRecord::opened_at(now);
                let hit = Self::judge(&mut record, now, policy);
                entry.insert(record);
                hit
            }
        }
    }

    fn judge(record: &mut CounterRecord, now: u64, policy: &Policy) -> Hit {
        if record.count <= policy.max_requests {
            return Hit::Allowed(*record);
        }
        match policy.block_duration_ms {
            Some(duration) => {
                record.block_until(now.saturating_add(duration));
                Hit::Escalated(*record)
            }
            None => Hit::Denied(*record),
        }
    }

    /// Block a key for `duration_ms` from `now`.
    ///
    /// A missing record is created already over the policy's ceiling.
    pub fn set_block(
        &self,
        operation: &str,
        identifier: &str,
        now: u64,
        duration_ms: u64,
        policy: &Policy,
    ) -> CounterRecord {
        let until = now.saturating_add(duration_ms);
        let mut record = self
            .records
            .entry(CounterKey::new(operation, identifier))
            .or_insert_with(|| CounterRecord {
                count: policy.max_requests.saturating_add(1),
                window_start: now,
                blocked_until: None,
            });
        record.block_until(until);
        *record
    }

    /// Delete one record. Returns whether it existed.
    pub fn clear(&self, operation: &str, identifier: &str) -> bool {
        self.records
            .remove(&CounterKey::new(operation, identifier))
            .is_some()
    }

    /// Delete every record for `identifier`, across operations.
    pub fn clear_identifier(&self, identifier: &str) -> usize {
        let mut removed = 0;
        self.records.retain(|key, _| {
            let keep = key.identifier != identifier;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Evict records whose window has elapsed and which are not blocked.
    ///
    /// `window_for` resolves the window length of an operation; records of
    /// operations it cannot resolve are kept only while blocked. Eligibility
    /// is evaluated under the shard write lock, so a concurrent decision
    /// never sees a record vanish between its check and its update.
    pub fn sweep_expired<F>(&self, now: u64, window_for: F) -> usize
    where
        F: Fn(&str) -> Option<u64>,
    {
        let mut evicted = 0;
        self.records.retain(|key, record| {
            let stale = match window_for(&key.operation) {
                Some(window_ms) => record.is_stale(now, window_ms),
                None => !record.is_blocked_at(now),
            };
            if stale {
                evicted += 1;
            }
            !stale
        });
        evicted
    }

    /// Copy out every record.
    pub fn snapshot(&self) -> Vec<(CounterKey, CounterRecord)> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Replace the contents of the store.
    ///
    /// Incoming records overwrite their keys before anything else is
    /// dropped, so a key present in `records` is never observed missing.
    pub fn restore(&self, records: Vec<(CounterKey, CounterRecord)>) {
        let keep: HashSet<CounterKey> = records.iter().map(|(key, _)| key.clone()).collect();
        for (key, record) in records {
            self.records.insert(key, record);
        }
        self.records.retain(|key, _| keep.contains(key));
    }

    /// Distinct operations that currently have at least one record.
    pub fn operations(&self) -> HashSet<String> {
        self.records
            .iter()
            .map(|entry| entry.key().operation.clone())
            .collect()
    }

    /// Aggregate counts, optionally restricted to one identifier.
    pub fn stats(&self, now: u64, identifier: Option<&str>) -> LimiterStats {
        let mut operations = HashSet::new();
        let mut identifiers = HashSet::new();
        let mut blocked = 0;

        for entry in self.records.iter() {
            let key = entry.key();
            if identifier.is_some_and(|id| id != key.identifier) {
                continue;
            }
            operations.insert(key.operation.clone());
            identifiers.insert(key.identifier.clone());
            if entry.value().is_blocked_at(now) {
                blocked += 1;
            }
        }

        LimiterStats {
            tracked_operations: operations.len(),
            tracked_identifiers: identifiers.len(),
            blocked,
        }
    }

    /// Get the number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_upsert_creates_then_increments() {
        let store = CounterStore::new();
        let policy = Policy::new(5, 1000);

        let first = store.upsert_increment("OP", "a", 10, &policy);
        assert_eq!(first, CounterRecord::opened_at(10));

        let second = store.upsert_increment("OP", "a", 20, &policy);
        assert_eq!(second.count, 2);
        assert_eq!(second.window_start, 10);
        assert_eq!(store.get("OP", "a"), Some(second));
    }

    #[test]
    fn test_record_hit_escalates_once() {
        let store = CounterStore::new();
        let policy = Policy::new(1, 1000).with_block(5000);

        assert!(matches!(store.record_hit("OP", "a", 0, &policy), Hit::Allowed(_)));
        match store.record_hit("OP", "a", 1, &policy) {
            Hit::Escalated(record) => {
                assert_eq!(record.count, 2);
                assert_eq!(record.blocked_until, Some(5001));
            }
            other => panic!("expected escalation, got {:?}", other),
        }
        match store.record_hit("OP", "a", 2, &policy) {
            Hit::Blocked(record) => assert_eq!(record.count, 2),
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn test_set_block_on_missing_record() {
        let store = CounterStore::new();
        let policy = Policy::new(3, 1000);

        let record = store.set_block("OP", "a", 100, 500, &policy);
        assert_eq!(record.count, 4);
        assert_eq!(record.window_start, 100);
        assert_eq!(record.blocked_until, Some(600));
    }

    #[test]
    fn test_clear_identifier_spans_operations() {
        let store = CounterStore::new();
        let policy = Policy::new(5, 1000);
        store.upsert_increment("A", "x", 0, &policy);
        store.upsert_increment("B", "x", 0, &policy);
        store.upsert_increment("A", "y", 0, &policy);

        assert_eq!(store.clear_identifier("x"), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("A", "y").is_some());
        assert!(!store.clear("A", "x"));
    }

    #[test]
    fn test_sweep_keeps_blocked_and_unknown_blocked() {
        let store = CounterStore::new();
        let policy = Policy::new(5, 1000);
        store.upsert_increment("KNOWN", "stale", 0, &policy);
        store.upsert_increment("KNOWN", "fresh", 900, &policy);
        store.set_block("KNOWN", "blocked", 0, 10_000, &policy);
        store.set_block("ORPHAN", "blocked", 0, 10_000, &policy);
        store.upsert_increment("ORPHAN", "idle", 0, &policy);

        let window_for = |op: &str| (op == "KNOWN").then_some(1000);
        let evicted = store.sweep_expired(1500, window_for);

        assert_eq!(evicted, 2);
        assert!(store.get("KNOWN", "stale").is_none());
        assert!(store.get("ORPHAN", "idle").is_none());
        assert!(store.get("KNOWN", "fresh").is_some());
        assert!(store.get("KNOWN", "blocked").is_some());
        assert!(store.get("ORPHAN", "blocked").is_some());
    }

    #[test]
    fn test_stats() {
        let store = CounterStore::new();
        let policy = Policy::new(5, 1000);
        store.upsert_increment("A", "x", 0, &policy);
        store.upsert_increment("B", "x", 0, &policy);
        store.upsert_increment("A", "y", 0, &policy);
        store.set_block("C", "y", 0, 100, &policy);

        let all = store.stats(50, None);
        assert_eq!(
            all,
            LimiterStats {
                tracked_operations: 3,
                tracked_identifiers: 2,
                blocked: 1,
            }
        );

        let y = store.stats(50, Some("y"));
        assert_eq!(y.tracked_operations, 2);
        assert_eq!(y.tracked_identifiers, 1);
        assert_eq!(y.blocked, 1);

        assert_eq!(store.stats(200, Some("y")).blocked, 0);
        assert_eq!(store.stats(0, Some("nobody")), LimiterStats::default());
    }

    #[test]
    fn test_restore_replaces_contents() {
        let store = CounterStore::new();
        let policy = Policy::new(5, 1000);
        store.upsert_increment("A", "gone", 0, &policy);
        store.upsert_increment("A", "kept", 0, &policy);

        let blocked = CounterRecord {
            count: 9,
            window_start: 50,
            blocked_until: Some(900),
        };
        store.restore(vec![
            (CounterKey::new("A", "kept"), blocked),
            (CounterKey::new("B", "new"), CounterRecord::opened_at(60)),
        ]);

        assert_eq!(store.len(), 2);
        assert!(store.get("A", "gone").is_none());
        assert_eq!(store.get("A", "kept"), Some(blocked));
        assert_eq!(store.operations().len(), 2);
    }

    #[test]
    fn test_restore_never_exposes_a_missing_key() {
        let store = Arc::new(CounterStore::new());
        let blocked = CounterRecord {
            count: 2,
            window_start: 0,
            blocked_until: Some(10_000_000),
        };
        let records: Vec<_> = (0..500)
            .map(|i| (CounterKey::new("OP", &format!("id-{}", i)), blocked))
            .collect();
        store.restore(records.clone());

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let store = store.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut missing = 0;
                while !done.load(Ordering::Relaxed) {
                    for i in 0..500 {
                        if store.get("OP", &format!("id-{}", i)).is_none() {
                            missing += 1;
                        }
                    }
                }
                missing
            })
        };

        for _ in 0..100 {
            store.restore(records.clone());
        }
        done.store(true, Ordering::Relaxed);

        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(CounterStore::new());
        let policy = Policy::new(1_000_000, 60_000);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        store.upsert_increment("OP", "shared", 0, &policy);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get("OP", "shared").unwrap().count, 8000);
    }
}
