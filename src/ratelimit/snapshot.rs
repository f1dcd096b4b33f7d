//! Export and import of the counter store.
//!
//! The wire form is JSON grouped by operation, then identifier:
//!
//! ```json
//! {
//!   "version": 1,
//!   "exportedAt": 1704067200000,
//!   "operations": {
//!     "LOGIN": { "ip-1": { "count": 6, "windowStart": 1704067100000, "blockedUntil": 1704068900000 } }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use super::counter::{CounterKey, CounterRecord};
use crate::error::{BulwarkError, Result};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// One exported counter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecordState {
    pub count: u64,
    pub window_start: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<u64>,
}

impl From<CounterRecord> for RecordState {
    fn from(record: CounterRecord) -> Self {
        Self {
            count: record.count,
            window_start: record.window_start,
            blocked_until: record.blocked_until,
        }
    }
}

/// The full serialized state of a counter store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub exported_at: u64,
    #[serde(default)]
    pub operations: BTreeMap<String, BTreeMap<String, RecordState>>,
}

impl Snapshot {
    /// Group raw store records into a snapshot.
    pub fn from_records(records: Vec<(CounterKey, CounterRecord)>, exported_at: u64) -> Self {
        let mut operations: BTreeMap<String, BTreeMap<String, RecordState>> = BTreeMap::new();
        for (key, record) in records {
            operations
                .entry(key.operation)
                .or_default()
                .insert(key.identifier, record.into());
        }

        Self {
            version: SNAPSHOT_VERSION,
            exported_at,
            operations,
        }
    }

    /// Validate every entry and flatten back into store records.
    ///
    /// Nothing is returned unless every record is well formed.
    pub fn into_records(self) -> Result<Vec<(CounterKey, CounterRecord)>> {
        if self.version != SNAPSHOT_VERSION {
            return Err(BulwarkError::Snapshot(format!(
                "unsupported snapshot version {} (expected {})",
                self.version, SNAPSHOT_VERSION
            )));
        }

        let mut records = Vec::new();
        for (operation, identifiers) in self.operations {
            if operation.is_empty() {
                return Err(BulwarkError::Snapshot("empty operation name".to_string()));
            }
            for (identifier, state) in identifiers {
                if state.count == 0 {
                    return Err(BulwarkError::Snapshot(format!(
                        "record {}:{} has a zero count",
                        operation, identifier
                    )));
                }
                let key = CounterKey {
                    operation: operation.clone(),
                    identifier,
                };
                let record = CounterRecord {
                    count: state.count,
                    window_start: state.window_start,
                    blocked_until: state.blocked_until,
                };
                records.push((key, record));
            }
        }
        Ok(records)
    }

    /// Number of records in the snapshot.
    pub fn record_count(&self) -> usize {
        self.operations.values().map(|ids| ids.len()).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| BulwarkError::Snapshot(format!("malformed snapshot: {}", e)))
    }

    /// Write the snapshot, replacing the file only once it is fully written.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;

        info!(path = %path.display(), records = self.record_count(), "Snapshot written");
        Ok(())
    }

    pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }
}
