//! Records and the per-user chronological log.
//!
//! ```text
//! UserLog (one per uid)
//! ┌────────┬────────┬────────┬────────┐
//! │ ts=3   │ ts=7   │ ts=9   │ ts=15  │   strictly ascending, unique ts
//! │ new=no │ new=no │ new=yes│ new=yes│   new = not yet in a snapshot
//! └────────┴────────┴────────┴────────┘
//!                     has_changed = true
//! ```
//!
//! All lookups are binary searches over `ts`, so range and latest-at-ts
//! queries are O(log n) per user.

use serde::{Deserialize, Serialize};

/// A single timestamped payload.
///
/// This is also the on-disk and on-wire shape: `{"ts":N,"data":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Seconds since the unix epoch
    pub ts: i64,
    /// Opaque payload
    pub data: String,
}

impl Record {
    pub fn new(ts: i64, data: impl Into<String>) -> Self {
        Self {
            ts,
            data: data.into(),
        }
    }
}

/// A record plus its runtime-only dirty flag.
#[derive(Debug, Clone)]
struct Entry {
    record: Record,
    is_new: bool,
}

/// Chronologically ordered records for one uid.
#[derive(Debug, Clone, Default)]
pub struct UserLog {
    entries: Vec<Entry>,
    has_changed: bool,
}

impl UserLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True while at least one record has not been written to a snapshot.
    pub fn has_changed(&self) -> bool {
        self.has_changed
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.entries.get(index).map(|e| &e.record)
    }

    pub fn first(&self) -> Option<&Record> {
        self.entries.first().map(|e| &e.record)
    }

    pub fn last(&self) -> Option<&Record> {
        self.entries.last().map(|e| &e.record)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.entries.iter().map(|e| &e.record)
    }

    /// Number of records still waiting for a snapshot.
    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_new).count()
    }

    /// Smallest index with `ts >= min_ts`.
    pub fn lower_bound_index(&self, min_ts: i64) -> Option<usize> {
        let i = self.entries.partition_point(|e| e.record.ts < min_ts);
        (i < self.entries.len()).then_some(i)
    }

    /// Largest index with `ts <= max_ts`.
    pub fn upper_bound_index(&self, max_ts: i64) -> Option<usize> {
        let i = self.entries.partition_point(|e| e.record.ts <= max_ts);
        i.checked_sub(1)
    }

    /// Insert a record at its sorted position, or overwrite the payload of
    /// the record already stored at `ts`.
    ///
    /// An overwrite keeps the existing dirty flag, so replaying data that is
    /// already on disk never marks it dirty again.
    pub fn insert_or_replace(&mut self, ts: i64, data: String, mark_new: bool) {
        match self.entries.binary_search_by_key(&ts, |e| e.record.ts) {
            Ok(i) => {
                self.entries[i].record.data = data;
            }
            Err(i) => {
                self.entries.insert(
                    i,
                    Entry {
                        record: Record { ts, data },
                        is_new: mark_new,
                    },
                );
                if mark_new {
                    self.has_changed = true;
                }
            }
        }
    }

    /// Copy of the records with `from <= ts <= to`, in order.
    pub fn range(&self, from: i64, to: i64) -> Vec<Record> {
        if from > to {
            return Vec::new();
        }
        match (self.lower_bound_index(from), self.upper_bound_index(to)) {
            (Some(start), Some(end)) if start <= end => self.entries[start..=end]
                .iter()
                .map(|e| e.record.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Collect every new record and clear its flag in place.
    ///
    /// The log is clean afterwards; the caller owns persisting the batch.
    pub fn take_new(&mut self) -> Vec<Record> {
        if !self.has_changed {
            return Vec::new();
        }
        let mut batch = Vec::new();
        for entry in self.entries.iter_mut().filter(|e| e.is_new) {
            entry.is_new = false;
            batch.push(entry.record.clone());
        }
        self.has_changed = false;
        batch
    }
}
