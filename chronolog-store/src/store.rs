//! Per-collection record store.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Store ("events.login", ttl)                  │
//! │                                              │
//! │  RwLock ── HashMap<uid, UserLog>             │
//! │              │                               │
//! │              ├── "alice" → [r, r, r*]        │
//! │              └── "bob"   → [r*, r*]          │
//! │                              * = not flushed │
//! │                                              │
//! │  flush(): scan + clear dirty bits (write lock)
//! │           write fragments (no lock held)     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! One lock guards the map and every log inside it. `insert`, `delete_user`,
//! `sweep_expired` and the scan phase of `flush` take it exclusively; all
//! queries share it. Queries return owned copies, never references into a log.
//!
//! A second mutex serializes disk mutations: `flush` holds it from scan to
//! last fragment write, `delete_user` holds it around the map removal and
//! directory removal. A uid deleted mid-flush therefore never gets its
//! directory recreated. Lock order is always persist, then users.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::{validate_key, StoreError};
use crate::record::{Record, UserLog};
use crate::snapshot::{LoadStats, SnapshotDir};

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records that were new at scan time
    pub records: usize,
    pub files_written: usize,
    pub files_failed: usize,
}

/// All records of one collection, keyed by uid.
pub struct Store {
    name: String,
    ttl: Duration,
    snapshots: Option<SnapshotDir>,
    users: RwLock<HashMap<String, UserLog>>,
    /// Held while fragments are written or a uid directory is removed
    persist: Mutex<()>,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl Store {
    /// Create an empty store without touching disk.
    pub fn new(
        name: impl Into<String>,
        ttl: Duration,
        snapshots: Option<SnapshotDir>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            ttl,
            snapshots,
            users: RwLock::new(HashMap::new()),
            persist: Mutex::new(()),
            clock,
            closed: AtomicBool::new(false),
        }
    }

    /// In-memory store on the system clock.
    pub fn ephemeral(name: impl Into<String>, ttl: Duration) -> Self {
        Self::new(name, ttl, None, Arc::new(SystemClock))
    }

    /// Create a store and load whatever the storage root holds for it.
    pub fn open(
        name: impl Into<String>,
        ttl: Duration,
        snapshots: Option<SnapshotDir>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let store = Self::new(name, ttl, snapshots, clock);
        store.load()?;
        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_persistent(&self) -> bool {
        self.snapshots.is_some()
    }

    pub fn user_count(&self) -> usize {
        self.read().len()
    }

    pub fn record_count(&self) -> usize {
        self.read().values().map(UserLog::len).sum()
    }

    /// Records inserted since the last flush.
    pub fn pending_count(&self) -> usize {
        self.read().values().map(UserLog::pending_count).sum()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, UserLog>> {
        self.users.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, UserLog>> {
        self.users.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist_guard(&self) -> MutexGuard<'_, ()> {
        self.persist.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite the record at `(uid, ts)`.
    pub fn insert(&self, uid: &str, ts: i64, data: impl Into<String>) -> Result<(), StoreError> {
        validate_key(uid)?;
        let mut users = self.write();
        users
            .entry(uid.to_string())
            .or_default()
            .insert_or_replace(ts, data.into(), true);
        Ok(())
    }

    /// Latest record of `uid` with `ts <= max_ts`.
    pub fn latest_for_user(&self, uid: &str, max_ts: i64) -> Option<Record> {
        let users = self.read();
        let log = users.get(uid)?;
        log.upper_bound_index(max_ts)
            .and_then(|i| log.get(i))
            .cloned()
    }

    /// Earliest record of `uid` with `ts >= min_ts`.
    pub fn earliest_for_user(&self, uid: &str, min_ts: i64) -> Option<Record> {
        let users = self.read();
        let log = users.get(uid)?;
        log.lower_bound_index(min_ts)
            .and_then(|i| log.get(i))
            .cloned()
    }

    /// Latest record at or before `max_ts` for every uid that has one.
    pub fn all_latest(&self, max_ts: i64) -> HashMap<String, Record> {
        let users = self.read();
        users
            .iter()
            .filter_map(|(uid, log)| {
                let i = log.upper_bound_index(max_ts)?;
                log.get(i).map(|r| (uid.clone(), r.clone()))
            })
            .collect()
    }

    /// Records of `uid` with `from <= ts <= to`, oldest first.
    pub fn range(&self, uid: &str, from: i64, to: i64) -> Vec<Record> {
        if from > to {
            log::debug!("{}: reversed range {from}..{to} for {uid}", self.name);
            return Vec::new();
        }
        self.read()
            .get(uid)
            .map(|log| log.range(from, to))
            .unwrap_or_default()
    }

    /// Drop a uid from memory and from disk. Absent uids are a no-op.
    ///
    /// Returns whether the uid was present in memory.
    pub fn delete_user(&self, uid: &str) -> bool {
        let _persist = self.persist_guard();
        let mut users = self.write();
        let removed = users.remove(uid).is_some();
        if let Some(dir) = &self.snapshots {
            if validate_key(uid).is_ok() {
                if let Err(e) = dir.remove_user(&self.name, uid) {
                    log::error!("{}: failed to remove files for {uid}: {e}", self.name);
                }
            }
        }
        removed
    }

    /// Drop every uid whose newest record is older than `now - ttl`.
    ///
    /// Returns the number of uids removed.
    pub fn sweep_expired(&self) -> usize {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now().saturating_sub(ttl);
        let mut users = self.write();
        let before = users.len();
        users.retain(|_, log| log.last().is_some_and(|r| r.ts >= cutoff));
        let removed = before - users.len();
        if removed > 0 {
            log::info!(
                "{}: expired {removed} users with no records since {cutoff}",
                self.name
            );
        }
        removed
    }

    /// Persist every record inserted since the previous flush.
    ///
    /// Dirty bits are cleared during the scan. A fragment that fails to
    /// write is logged and its records stay in memory only.
    pub fn flush(&self) -> FlushReport {
        let Some(dir) = &self.snapshots else {
            return FlushReport::default();
        };
        let _persist = self.persist_guard();
        let batches = self.take_pending();
        self.write_batches(dir, &batches)
    }

    /// Scan phase: collect and clear every uid's new records.
    fn take_pending(&self) -> Vec<(String, Vec<Record>)> {
        let mut users = self.write();
        users
            .iter_mut()
            .filter(|(_, log)| log.has_changed())
            .map(|(uid, log)| (uid.clone(), log.take_new()))
            .filter(|(_, batch)| !batch.is_empty())
            .collect()
    }

    /// Write phase: one fragment per uid, with the map lock released.
    fn write_batches(&self, dir: &SnapshotDir, batches: &[(String, Vec<Record>)]) -> FlushReport {
        let mut report = FlushReport {
            records: batches.iter().map(|(_, b)| b.len()).sum(),
            ..FlushReport::default()
        };
        if report.records == 0 {
            log::trace!("{}: nothing to flush", self.name);
            return report;
        }

        let flushed_at = self.clock.now();
        for (uid, batch) in batches {
            match dir.write_fragment(&self.name, uid, flushed_at, batch) {
                Ok(_) => report.files_written += 1,
                Err(e) => {
                    report.files_failed += 1;
                    log::error!(
                        "{}: failed to flush {} records for {uid}: {e}",
                        self.name,
                        batch.len()
                    );
                }
            }
        }

        log::info!(
            "{}: flushed {} records ({} files, {} failed)",
            self.name,
            report.records,
            report.files_written,
            report.files_failed
        );
        report
    }

    /// Replay this collection's fragments from disk.
    ///
    /// Loaded records are clean. Loading the same tree twice is idempotent.
    pub fn load(&self) -> Result<LoadStats, StoreError> {
        let Some(dir) = &self.snapshots else {
            return Ok(LoadStats::default());
        };

        let mut users = self.write();
        let stats = dir.load_collection(&self.name, |uid, records| {
            let log = users.entry(uid.to_string()).or_default();
            for record in records {
                log.insert_or_replace(record.ts, record.data, false);
            }
        })?;
        users.retain(|_, log| !log.is_empty());

        if stats.files > 0 || stats.files_skipped > 0 {
            log::info!("Loaded {} records from {}", stats.records, self.name);
        }
        Ok(stats)
    }

    /// Signal that no further background work should run. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("{}: closed", self.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("persistent", &self.snapshots.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}
