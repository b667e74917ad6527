//! Entry Table
//!
//! The authoritative local map of key -> entry. The map itself is a `DashMap`;
//! each entry sits behind its own mutex so commands for different keys run in
//! parallel while all mutation of one entry is serialized.
//!
//! Sweeps take each candidate's lock before deciding to evict it. An evicted
//! entry is flagged, so a writer that fetched it just before eviction notices
//! and retries against a fresh entry instead of updating an orphan.
//!
//! The table also keeps the highest lineage it has issued or seen, so a key
//! restarted after eviction is always stamped above any copy still held by
//! a replica.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use super::entry::{ApplyOutcome, DataStoreEntry, LINEAGE_SHIFT, PendingUpdate, lineage_of, now_ms};
use super::error::StoreResult;
use crate::membership::types::MemberName;

type EntryCell<V> = Arc<Mutex<DataStoreEntry<V>>>;

/// Result of a purely local read.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalRead<V> {
    Found(V),
    /// A tombstone is present: the key was removed.
    Removed,
    /// Nothing usable locally.
    Missing,
}

/// Point-in-time copy of an entry's metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub version: i64,
    pub removed: bool,
    pub has_value: bool,
    pub encoded: bool,
    pub pending_updates: usize,
    pub last_accessed: u64,
    pub max_idle_ms: u64,
    pub replica_instance_name: Option<MemberName>,
}

pub struct EntryTable<K, V> {
    entries: DashMap<K, EntryCell<V>>,
    max_pending_updates: usize,
    lineage: AtomicI64,
}

impl<K, V> EntryTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn new(max_pending_updates: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_pending_updates,
            lineage: AtomicI64::new(0),
        }
    }

    /// Highest lineage issued or observed so far.
    pub fn lineage(&self) -> i64 {
        self.lineage.load(Ordering::Acquire)
    }

    fn observe(&self, version: i64) {
        self.lineage.fetch_max(lineage_of(version), Ordering::AcqRel);
    }

    /// First version of a new lineage: the current clock, or one past the
    /// last lineage if the clock has not moved past it.
    fn open_lineage(&self) -> i64 {
        let now = now_ms() as i64;
        let mut current = self.lineage.load(Ordering::Acquire);
        loop {
            let next = now.max(current.saturating_add(1));
            match self
                .lineage
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next << LINEAGE_SHIFT,
                Err(actual) => current = actual,
            }
        }
    }

    /// The version an owner-side write stamps on `entry`.
    fn stamp(&self, entry: &DataStoreEntry<V>) -> i64 {
        let version = entry.successor().unwrap_or_else(|| self.open_lineage());
        self.observe(version);
        version
    }

    /// Runs `f` on the entry for `key`, creating it if needed.
    pub fn with_entry<R>(&self, key: &K, f: impl FnOnce(&mut DataStoreEntry<V>) -> R) -> R {
        loop {
            let cell = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(DataStoreEntry::new())))
                .value()
                .clone();

            let mut entry = cell.lock();
            if entry.is_evicted() {
                continue;
            }
            return f(&mut entry);
        }
    }

    /// Runs `f` on the entry for `key` if one exists. Never creates.
    pub fn with_existing<R>(&self, key: &K, f: impl FnOnce(&mut DataStoreEntry<V>) -> R) -> Option<R> {
        let cell = self.entries.get(key)?.value().clone();
        let mut entry = cell.lock();
        if entry.is_evicted() {
            return None;
        }
        Some(f(&mut entry))
    }

    /// Owner-side put. Returns the version stamped on the value.
    pub fn save_local(&self, key: &K, value: V, now: u64, max_idle_ms: u64) -> i64 {
        self.with_entry(key, |entry| {
            let version = self.stamp(entry);
            entry.set_value(value, version, now, max_idle_ms);
            version
        })
    }

    /// Owner-side touch of a live entry. Returns the version stamped on the
    /// touch, or `None` if there is nothing to touch.
    pub fn touch_local(&self, key: &K, last_accessed: u64, max_idle_ms: u64) -> Option<i64> {
        self.with_existing(key, |entry| {
            if entry.is_removed() || !entry.has_value() {
                return None;
            }
            let version = self.stamp(entry);
            entry.touch_local(version, last_accessed, max_idle_ms);
            Some(version)
        })
        .flatten()
    }

    /// Owner-side remove. Returns the version stamped on the tombstone.
    pub fn remove_local(&self, key: &K, now: u64) -> i64 {
        self.with_entry(key, |entry| {
            let version = self.stamp(entry);
            entry.mark_removed(version, now);
            version
        })
    }

    /// Replica-side SAVE / TOUCH.
    pub fn apply_update(
        &self,
        key: &K,
        version: i64,
        update: PendingUpdate,
        source: &MemberName,
    ) -> ApplyOutcome {
        let max_pending = self.max_pending_updates;
        self.observe(version);
        self.with_entry(key, |entry| entry.apply_update(version, update, source, max_pending))
    }

    /// Replica-side REMOVE. Always applies.
    pub fn apply_remove(&self, key: &K, version: i64, now: u64) {
        self.observe(version);
        self.with_entry(key, |entry| entry.mark_removed(version, now));
    }

    /// Reads the local copy, refreshing its access time on a hit.
    pub fn read_local(&self, key: &K, now: u64) -> StoreResult<LocalRead<V>> {
        let read = self.with_existing(key, |entry| -> StoreResult<LocalRead<V>> {
            if entry.is_removed() {
                return Ok(LocalRead::Removed);
            }
            match entry.read_value(|bytes| bincode::deserialize::<V>(bytes))? {
                Some(value) => {
                    entry.record_access(now);
                    Ok(LocalRead::Found(value))
                }
                None => Ok(LocalRead::Missing),
            }
        });
        read.unwrap_or(Ok(LocalRead::Missing))
    }

    /// Reads the local copy without touching access metadata.
    pub fn peek(&self, key: &K) -> StoreResult<Option<V>> {
        let read = self.with_existing(key, |entry| -> StoreResult<Option<V>> {
            if entry.is_removed() {
                return Ok(None);
            }
            Ok(entry.read_value(|bytes| bincode::deserialize::<V>(bytes))?)
        });
        Ok(read.transpose()?.flatten())
    }

    /// Version and raw bytes for answering a load request.
    pub fn load_state(&self, key: &K) -> StoreResult<Option<(i64, Bytes)>> {
        let state = self.with_existing(key, |entry| -> StoreResult<Option<(i64, Bytes)>> {
            if entry.is_removed() {
                return Ok(None);
            }
            let version = entry.version();
            let bytes = entry.encoded_value(|value| bincode::serialize(value))?;
            Ok(bytes.map(|bytes| (version, bytes)))
        });
        Ok(state.transpose()?.flatten())
    }

    /// Installs a value loaded from `source`. Returns false if a newer local
    /// version was kept instead.
    pub fn adopt(&self, key: &K, value: V, version: i64, source: MemberName, now: u64, max_idle_ms: u64) -> bool {
        self.observe(version);
        self.with_entry(key, |entry| entry.adopt(value, version, source, now, max_idle_ms))
    }

    pub fn snapshot(&self, key: &K) -> Option<EntrySnapshot> {
        self.with_existing(key, |entry| EntrySnapshot {
            version: entry.version(),
            removed: entry.is_removed(),
            has_value: entry.has_value(),
            encoded: entry.is_encoded(),
            pending_updates: entry.pending_count(),
            last_accessed: entry.last_accessed(),
            max_idle_ms: entry.max_idle_ms(),
            replica_instance_name: entry.replica_instance_name().cloned(),
        })
    }

    /// Evicts entries unaccessed for more than `idle_for_ms`.
    pub fn remove_idle(&self, now: u64, idle_for_ms: u64) -> usize {
        self.sweep(|entry| entry.is_idle(now, idle_for_ms))
    }

    /// Evicts entries past their own max idle time.
    pub fn remove_expired(&self, now: u64) -> usize {
        self.sweep(|entry| entry.is_expired(now))
    }

    fn sweep(&self, is_stale: impl Fn(&DataStoreEntry<V>) -> bool) -> usize {
        let candidates: Vec<K> = self
            .entries
            .iter()
            .filter(|cell| is_stale(&cell.value().lock()))
            .map(|cell| cell.key().clone())
            .collect();

        let mut removed = 0;
        for key in candidates {
            let evicted = self.entries.remove_if(&key, |_, cell| {
                let mut entry = cell.lock();
                if is_stale(&entry) {
                    entry.mark_evicted();
                    true
                } else {
                    false
                }
            });
            if evicted.is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Entries holding a live value.
    pub fn live_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|cell| {
                let entry = cell.value().lock();
                !entry.is_removed() && entry.has_value()
            })
            .count()
    }

    /// All entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|cell| cell.key().clone()).collect()
    }

    pub fn clear(&self) {
        for cell in self.entries.iter() {
            cell.value().lock().mark_evicted();
        }
        self.entries.clear();
    }
}
