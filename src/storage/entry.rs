//! Versioned Store Entries
//!
//! A `DataStoreEntry` is the per-key record held by an owner or a replica.
//! Every mutation happens under the entry's own lock (see `table.rs`); the
//! methods here assume exclusive access.
//!
//! ## Versioning
//! Updates carry a version assigned by the writer. An update applies only when
//! it directly follows the current version (or the entry is fresh); newer
//! updates that arrive early wait in `pending_updates`, ordered by version,
//! and are drained as soon as the gap closes. Older or duplicate updates are
//! dropped.
//!
//! ## Lineages
//! An owner that starts a key from scratch (first write, or after a sweep
//! reclaimed its entry) begins a new lineage: the high bits of the version
//! carry a clock reading that only moves forward, the low `LINEAGE_SHIFT`
//! bits count updates within it. A SAVE from a newer lineage replaces
//! whatever a replica held, even across a gap.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::membership::types::MemberName;

/// Version of an entry that no update has touched yet.
pub const VERSION_SENTINEL: i64 = i64::MIN;

pub const LINEAGE_SHIFT: u32 = 20;

/// The lineage a version belongs to.
pub fn lineage_of(version: i64) -> i64 {
    version >> LINEAGE_SHIFT
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Either the live value or the raw bytes it was replicated as.
///
/// Replicas keep `Encoded` until somebody reads the entry; the first read
/// replaces it with `Decoded`.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryValue<V> {
    Decoded(V),
    Encoded(Bytes),
}

/// An update waiting for its predecessor.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingUpdate {
    Save {
        value: Bytes,
        last_accessed: u64,
        max_idle_ms: u64,
    },
    Touch {
        last_accessed: u64,
        max_idle_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied, followed by `drained` updates released from the pending set.
    Applied { drained: usize },
    /// Buffered until the missing versions arrive.
    Queued,
    /// Older than (or equal to) the current version; dropped.
    Stale,
}

#[derive(Debug)]
pub struct DataStoreEntry<V> {
    value: Option<EntryValue<V>>,
    version: i64,
    last_accessed: u64,
    max_idle_ms: u64,
    removed: bool,
    evicted: bool,
    replica_instance_name: Option<MemberName>,
    pending_updates: BTreeMap<i64, PendingUpdate>,
}

impl<V> Default for DataStoreEntry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> DataStoreEntry<V> {
    pub fn new() -> Self {
        Self {
            value: None,
            version: VERSION_SENTINEL,
            last_accessed: now_ms(),
            max_idle_ms: 0,
            removed: false,
            evicted: false,
            replica_instance_name: None,
            pending_updates: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn last_accessed(&self) -> u64 {
        self.last_accessed
    }

    pub fn max_idle_ms(&self) -> u64 {
        self.max_idle_ms
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_encoded(&self) -> bool {
        matches!(self.value, Some(EntryValue::Encoded(_)))
    }

    pub fn pending_count(&self) -> usize {
        self.pending_updates.len()
    }

    pub fn pending_versions(&self) -> Vec<i64> {
        self.pending_updates.keys().copied().collect()
    }

    pub fn replica_instance_name(&self) -> Option<&MemberName> {
        self.replica_instance_name.as_ref()
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted
    }

    pub(crate) fn mark_evicted(&mut self) {
        self.evicted = true;
    }

    /// The version following the current one. `None` for a fresh entry,
    /// whose first version opens a new lineage.
    pub fn successor(&self) -> Option<i64> {
        if self.version == VERSION_SENTINEL {
            None
        } else {
            Some(self.version.saturating_add(1))
        }
    }

    pub fn record_access(&mut self, now: u64) {
        self.last_accessed = now;
    }

    /// `now - last_accessed > idle_for_ms`.
    pub fn is_idle(&self, now: u64, idle_for_ms: u64) -> bool {
        now.saturating_sub(self.last_accessed) > idle_for_ms
    }

    /// `last_accessed + max_idle < now`, judged by the entry's own idle time.
    pub fn is_expired(&self, now: u64) -> bool {
        self.last_accessed.saturating_add(self.max_idle_ms) < now
    }

    /// Owner-side write of a fresh value.
    pub fn set_value(&mut self, value: V, version: i64, now: u64, max_idle_ms: u64) {
        self.value = Some(EntryValue::Decoded(value));
        self.version = version;
        self.last_accessed = now;
        self.max_idle_ms = max_idle_ms;
        self.removed = false;
        self.replica_instance_name = None;
        self.pending_updates.clear();
    }

    /// Owner-side liveness refresh.
    pub fn touch_local(&mut self, version: i64, last_accessed: u64, max_idle_ms: u64) {
        self.version = version;
        self.last_accessed = last_accessed;
        self.max_idle_ms = max_idle_ms;
    }

    /// Turns the entry into a tombstone at `version` (or the current version if
    /// that is newer). Value and pending updates are discarded.
    pub fn mark_removed(&mut self, version: i64, now: u64) {
        self.value = None;
        self.pending_updates.clear();
        self.removed = true;
        self.version = self.version.max(version);
        self.last_accessed = now;
    }

    /// Installs a value fetched from another member during failover. A newer
    /// local version wins, tombstones included.
    pub fn adopt(&mut self, value: V, version: i64, source: MemberName, now: u64, max_idle_ms: u64) -> bool {
        if self.version != VERSION_SENTINEL && self.version >= version {
            return false;
        }
        self.value = Some(EntryValue::Decoded(value));
        self.version = version;
        self.last_accessed = now;
        self.max_idle_ms = max_idle_ms;
        self.removed = false;
        self.replica_instance_name = Some(source);
        self.pending_updates.retain(|pending, _| *pending > version);
        true
    }

    /// Applies a replicated update, buffering it if its predecessor is missing.
    ///
    /// When more than `max_pending` updates are buffered, the lowest one is
    /// applied across the gap so a lost message cannot wedge the entry.
    pub fn apply_update(
        &mut self,
        version: i64,
        update: PendingUpdate,
        source: &MemberName,
        max_pending: usize,
    ) -> ApplyOutcome {
        let fresh = self.version == VERSION_SENTINEL;
        if !fresh && version <= self.version {
            return ApplyOutcome::Stale;
        }

        self.replica_instance_name = Some(source.clone());

        let rebase = matches!(update, PendingUpdate::Save { .. })
            && lineage_of(version) > lineage_of(self.version);
        if fresh || rebase || version == self.version + 1 {
            if rebase && !fresh {
                tracing::debug!(
                    "New lineage at version {} replaces version {}",
                    version,
                    self.version
                );
                self.pending_updates.retain(|pending, _| *pending > version);
            }
            self.apply(version, update);
            let drained = self.drain_pending();
            return ApplyOutcome::Applied { drained };
        }

        self.pending_updates.entry(version).or_insert(update);
        if self.pending_updates.len() > max_pending {
            if let Some((lowest, update)) = self.pending_updates.pop_first() {
                tracing::warn!(
                    "Pending updates overflowed at version {}, skipping gap to {}",
                    self.version,
                    lowest
                );
                self.apply(lowest, update);
                let drained = self.drain_pending();
                return ApplyOutcome::Applied { drained };
            }
        }

        ApplyOutcome::Queued
    }

    fn apply(&mut self, version: i64, update: PendingUpdate) {
        match update {
            PendingUpdate::Save {
                value,
                last_accessed,
                max_idle_ms,
            } => {
                self.value = Some(EntryValue::Encoded(value));
                self.last_accessed = last_accessed;
                self.max_idle_ms = max_idle_ms;
                self.removed = false;
            }
            PendingUpdate::Touch {
                last_accessed,
                max_idle_ms,
            } => {
                self.last_accessed = last_accessed;
                self.max_idle_ms = max_idle_ms;
            }
        }
        self.version = version;
    }

    fn drain_pending(&mut self) -> usize {
        let mut drained = 0;
        while let Some((&next, _)) = self.pending_updates.first_key_value() {
            if next <= self.version {
                self.pending_updates.pop_first();
                continue;
            }
            if next != self.version + 1 {
                break;
            }
            if let Some((version, update)) = self.pending_updates.pop_first() {
                self.apply(version, update);
                drained += 1;
            }
        }
        drained
    }
}

impl<V: Clone> DataStoreEntry<V> {
    /// Returns the value, deserializing and caching it on first read.
    pub fn read_value<E>(
        &mut self,
        decode: impl FnOnce(&[u8]) -> Result<V, E>,
    ) -> Result<Option<V>, E> {
        let bytes = match &self.value {
            None => return Ok(None),
            Some(EntryValue::Decoded(value)) => return Ok(Some(value.clone())),
            Some(EntryValue::Encoded(bytes)) => bytes.clone(),
        };
        let value = decode(&bytes)?;
        self.value = Some(EntryValue::Decoded(value.clone()));
        Ok(Some(value))
    }

    /// Returns the value as raw bytes, serializing a decoded value on demand.
    pub fn encoded_value<E>(
        &self,
        encode: impl FnOnce(&V) -> Result<Vec<u8>, E>,
    ) -> Result<Option<Bytes>, E> {
        match &self.value {
            None => Ok(None),
            Some(EntryValue::Encoded(bytes)) => Ok(Some(bytes.clone())),
            Some(EntryValue::Decoded(value)) => encode(value).map(|bytes| Some(Bytes::from(bytes))),
        }
    }
}
