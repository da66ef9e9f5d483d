//! In-memory write buffer with a snapshot-for-flush lifecycle.
//!
//! `MemStore` holds the region's in-memory modifications: an *active* sorted
//! map taking new writes, plus frozen maps awaiting persistence. Freezing is
//! copy-on-flush: `snapshot` moves the active map into history and hands it
//! to the flusher, `delete_snapshot` drops it once the data is durable
//! elsewhere. At most one snapshot may be in flight.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::column::ColumnSpecError;
use crate::store_key::StoreKey;
use crate::wal::CommitLog;

mod iter;

pub use iter::MemStoreScanner;

/// Sorted cell map shared by the active buffer and frozen snapshots.
pub type KeyMap = BTreeMap<StoreKey, Bytes>;

#[derive(Debug, thiserror::Error)]
pub enum MemStoreError {
    /// The single-flight snapshot protocol was violated: a snapshot is
    /// already awaiting `delete_snapshot`.
    #[error("snapshot already in progress")]
    SnapshotInProgress,

    #[error("no snapshot in progress")]
    NoSnapshotInProgress,

    #[error(transparent)]
    ColumnSpec(#[from] ColumnSpecError),
}

/// Result of freezing the active map for a flush.
///
/// `data` is `None` when the active map was empty and there is nothing to
/// flush; no snapshot is left in flight in that case.
#[derive(Debug, Clone)]
pub struct FlushSnapshot {
    pub data: Option<Arc<KeyMap>>,
    pub sequence_id: u64,
}

#[derive(Debug, Default)]
pub(crate) struct MemStoreInner {
    pub(crate) active: KeyMap,
    /// Frozen maps, oldest first. Read paths walk these newest-first so live
    /// data shadows frozen data.
    pub(crate) history: Vec<Arc<KeyMap>>,
    /// The history entry currently being flushed, if any.
    flushing: Option<Arc<KeyMap>>,
}

/// Structural changes (insert, freeze, unfreeze) take the write lock; reads
/// and scanner construction take the read lock. A scanner keeps the read
/// lock for its whole lifetime, so open scanners block `snapshot` until
/// closed — callers must bound scanner lifetimes.
#[derive(Debug, Default)]
pub struct MemStore {
    pub(crate) inner: Arc<RwLock<MemStoreInner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one cell per column for `row` at `timestamp`.
    pub fn add(
        &self,
        row: impl Into<Bytes>,
        columns: impl IntoIterator<Item = (Bytes, Bytes)>,
        timestamp: i64,
    ) {
        let row = row.into();
        let mut inner = self.inner.write();
        for (column, value) in columns {
            inner
                .active
                .insert(StoreKey::new(row.clone(), column, timestamp), value);
        }
    }

    /// Up to `max_versions` values for `key`'s row and column with timestamps
    /// at or below `key.timestamp`, newest first. `max_versions == 0` means
    /// unbounded. An empty result is not an error.
    pub fn get(&self, key: &StoreKey, max_versions: usize) -> Vec<Bytes> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        collect_versions(&inner.active, key, max_versions, &mut out);
        for frozen in inner.history.iter().rev() {
            if max_versions > 0 && out.len() >= max_versions {
                break;
            }
            collect_versions(frozen, key, max_versions, &mut out);
        }
        out
    }

    /// The newest value at or below `key.timestamp` for every column of
    /// `key`'s row, across the active map and all history maps.
    pub fn get_full(&self, key: &StoreKey) -> BTreeMap<Bytes, Bytes> {
        let inner = self.inner.read();
        let mut results = BTreeMap::new();
        collect_full_row(&inner.active, key, &mut results);
        for frozen in inner.history.iter().rev() {
            collect_full_row(frozen, key, &mut results);
        }
        results
    }

    /// Freeze the active map for persistence and obtain a durability
    /// sequence number from the log collaborator.
    ///
    /// Fails with [`MemStoreError::SnapshotInProgress`] if a previous
    /// snapshot has not been deleted yet. An empty active map yields a no-op
    /// result instead of freezing anything.
    pub fn snapshot(&self, log: &dyn CommitLog) -> Result<FlushSnapshot, MemStoreError> {
        let mut inner = self.inner.write();
        if inner.flushing.is_some() {
            return Err(MemStoreError::SnapshotInProgress);
        }
        if inner.active.is_empty() {
            debug!("memstore empty, skipping snapshot");
            return Ok(FlushSnapshot {
                data: None,
                sequence_id: 0,
            });
        }

        debug!(entries = inner.active.len(), "starting memstore snapshot");
        let frozen = Arc::new(std::mem::take(&mut inner.active));
        inner.history.push(frozen.clone());
        inner.flushing = Some(frozen.clone());
        let sequence_id = log.start_cache_flush();
        debug!(sequence_id, "memstore snapshot complete");

        Ok(FlushSnapshot {
            data: Some(frozen),
            sequence_id,
        })
    }

    /// Drop the in-flight snapshot from history once its data is durable.
    pub fn delete_snapshot(&self) -> Result<(), MemStoreError> {
        let mut inner = self.inner.write();
        let Some(flushing) = inner.flushing.take() else {
            return Err(MemStoreError::NoSnapshotInProgress);
        };
        inner.history.retain(|frozen| !Arc::ptr_eq(frozen, &flushing));
        debug!("memstore snapshot deleted");
        Ok(())
    }
}

fn collect_versions(map: &KeyMap, key: &StoreKey, cap: usize, out: &mut Vec<Bytes>) {
    // Entries with timestamps above the ceiling sort before `key` and are
    // excluded by the range; within the range, versions arrive newest first.
    for (found, value) in map.range(key.clone()..) {
        if !found.same_row_and_column(key) {
            break;
        }
        out.push(value.clone());
        if cap > 0 && out.len() >= cap {
            break;
        }
    }
}

fn collect_full_row(map: &KeyMap, key: &StoreKey, results: &mut BTreeMap<Bytes, Bytes>) {
    for (found, value) in map.range(StoreKey::row_start(key.row.clone())..) {
        if found.row > key.row {
            // Sources are sorted; nothing past the target row can match.
            break;
        }
        if key.matches_without_column(found) && !results.contains_key(&found.column) {
            results.insert(found.column.clone(), value.clone());
        }
    }
}
