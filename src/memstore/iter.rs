//! Scanner construction over the write buffer.

use bytes::Bytes;
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::RawRwLock;

use crate::column::MatcherSet;
use crate::scan::{MergeScanner, ScanEntry, VecCursor};
use crate::store_key::StoreKey;

use super::{KeyMap, MemStore, MemStoreError, MemStoreInner};

/// Merge scan over the active map and all frozen history maps.
///
/// Holds the buffer's shared lock from construction until `close` (or drop),
/// so snapshot and delete-snapshot block while the scanner is open.
pub struct MemStoreScanner {
    scanner: MergeScanner<VecCursor>,
    guard: Option<ArcRwLockReadGuard<RawRwLock, MemStoreInner>>,
}

impl MemStore {
    /// Scanner over `[active] + [history, newest first]`, seeded at
    /// `start_row`, returning columns matching `columns` with timestamps at
    /// or below `timestamp`.
    pub fn scanner<S: AsRef<[u8]>>(
        &self,
        timestamp: i64,
        columns: &[S],
        start_row: impl Into<Bytes>,
    ) -> Result<MemStoreScanner, MemStoreError> {
        let matchers = MatcherSet::compile(columns)?;
        let start = StoreKey::row_start(start_row);

        let guard = self.inner.read_arc();
        let mut cursors = Vec::with_capacity(guard.history.len() + 1);
        cursors.push(materialize(&guard.active, &start));
        for frozen in guard.history.iter().rev() {
            cursors.push(materialize(frozen, &start));
        }

        Ok(MemStoreScanner {
            scanner: MergeScanner::new(timestamp, matchers, cursors),
            guard: Some(guard),
        })
    }
}

impl MemStoreScanner {
    pub fn next(&mut self) -> Option<ScanEntry> {
        self.scanner.next()
    }

    /// Idempotent; releases the buffer's shared lock.
    pub fn close(&mut self) {
        self.scanner.close();
        self.guard = None;
    }
}

fn materialize(map: &KeyMap, start: &StoreKey) -> VecCursor {
    let entries = map
        .range(start.clone()..)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    VecCursor::new(entries)
}
