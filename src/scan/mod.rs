//! Generic N-way merge scan over sorted key sources.
//!
//! The merge is written once against the [`KeyCursor`] trait and serves every
//! backing-store kind: the live write buffer, frozen flush snapshots, and
//! (externally) on-disk stores. Sources only have to present their entries in
//! store-key order.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::column::MatcherSet;
use crate::store_key::StoreKey;

/// Cursor over one sorted key source.
///
/// `current` returns the entry the cursor is positioned at, or `None` once
/// the source is exhausted or closed. `advance` moves to the next entry and
/// reports whether one exists.
pub trait KeyCursor {
    fn current(&self) -> Option<(&StoreKey, &Bytes)>;
    fn advance(&mut self) -> bool;
    fn close(&mut self);
}

/// Cursor over materialized, sorted `(key, value)` entries.
///
/// Backs scans over in-memory maps, and stands in for on-disk sources in
/// tests.
#[derive(Debug)]
pub struct VecCursor {
    entries: Vec<(StoreKey, Bytes)>,
    index: usize,
    closed: bool,
}

impl VecCursor {
    pub fn new(mut entries: Vec<(StoreKey, Bytes)>) -> Self {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            entries,
            index: 0,
            closed: false,
        }
    }

    /// Position the cursor at the first entry >= `target`.
    pub fn seek(&mut self, target: &StoreKey) {
        self.index = match self.entries.binary_search_by(|(k, _)| k.cmp(target)) {
            Ok(i) | Err(i) => i,
        };
    }
}

impl KeyCursor for VecCursor {
    fn current(&self) -> Option<(&StoreKey, &Bytes)> {
        if self.closed {
            return None;
        }
        self.entries.get(self.index).map(|(k, v)| (k, v))
    }

    fn advance(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.index += 1;
        self.index < self.entries.len()
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// One merged row: the chosen row and timestamp, plus the values collected
/// per matching column.
pub type ScanEntry = (StoreKey, BTreeMap<Bytes, Bytes>);

/// N-way merge over sorted sources with a column predicate and a timestamp
/// ceiling.
///
/// Each call to [`next`](MergeScanner::next) surfaces one logical row: the
/// smallest visible row across all cursors, tie-broken toward the largest
/// timestamp at or below the ceiling. Without wildcard or multiple matchers
/// only the single chosen timestamp is consumed per row; otherwise all
/// distinct matching columns are merged into the row, newest version winning
/// per column.
pub struct MergeScanner<C> {
    cursors: Vec<C>,
    matchers: MatcherSet,
    timestamp: i64,
    closed: bool,
}

impl<C: KeyCursor> MergeScanner<C> {
    /// Cursors must already be positioned at or after the scan's start row;
    /// construction advances each past non-matching columns and entries above
    /// the timestamp ceiling.
    pub fn new(timestamp: i64, matchers: MatcherSet, cursors: Vec<C>) -> Self {
        let mut scanner = Self {
            cursors,
            matchers,
            timestamp,
            closed: false,
        };
        let matchers = &scanner.matchers;
        for cursor in scanner.cursors.iter_mut() {
            skip_invisible(cursor, matchers, timestamp);
        }
        scanner
    }

    pub fn next(&mut self) -> Option<ScanEntry> {
        if self.closed {
            return None;
        }

        let matchers = &self.matchers;
        let ceiling = self.timestamp;
        let single_version = !matchers.is_wildcard() && !matchers.has_multiple_matchers();

        loop {
            // Choose the next row: smallest visible row, tie broken toward
            // the largest timestamp at or below the ceiling.
            let mut chosen: Option<(Bytes, i64)> = None;
            for cursor in &self.cursors {
                let Some((key, _)) = cursor.current() else {
                    continue;
                };
                if key.timestamp > ceiling || !matchers.matches(&key.column) {
                    continue;
                }
                let better = match &chosen {
                    None => true,
                    Some((row, ts)) => {
                        key.row < *row || (key.row == *row && key.timestamp > *ts)
                    }
                };
                if better {
                    chosen = Some((key.row.clone(), key.timestamp));
                }
            }
            let (chosen_row, chosen_ts) = chosen?;

            // Consume every cursor sitting on the chosen row. The newest
            // version of a column across sources arrives first, so the first
            // writer wins per column.
            let mut columns = BTreeMap::new();
            for cursor in self.cursors.iter_mut() {
                loop {
                    let Some((key, value)) = cursor.current() else {
                        break;
                    };
                    if key.row != chosen_row {
                        break;
                    }
                    // An exact, single-matcher scan surfaces only the chosen
                    // timestamp; this cursor's other versions belong to a
                    // later logical row.
                    if single_version && key.timestamp != chosen_ts {
                        break;
                    }
                    if matchers.matches(&key.column) && !columns.contains_key(&key.column) {
                        columns.insert(key.column.clone(), value.clone());
                    }
                    if !cursor.advance() {
                        cursor.close();
                        break;
                    }
                }
            }

            // Resynchronize all cursors past the chosen row so every cursor
            // sits on a visible entry for the next call.
            for cursor in self.cursors.iter_mut() {
                loop {
                    let Some((key, _)) = cursor.current() else {
                        break;
                    };
                    let behind = key.row <= chosen_row
                        || key.timestamp > ceiling
                        || !matchers.matches(&key.column);
                    if !behind {
                        break;
                    }
                    if !cursor.advance() {
                        cursor.close();
                        break;
                    }
                }
            }

            if !columns.is_empty() {
                return Some((
                    StoreKey::new(chosen_row, Bytes::new(), chosen_ts),
                    columns,
                ));
            }
            // A chosen row that yielded no columns is skipped, not a scan
            // terminator.
        }
    }

    /// Idempotent; closes every cursor.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for cursor in self.cursors.iter_mut() {
            cursor.close();
        }
        self.closed = true;
    }
}

fn skip_invisible<C: KeyCursor>(cursor: &mut C, matchers: &MatcherSet, ceiling: i64) {
    loop {
        let Some((key, _)) = cursor.current() else {
            return;
        };
        if key.timestamp <= ceiling && matchers.matches(&key.column) {
            return;
        }
        if !cursor.advance() {
            cursor.close();
            return;
        }
    }
}
