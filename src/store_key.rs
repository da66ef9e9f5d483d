//! Composite store key and its total ordering.

use std::cmp::Ordering;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Separator between the column family and the qualifier in a column name.
pub const FAMILY_SEPARATOR: u8 = b':';

/// Key for one versioned cell: `(row, family:qualifier, timestamp)`.
///
/// Ordering is `(row ASC, column ASC, timestamp DESC)`: for a given row and
/// column, the most recent version sorts first. Iterating a sorted source
/// forward from a row therefore visits every column's versions newest to
/// oldest before crossing into the next row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreKey {
    pub row: Bytes,
    pub column: Bytes,
    pub timestamp: i64,
}

impl StoreKey {
    pub fn new(row: impl Into<Bytes>, column: impl Into<Bytes>, timestamp: i64) -> Self {
        Self {
            row: row.into(),
            column: column.into(),
            timestamp,
        }
    }

    /// Probe key that sorts before every cell of `row`.
    ///
    /// An empty row is the start-of-keyspace sentinel, so
    /// `row_start(Bytes::new())` sorts before everything.
    pub fn row_start(row: impl Into<Bytes>) -> Self {
        Self {
            row: row.into(),
            column: Bytes::new(),
            timestamp: i64::MAX,
        }
    }

    pub fn same_row(&self, other: &StoreKey) -> bool {
        self.row == other.row
    }

    pub fn same_row_and_column(&self, other: &StoreKey) -> bool {
        self.row == other.row && self.column == other.column
    }

    /// True when `candidate` lies in this key's row at or below this key's
    /// timestamp ceiling, regardless of column.
    pub fn matches_without_column(&self, candidate: &StoreKey) -> bool {
        self.row == candidate.row && candidate.timestamp <= self.timestamp
    }
}

impl Ord for StoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column.cmp(&other.column))
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for StoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The family portion of a column name, including the trailing separator.
///
/// Returns `None` when the column carries no family indicator.
pub fn family(column: &[u8]) -> Option<&[u8]> {
    column
        .iter()
        .position(|&b| b == FAMILY_SEPARATOR)
        .map(|pos| &column[..=pos])
}
