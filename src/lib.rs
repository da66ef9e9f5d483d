//! `tabletdb` is the storage engine and client-access layer of a
//! column-oriented, versioned, range-partitioned key-value store.
//!
//! This crate is intentionally opinionated about correctness first:
//! - Store keys are ordered by `(row ASC, column ASC, timestamp DESC)`, so
//!   the newest version of a cell is always encountered first.
//! - The write buffer freezes copy-on-flush: reads keep running against the
//!   frozen history while new writes land in a fresh active map.
//! - Snapshot-for-flush is single-flight and enforced, not advisory.
//! - Scans are a single N-way merge written once against a cursor trait,
//!   shared by the live buffer, frozen snapshots, and on-disk stores.
//!
//! The on-disk store format, the write-ahead log internals, and the RPC
//! transport are external collaborators consumed through the narrow
//! contracts in [`wal`] and [`rpc`].

pub mod client;
pub mod column;
pub mod memstore;
pub mod region;
pub mod rpc;
pub mod scan;
pub mod store_key;
pub mod wal;

pub use client::{
    ClientError, ClientOptions, RegionLocation, RegionLocator, RowSession, Table, TableScanner,
};
pub use column::{ColumnSpecError, MatcherSet};
pub use memstore::{FlushSnapshot, MemStore, MemStoreError, MemStoreScanner};
pub use region::{RegionError, RegionInfo, ServerAddress, TableDescriptor};
pub use rpc::{MasterService, RegionService, RowScanner, RpcError, ServerRegistry};
pub use scan::{KeyCursor, MergeScanner, ScanEntry, VecCursor};
pub use store_key::StoreKey;
pub use wal::{CommitLog, SequenceLog};
