//! Service boundaries consumed by the client layer.
//!
//! Transport and wire encoding live outside this crate; the locator and the
//! row-mutation session only depend on these traits. Implementations are
//! expected to be blocking and to surface transport failures as
//! [`RpcError`].

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::region::{RegionInfo, ServerAddress};
use crate::store_key::StoreKey;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("server unavailable: {0}")]
    Unavailable(String),

    #[error("rpc timed out")]
    TimedOut,

    /// The addressed server no longer serves the named region.
    #[error("region not served here: {0}")]
    NotServing(String),

    #[error("remote error: {0}")]
    Remote(String),
}

/// Server-side scan cursor handle.
pub trait RowScanner {
    fn next(&mut self) -> Result<Option<(StoreKey, BTreeMap<Bytes, Bytes>)>, RpcError>;
    fn close(&mut self);
}

/// Region server operations used by the client.
pub trait RegionService: Send + Sync {
    /// Up to `max_versions` values (0 = unbounded) for the row and column,
    /// newest first, with timestamps at or below `timestamp`.
    fn get(
        &self,
        region: &[u8],
        row: &[u8],
        column: &[u8],
        timestamp: i64,
        max_versions: usize,
    ) -> Result<Vec<Bytes>, RpcError>;

    /// The newest value per column for the row.
    fn get_row(&self, region: &[u8], row: &[u8]) -> Result<BTreeMap<Bytes, Bytes>, RpcError>;

    fn open_scanner(
        &self,
        region: &[u8],
        columns: &[String],
        start_row: &[u8],
    ) -> Result<Box<dyn RowScanner>, RpcError>;

    /// Descriptor of a region this server hosts, or `None` when it does not
    /// serve that region.
    fn get_region_info(&self, region_name: &[u8]) -> Result<Option<RegionInfo>, RpcError>;

    /// Acquire a row lock for an atomic single-row mutation; returns the
    /// lock id the subsequent calls must present.
    fn start_update(&self, region: &[u8], client_id: u64, row: &[u8]) -> Result<u64, RpcError>;

    fn put(
        &self,
        region: &[u8],
        client_id: u64,
        lock_id: u64,
        column: &[u8],
        value: Bytes,
    ) -> Result<(), RpcError>;

    fn delete(
        &self,
        region: &[u8],
        client_id: u64,
        lock_id: u64,
        column: &[u8],
    ) -> Result<(), RpcError>;

    /// Atomically apply all mutations buffered under the lock and release it.
    fn commit(&self, region: &[u8], client_id: u64, lock_id: u64) -> Result<(), RpcError>;

    /// Discard the lock and any buffered mutations.
    fn abort(&self, region: &[u8], client_id: u64, lock_id: u64) -> Result<(), RpcError>;
}

/// Master operations used by the client.
pub trait MasterService: Send + Sync {
    /// Address of the server hosting the root region, or `None` while the
    /// root region is unassigned.
    fn find_root_region(&self) -> Result<Option<ServerAddress>, RpcError>;
}

/// Resolves server addresses to live service handles.
///
/// One registry per logical cluster context, owned by the caller and passed
/// to [`crate::client::RegionLocator`] explicitly. Implementations should
/// reuse connections per address.
pub trait ServerRegistry: Send + Sync {
    fn connect(&self, address: &ServerAddress) -> Result<Arc<dyn RegionService>, RpcError>;
}
