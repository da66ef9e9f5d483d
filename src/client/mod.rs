//! Client-side region discovery and row operations.
//!
//! Finding the server that owns a row walks a two-level metadata hierarchy:
//! the master names the root region's server, scanning root yields the meta
//! regions, scanning meta yields a user table's regions. Resolved locations
//! are cached per table and retained indefinitely; there is no invalidation
//! or TTL in this layer. Re-resolving on a "not serving region" error is an
//! extension point for callers.

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::region::{
    RegionError, RegionInfo, ServerAddress, TableDescriptor, COL_REGION_INFO, COL_SERVER,
    META_COLUMN_FAMILY, META_TABLE_NAME, ROOT_TABLE_NAME,
};
use crate::rpc::{MasterService, RegionService, RowScanner, RpcError, ServerRegistry};
use crate::store_key::StoreKey;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("unable to locate root region server after {attempts} attempts")]
    RootRegionUnavailable { attempts: u32 },

    #[error("region server {server} unavailable")]
    RegionUnavailable {
        server: ServerAddress,
        #[source]
        source: RpcError,
    },

    #[error("no region of table {table:?} covers the requested row")]
    NoRegionForRow { table: String },

    #[error("metadata row missing column {column:?}")]
    MissingMetaColumn { column: &'static str },

    /// The row session was already committed, aborted, or auto-released
    /// after a failed mutation.
    #[error("row session already released")]
    SessionReleased,

    #[error(transparent)]
    Region(#[from] RegionError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Delay between master polls while the root region is unassigned.
    pub client_timeout: Duration,
    /// Master polls per root-location attempt.
    pub num_timeouts: u32,
    /// Additional root-location attempts after the first.
    pub num_retries: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_timeout: Duration::from_secs(10),
            num_timeouts: 5,
            num_retries: 2,
        }
    }
}

/// A region and the server currently hosting it.
#[derive(Debug, Clone)]
pub struct RegionLocation {
    pub region: RegionInfo,
    pub server: ServerAddress,
}

type TableMap = BTreeMap<Bytes, RegionLocation>;

/// Resolves which server owns a given row and caches the answer.
///
/// Root-location polling blocks the calling thread for up to
/// `num_retries x num_timeouts x client_timeout`; run it off any latency
/// critical path.
pub struct RegionLocator {
    options: ClientOptions,
    master: Arc<dyn MasterService>,
    registry: Arc<dyn ServerRegistry>,
    tables: Mutex<BTreeMap<Bytes, TableMap>>,
}

impl RegionLocator {
    pub fn new(
        options: ClientOptions,
        master: Arc<dyn MasterService>,
        registry: Arc<dyn ServerRegistry>,
    ) -> Self {
        Self {
            options,
            master,
            registry,
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load `table`'s region mapping if it is not cached yet.
    pub fn open_table(&self, table: &[u8]) -> Result<(), ClientError> {
        if self.tables.lock().contains_key(table) {
            return Ok(());
        }
        self.load_table(table)
    }

    /// The region owning `row`: the cached region with the greatest start
    /// key at or below `row`.
    pub fn locate_region(&self, table: &[u8], row: &[u8]) -> Result<RegionLocation, ClientError> {
        if let Some(found) = self.cached_region(table, row) {
            return Ok(found);
        }
        self.load_table(table)?;
        self.cached_region(table, row)
            .ok_or_else(|| ClientError::NoRegionForRow {
                table: String::from_utf8_lossy(table).into_owned(),
            })
    }

    /// Distinct descriptors of all user tables, discovered by scanning every
    /// meta region for entries with an empty start key.
    pub fn list_tables(&self) -> Result<Vec<TableDescriptor>, ClientError> {
        self.ensure_meta_loaded()?;
        let meta_regions: Vec<RegionLocation> = {
            let tables = self.tables.lock();
            tables
                .get(META_TABLE_NAME)
                .map(|map| map.values().cloned().collect())
                .unwrap_or_default()
        };

        let mut unique = BTreeSet::new();
        for location in meta_regions {
            let server = self.connect(&location.server)?;
            let mut scanner = server.open_scanner(
                &location.region.region_name,
                &[META_COLUMN_FAMILY.to_owned()],
                b"",
            )?;
            let result = collect_first_regions(scanner.as_mut(), &mut unique);
            scanner.close();
            result?;
        }
        Ok(unique.into_iter().collect())
    }

    pub(crate) fn connect(
        &self,
        address: &ServerAddress,
    ) -> Result<Arc<dyn RegionService>, ClientError> {
        self.registry
            .connect(address)
            .map_err(|source| ClientError::RegionUnavailable {
                server: address.clone(),
                source,
            })
    }

    /// Cached locations from the region covering `start_row` through the end
    /// of the table.
    pub(crate) fn regions_for_scan(&self, table: &[u8], start_row: &[u8]) -> Vec<RegionLocation> {
        let tables = self.tables.lock();
        let Some(map) = tables.get(table) else {
            return Vec::new();
        };
        let covering = map
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(start_row)))
            .next_back()
            .map(|(start, _)| start.clone());
        match covering {
            Some(start) => map
                .range::<[u8], _>((Bound::Included(start.as_ref()), Bound::Unbounded))
                .map(|(_, location)| location.clone())
                .collect(),
            None => map.values().cloned().collect(),
        }
    }

    fn cached_region(&self, table: &[u8], row: &[u8]) -> Option<RegionLocation> {
        let tables = self.tables.lock();
        let map = tables.get(table)?;
        map.range::<[u8], _>((Bound::Unbounded, Bound::Included(row)))
            .next_back()
            .map(|(_, location)| location.clone())
    }

    fn load_table(&self, table: &[u8]) -> Result<(), ClientError> {
        if table == ROOT_TABLE_NAME {
            self.locate_root_region()?;
            return Ok(());
        }
        self.ensure_meta_loaded()?;
        if table == META_TABLE_NAME {
            return Ok(());
        }

        let meta_regions = self.regions_for_scan(META_TABLE_NAME, table);
        let mut map = TableMap::new();
        for location in &meta_regions {
            self.scan_meta_region(location, table, &mut map)?;
        }
        debug!(
            table = %String::from_utf8_lossy(table),
            regions = map.len(),
            "table region mapping loaded"
        );
        self.tables.lock().insert(Bytes::copy_from_slice(table), map);
        Ok(())
    }

    fn ensure_meta_loaded(&self) -> Result<(), ClientError> {
        if self.tables.lock().contains_key(META_TABLE_NAME) {
            return Ok(());
        }
        let root = self.locate_root_region()?;
        let mut map = TableMap::new();
        self.scan_meta_region(&root, META_TABLE_NAME, &mut map)?;
        self.tables
            .lock()
            .insert(Bytes::from_static(META_TABLE_NAME), map);
        Ok(())
    }

    /// Ask the master for the root region's server, bounded by the
    /// configured retry budget, and verify the named server actually hosts
    /// the root region before caching it.
    fn locate_root_region(&self) -> Result<RegionLocation, ClientError> {
        if let Some(found) = self.cached_region(ROOT_TABLE_NAME, b"") {
            return Ok(found);
        }

        let root_info = RegionInfo::root();
        let mut attempts = 0u32;
        while attempts <= self.options.num_retries {
            attempts += 1;
            let Some(address) = self.poll_master() else {
                continue;
            };
            let verified = self
                .registry
                .connect(&address)
                .and_then(|server| server.get_region_info(&root_info.region_name));
            match verified {
                Ok(Some(_)) => {
                    debug!(server = %address, "root region located");
                    let location = RegionLocation {
                        region: root_info,
                        server: address,
                    };
                    let mut map = TableMap::new();
                    map.insert(Bytes::new(), location.clone());
                    self.tables
                        .lock()
                        .insert(Bytes::from_static(ROOT_TABLE_NAME), map);
                    return Ok(location);
                }
                Ok(None) => {
                    warn!(server = %address, "server no longer hosts the root region")
                }
                Err(err) => {
                    warn!(server = %address, error = %err, "root region server unreachable")
                }
            }
        }
        Err(ClientError::RootRegionUnavailable { attempts })
    }

    fn poll_master(&self) -> Option<ServerAddress> {
        for poll in 0..self.options.num_timeouts {
            if poll > 0 {
                std::thread::sleep(self.options.client_timeout);
            }
            match self.master.find_root_region() {
                Ok(Some(address)) => return Some(address),
                Ok(None) => debug!("root region not assigned yet"),
                Err(err) => warn!(error = %err, "master unreachable"),
            }
        }
        None
    }

    fn scan_meta_region(
        &self,
        location: &RegionLocation,
        target_table: &[u8],
        out: &mut TableMap,
    ) -> Result<(), ClientError> {
        let server = self.connect(&location.server)?;
        let mut scanner = server.open_scanner(
            &location.region.region_name,
            &[META_COLUMN_FAMILY.to_owned()],
            target_table,
        )?;
        let result = collect_table_regions(scanner.as_mut(), target_table, out);
        scanner.close();
        result
    }
}

fn collect_table_regions(
    scanner: &mut dyn RowScanner,
    target_table: &[u8],
    out: &mut TableMap,
) -> Result<(), ClientError> {
    while let Some((_, mut columns)) = scanner.next()? {
        let region = decode_region_column(&mut columns)?;
        if region.table.name.as_ref() != target_table {
            // Metadata rows are sorted by region name; past the target table
            // no further entries can match.
            break;
        }
        let address = decode_server_column(&mut columns)?;
        out.insert(
            region.start_key.clone(),
            RegionLocation {
                region,
                server: address,
            },
        );
    }
    Ok(())
}

fn collect_first_regions(
    scanner: &mut dyn RowScanner,
    out: &mut BTreeSet<TableDescriptor>,
) -> Result<(), ClientError> {
    while let Some((_, mut columns)) = scanner.next()? {
        let region = decode_region_column(&mut columns)?;
        if region.start_key.is_empty() {
            out.insert(region.table);
        }
    }
    Ok(())
}

fn decode_region_column(columns: &mut BTreeMap<Bytes, Bytes>) -> Result<RegionInfo, ClientError> {
    let info_bytes = columns
        .remove(COL_REGION_INFO)
        .ok_or(ClientError::MissingMetaColumn {
            column: "info:regioninfo",
        })?;
    Ok(RegionInfo::decode(&info_bytes)?)
}

fn decode_server_column(columns: &mut BTreeMap<Bytes, Bytes>) -> Result<ServerAddress, ClientError> {
    let server_bytes = columns
        .remove(COL_SERVER)
        .ok_or(ClientError::MissingMetaColumn {
            column: "info:server",
        })?;
    let address = std::str::from_utf8(&server_bytes).map_err(|_| {
        ClientError::Region(RegionError::BadServerAddress {
            address: String::from_utf8_lossy(&server_bytes).into_owned(),
        })
    })?;
    Ok(ServerAddress::parse(address)?)
}

/// Handle to one table, bound to a locator.
///
/// Opening a table eagerly loads its region mapping, so later operations
/// never run against an unresolved table.
pub struct Table {
    locator: Arc<RegionLocator>,
    name: Bytes,
    client_id: u64,
}

impl Table {
    pub fn open(locator: Arc<RegionLocator>, name: impl Into<Bytes>) -> Result<Self, ClientError> {
        let name = name.into();
        locator.open_table(&name)?;
        Ok(Self {
            locator,
            name,
            client_id: rand::random(),
        })
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Newest version of one cell, or `None` when absent.
    pub fn get(&self, row: &[u8], column: &[u8]) -> Result<Option<Bytes>, ClientError> {
        Ok(self
            .get_versions_before(row, column, i64::MAX, 1)?
            .into_iter()
            .next())
    }

    /// Up to `max_versions` versions of one cell, newest first.
    pub fn get_versions(
        &self,
        row: &[u8],
        column: &[u8],
        max_versions: usize,
    ) -> Result<Vec<Bytes>, ClientError> {
        self.get_versions_before(row, column, i64::MAX, max_versions)
    }

    /// Like [`get_versions`](Self::get_versions), bounded by a timestamp
    /// ceiling.
    pub fn get_versions_before(
        &self,
        row: &[u8],
        column: &[u8],
        timestamp: i64,
        max_versions: usize,
    ) -> Result<Vec<Bytes>, ClientError> {
        let (location, server) = self.region_server(row)?;
        Ok(server.get(
            &location.region.region_name,
            row,
            column,
            timestamp,
            max_versions,
        )?)
    }

    /// The newest value per column for a row.
    pub fn get_row(&self, row: &[u8]) -> Result<BTreeMap<Bytes, Bytes>, ClientError> {
        let (location, server) = self.region_server(row)?;
        Ok(server.get_row(&location.region.region_name, row)?)
    }

    /// Cursor over the table from `start_row`, spanning regions
    /// transparently.
    pub fn scanner<S: AsRef<str>>(
        &self,
        columns: &[S],
        start_row: &[u8],
    ) -> Result<TableScanner, ClientError> {
        TableScanner::new(self, columns, start_row)
    }

    /// Begin an atomic single-row mutation by acquiring a server-side row
    /// lock.
    ///
    /// The returned session borrows the table mutably, so a client instance
    /// can drive at most one row mutation at a time.
    pub fn start_update(&mut self, row: &[u8]) -> Result<RowSession<'_>, ClientError> {
        let location = self.locator.locate_region(&self.name, row)?;
        let server = self.locator.connect(&location.server)?;
        let lock_id = server.start_update(&location.region.region_name, self.client_id, row)?;
        Ok(RowSession {
            server,
            region: location.region.region_name,
            client_id: self.client_id,
            lock_id,
            released: false,
            _table: PhantomData,
        })
    }

    fn region_server(
        &self,
        row: &[u8],
    ) -> Result<(RegionLocation, Arc<dyn RegionService>), ClientError> {
        let location = self.locator.locate_region(&self.name, row)?;
        let server = self.locator.connect(&location.server)?;
        Ok((location, server))
    }
}

/// One in-flight single-row mutation under a server-held row lock.
///
/// `commit` and `abort` consume the session. A `put` or `delete` failure
/// best-effort aborts the server-side lock and releases the session; the
/// original error is what propagates. Dropping an unreleased session aborts
/// the lock.
pub struct RowSession<'a> {
    server: Arc<dyn RegionService>,
    region: Bytes,
    client_id: u64,
    lock_id: u64,
    released: bool,
    _table: PhantomData<&'a mut Table>,
}

impl RowSession<'_> {
    pub fn lock_id(&self) -> u64 {
        self.lock_id
    }

    pub fn put(&mut self, column: &[u8], value: impl Into<Bytes>) -> Result<(), ClientError> {
        self.ensure_live()?;
        match self
            .server
            .put(&self.region, self.client_id, self.lock_id, column, value.into())
        {
            Ok(()) => Ok(()),
            Err(err) => {
                self.release_after_failure();
                Err(err.into())
            }
        }
    }

    pub fn delete(&mut self, column: &[u8]) -> Result<(), ClientError> {
        self.ensure_live()?;
        match self
            .server
            .delete(&self.region, self.client_id, self.lock_id, column)
        {
            Ok(()) => Ok(()),
            Err(err) => {
                self.release_after_failure();
                Err(err.into())
            }
        }
    }

    /// Atomically apply the buffered mutations. The session is released
    /// whether or not finalization succeeds.
    pub fn commit(mut self) -> Result<(), ClientError> {
        self.released = true;
        self.server
            .commit(&self.region, self.client_id, self.lock_id)
            .map_err(Into::into)
    }

    /// Discard the buffered mutations and release the lock.
    pub fn abort(mut self) -> Result<(), ClientError> {
        self.released = true;
        self.server
            .abort(&self.region, self.client_id, self.lock_id)
            .map_err(Into::into)
    }

    fn ensure_live(&self) -> Result<(), ClientError> {
        if self.released {
            return Err(ClientError::SessionReleased);
        }
        Ok(())
    }

    fn release_after_failure(&mut self) {
        self.released = true;
        // Best effort; the caller sees the original mutation error.
        if let Err(err) = self
            .server
            .abort(&self.region, self.client_id, self.lock_id)
        {
            warn!(error = %err, "failed to abort row lock after mutation failure");
        }
    }
}

impl Drop for RowSession<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self
                .server
                .abort(&self.region, self.client_id, self.lock_id);
        }
    }
}

/// Client-side cursor spanning all regions of a table from a start row.
///
/// Opens one server-side scanner per region, advancing to the next region
/// when the current one is exhausted.
pub struct TableScanner {
    locator: Arc<RegionLocator>,
    columns: Vec<String>,
    start_row: Bytes,
    regions: Vec<RegionLocation>,
    next_region: usize,
    current: Option<Box<dyn RowScanner>>,
    closed: bool,
}

impl TableScanner {
    fn new<S: AsRef<str>>(
        table: &Table,
        columns: &[S],
        start_row: &[u8],
    ) -> Result<Self, ClientError> {
        let regions = table.locator.regions_for_scan(&table.name, start_row);
        let mut scanner = Self {
            locator: table.locator.clone(),
            columns: columns.iter().map(|c| c.as_ref().to_owned()).collect(),
            start_row: Bytes::copy_from_slice(start_row),
            regions,
            next_region: 0,
            current: None,
            closed: false,
        };
        scanner.advance_region()?;
        Ok(scanner)
    }

    pub fn next(
        &mut self,
    ) -> Result<Option<(StoreKey, BTreeMap<Bytes, Bytes>)>, ClientError> {
        if self.closed {
            return Ok(None);
        }
        loop {
            let Some(current) = self.current.as_mut() else {
                return Ok(None);
            };
            if let Some(entry) = current.next()? {
                return Ok(Some(entry));
            }
            if !self.advance_region()? {
                return Ok(None);
            }
        }
    }

    /// Idempotent.
    pub fn close(&mut self) {
        if let Some(mut current) = self.current.take() {
            current.close();
        }
        self.closed = true;
    }

    fn advance_region(&mut self) -> Result<bool, ClientError> {
        if let Some(mut current) = self.current.take() {
            current.close();
        }
        let Some(location) = self.regions.get(self.next_region).cloned() else {
            self.closed = true;
            return Ok(false);
        };
        self.next_region += 1;

        let server = match self.locator.connect(&location.server) {
            Ok(server) => server,
            Err(err) => {
                self.closed = true;
                return Err(err);
            }
        };
        match server.open_scanner(&location.region.region_name, &self.columns, &self.start_row) {
            Ok(scanner) => {
                self.current = Some(scanner);
                Ok(true)
            }
            Err(err) => {
                self.closed = true;
                Err(err.into())
            }
        }
    }
}

impl Drop for TableScanner {
    fn drop(&mut self) {
        self.close();
    }
}
