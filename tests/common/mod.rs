//! In-memory fake cluster for client tests.
//!
//! Region servers here implement the crate's service traits directly over
//! `MemStore`, so locator and session tests exercise the real engine read
//! path instead of canned responses.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use tabletdb::region::{COL_REGION_INFO, COL_SERVER};
use tabletdb::{
    ClientOptions, MasterService, MemStore, RegionInfo, RegionLocator, RegionService, RowScanner,
    RpcError, ServerAddress, ServerRegistry, StoreKey, TableDescriptor,
};

pub struct FakeMaster {
    root: Option<ServerAddress>,
    unanswered_polls: AtomicU32,
    polls: AtomicU32,
}

impl FakeMaster {
    pub fn new(root: Option<ServerAddress>) -> Self {
        Self {
            root,
            unanswered_polls: AtomicU32::new(0),
            polls: AtomicU32::new(0),
        }
    }

    /// Answer `None` for the first `n` polls, then the real address.
    pub fn delay_answers(&self, n: u32) {
        self.unanswered_polls.store(n, Ordering::SeqCst);
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

impl MasterService for FakeMaster {
    fn find_root_region(&self) -> Result<Option<ServerAddress>, RpcError> {
        let seen = self.polls.fetch_add(1, Ordering::SeqCst);
        if seen < self.unanswered_polls.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.root.clone())
    }
}

struct HostedRegion {
    info: RegionInfo,
    store: MemStore,
}

#[derive(Default)]
struct PendingUpdate {
    row: Bytes,
    puts: BTreeMap<Bytes, Bytes>,
    deletes: Vec<Bytes>,
}

pub struct FakeRegionServer {
    address: ServerAddress,
    regions: Mutex<BTreeMap<Bytes, Arc<HostedRegion>>>,
    locks: Mutex<BTreeMap<u64, (Bytes, PendingUpdate)>>,
    next_lock: AtomicU64,
    commit_clock: AtomicU64,
    fail_next_put: AtomicBool,
    aborted_locks: Mutex<Vec<u64>>,
}

impl FakeRegionServer {
    pub fn new(address: ServerAddress) -> Arc<Self> {
        Arc::new(Self {
            address,
            regions: Mutex::new(BTreeMap::new()),
            locks: Mutex::new(BTreeMap::new()),
            next_lock: AtomicU64::new(1),
            commit_clock: AtomicU64::new(1_000),
            fail_next_put: AtomicBool::new(false),
            aborted_locks: Mutex::new(Vec::new()),
        })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn host_region(&self, info: RegionInfo) {
        self.regions.lock().insert(
            info.region_name.clone(),
            Arc::new(HostedRegion {
                info,
                store: MemStore::new(),
            }),
        );
    }

    /// Fixture setup: write a row directly into a hosted region's store.
    pub fn write_row(
        &self,
        region_name: &[u8],
        row: impl Into<Bytes>,
        columns: Vec<(Bytes, Bytes)>,
        timestamp: i64,
    ) {
        let region = self
            .regions
            .lock()
            .get(region_name)
            .cloned()
            .expect("fixture writes to a hosted region");
        region.store.add(row, columns, timestamp);
    }

    pub fn fail_next_put(&self) {
        self.fail_next_put.store(true, Ordering::SeqCst);
    }

    pub fn aborted_locks(&self) -> Vec<u64> {
        self.aborted_locks.lock().clone()
    }

    fn region(&self, name: &[u8]) -> Result<Arc<HostedRegion>, RpcError> {
        self.regions
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::NotServing(String::from_utf8_lossy(name).into_owned()))
    }
}

struct FakeRowScanner(tabletdb::MemStoreScanner);

impl RowScanner for FakeRowScanner {
    fn next(&mut self) -> Result<Option<(StoreKey, BTreeMap<Bytes, Bytes>)>, RpcError> {
        Ok(self.0.next())
    }

    fn close(&mut self) {
        self.0.close();
    }
}

impl RegionService for FakeRegionServer {
    fn get(
        &self,
        region: &[u8],
        row: &[u8],
        column: &[u8],
        timestamp: i64,
        max_versions: usize,
    ) -> Result<Vec<Bytes>, RpcError> {
        let region = self.region(region)?;
        let key = StoreKey::new(
            Bytes::copy_from_slice(row),
            Bytes::copy_from_slice(column),
            timestamp,
        );
        Ok(region.store.get(&key, max_versions))
    }

    fn get_row(&self, region: &[u8], row: &[u8]) -> Result<BTreeMap<Bytes, Bytes>, RpcError> {
        let region = self.region(region)?;
        let key = StoreKey::new(Bytes::copy_from_slice(row), Bytes::new(), i64::MAX);
        Ok(region.store.get_full(&key))
    }

    fn open_scanner(
        &self,
        region: &[u8],
        columns: &[String],
        start_row: &[u8],
    ) -> Result<Box<dyn RowScanner>, RpcError> {
        let region = self.region(region)?;
        let scanner = region
            .store
            .scanner(i64::MAX, columns, Bytes::copy_from_slice(start_row))
            .map_err(|err| RpcError::Remote(err.to_string()))?;
        Ok(Box::new(FakeRowScanner(scanner)))
    }

    fn get_region_info(&self, region_name: &[u8]) -> Result<Option<RegionInfo>, RpcError> {
        Ok(self
            .regions
            .lock()
            .get(region_name)
            .map(|region| region.info.clone()))
    }

    fn start_update(&self, region: &[u8], _client_id: u64, row: &[u8]) -> Result<u64, RpcError> {
        self.region(region)?;
        let lock_id = self.next_lock.fetch_add(1, Ordering::SeqCst);
        self.locks.lock().insert(
            lock_id,
            (
                Bytes::copy_from_slice(region),
                PendingUpdate {
                    row: Bytes::copy_from_slice(row),
                    ..PendingUpdate::default()
                },
            ),
        );
        Ok(lock_id)
    }

    fn put(
        &self,
        _region: &[u8],
        _client_id: u64,
        lock_id: u64,
        column: &[u8],
        value: Bytes,
    ) -> Result<(), RpcError> {
        if self.fail_next_put.swap(false, Ordering::SeqCst) {
            return Err(RpcError::Remote("injected put failure".to_owned()));
        }
        let mut locks = self.locks.lock();
        let (_, pending) = locks
            .get_mut(&lock_id)
            .ok_or_else(|| RpcError::Remote(format!("unknown lock {lock_id}")))?;
        pending.puts.insert(Bytes::copy_from_slice(column), value);
        Ok(())
    }

    fn delete(
        &self,
        _region: &[u8],
        _client_id: u64,
        lock_id: u64,
        column: &[u8],
    ) -> Result<(), RpcError> {
        let mut locks = self.locks.lock();
        let (_, pending) = locks
            .get_mut(&lock_id)
            .ok_or_else(|| RpcError::Remote(format!("unknown lock {lock_id}")))?;
        let column = Bytes::copy_from_slice(column);
        pending.puts.remove(&column);
        pending.deletes.push(column);
        Ok(())
    }

    fn commit(&self, _region: &[u8], _client_id: u64, lock_id: u64) -> Result<(), RpcError> {
        let (region_name, pending) = self
            .locks
            .lock()
            .remove(&lock_id)
            .ok_or_else(|| RpcError::Remote(format!("unknown lock {lock_id}")))?;
        let region = self.region(&region_name)?;
        // The fake applies puts only; tombstones are the real server's
        // concern.
        if !pending.puts.is_empty() {
            let timestamp = self.commit_clock.fetch_add(1, Ordering::SeqCst) as i64;
            region
                .store
                .add(pending.row.clone(), pending.puts.into_iter().collect::<Vec<_>>(), timestamp);
        }
        Ok(())
    }

    fn abort(&self, _region: &[u8], _client_id: u64, lock_id: u64) -> Result<(), RpcError> {
        self.locks.lock().remove(&lock_id);
        self.aborted_locks.lock().push(lock_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    servers: Mutex<BTreeMap<String, Arc<FakeRegionServer>>>,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, server: Arc<FakeRegionServer>) {
        self.servers
            .lock()
            .insert(server.address().to_string(), server);
    }
}

impl ServerRegistry for FakeRegistry {
    fn connect(&self, address: &ServerAddress) -> Result<Arc<dyn RegionService>, RpcError> {
        self.servers
            .lock()
            .get(&address.to_string())
            .cloned()
            .map(|server| server as Arc<dyn RegionService>)
            .ok_or_else(|| RpcError::Unavailable(address.to_string()))
    }
}

/// A cluster whose first server hosts the root and meta regions.
pub struct FakeCluster {
    pub master: Arc<FakeMaster>,
    pub registry: Arc<FakeRegistry>,
    pub servers: Vec<Arc<FakeRegionServer>>,
    meta_clock: AtomicU64,
}

impl FakeCluster {
    pub fn new(num_servers: usize) -> Self {
        let registry = FakeRegistry::new();
        let servers: Vec<Arc<FakeRegionServer>> = (0..num_servers.max(1))
            .map(|i| {
                let server = FakeRegionServer::new(ServerAddress::new("node", 7000 + i as u16));
                registry.register(server.clone());
                server
            })
            .collect();

        let bootstrap = &servers[0];
        let root = RegionInfo::root();
        let meta = RegionInfo::first_meta();
        bootstrap.host_region(root.clone());
        bootstrap.host_region(meta.clone());
        bootstrap.write_row(
            &root.region_name,
            meta.region_name.clone(),
            vec![
                (
                    Bytes::from_static(COL_REGION_INFO),
                    meta.encode().expect("encode meta descriptor"),
                ),
                (
                    Bytes::from_static(COL_SERVER),
                    Bytes::from(bootstrap.address().to_string()),
                ),
            ],
            1,
        );

        let master = Arc::new(FakeMaster::new(Some(bootstrap.address().clone())));
        Self {
            master,
            registry,
            servers,
            meta_clock: AtomicU64::new(1),
        }
    }

    /// Host one region per `(start_key, server index)` pair and publish the
    /// matching meta rows.
    pub fn add_table(&self, name: &str, regions: &[(&str, usize)]) {
        let descriptor = TableDescriptor::new(
            Bytes::copy_from_slice(name.as_bytes()),
            vec![Bytes::from_static(b"cf:")],
        );
        let meta_name = RegionInfo::first_meta().region_name;
        for (start_key, server_index) in regions {
            let info = RegionInfo::new(
                descriptor.clone(),
                Bytes::copy_from_slice(start_key.as_bytes()),
            );
            let server = &self.servers[*server_index];
            server.host_region(info.clone());

            let timestamp = self.meta_clock.fetch_add(1, Ordering::SeqCst) as i64;
            self.servers[0].write_row(
                &meta_name,
                info.region_name.clone(),
                vec![
                    (
                        Bytes::from_static(COL_REGION_INFO),
                        info.encode().expect("encode region descriptor"),
                    ),
                    (
                        Bytes::from_static(COL_SERVER),
                        Bytes::from(server.address().to_string()),
                    ),
                ],
                timestamp,
            );
        }
    }

    pub fn locator(&self, options: ClientOptions) -> Arc<RegionLocator> {
        Arc::new(RegionLocator::new(
            options,
            self.master.clone(),
            self.registry.clone(),
        ))
    }
}

/// Options tuned so retry loops finish quickly in tests.
pub fn fast_options() -> ClientOptions {
    ClientOptions {
        client_timeout: std::time::Duration::from_millis(1),
        num_timeouts: 2,
        num_retries: 1,
    }
}
