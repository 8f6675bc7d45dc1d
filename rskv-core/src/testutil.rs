//! Shared fixtures: a scriptable connection, an in-memory backend that
//! behaves like one data node, and local storage/cache doubles for the
//! wrapper tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::bucket::{fnv1a, BUCKET_COUNT};
use crate::cache::Cache;
use crate::client::{Behavior, Connection, Error, Storage};
use crate::store::Backend;

fn io_err(what: &str) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, what.to_string()))
}

/// A connection that succeeds at everything and returns nothing, for tests
/// that never actually touch the wire.
pub(crate) struct TestConn;

#[async_trait]
impl Connection for TestConn {
    async fn connect(_addr: &str, _behavior: &Behavior) -> Result<Self, Error> {
        Ok(TestConn)
    }

    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Error> {
        Ok(0)
    }

    async fn write(&mut self, _data: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

thread_local! {
    static SCRIPTS: RefCell<VecDeque<VecDeque<Vec<u8>>>> = RefCell::new(VecDeque::new());
}

/// A connection that replays staged read chunks. Each `connect` consumes
/// one staged script; connecting with none left fails, which doubles as a
/// way to simulate an unreachable endpoint.
pub(crate) struct ScriptConn {
    reads: VecDeque<Vec<u8>>,
}

impl ScriptConn {
    pub(crate) fn stage(scripts: Vec<Vec<Vec<u8>>>) {
        SCRIPTS.with(|cell| {
            *cell.borrow_mut() = scripts
                .into_iter()
                .map(|script| script.into_iter().collect())
                .collect();
        });
    }
}

#[async_trait]
impl Connection for ScriptConn {
    async fn connect(_addr: &str, _behavior: &Behavior) -> Result<Self, Error> {
        SCRIPTS
            .with(|cell| cell.borrow_mut().pop_front())
            .map(|reads| ScriptConn { reads })
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "no scripted connection",
                ))
            })
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match self.reads.pop_front() {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Err(io_err("script exhausted")),
        }
    }

    async fn write(&mut self, _data: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

/// An in-memory stand-in for one data node, scriptable enough to act out
/// the failure modes the routers care about. It answers the `@` inventory
/// listing, the `?` existence probe, and the `@%08x` per-hash listing the
/// same way a real node would.
pub(crate) struct FakeStore {
    addr: String,
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    fail_io: AtomicBool,
    reject_writes: AtomicBool,
    inventory_override: Mutex<Option<String>>,
    multi_fail_once: Mutex<Option<Vec<Vec<u8>>>>,
    multi_batches: Mutex<Vec<usize>>,
    ops: AtomicUsize,
}

impl FakeStore {
    pub(crate) fn new(addr: String) -> Self {
        FakeStore {
            addr,
            data: Mutex::new(HashMap::new()),
            fail_io: AtomicBool::new(false),
            reject_writes: AtomicBool::new(false),
            inventory_override: Mutex::new(None),
            multi_fail_once: Mutex::new(None),
            multi_batches: Mutex::new(Vec::new()),
            ops: AtomicUsize::new(0),
        }
    }

    pub(crate) fn insert(&self, key: &[u8], value: &[u8]) {
        self.data.lock().unwrap().insert(key.to_vec(), value.to_vec());
    }

    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        self.data.lock().unwrap().contains_key(key)
    }

    /// All further operations fail with a transport error.
    pub(crate) fn fail_io(&self) {
        self.fail_io.store(true, Ordering::SeqCst);
    }

    /// All further writes and deletes are refused (but answered).
    pub(crate) fn reject_writes(&self) {
        self.reject_writes.store(true, Ordering::SeqCst);
    }

    /// The next `set_multi` reports these keys as failed while storing the
    /// rest.
    pub(crate) fn fail_keys_once(&self, keys: Vec<Vec<u8>>) {
        *self.multi_fail_once.lock().unwrap() = Some(keys);
    }

    pub(crate) fn set_inventory(&self, listing: &str) {
        *self.inventory_override.lock().unwrap() = Some(listing.to_string());
    }

    pub(crate) fn restore_inventory(&self) {
        *self.inventory_override.lock().unwrap() = None;
    }

    /// Sizes of every multi-key batch this store has seen.
    pub(crate) fn multi_batch_sizes(&self) -> Vec<usize> {
        self.multi_batches.lock().unwrap().clone()
    }

    pub(crate) fn op_count(&self) -> usize {
        self.ops.load(Ordering::SeqCst)
    }

    fn inventory(&self) -> String {
        if let Some(listing) = self.inventory_override.lock().unwrap().clone() {
            return listing;
        }
        (0..BUCKET_COUNT)
            .map(|i| format!("{}/ {:08x} 1\n", i, i))
            .collect()
    }

    fn check_io(&self) -> Result<(), Error> {
        if self.fail_io.load(Ordering::SeqCst) {
            Err(io_err("injected transport failure"))
        } else {
            Ok(())
        }
    }

    fn record_batch(&self, len: usize) {
        self.multi_batches.lock().unwrap().push(len);
    }
}

#[async_trait]
impl Backend for FakeStore {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        self.check_io()?;
        if key == b"@" {
            return Ok(Some(Bytes::from(self.inventory())));
        }
        if let Some(rest) = key.strip_prefix(b"?") {
            let found = self.data.lock().unwrap().contains_key(rest);
            return Ok(found.then(|| Bytes::from_static(b"1")));
        }
        if key.len() == 9 && key[0] == b'@' {
            let suffix = String::from_utf8_lossy(&key[1..]).into_owned();
            let data = self.data.lock().unwrap();
            let lines: String = data
                .keys()
                .filter(|k| format!("{:08x}", fnv1a(k)) == suffix)
                .map(|k| format!("{} 0 1\n", String::from_utf8_lossy(k)))
                .collect();
            return Ok(if lines.is_empty() {
                None
            } else {
                Some(Bytes::from(lines))
            });
        }
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(key)
            .map(|v| Bytes::copy_from_slice(v)))
    }

    async fn get_raw(&self, key: &[u8]) -> Result<Option<(Bytes, u32)>, Error> {
        Ok(Backend::get(self, key).await?.map(|data| (data, 0)))
    }

    async fn get_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Bytes>, Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        self.record_batch(keys.len());
        self.check_io()?;
        let data = self.data.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|key| data.get(key).map(|v| (key.clone(), Bytes::copy_from_slice(v))))
            .collect())
    }

    async fn set(&self, key: &[u8], value: &[u8], _rev: i64) -> Result<bool, Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        self.check_io()?;
        if self.reject_writes.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.insert(key, value);
        Ok(true)
    }

    async fn set_raw(
        &self,
        key: &[u8],
        value: &[u8],
        rev: i64,
        _flags: u32,
    ) -> Result<bool, Error> {
        Backend::set(self, key, value, rev).await
    }

    async fn set_multi(
        &self,
        values: &HashMap<Vec<u8>, Bytes>,
    ) -> Result<(bool, Vec<Vec<u8>>), Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        self.record_batch(values.len());
        self.check_io()?;
        if let Some(failing) = self.multi_fail_once.lock().unwrap().take() {
            let mut failed = Vec::new();
            for (key, value) in values {
                if failing.contains(key) {
                    failed.push(key.clone());
                } else {
                    self.insert(key, value);
                }
            }
            return Ok((failed.is_empty(), failed));
        }
        if self.reject_writes.load(Ordering::SeqCst) {
            return Ok((false, values.keys().cloned().collect()));
        }
        for (key, value) in values {
            self.insert(key, value);
        }
        Ok((true, Vec::new()))
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        self.check_io()?;
        if self.reject_writes.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.data.lock().unwrap().remove(key);
        Ok(true)
    }

    async fn delete_multi(&self, keys: &[Vec<u8>]) -> Result<(bool, Vec<Vec<u8>>), Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        self.record_batch(keys.len());
        self.check_io()?;
        if self.reject_writes.load(Ordering::SeqCst) {
            return Ok((false, keys.to_vec()));
        }
        let mut data = self.data.lock().unwrap();
        for key in keys {
            data.remove(key);
        }
        Ok((true, Vec::new()))
    }

    async fn exists(&self, key: &[u8]) -> Result<bool, Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        self.check_io()?;
        Ok(self.data.lock().unwrap().contains_key(key))
    }

    async fn incr(&self, key: &[u8], delta: u64) -> Result<u64, Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        self.check_io()?;
        let mut data = self.data.lock().unwrap();
        let current: u64 = match data.get(key) {
            Some(value) => String::from_utf8_lossy(value).parse().unwrap_or(0),
            None => return Ok(0),
        };
        let next = current + delta;
        data.insert(key.to_vec(), next.to_string().into_bytes());
        Ok(next)
    }
}

/// In-memory [`Storage`] double for the cache-wrapper tests, with scripted
/// write failures.
pub(crate) struct MemStorage {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    fail_writes: AtomicBool,
    multi_failures: Mutex<Option<Vec<Vec<u8>>>>,
    ops: AtomicUsize,
}

impl MemStorage {
    pub(crate) fn new() -> Self {
        MemStorage {
            data: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
            multi_failures: Mutex::new(None),
            ops: AtomicUsize::new(0),
        }
    }

    pub(crate) fn put(&self, key: &[u8], value: &[u8]) {
        self.data.lock().unwrap().insert(key.to_vec(), value.to_vec());
    }

    pub(crate) fn peek(&self, key: &[u8]) -> Option<Bytes> {
        self.data.lock().unwrap().get(key).map(|v| Bytes::copy_from_slice(v))
    }

    pub(crate) fn op_count(&self) -> usize {
        self.ops.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// The next `set_multi` fails for these keys and stores the rest.
    pub(crate) fn fail_multi_keys(&self, keys: Vec<Vec<u8>>) {
        *self.multi_failures.lock().unwrap() = Some(keys);
    }

    fn check_writes(&self, key: &[u8]) -> Result<(), Error> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(Error::write_failed(key, vec!["memstorage".to_string()]))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        Ok(self.peek(key))
    }

    async fn get_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Option<Bytes>>, Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        Ok(keys.iter().map(|key| (key.clone(), self.peek(key))).collect())
    }

    async fn set(&self, key: &[u8], value: Option<&[u8]>) -> Result<bool, Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        self.check_writes(key)?;
        match value {
            Some(value) => self.put(key, value),
            None => {
                self.data.lock().unwrap().remove(key);
            }
        }
        Ok(true)
    }

    async fn set_multi(&self, values: &HashMap<Vec<u8>, Option<Bytes>>) -> Result<bool, Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        if let Some(failing) = self.multi_failures.lock().unwrap().take() {
            for (key, value) in values {
                if !failing.contains(key) {
                    if let Some(value) = value {
                        self.put(key, value);
                    }
                }
            }
            return Err(Error::write_failed_multi(
                failing,
                vec!["memstorage".to_string()],
            ));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::write_failed_multi(
                values.keys().cloned().collect(),
                vec!["memstorage".to_string()],
            ));
        }
        for (key, value) in values {
            match value {
                Some(value) => self.put(key, value),
                None => {
                    self.data.lock().unwrap().remove(key);
                }
            }
        }
        Ok(true)
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        self.check_writes(key)?;
        self.data.lock().unwrap().remove(key);
        Ok(true)
    }

    async fn delete_multi(&self, keys: &[Vec<u8>]) -> Result<bool, Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.lock().unwrap();
        for key in keys {
            data.remove(key);
        }
        Ok(true)
    }

    async fn exists(&self, key: &[u8]) -> Result<bool, Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        Ok(self.data.lock().unwrap().contains_key(key))
    }

    async fn incr(&self, key: &[u8], delta: u64) -> Result<u64, Error> {
        self.ops.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.lock().unwrap();
        let current: u64 = data
            .get(key)
            .map(|v| String::from_utf8_lossy(v).parse().unwrap_or(0))
            .unwrap_or(0);
        let next = current + delta;
        data.insert(key.to_vec(), next.to_string().into_bytes());
        Ok(next)
    }
}

/// In-memory [`Cache`] double that records expirations and delete delays.
/// Like a real memcache double it honors deletes immediately, delayed or
/// not, and only keeps the bookkeeping for assertions.
pub(crate) struct LocalCache {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    sets: Mutex<Vec<(Vec<u8>, u32)>>,
    deletes: Mutex<Vec<(Vec<u8>, u32)>>,
}

impl LocalCache {
    pub(crate) fn new() -> Self {
        LocalCache {
            data: Mutex::new(HashMap::new()),
            sets: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        }
    }

    /// Seed an entry without recording it.
    pub(crate) fn put(&self, key: &[u8], value: &[u8]) {
        self.data.lock().unwrap().insert(key.to_vec(), value.to_vec());
    }

    pub(crate) fn peek(&self, key: &[u8]) -> Option<Bytes> {
        self.data.lock().unwrap().get(key).map(|v| Bytes::copy_from_slice(v))
    }

    pub(crate) fn contains(&self, key: &[u8]) -> bool {
        self.data.lock().unwrap().contains_key(key)
    }

    pub(crate) fn sets(&self) -> Vec<(Vec<u8>, u32)> {
        self.sets.lock().unwrap().clone()
    }

    pub(crate) fn deletes(&self) -> Vec<(Vec<u8>, u32)> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Cache for LocalCache {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        Ok(self.peek(key))
    }

    async fn get_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Bytes>, Error> {
        let data = self.data.lock().unwrap();
        Ok(keys
            .iter()
            .filter_map(|key| data.get(key).map(|v| (key.clone(), Bytes::copy_from_slice(v))))
            .collect())
    }

    async fn set(&self, key: &[u8], value: &[u8], expire: u32) -> Result<bool, Error> {
        self.sets.lock().unwrap().push((key.to_vec(), expire));
        self.put(key, value);
        Ok(true)
    }

    async fn set_multi(
        &self,
        values: &HashMap<Vec<u8>, Bytes>,
        expire: u32,
    ) -> Result<bool, Error> {
        for (key, value) in values {
            Cache::set(self, key, value, expire).await?;
        }
        Ok(true)
    }

    async fn delete(&self, key: &[u8], delay: u32) -> Result<bool, Error> {
        self.deletes.lock().unwrap().push((key.to_vec(), delay));
        Ok(self.data.lock().unwrap().remove(key).is_some())
    }

    async fn delete_multi(&self, keys: &[Vec<u8>], delay: u32) -> Result<bool, Error> {
        for key in keys {
            Cache::delete(self, key, delay).await?;
        }
        Ok(true)
    }
}
