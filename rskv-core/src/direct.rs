//! The direct router talks straight to the data fleet. Keys map to one of
//! 16 buckets; each bucket's candidate replicas come from the backends'
//! self-reported inventories. Reads fail over across candidates, writes must
//! reach a quorum of W out of the first N, deletes must be acknowledged by
//! every candidate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures::lock::Mutex;
use tracing::warn;

use crate::bucket::{assign_buckets, bucket_of, fnv1a, parse_inventory, BUCKET_COUNT};
use crate::client::{Behavior, Connection, Error, NoCompressor, Storage, MAX_KEYS_IN_GET_MULTI};
use crate::store::{Backend, Store};

/// Replica fanout: how many candidates a bucket keeps.
pub const DEFAULT_N: usize = 3;
/// Write quorum: how many of the first N must acknowledge a set.
pub const DEFAULT_W: usize = 2;
/// How long a bucket table stays fresh.
pub const DEFAULT_UPDATE_PERIOD: Duration = Duration::from_secs(10);

struct BucketTable {
    inventories: Vec<Option<Vec<u64>>>,
    buckets: Vec<Vec<usize>>,
    refreshed_at: Option<Instant>,
}

/// A client that reads and writes the data fleet directly.
pub struct DirectClient<S> {
    servers: Vec<Arc<S>>,
    n: usize,
    w: usize,
    update_period: Duration,
    table: Mutex<BucketTable>,
}

impl<C: Connection> DirectClient<Store<C, NoCompressor>> {
    /// Connect to the data fleet at the given addresses with the direct-mode
    /// behavior preset.
    pub fn connect(addrs: &[String]) -> Result<Self, Error> {
        let stores = addrs
            .iter()
            .map(|addr| Store::new(addr.clone(), Behavior::direct()).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_stores(stores))
    }
}

impl<S: Backend> DirectClient<S> {
    /// Assemble a client over already-built backends.
    pub fn from_stores(servers: Vec<Arc<S>>) -> Self {
        let count = servers.len();
        DirectClient {
            servers,
            n: DEFAULT_N,
            w: DEFAULT_W,
            update_period: DEFAULT_UPDATE_PERIOD,
            table: Mutex::new(BucketTable {
                inventories: vec![None; count],
                buckets: vec![Vec::new(); BUCKET_COUNT],
                refreshed_at: None,
            }),
        }
    }

    /// Override the replica fanout and write quorum. The quorum is clamped
    /// so that W <= N always holds.
    pub fn with_quorum(mut self, n: usize, w: usize) -> Self {
        self.n = n.max(1);
        self.w = w.clamp(1, self.n);
        self
    }

    /// Override how long the bucket table stays fresh.
    pub fn with_update_period(mut self, period: Duration) -> Self {
        self.update_period = period;
        self
    }

    /// Rebuild the bucket table when it has gone stale. Inventories are
    /// queried only from backends that never answered; a backend's first
    /// successful listing is kept for the life of the process. Overlapping
    /// refreshes are harmless, and readers always see either the old table
    /// or the new one.
    async fn refresh_if_stale(&self) {
        let missing: Vec<usize> = {
            let table = self.table.lock().await;
            let stale = table
                .refreshed_at
                .map_or(true, |at| at.elapsed() >= self.update_period);
            if !stale {
                return;
            }
            table
                .inventories
                .iter()
                .enumerate()
                .filter(|(_, inv)| inv.is_none())
                .map(|(i, _)| i)
                .collect()
        };

        let mut fetched = Vec::new();
        for i in missing {
            let server = &self.servers[i];
            match server.get(b"@").await {
                Ok(Some(listing)) => match parse_inventory(&listing) {
                    Some(counts) => fetched.push((i, counts)),
                    None => warn!(server = server.addr(), "unparseable bucket inventory"),
                },
                Ok(None) => warn!(server = server.addr(), "no bucket inventory"),
                Err(err) => {
                    warn!(server = server.addr(), error = %err, "bucket inventory query failed")
                }
            }
        }

        let mut table = self.table.lock().await;
        for (i, counts) in fetched {
            if table.inventories[i].is_none() {
                table.inventories[i] = Some(counts);
            }
        }
        let buckets = assign_buckets(&table.inventories, self.n, &mut rand::thread_rng());
        table.buckets = buckets;
        table.refreshed_at = Some(Instant::now());
    }

    /// The ordered candidate replicas for a key's bucket.
    async fn candidates(&self, key: &[u8]) -> Vec<Arc<S>> {
        self.refresh_if_stale().await;
        let table = self.table.lock().await;
        table.buckets[bucket_of(key)]
            .iter()
            .map(|&i| self.servers[i].clone())
            .collect()
    }

    /// Group keys into per-backend bags covering every candidate replica,
    /// smallest bag first so the cheap queries run before the broad ones.
    async fn dispatch(&self, keys: &[Vec<u8>]) -> Vec<(Arc<S>, Vec<Vec<u8>>)> {
        let mut bags: HashMap<String, (Arc<S>, Vec<Vec<u8>>)> = HashMap::new();
        for key in keys {
            for server in self.candidates(key).await {
                bags.entry(server.addr().to_string())
                    .or_insert_with(|| (server.clone(), Vec::new()))
                    .1
                    .push(key.clone());
            }
        }
        let mut plan: Vec<(String, (Arc<S>, Vec<Vec<u8>>))> = bags.into_iter().collect();
        plan.sort_by(|(a_addr, (_, a_keys)), (b_addr, (_, b_keys))| {
            (a_keys.len(), a_addr).cmp(&(b_keys.len(), b_addr))
        });
        plan.into_iter().map(|(_, bag)| bag).collect()
    }

    async fn get_chunk(&self, keys: &[Vec<u8>]) -> HashMap<Vec<u8>, Option<Bytes>> {
        let mut found: HashMap<Vec<u8>, Bytes> = HashMap::new();
        for (server, bag) in self.dispatch(keys).await {
            let pending: Vec<Vec<u8>> = bag
                .into_iter()
                .filter(|key| !found.contains_key(key))
                .collect();
            if pending.is_empty() {
                continue;
            }
            match server.get_multi(&pending).await {
                Ok(values) => found.extend(values),
                Err(err) => {
                    warn!(server = server.addr(), error = %err, "get_multi bag failed")
                }
            }
        }
        keys.iter()
            .map(|key| (key.clone(), found.get(key).cloned()))
            .collect()
    }
}

fn addrs<S: Backend>(servers: &[Arc<S>]) -> Vec<String> {
    servers.iter().map(|s| s.addr().to_string()).collect()
}

#[async_trait]
impl<S: Backend> Storage for DirectClient<S> {
    /// Try each candidate in order and return the first value seen. A key
    /// is only reported absent if at least one replica answered cleanly.
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        let servers = self.candidates(key).await;
        let mut answered = false;
        for server in &servers {
            match server.get(key).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => answered = true,
                Err(err) => {
                    warn!(server = server.addr(), error = %err, "replica get failed")
                }
            }
        }
        if !answered {
            return Err(Error::read_failed(key, addrs(&servers)));
        }
        Ok(None)
    }

    async fn get_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Option<Bytes>>, Error> {
        let mut out = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_KEYS_IN_GET_MULTI) {
            out.extend(self.get_chunk(chunk).await);
        }
        Ok(out)
    }

    /// Write to the first N candidates and demand a quorum of W acks.
    async fn set(&self, key: &[u8], value: Option<&[u8]>) -> Result<bool, Error> {
        let value = match value {
            Some(value) => value,
            None => return self.delete(key).await,
        };
        let servers = self.candidates(key).await;
        let writes = servers
            .iter()
            .take(self.n)
            .map(|server| server.set(key, value, 0));
        let results = future::join_all(writes).await;
        for (server, result) in servers.iter().zip(&results) {
            if let Err(err) = result {
                warn!(server = server.addr(), error = %err, "replica set failed");
            }
        }
        let acked = results
            .iter()
            .filter(|result| matches!(result, Ok(true)))
            .count();
        if acked < self.w {
            return Err(Error::write_failed(key, addrs(&servers)));
        }
        Ok(true)
    }

    async fn set_multi(&self, values: &HashMap<Vec<u8>, Option<Bytes>>) -> Result<bool, Error> {
        let doomed: Vec<Vec<u8>> = values
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(key, _)| key.clone())
            .collect();
        if !doomed.is_empty() {
            self.delete_multi(&doomed).await?;
        }

        let live: HashMap<Vec<u8>, Bytes> = values
            .iter()
            .filter_map(|(key, value)| value.clone().map(|v| (key.clone(), v)))
            .collect();
        if live.is_empty() {
            return Ok(true);
        }

        let keys: Vec<Vec<u8>> = live.keys().cloned().collect();
        let plan = self.dispatch(&keys).await;
        let mut touched = Vec::with_capacity(plan.len());
        let mut failed: Vec<Vec<u8>> = Vec::new();
        for (server, bag) in plan {
            touched.push(server.addr().to_string());
            let subset: HashMap<Vec<u8>, Bytes> = bag
                .iter()
                .filter_map(|key| live.get(key).map(|v| (key.clone(), v.clone())))
                .collect();
            match server.set_multi(&subset).await {
                Ok((true, _)) => {}
                Ok((false, failures)) => failed.extend(failures),
                Err(err) => {
                    warn!(server = server.addr(), error = %err, "set_multi bag failed");
                    failed.extend(bag);
                }
            }
        }
        if !failed.is_empty() {
            failed.sort_unstable();
            failed.dedup();
            return Err(Error::write_failed_multi(failed, touched));
        }
        Ok(true)
    }

    /// Delete on every candidate; any refusal fails the operation. Deletes
    /// are strictly stronger than writes so a stale replica can never
    /// resurrect a key.
    async fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        let servers = self.candidates(key).await;
        let deletes = servers.iter().map(|server| server.delete(key));
        let results = future::join_all(deletes).await;
        let mut acked = true;
        for (server, result) in servers.iter().zip(results) {
            match result {
                Ok(true) => {}
                Ok(false) => acked = false,
                Err(err) => {
                    warn!(server = server.addr(), error = %err, "replica delete failed");
                    acked = false;
                }
            }
        }
        if !acked {
            return Err(Error::write_failed(key, addrs(&servers)));
        }
        Ok(true)
    }

    async fn delete_multi(&self, keys: &[Vec<u8>]) -> Result<bool, Error> {
        let plan = self.dispatch(keys).await;
        let mut touched = Vec::with_capacity(plan.len());
        let mut failed: Vec<Vec<u8>> = Vec::new();
        for (server, bag) in plan {
            touched.push(server.addr().to_string());
            match server.delete_multi(&bag).await {
                Ok((true, _)) => {}
                Ok((false, failures)) => failed.extend(failures),
                Err(err) => {
                    warn!(server = server.addr(), error = %err, "delete_multi bag failed");
                    failed.extend(bag);
                }
            }
        }
        if !failed.is_empty() {
            failed.sort_unstable();
            failed.dedup();
            return Err(Error::delete_failed_multi(failed, touched));
        }
        Ok(true)
    }

    /// Scan the per-hash listing on each candidate. A listing line naming
    /// the key with a positive version is existence.
    async fn exists(&self, key: &[u8]) -> Result<bool, Error> {
        let probe = format!("@{:08x}", fnv1a(key)).into_bytes();
        for server in self.candidates(key).await {
            let listing = match server.get(&probe).await? {
                Some(listing) => listing,
                None => continue,
            };
            for line in listing.split(|&b| b == b'\n') {
                let mut fields = line.split(|&b| b == b' ').filter(|f| !f.is_empty());
                if fields.next() != Some(key) {
                    continue;
                }
                let version = fields
                    .last()
                    .and_then(|f| std::str::from_utf8(f).ok())
                    .and_then(|f| f.trim().parse::<i64>().ok());
                if let Some(version) = version {
                    return Ok(version > 0);
                }
            }
        }
        Ok(false)
    }

    /// Ask every candidate and keep the freshest answer. Counters are
    /// best-effort: no quorum, diverged replicas read as their max.
    async fn incr(&self, key: &[u8], delta: u64) -> Result<u64, Error> {
        let servers = self.candidates(key).await;
        let bumps = servers.iter().map(|server| server.incr(key, delta));
        let results = future::join_all(bumps).await;
        let mut freshest = 0;
        for (server, result) in servers.iter().zip(results) {
            match result {
                Ok(value) => freshest = freshest.max(value),
                Err(err) => {
                    warn!(server = server.addr(), error = %err, "replica incr failed")
                }
            }
        }
        Ok(freshest)
    }
}
