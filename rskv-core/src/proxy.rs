//! The proxy router reaches the cluster through protocol-translating proxy
//! nodes. Proxies are tried in order; a failing proxy is rotated to the
//! tail, a proxy that answers from deeper in the list is promoted to the
//! head, and every `rechoose_period` the first two entries swap so a warm
//! TCP connection exists on more than one proxy. Without the swap, the
//! primary dying would send every client connecting to a cold proxy at once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::lock::Mutex;
use rand::seq::SliceRandom;
use tracing::warn;

use crate::client::{Behavior, Connection, Error, NoCompressor, Storage, MAX_KEYS_IN_GET_MULTI};
use crate::store::{Backend, Store};

/// How often the head pair swaps.
pub const DEFAULT_RECHOOSE_PERIOD: Duration = Duration::from_secs(60);

struct Rotation {
    order: Vec<usize>,
    rechoose_at: Instant,
}

/// A client that reaches the cluster through a fleet of proxies, treating
/// each one as an opaque store.
pub struct ProxyClient<S> {
    servers: Vec<Arc<S>>,
    rechoose_period: Duration,
    rotation: Mutex<Rotation>,
}

impl<C: Connection> ProxyClient<Store<C, NoCompressor>> {
    /// Connect to the proxy fleet at the given addresses with the
    /// proxied-mode behavior preset.
    pub fn connect(addrs: &[String]) -> Result<Self, Error> {
        let stores = addrs
            .iter()
            .map(|addr| Store::new(addr.clone(), Behavior::proxied()).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_stores(stores))
    }
}

impl<S: Backend> ProxyClient<S> {
    /// Assemble a client over already-built proxy stores. The initial order
    /// is shuffled so a fleet of clients spreads its first choices.
    pub fn from_stores(servers: Vec<Arc<S>>) -> Self {
        let mut order: Vec<usize> = (0..servers.len()).collect();
        order.shuffle(&mut rand::thread_rng());
        ProxyClient {
            servers,
            rechoose_period: DEFAULT_RECHOOSE_PERIOD,
            rotation: Mutex::new(Rotation {
                order,
                rechoose_at: Instant::now() + DEFAULT_RECHOOSE_PERIOD,
            }),
        }
    }

    /// Override the rechoose period. The first swap happens one period from
    /// now.
    pub fn with_rechoose_period(self, period: Duration) -> Self {
        let Rotation { order, .. } = self.rotation.into_inner();
        ProxyClient {
            servers: self.servers,
            rechoose_period: period,
            rotation: Mutex::new(Rotation {
                order,
                rechoose_at: Instant::now() + period,
            }),
        }
    }

    /// The current proxy order, freshest preference first.
    pub async fn server_addrs(&self) -> Vec<String> {
        let rotation = self.rotation.lock().await;
        rotation
            .order
            .iter()
            .map(|&i| self.servers[i].addr().to_string())
            .collect()
    }

    /// Snapshot the order for one dispatch, swapping the head pair first if
    /// the rechoose deadline has passed.
    async fn line_up(&self) -> Vec<(usize, Arc<S>)> {
        let mut rotation = self.rotation.lock().await;
        let now = Instant::now();
        if now >= rotation.rechoose_at {
            if rotation.order.len() >= 2 {
                rotation.order.swap(0, 1);
            }
            rotation.rechoose_at = now + self.rechoose_period;
        }
        rotation
            .order
            .iter()
            .map(|&i| (i, self.servers[i].clone()))
            .collect()
    }

    /// Send a failing proxy to the back of the line.
    async fn demote(&self, server: usize) {
        let mut rotation = self.rotation.lock().await;
        if let Some(pos) = rotation.order.iter().position(|&i| i == server) {
            rotation.order.remove(pos);
            rotation.order.push(server);
        }
    }

    /// Rotate a proxy that answered to the head of the line.
    async fn promote(&self, server: usize) {
        let mut rotation = self.rotation.lock().await;
        if let Some(pos) = rotation.order.iter().position(|&i| i == server) {
            if pos > 0 {
                rotation.order.rotate_left(pos);
            }
        }
    }

    async fn get_chunk(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Option<Bytes>>, Error> {
        let lineup = self.line_up().await;
        for (pos, (server, proxy)) in lineup.iter().enumerate() {
            match proxy.get_multi(keys).await {
                Ok(mut found) => {
                    if pos > 0 {
                        self.promote(*server).await;
                    }
                    return Ok(keys
                        .iter()
                        .map(|key| (key.clone(), found.remove(key)))
                        .collect());
                }
                Err(err) => {
                    warn!(server = proxy.addr(), error = %err, "proxy get_multi failed");
                    self.demote(*server).await;
                }
            }
        }
        warn!("all proxies failed reading");
        Err(Error::read_failed_multi(
            keys.to_vec(),
            lineup.iter().map(|(_, p)| p.addr().to_string()).collect(),
        ))
    }
}

fn lineup_addrs<S: Backend>(lineup: &[(usize, Arc<S>)]) -> Vec<String> {
    lineup.iter().map(|(_, p)| p.addr().to_string()).collect()
}

#[async_trait]
impl<S: Backend> Storage for ProxyClient<S> {
    /// A clean miss from a proxy is an answer, not a failure; only
    /// transport errors move the line along.
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        let lineup = self.line_up().await;
        for (pos, (server, proxy)) in lineup.iter().enumerate() {
            match proxy.get(key).await {
                Ok(value) => {
                    if pos > 0 {
                        self.promote(*server).await;
                    }
                    return Ok(value);
                }
                Err(err) => {
                    warn!(server = proxy.addr(), error = %err, "proxy get failed");
                    self.demote(*server).await;
                }
            }
        }
        warn!(key = %String::from_utf8_lossy(key), "all proxies failed reading");
        Err(Error::read_failed(key, lineup_addrs(&lineup)))
    }

    async fn get_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Option<Bytes>>, Error> {
        let mut out = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_KEYS_IN_GET_MULTI) {
            out.extend(self.get_chunk(chunk).await?);
        }
        Ok(out)
    }

    /// A nil write is refused locally; nothing is sent.
    async fn set(&self, key: &[u8], value: Option<&[u8]>) -> Result<bool, Error> {
        let value = match value {
            Some(value) => value,
            None => return Ok(false),
        };
        let lineup = self.line_up().await;
        for (pos, (server, proxy)) in lineup.iter().enumerate() {
            match proxy.set(key, value, 0).await {
                Ok(true) => {
                    if pos > 0 {
                        self.promote(*server).await;
                    }
                    return Ok(true);
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(server = proxy.addr(), error = %err, "proxy set failed");
                    self.demote(*server).await;
                }
            }
        }
        warn!(key = %String::from_utf8_lossy(key), "all proxies failed writing");
        Err(Error::write_failed(key, lineup_addrs(&lineup)))
    }

    /// Each proxy gets the keys every earlier proxy failed to store; only
    /// the residual that survives the whole list is an error.
    async fn set_multi(&self, values: &HashMap<Vec<u8>, Option<Bytes>>) -> Result<bool, Error> {
        let doomed: Vec<Vec<u8>> = values
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(key, _)| key.clone())
            .collect();
        if !doomed.is_empty() {
            self.delete_multi(&doomed).await?;
        }

        let mut residual: HashMap<Vec<u8>, Bytes> = values
            .iter()
            .filter_map(|(key, value)| value.clone().map(|v| (key.clone(), v)))
            .collect();
        if residual.is_empty() {
            return Ok(true);
        }

        let lineup = self.line_up().await;
        for (pos, (server, proxy)) in lineup.iter().enumerate() {
            match proxy.set_multi(&residual).await {
                Ok((true, _)) => {
                    if pos > 0 {
                        self.promote(*server).await;
                    }
                    return Ok(true);
                }
                Ok((false, failures)) => {
                    let keep: HashSet<Vec<u8>> = failures.into_iter().collect();
                    residual.retain(|key, _| keep.contains(key));
                    if residual.is_empty() {
                        return Ok(true);
                    }
                }
                Err(err) => {
                    warn!(server = proxy.addr(), error = %err, "proxy set_multi failed");
                    self.demote(*server).await;
                }
            }
        }
        Err(Error::write_failed_multi(
            residual.into_keys().collect(),
            lineup_addrs(&lineup),
        ))
    }

    /// Deletes stay lenient: a fully exhausted list reports `false` rather
    /// than raising, which long-standing callers depend on.
    async fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        let lineup = self.line_up().await;
        for (pos, (server, proxy)) in lineup.iter().enumerate() {
            match proxy.delete(key).await {
                Ok(true) => {
                    if pos > 0 {
                        self.promote(*server).await;
                    }
                    return Ok(true);
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(server = proxy.addr(), error = %err, "proxy delete failed");
                    self.demote(*server).await;
                }
            }
        }
        warn!(key = %String::from_utf8_lossy(key), "all proxies failed deleting");
        Ok(false)
    }

    async fn delete_multi(&self, keys: &[Vec<u8>]) -> Result<bool, Error> {
        let mut residual = keys.to_vec();
        let lineup = self.line_up().await;
        for (pos, (server, proxy)) in lineup.iter().enumerate() {
            match proxy.delete_multi(&residual).await {
                Ok((true, _)) => {
                    if pos > 0 {
                        self.promote(*server).await;
                    }
                    return Ok(true);
                }
                Ok((false, failures)) => {
                    residual = failures;
                    if residual.is_empty() {
                        return Ok(true);
                    }
                }
                Err(err) => {
                    warn!(server = proxy.addr(), error = %err, "proxy delete_multi failed");
                    self.demote(*server).await;
                }
            }
        }
        warn!("all proxies failed deleting");
        Ok(false)
    }

    async fn exists(&self, key: &[u8]) -> Result<bool, Error> {
        let lineup = self.line_up().await;
        for (pos, (server, proxy)) in lineup.iter().enumerate() {
            match proxy.exists(key).await {
                Ok(found) => {
                    if pos > 0 {
                        self.promote(*server).await;
                    }
                    return Ok(found);
                }
                Err(err) => {
                    warn!(server = proxy.addr(), error = %err, "proxy exists failed");
                    self.demote(*server).await;
                }
            }
        }
        Ok(false)
    }

    async fn incr(&self, key: &[u8], delta: u64) -> Result<u64, Error> {
        let lineup = self.line_up().await;
        for (pos, (server, proxy)) in lineup.iter().enumerate() {
            match proxy.incr(key, delta).await {
                Ok(value) if value > 0 => {
                    if pos > 0 {
                        self.promote(*server).await;
                    }
                    return Ok(value);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(server = proxy.addr(), error = %err, "proxy incr failed");
                    self.demote(*server).await;
                }
            }
        }
        Ok(0)
    }
}
