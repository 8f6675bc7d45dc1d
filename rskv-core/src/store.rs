//! A [`Store`] wraps a single memcache-protocol endpoint behind a connection
//! pool. It implements [`Backend`] (the per-endpoint operation set the
//! routers dispatch over) and [`Cache`] (the same endpoint viewed as a
//! look-aside cache), and tracks consecutive transport failures so a dead
//! endpoint is benched instead of slowing every request down.

use std::collections::HashMap;
use std::io;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool::managed::{Object, PoolError};
use futures::lock::Mutex;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::client::{new_pool, Behavior, Compressor, ConnPool, Connection, Error, NoCompressor};
use crate::protocol::{self, ProtocolError};

const READ_CHUNK: usize = 4096;

/// Write one request and keep reading until the parser has a complete
/// response. The parser returning `Ok(None)` means "more bytes, please".
pub(crate) async fn exchange<C, T, F>(conn: &mut C, req: &[u8], parse: F) -> Result<T, Error>
where
    C: Connection,
    F: Fn(&[u8]) -> Result<Option<T>, ProtocolError>,
{
    conn.write(req).await?;
    let mut acc = Vec::new();
    let mut chunk = [0_u8; READ_CHUNK];
    loop {
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-response",
            )));
        }
        acc.extend_from_slice(&chunk[..n]);
        if let Some(parsed) = parse(&acc)? {
            return Ok(parsed);
        }
    }
}

#[derive(Debug, Default)]
struct Health {
    consecutive_failures: u32,
    benched_until: Option<Instant>,
}

/// A single endpoint of the data or proxy fleet.
pub struct Store<C: Connection, P: Compressor = NoCompressor> {
    addr: String,
    behavior: Behavior,
    compressor: P,
    pool: ConnPool<C>,
    health: Mutex<Health>,
}

impl<C: Connection> Store<C, NoCompressor> {
    /// Create a store for the endpoint with no value compression.
    pub fn new(addr: impl Into<String>, behavior: Behavior) -> Result<Self, Error> {
        Store::with_compressor(addr, behavior, NoCompressor)
    }
}

impl<C: Connection, P: Compressor> Store<C, P> {
    /// Create a store for the endpoint with the given compressor. No
    /// connection is made until the first operation checks one out.
    pub fn with_compressor(
        addr: impl Into<String>,
        behavior: Behavior,
        compressor: P,
    ) -> Result<Self, Error> {
        let addr = addr.into();
        let pool = new_pool(addr.clone(), behavior)?;
        Ok(Store {
            addr,
            behavior,
            compressor,
            pool,
            health: Mutex::new(Health::default()),
        })
    }

    async fn check_benched(&self) -> Result<(), Error> {
        let health = self.health.lock().await;
        if let Some(until) = health.benched_until {
            if Instant::now() < until {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    format!("{} marked dead after repeated failures", self.addr),
                )));
            }
        }
        Ok(())
    }

    async fn record_outcome<T>(&self, result: &Result<T, Error>) {
        match result {
            Err(Error::Io(_)) => {
                let mut health = self.health.lock().await;
                health.consecutive_failures += 1;
                if health.consecutive_failures >= self.behavior.failure_limit {
                    health.benched_until = Some(Instant::now() + self.behavior.retry_timeout);
                }
            }
            _ => {
                let mut health = self.health.lock().await;
                health.consecutive_failures = 0;
                health.benched_until = None;
            }
        }
    }

    /// One request/response cycle on a pooled connection, bracketed by the
    /// failure accounting. A connection that saw a transport error is torn
    /// down rather than returned to the pool.
    async fn round_trip<T, F>(&self, req: Vec<u8>, parse: F) -> Result<T, Error>
    where
        F: Fn(&[u8]) -> Result<Option<T>, ProtocolError>,
    {
        self.check_benched().await?;
        let result = self.round_trip_inner(req, parse).await;
        self.record_outcome(&result).await;
        result
    }

    async fn round_trip_inner<T, F>(&self, req: Vec<u8>, parse: F) -> Result<T, Error>
    where
        F: Fn(&[u8]) -> Result<Option<T>, ProtocolError>,
    {
        let mut conn = self.pool.get().await.map_err(|err| match err {
            PoolError::Backend(inner) => inner,
            other => Error::Io(io::Error::new(io::ErrorKind::Other, other.to_string())),
        })?;
        match exchange(&mut *conn, &req, parse).await {
            Ok(parsed) => Ok(parsed),
            Err(err) => {
                let _ = Object::take(conn);
                Err(err)
            }
        }
    }

    async fn delete_with_delay(&self, key: &[u8], delay: Option<u32>) -> Result<bool, Error> {
        let req = protocol::delete(key, delay)?;
        self.round_trip(req, protocol::parse_deleted).await
    }

    /// Decode one wire value, deleting the key when the payload turns out to
    /// be corrupt. The bad entry heals itself away instead of poisoning
    /// every future read.
    async fn decode(&self, key: &[u8], data: Bytes, flags: u32) -> Result<Option<Bytes>, Error> {
        match self.compressor.decompress(data, flags) {
            Ok(data) => Ok(Some(data)),
            Err(err) => {
                warn!(
                    server = self.addr.as_str(),
                    key = %String::from_utf8_lossy(key),
                    error = %err,
                    "undecodable value, deleting"
                );
                Backend::delete(self, key).await?;
                Ok(None)
            }
        }
    }
}

/// The operation set of a single endpoint. Routers dispatch over this trait,
/// which also gives tests a seam for scripted fakes.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// The network address, used for placement identity and error reports.
    fn addr(&self) -> &str;

    /// Look up one key, decoding the value flag. A miss is `Ok(None)`.
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error>;

    /// Look up one key without decoding, returning the raw 32-bit flag.
    async fn get_raw(&self, key: &[u8]) -> Result<Option<(Bytes, u32)>, Error>;

    /// Look up many keys in one round trip. Only found keys appear in the
    /// result.
    async fn get_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Bytes>, Error>;

    /// Write one key at the given revision.
    async fn set(&self, key: &[u8], value: &[u8], rev: i64) -> Result<bool, Error>;

    /// Write one key with an explicit flag, bypassing the compressor.
    async fn set_raw(&self, key: &[u8], value: &[u8], rev: i64, flags: u32)
        -> Result<bool, Error>;

    /// Write many keys, reporting the ones that failed.
    async fn set_multi(
        &self,
        values: &HashMap<Vec<u8>, Bytes>,
    ) -> Result<(bool, Vec<Vec<u8>>), Error>;

    /// Delete one key.
    async fn delete(&self, key: &[u8]) -> Result<bool, Error>;

    /// Delete many keys, reporting the ones that failed.
    async fn delete_multi(&self, keys: &[Vec<u8>]) -> Result<(bool, Vec<Vec<u8>>), Error>;

    /// Probe for existence without fetching the value.
    async fn exists(&self, key: &[u8]) -> Result<bool, Error>;

    /// Bump a counter. A missing counter reads as zero.
    async fn incr(&self, key: &[u8], delta: u64) -> Result<u64, Error>;
}

#[async_trait]
impl<C: Connection, P: Compressor> Backend for Store<C, P> {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        match self.get_raw(key).await? {
            Some((data, flags)) => self.decode(key, data, flags).await,
            None => Ok(None),
        }
    }

    async fn get_raw(&self, key: &[u8]) -> Result<Option<(Bytes, u32)>, Error> {
        let req = protocol::get(&[key])?;
        let values = self.round_trip(req, protocol::parse_values).await?;
        Ok(values
            .into_iter()
            .find(|v| v.key == key)
            .map(|v| (v.data, v.flags)))
    }

    async fn get_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Bytes>, Error> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let req = protocol::get(&refs)?;
        let values = self.round_trip(req, protocol::parse_values).await?;
        let mut out = HashMap::with_capacity(values.len());
        for v in values {
            if let Some(data) = self.decode(&v.key, v.data, v.flags).await? {
                out.insert(v.key, data);
            }
        }
        Ok(out)
    }

    async fn set(&self, key: &[u8], value: &[u8], rev: i64) -> Result<bool, Error> {
        let (data, flags) = self.compressor.compress(value.to_vec())?;
        self.set_raw(key, &data, rev, flags).await
    }

    async fn set_raw(
        &self,
        key: &[u8],
        value: &[u8],
        rev: i64,
        flags: u32,
    ) -> Result<bool, Error> {
        if rev < 0 {
            return Err(Error::InvalidRevision(rev));
        }
        let req = protocol::set(key, flags, rev as u32, value)?;
        self.round_trip(req, protocol::parse_stored).await
    }

    async fn set_multi(
        &self,
        values: &HashMap<Vec<u8>, Bytes>,
    ) -> Result<(bool, Vec<Vec<u8>>), Error> {
        let mut failures = Vec::new();
        for (key, value) in values {
            match Backend::set(self, key, value, 0).await {
                Ok(true) => {}
                Ok(false) => failures.push(key.clone()),
                Err(err) => {
                    debug!(server = self.addr.as_str(), error = %err, "set_multi entry failed");
                    failures.push(key.clone());
                }
            }
        }
        Ok((failures.is_empty(), failures))
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        self.delete_with_delay(key, None).await
    }

    async fn delete_multi(&self, keys: &[Vec<u8>]) -> Result<(bool, Vec<Vec<u8>>), Error> {
        let mut failures = Vec::new();
        for key in keys {
            match self.delete_with_delay(key, None).await {
                Ok(true) => {}
                Ok(false) => failures.push(key.clone()),
                Err(err) => {
                    debug!(server = self.addr.as_str(), error = %err, "delete_multi entry failed");
                    failures.push(key.clone());
                }
            }
        }
        Ok((failures.is_empty(), failures))
    }

    async fn exists(&self, key: &[u8]) -> Result<bool, Error> {
        // "?<key>" asks the server for existence without the value payload.
        let mut probe = Vec::with_capacity(key.len() + 1);
        probe.push(b'?');
        probe.extend_from_slice(key);
        let found = self.get_raw(&probe).await?;
        Ok(found.map_or(false, |(data, _)| !data.is_empty()))
    }

    async fn incr(&self, key: &[u8], delta: u64) -> Result<u64, Error> {
        let req = protocol::incr(key, delta)?;
        self.round_trip(req, protocol::parse_incr).await
    }
}

/// A [`Store`] is itself a memcache client, so it doubles as the look-aside
/// cache in front of a router. Expirations ride the same wire slot the data
/// fleet uses for revisions.
#[async_trait]
impl<C: Connection, P: Compressor> Cache for Store<C, P> {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        Backend::get(self, key).await
    }

    async fn get_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Bytes>, Error> {
        Backend::get_multi(self, keys).await
    }

    async fn set(&self, key: &[u8], value: &[u8], expire: u32) -> Result<bool, Error> {
        let (data, flags) = self.compressor.compress(value.to_vec())?;
        let req = protocol::set(key, flags, expire, &data)?;
        self.round_trip(req, protocol::parse_stored).await
    }

    async fn set_multi(
        &self,
        values: &HashMap<Vec<u8>, Bytes>,
        expire: u32,
    ) -> Result<bool, Error> {
        let mut ok = true;
        for (key, value) in values {
            ok &= Cache::set(self, key, value, expire).await?;
        }
        Ok(ok)
    }

    async fn delete(&self, key: &[u8], delay: u32) -> Result<bool, Error> {
        let delay = if delay == 0 { None } else { Some(delay) };
        self.delete_with_delay(key, delay).await
    }

    async fn delete_multi(&self, keys: &[Vec<u8>], delay: u32) -> Result<bool, Error> {
        let mut ok = true;
        for key in keys {
            ok &= Cache::delete(self, key, delay).await?;
        }
        Ok(ok)
    }
}
