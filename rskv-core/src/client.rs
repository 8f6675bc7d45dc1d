//! This module defines the interfaces shared by every part of the client:
//! the error surface, the behavior tuning applied to each endpoint, the
//! [`Connection`] trait a runtime adapter implements, the [`Compressor`]
//! seam for value encoding, the per-endpoint connection pool, and the
//! [`Storage`] trait exposed by all routers. Regardless of the async runtime
//! used, all implementations share this interface.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool::managed::{self, RecycleError, RecycleResult};

use crate::protocol::{self, ProtocolError};

/// The most keys a single multi-key retrieval may carry. Larger requests are
/// split into chunks of this size before they reach the wire.
pub const MAX_KEYS_IN_GET_MULTI: usize = 200;

/// Connections kept per endpoint pool.
const POOL_SIZE: usize = 16;

/// An error raised while talking to the cluster.
#[derive(Debug)]
pub enum Error {
    /// An error communicating over the wire.
    Io(std::io::Error),
    /// An error caused by a malformed request or response.
    Protocol(ProtocolError),
    /// A negative revision was passed to a store write.
    InvalidRevision(i64),
    /// Every replica or proxy failed a read.
    ReadFailed {
        keys: Vec<Vec<u8>>,
        servers: Vec<String>,
    },
    /// A write did not reach its quorum, or a proxied write exhausted the
    /// proxy list.
    WriteFailed {
        keys: Vec<Vec<u8>>,
        servers: Vec<String>,
    },
    /// A multi-key delete left unacknowledged keys behind.
    DeleteFailed {
        keys: Vec<Vec<u8>>,
        servers: Vec<String>,
    },
}

impl Error {
    pub(crate) fn read_failed(key: &[u8], servers: Vec<String>) -> Self {
        Error::ReadFailed {
            keys: vec![key.to_vec()],
            servers,
        }
    }

    pub(crate) fn read_failed_multi(keys: Vec<Vec<u8>>, servers: Vec<String>) -> Self {
        Error::ReadFailed { keys, servers }
    }

    pub(crate) fn write_failed(key: &[u8], servers: Vec<String>) -> Self {
        Error::WriteFailed {
            keys: vec![key.to_vec()],
            servers,
        }
    }

    pub(crate) fn write_failed_multi(keys: Vec<Vec<u8>>, servers: Vec<String>) -> Self {
        Error::WriteFailed { keys, servers }
    }

    pub(crate) fn delete_failed_multi(keys: Vec<Vec<u8>>, servers: Vec<String>) -> Self {
        Error::DeleteFailed { keys, servers }
    }
}

fn fmt_keys(keys: &[Vec<u8>]) -> String {
    keys.iter()
        .map(|k| String::from_utf8_lossy(k).into_owned())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Error::Io(err) => write!(f, "IoError: {}", err),
            Error::Protocol(err) => write!(f, "ProtocolError: {}", err),
            Error::InvalidRevision(rev) => write!(f, "invalid revision: {}", rev),
            Error::ReadFailed { keys, servers } => {
                write!(f, "read [{}] failed({:?})", fmt_keys(keys), servers)
            }
            Error::WriteFailed { keys, servers } => {
                write!(f, "write [{}] failed({:?})", fmt_keys(keys), servers)
            }
            Error::DeleteFailed { keys, servers } => {
                write!(f, "delete [{}] failed({:?})", fmt_keys(keys), servers)
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Protocol(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

/// The failure kinds stay within the I/O error category so callers that only
/// understand [`std::io::Error`] keep working.
impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        match err {
            Error::Io(inner) => inner,
            other => {
                let kind = match &other {
                    Error::Protocol(_) => ErrorKind::InvalidData,
                    Error::InvalidRevision(_) => ErrorKind::InvalidInput,
                    _ => ErrorKind::Other,
                };
                std::io::Error::new(kind, other.to_string())
            }
        }
    }
}

/// Tuning applied to every connection of one endpoint. The direct and
/// proxied presets are part of the client contract: data nodes get tight
/// connect deadlines and a short retry window, proxies get a looser poll
/// deadline and a longer ban after repeated failures.
#[derive(Debug, Clone, Copy)]
pub struct Behavior {
    /// Deadline for establishing a TCP connection.
    pub connect_timeout: Duration,
    /// Deadline for any single read or write on an established connection.
    pub poll_timeout: Duration,
    /// Consecutive transport failures before the endpoint is benched.
    pub failure_limit: u32,
    /// How long a benched endpoint stays out of rotation.
    pub retry_timeout: Duration,
}

impl Behavior {
    /// Preset for talking to data nodes directly.
    pub fn direct() -> Self {
        Behavior {
            connect_timeout: Duration::from_millis(300),
            poll_timeout: Duration::from_secs(3),
            failure_limit: 4,
            retry_timeout: Duration::from_secs(5),
        }
    }

    /// Preset for talking through the proxy fleet.
    pub fn proxied() -> Self {
        Behavior {
            connect_timeout: Duration::from_millis(100),
            poll_timeout: Duration::from_secs(5),
            failure_limit: 4,
            retry_timeout: Duration::from_secs(10),
        }
    }
}

/// A connection is an async interface to one endpoint, which requires a
/// concrete implementation using an underlying async runtime (e.g. tokio or
/// async-std.) Implementations are expected to honor the connect and poll
/// deadlines from the supplied [`Behavior`].
#[async_trait]
pub trait Connection: Sized + Send + Sync + 'static {
    /// Connect to an endpoint over TCP.
    async fn connect(addr: &str, behavior: &Behavior) -> Result<Self, Error>;

    /// Read into the buffer, returning the number of bytes read.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Write an entire buffer to the stream.
    async fn write(&mut self, data: &[u8]) -> Result<(), Error>;
}

/// A Compressor is used to implement compression of stored values, carried
/// in the 32-bit value flag. A default implementation is provided for
/// [`NoCompressor`], as well as `ZlibCompressor` behind the `zlib` feature.
pub trait Compressor: Clone + Copy + Send + Sync + 'static {
    /// Consume a value about to be written, returning the encoded bytes and
    /// the flag to store alongside them.
    fn compress(&self, value: Vec<u8>) -> Result<(Vec<u8>, u32), Error>;

    /// Decode a value read from the wire according to its flag. An error
    /// here means the payload is corrupt; the store reacts by deleting the
    /// key and reporting a miss.
    fn decompress(&self, value: Bytes, flags: u32) -> Result<Bytes, Error>;
}

/// An implementation of [`Compressor`] that does nothing. This is useful if
/// you want to disable compression.
#[derive(Debug, Clone, Copy)]
pub struct NoCompressor;

impl Compressor for NoCompressor {
    fn compress(&self, value: Vec<u8>) -> Result<(Vec<u8>, u32), Error> {
        Ok((value, 0))
    }

    fn decompress(&self, value: Bytes, _flags: u32) -> Result<Bytes, Error> {
        Ok(value)
    }
}

/// Creates and recycles connections for one endpoint. Recycling sends a
/// `version` probe so a dead connection never gets handed back out.
pub(crate) struct ConnManager<C: Connection> {
    addr: String,
    behavior: Behavior,
    _conn: PhantomData<fn() -> C>,
}

impl<C: Connection> ConnManager<C> {
    pub(crate) fn new(addr: String, behavior: Behavior) -> Self {
        ConnManager {
            addr,
            behavior,
            _conn: PhantomData,
        }
    }
}

#[async_trait]
impl<C: Connection> managed::Manager for ConnManager<C> {
    type Type = C;
    type Error = Error;

    async fn create(&self) -> Result<C, Error> {
        C::connect(&self.addr, &self.behavior).await
    }

    async fn recycle(&self, conn: &mut C) -> RecycleResult<Error> {
        crate::store::exchange(conn, &protocol::version(), protocol::parse_version)
            .await
            .map_err(RecycleError::Backend)?;
        Ok(())
    }
}

/// A pool of connections to a single endpoint. Pooling eliminates the
/// overhead of constantly recreating TCP connections while bounding how many
/// are open at a time, and it keeps each connection confined to one caller
/// until it is returned.
pub(crate) type ConnPool<C> = managed::Pool<ConnManager<C>>;

pub(crate) fn new_pool<C: Connection>(addr: String, behavior: Behavior) -> Result<ConnPool<C>, Error> {
    ConnPool::builder(ConnManager::new(addr, behavior))
        .max_size(POOL_SIZE)
        .build()
        .map_err(|err| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            ))
        })
}

/// The operation surface shared by both routers and the cache wrapper.
///
/// Absent values read as `Ok(None)` and multi-key reads report every
/// requested key, mapping the missing ones to `None`; only transport-level
/// exhaustion surfaces as an error.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Look up one key.
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error>;

    /// Look up many keys. The result covers every requested key.
    async fn get_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Option<Bytes>>, Error>;

    /// Write one key. A `None` value means "delete this key".
    async fn set(&self, key: &[u8], value: Option<&[u8]>) -> Result<bool, Error>;

    /// Write many keys. `None` values are deletions.
    async fn set_multi(&self, values: &HashMap<Vec<u8>, Option<Bytes>>) -> Result<bool, Error>;

    /// Delete one key.
    async fn delete(&self, key: &[u8]) -> Result<bool, Error>;

    /// Delete many keys.
    async fn delete_multi(&self, keys: &[Vec<u8>]) -> Result<bool, Error>;

    /// Whether the store holds the key.
    async fn exists(&self, key: &[u8]) -> Result<bool, Error>;

    /// Bump a counter, returning its new value.
    async fn incr(&self, key: &[u8], delta: u64) -> Result<u64, Error>;
}

/// A shared handle is as good as the thing it shares.
#[async_trait]
impl<T: Storage + ?Sized> Storage for std::sync::Arc<T> {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        (**self).get(key).await
    }

    async fn get_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Option<Bytes>>, Error> {
        (**self).get_multi(keys).await
    }

    async fn set(&self, key: &[u8], value: Option<&[u8]>) -> Result<bool, Error> {
        (**self).set(key, value).await
    }

    async fn set_multi(&self, values: &HashMap<Vec<u8>, Option<Bytes>>) -> Result<bool, Error> {
        (**self).set_multi(values).await
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        (**self).delete(key).await
    }

    async fn delete_multi(&self, keys: &[Vec<u8>]) -> Result<bool, Error> {
        (**self).delete_multi(keys).await
    }

    async fn exists(&self, key: &[u8]) -> Result<bool, Error> {
        (**self).exists(key).await
    }

    async fn incr(&self, key: &[u8], delta: u64) -> Result<u64, Error> {
        (**self).incr(key, delta).await
    }
}
