//! Tokio adapter for rskv. A [`TokioConnection`] speaks TCP through the
//! tokio runtime and honors the per-mode connect and poll deadlines, so the
//! runtime-agnostic client types from `rskv-core` can be used directly. For
//! example:
//!
//! ```ignore
//! use rskv_core::client::Storage;
//! use rskv_tokio::DirectClient;
//!
//! let db = DirectClient::connect(&["localhost:7900".into()])?;
//! db.set(b"key", Some(b"value")).await?;
//! ```

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use rskv_core::client::{Behavior, Connection, Error, NoCompressor};

pub use rskv_core::client::{Compressor, Storage};
#[cfg(feature = "zlib")]
pub use rskv_core::zlib::ZlibCompressor;

/// A store over a tokio TCP connection.
pub type Store<P = NoCompressor> = rskv_core::store::Store<TokioConnection, P>;
/// The direct router over tokio connections.
pub type DirectClient = rskv_core::direct::DirectClient<Store>;
/// The proxy router over tokio connections.
pub type ProxyClient = rskv_core::proxy::ProxyClient<Store>;
/// Either router, as resolved from configuration.
pub type Router = rskv_core::config::Router<Store>;

fn deadline(what: &str, after: Duration) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{} timed out after {:?}", what, after),
    ))
}

/// A TokioConnection uses the tokio runtime to form TCP connections to an
/// endpoint.
pub struct TokioConnection {
    stream: TcpStream,
    poll_timeout: Duration,
}

#[async_trait]
impl Connection for TokioConnection {
    async fn connect(addr: &str, behavior: &Behavior) -> Result<Self, Error> {
        let stream = timeout(behavior.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| deadline("connect", behavior.connect_timeout))??;
        stream.set_nodelay(true)?;
        Ok(TokioConnection {
            stream,
            poll_timeout: behavior.poll_timeout,
        })
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = timeout(self.poll_timeout, self.stream.read(buf))
            .await
            .map_err(|_| deadline("read", self.poll_timeout))??;
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        timeout(self.poll_timeout, self.stream.write_all(data))
            .await
            .map_err(|_| deadline("write", self.poll_timeout))??;
        Ok(())
    }
}
