//! Resolving a configuration document into a client. The document either
//! lists endpoints outright or maps out `servers` (data nodes) and `proxies`
//! (proxy fleet); offline jobs and callers that ask for it get the direct
//! router, everything else goes through the proxies. Supplying a cache
//! wraps the chosen router in the look-aside layer.

use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use serde_derive::Deserialize;

use crate::cache::{Cache, Cached, DelayCleaner};
use crate::client::{Connection, Error, NoCompressor, Storage};
use crate::direct::DirectClient;
use crate::proxy::ProxyClient;
use crate::store::Store;

/// A cluster configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Config {
    /// A bare list of endpoints, usable for either mode.
    Endpoints(Vec<String>),
    /// The full form naming both fleets.
    Cluster(ClusterConfig),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(default)]
    pub offline: bool,
}

impl Config {
    /// Parse a JSON configuration document.
    pub fn from_json(doc: &str) -> Result<Self, Error> {
        serde_json::from_str(doc)
            .map_err(|err| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, err)))
    }
}

/// Either router behind one type, so the choice of mode stays a
/// configuration detail.
pub enum Router<S> {
    Direct(DirectClient<S>),
    Proxy(ProxyClient<S>),
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $call:expr) => {
        match $self {
            Router::Direct($inner) => $call,
            Router::Proxy($inner) => $call,
        }
    };
}

#[async_trait]
impl<S: crate::store::Backend> Storage for Router<S> {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        delegate!(self, inner => inner.get(key).await)
    }

    async fn get_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Option<Bytes>>, Error> {
        delegate!(self, inner => inner.get_multi(keys).await)
    }

    async fn set(&self, key: &[u8], value: Option<&[u8]>) -> Result<bool, Error> {
        delegate!(self, inner => inner.set(key, value).await)
    }

    async fn set_multi(&self, values: &HashMap<Vec<u8>, Option<Bytes>>) -> Result<bool, Error> {
        delegate!(self, inner => inner.set_multi(values).await)
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        delegate!(self, inner => inner.delete(key).await)
    }

    async fn delete_multi(&self, keys: &[Vec<u8>]) -> Result<bool, Error> {
        delegate!(self, inner => inner.delete_multi(keys).await)
    }

    async fn exists(&self, key: &[u8]) -> Result<bool, Error> {
        delegate!(self, inner => inner.exists(key).await)
    }

    async fn incr(&self, key: &[u8], delta: u64) -> Result<u64, Error> {
        delegate!(self, inner => inner.incr(key, delta).await)
    }
}

/// Build the router a configuration calls for. `direct` forces the direct
/// router; an `offline` document does the same.
pub fn from_config<C: Connection>(
    config: &Config,
    direct: bool,
) -> Result<Router<Store<C, NoCompressor>>, Error> {
    let direct = direct || matches!(config, Config::Cluster(cluster) if cluster.offline);
    let nodes: &[String] = match config {
        Config::Endpoints(list) => list,
        Config::Cluster(cluster) => {
            if direct {
                &cluster.servers
            } else {
                &cluster.proxies
            }
        }
    };
    if nodes.is_empty() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "configuration names no endpoints for the selected mode",
        )));
    }
    if direct {
        Ok(Router::Direct(DirectClient::connect(nodes)?))
    } else {
        Ok(Router::Proxy(ProxyClient::connect(nodes)?))
    }
}

/// Like [`from_config`], fronted by the supplied cache. A delay cleaner
/// hands deferred invalidation to an external worker.
pub fn from_config_cached<C: Connection, M: Cache>(
    config: &Config,
    direct: bool,
    cache: M,
    delay_cleaner: Option<DelayCleaner>,
) -> Result<Cached<Router<Store<C, NoCompressor>>, M>, Error> {
    let router = from_config::<C>(config, direct)?;
    Ok(match delay_cleaner {
        Some(cleaner) => Cached::with_delay_cleaner(router, cache, cleaner),
        None => Cached::new(router, cache),
    })
}
