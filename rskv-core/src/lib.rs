//! This crate provides the core client libraries for rskv implementations
//! into various async runtimes. A cluster can be reached either directly
//! (bucket-aware placement with quorum writes over the data nodes) or through
//! a fleet of protocol-translating proxies (ordered failover with sticky
//! promotion), and either mode can be fronted by a memcache-style look-aside
//! cache. If compression is undesired, it is possible to disable the `zlib`
//! feature (on by default.)

pub mod bucket;
pub mod cache;
pub mod client;
pub mod config;
pub mod direct;
pub mod protocol;
pub mod proxy;
pub mod store;

#[cfg(feature = "zlib")]
pub mod zlib;

#[cfg(test)]
pub(crate) mod testutil;
