//! A look-aside cache in front of a router. Reads prefer the cache and
//! backfill it with a long expiration. Writes go to the store first, then
//! land in the cache with a short expiration followed by a deferred delete:
//! under concurrent writers a plain set-after-write can pin a stale value
//! forever, while the short expiration bounds the stale window and the
//! delayed delete clears whatever raced in during it.
//!
//! The cache may also hold a sentinel value marking a key as known-absent.
//! This client never writes the sentinel, but it must read it as a miss and
//! clear it once the store has confirmed the absence.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::client::{Error, Storage};

/// Marks a key the underlying store is known not to have. Compared against
/// exact bytes; truthiness is not enough.
pub const EMPTY_SLOT: &[u8] = b"__empty_slot__##";

/// Short expiration for freshly-written values, in seconds.
pub const ONE_MINUTE: u32 = 60;
/// Long expiration for read-through backfills, in seconds.
pub const ONE_DAY: u32 = 24 * 3600;

/// The memcache-shaped surface the wrapper needs from a cache. Expirations
/// are seconds; a delete with a non-zero delay hides the key for that long.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error>;

    /// Only found keys appear in the result.
    async fn get_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Bytes>, Error>;

    async fn set(&self, key: &[u8], value: &[u8], expire: u32) -> Result<bool, Error>;

    async fn set_multi(&self, values: &HashMap<Vec<u8>, Bytes>, expire: u32)
        -> Result<bool, Error>;

    async fn delete(&self, key: &[u8], delay: u32) -> Result<bool, Error>;

    async fn delete_multi(&self, keys: &[Vec<u8>], delay: u32) -> Result<bool, Error>;
}

#[async_trait]
impl<T: Cache + ?Sized> Cache for std::sync::Arc<T> {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        (**self).get(key).await
    }

    async fn get_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Bytes>, Error> {
        (**self).get_multi(keys).await
    }

    async fn set(&self, key: &[u8], value: &[u8], expire: u32) -> Result<bool, Error> {
        (**self).set(key, value, expire).await
    }

    async fn set_multi(
        &self,
        values: &HashMap<Vec<u8>, Bytes>,
        expire: u32,
    ) -> Result<bool, Error> {
        (**self).set_multi(values, expire).await
    }

    async fn delete(&self, key: &[u8], delay: u32) -> Result<bool, Error> {
        (**self).delete(key, delay).await
    }

    async fn delete_multi(&self, keys: &[Vec<u8>], delay: u32) -> Result<bool, Error> {
        (**self).delete_multi(keys, delay).await
    }
}

/// A caller-supplied hook that queues a deferred cache invalidation on an
/// external worker, replacing the inline delayed delete.
pub type DelayCleaner = Box<dyn Fn(&[u8]) + Send + Sync>;

/// A store wrapped with a look-aside cache.
pub struct Cached<S, M> {
    store: S,
    cache: M,
    delay_cleaner: Option<DelayCleaner>,
}

impl<S: Storage, M: Cache> Cached<S, M> {
    /// Wrap a store; invalidations use the inline delayed-delete discipline.
    pub fn new(store: S, cache: M) -> Self {
        Cached {
            store,
            cache,
            delay_cleaner: None,
        }
    }

    /// Wrap a store, delegating deferred invalidation to the cleaner.
    pub fn with_delay_cleaner(store: S, cache: M, cleaner: DelayCleaner) -> Self {
        Cached {
            store,
            cache,
            delay_cleaner: Some(cleaner),
        }
    }

    /// Borrow the wrapped store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Queue the deferred invalidation for one key. Cache trouble on this
    /// path is logged and swallowed; the store already holds the truth and
    /// the entry expires on its own.
    async fn schedule_clean(&self, key: &[u8]) {
        match &self.delay_cleaner {
            Some(cleaner) => cleaner(key),
            None => {
                if let Err(err) = self.cache.delete(key, ONE_MINUTE).await {
                    warn!(error = %err, "deferred cache delete failed");
                }
            }
        }
    }

    async fn schedule_clean_multi(&self, keys: &[Vec<u8>]) {
        match &self.delay_cleaner {
            Some(cleaner) => {
                for key in keys {
                    cleaner(key);
                }
            }
            None => {
                if let Err(err) = self.cache.delete_multi(keys, ONE_MINUTE).await {
                    warn!(error = %err, "deferred cache delete failed");
                }
            }
        }
    }

    /// Short-expire set now, deferred delete later. Even if another writer
    /// overwrites the short-lived entry, the deferred delete still lands.
    async fn set_with_expire(&self, key: &[u8], value: &[u8]) {
        if let Err(err) = self.cache.set(key, value, ONE_MINUTE).await {
            warn!(error = %err, "cache set failed");
        }
        self.schedule_clean(key).await;
    }

    async fn set_multi_with_expire(&self, values: &HashMap<Vec<u8>, Bytes>, keys: &[Vec<u8>]) {
        if let Err(err) = self.cache.set_multi(values, ONE_MINUTE).await {
            warn!(error = %err, "cache set failed");
        }
        self.schedule_clean_multi(keys).await;
    }

    /// Prompt delete now, deferred delete later.
    async fn delete_with_delay(&self, key: &[u8]) {
        if let Err(err) = self.cache.delete(key, 0).await {
            warn!(error = %err, "cache delete failed");
        }
        self.schedule_clean(key).await;
    }

    async fn delete_multi_with_delay(&self, keys: &[Vec<u8>]) {
        if let Err(err) = self.cache.delete_multi(keys, 0).await {
            warn!(error = %err, "cache delete failed");
        }
        self.schedule_clean_multi(keys).await;
    }
}

#[async_trait]
impl<S: Storage, M: Cache> Storage for Cached<S, M> {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        let cached = self.cache.get(key).await?;
        if let Some(value) = &cached {
            if value.as_ref() != EMPTY_SLOT {
                return Ok(cached);
            }
        }
        match self.store.get(key).await? {
            Some(value) => {
                self.cache.set(key, &value, ONE_DAY).await?;
                Ok(Some(value))
            }
            None => {
                // A stale sentinel is cleared once the store confirms the
                // absence; the next miss can re-establish it.
                if cached.is_some() {
                    self.cache.delete(key, 0).await?;
                }
                Ok(None)
            }
        }
    }

    async fn get_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Option<Bytes>>, Error> {
        let cached = self.cache.get_multi(keys).await?;
        let mut out: HashMap<Vec<u8>, Option<Bytes>> = HashMap::with_capacity(keys.len());
        let mut unresolved: Vec<Vec<u8>> = Vec::new();
        for key in keys {
            match cached.get(key) {
                Some(value) if value.as_ref() != EMPTY_SLOT => {
                    out.insert(key.clone(), Some(value.clone()));
                }
                _ => unresolved.push(key.clone()),
            }
        }
        if !unresolved.is_empty() {
            let fetched = self.store.get_multi(&unresolved).await?;
            let mut backfill: HashMap<Vec<u8>, Bytes> = HashMap::new();
            for (key, value) in fetched {
                if let Some(value) = &value {
                    backfill.insert(key.clone(), value.clone());
                }
                out.insert(key, value);
            }
            if !backfill.is_empty() {
                self.cache.set_multi(&backfill, ONE_DAY).await?;
            }
        }
        Ok(out)
    }

    async fn set(&self, key: &[u8], value: Option<&[u8]>) -> Result<bool, Error> {
        let stored = match value {
            Some(value) => self.store.set(key, Some(value)).await,
            None => {
                debug!(key = %String::from_utf8_lossy(key), "deleting explicitly via nil set");
                self.store.delete(key).await
            }
        };
        match stored {
            Ok(_) => {
                match value {
                    Some(value) => self.set_with_expire(key, value).await,
                    None => self.delete_with_delay(key).await,
                }
                Ok(true)
            }
            Err(err) => {
                // The cache must not keep a value the store refused.
                self.delete_with_delay(key).await;
                Err(err)
            }
        }
    }

    async fn set_multi(&self, values: &HashMap<Vec<u8>, Option<Bytes>>) -> Result<bool, Error> {
        let keys: Vec<Vec<u8>> = values.keys().cloned().collect();
        match self.store.set_multi(values).await {
            Ok(_) => {
                let live: HashMap<Vec<u8>, Bytes> = values
                    .iter()
                    .filter_map(|(key, value)| value.clone().map(|v| (key.clone(), v)))
                    .collect();
                self.set_multi_with_expire(&live, &keys).await;
                Ok(true)
            }
            Err(err) => {
                self.delete_multi_with_delay(&keys).await;
                Err(err)
            }
        }
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        let result = self.store.delete(key).await;
        self.delete_with_delay(key).await;
        result
    }

    async fn delete_multi(&self, keys: &[Vec<u8>]) -> Result<bool, Error> {
        let result = self.store.delete_multi(keys).await;
        self.delete_multi_with_delay(keys).await;
        result
    }

    async fn exists(&self, key: &[u8]) -> Result<bool, Error> {
        match self.cache.get(key).await? {
            Some(value) if value.as_ref() != EMPTY_SLOT => Ok(true),
            _ => self.store.exists(key).await,
        }
    }

    async fn incr(&self, key: &[u8], delta: u64) -> Result<u64, Error> {
        let result = self.store.incr(key, delta).await;
        self.delete_with_delay(key).await;
        result
    }
}
