// src/ingest/cache.rs
//! TTL read-through cache in front of provider calls.
//!
//! Values are raw response bodies keyed by [`FetchRequest::cache_key`]. The
//! value is stored only after the loaded payload was validated and written,
//! so a hit means the data is already in the record store.
//!
//! [`FetchRequest::cache_key`]: crate::ingest::types::FetchRequest::cache_key

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use tokio::time::Instant;

use crate::error::IngestError;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub expires_at: Instant,
}

/// Key-value collaborator behind the cache (in-process here, Redis-like
/// stores elsewhere).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, IngestError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), IngestError>;
    async fn delete(&self, key: &str) -> Result<(), IngestError>;

    /// Drop expired entries; returns how many were removed. Stores with
    /// native expiry have nothing to do.
    async fn purge_expired(&self) -> Result<usize, IngestError> {
        Ok(0)
    }
}

/// Sharded in-memory store: concurrent reads, per-key serialized writes.
/// Expired entries are dropped lazily on read or by [`purge_expired`].
///
/// [`purge_expired`]: KvStore::purge_expired
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, IngestError> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .map(|e| (e.expires_at > now, e.value.clone()));
        match hit {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                self.entries.remove_if(key, |_, e| e.expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), IngestError> {
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), IngestError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, IngestError> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        Ok(before.saturating_sub(self.entries.len()))
    }
}

/// Tagged result of a read-through lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    /// Served from cache; the loader did not run.
    Hit(String),
    /// The loader ran and produced `T`.
    Miss(T),
}

impl<T> CacheLookup<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

#[derive(Clone)]
pub struct CacheLayer {
    kv: Arc<dyn KvStore>,
}

impl CacheLayer {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKv::new()))
    }

    /// Cache faults degrade to a miss; they never fail the fetch.
    pub async fn get(&self, key: &str) -> Option<String> {
        match self.kv.get(key).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target: "ingest", key, error = %e, "cache read failed");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: String, ttl: Duration) {
        if let Err(e) = self.kv.set(key, value, ttl).await {
            tracing::warn!(target: "ingest", key, error = %e, "cache write failed");
        }
    }

    /// Sweep expired entries. Returns 0 when the store fails.
    pub async fn purge_expired(&self) -> usize {
        match self.kv.purge_expired().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(target: "ingest", error = %e, "cache purge failed");
                0
            }
        }
    }

    /// Serve `key` from cache, or run `load` and cache the body it returns.
    ///
    /// With `ttl == None` the data type is not cached: no lookup, no store.
    /// A failed load stores nothing.
    pub async fn read_through<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        load: F,
    ) -> Result<CacheLookup<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, String), E>>,
    {
        let Some(ttl) = ttl else {
            let (value, _) = load().await?;
            return Ok(CacheLookup::Miss(value));
        };

        if let Some(body) = self.get(key).await {
            counter!("ingest_cache_total", "result" => "hit").increment(1);
            tracing::debug!(target: "ingest", key, "cache hit");
            return Ok(CacheLookup::Hit(body));
        }
        counter!("ingest_cache_total", "result" => "miss").increment(1);

        let (value, body) = load().await?;
        self.set(key, body, ttl).await;
        Ok(CacheLookup::Miss(value))
    }
}
