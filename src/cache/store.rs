//! Key-value cache storage and the typed service built on top of it.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};

/// Default entry lifetime when the caller does not pass one (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache value could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Raw byte storage with per-entry expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    /// Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Every live key.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process [`CacheStore`] on a [`DashMap`].
///
/// Expired entries are dropped lazily on read, and in bulk by
/// [`cleanup_expired`](Self::cleanup_expired).
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until they are evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn start_cleanup_task(&self, every: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let removed = cache.cleanup_expired();
                if removed > 0 {
                    tracing::debug!(removed, remaining = cache.len(), "evicted expired cache entries");
                }
            }
        })
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }
}

/// Hit/miss counters for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Percentage of lookups that hit, `0.0` when there were none.
    pub hit_rate: f64,
}

impl CacheStats {
    fn from_counts(hits: u64, misses: u64) -> Self {
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        Self {
            hits,
            misses,
            hit_rate,
        }
    }
}

/// Typed JSON cache with per-key access statistics.
#[derive(Clone)]
pub struct CacheService {
    store: Arc<dyn CacheStore>,
    default_ttl: Duration,
    stats: Arc<DashMap<String, (u64, u64)>>,
}

impl CacheService {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_default_ttl(store, DEFAULT_TTL)
    }

    pub fn with_default_ttl(store: Arc<dyn CacheStore>, default_ttl: Duration) -> Self {
        Self {
            store,
            default_ttl,
            stats: Arc::new(DashMap::new()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn record_access(&self, key: &str, hit: bool) {
        let mut counts = self.stats.entry(key.to_owned()).or_default();
        if hit {
            counts.0 += 1;
        } else {
            counts.1 += 1;
        }
    }

    /// Looks up `key` and decodes it, counting the access as a hit or miss.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the backend fails or the stored value does not
    /// decode as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let raw = self.store.get(key).await?;
        self.record_access(key, raw.is_some());
        decode(raw)
    }

    /// Looks up `key` like [`get`](Self::get) without touching the statistics.
    ///
    /// Meant for lookups keyed on caller-controlled input, such as request
    /// URLs, which would otherwise grow the statistics map without bound.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub async fn peek<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        decode(self.store.get(key).await?)
    }

    /// Stores `value` as JSON for `ttl`, or the service default.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if encoding or the backend fails.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let bytes = Bytes::from(serde_json::to_vec(value)?);
        self.store
            .set(key, bytes, ttl.unwrap_or(self.default_ttl))
            .await
    }

    /// Returns the cached value, or runs `factory`, caches its output and returns it.
    ///
    /// Cache failures never reach the caller; they are logged and the factory's
    /// value is returned uncached.
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, factory: F, ttl: Option<Duration>) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.get::<T>(key).await {
            Ok(Some(cached)) => return cached,
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "cache lookup failed"),
        }

        let value = factory().await;
        if let Err(e) = self.set(key, &value, ttl).await {
            tracing::warn!(key = %key, error = %e, "cache store failed");
        }
        value
    }

    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] if the store fails.
    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.store.delete(key).await
    }

    /// Deletes every key in `keys`, returning how many live entries were removed.
    ///
    /// # Errors
    ///
    /// Stops at the first backend failure.
    pub async fn delete_many<S: AsRef<str>>(&self, keys: &[S]) -> Result<usize, CacheError> {
        let mut removed = 0;
        for key in keys {
            if self.store.delete(key.as_ref()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Deletes every key starting with `prefix`. Best effort: failures are
    /// logged and reported as zero deletions.
    pub async fn delete_pattern(&self, prefix: &str) -> usize {
        let result = async {
            let keys: Vec<String> = self
                .store
                .keys()
                .await?
                .into_iter()
                .filter(|k| k.starts_with(prefix))
                .collect();
            self.delete_many(&keys).await
        }
        .await;

        match result {
            Ok(removed) => {
                tracing::info!(pattern = %prefix, removed, "cache pattern cleared");
                removed
            }
            Err(e) => {
                tracing::warn!(pattern = %prefix, error = %e, "failed to delete cache pattern");
                0
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] if the store fails.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.store.clear().await?;
        tracing::info!("cache cleared");
        Ok(())
    }

    /// Statistics for one key; all zeros if it was never looked up.
    pub fn stats(&self, key: &str) -> CacheStats {
        self.stats
            .get(key)
            .map(|c| CacheStats::from_counts(c.0, c.1))
            .unwrap_or_default()
    }

    /// Statistics for every key looked up since the last reset.
    pub fn all_stats(&self) -> BTreeMap<String, CacheStats> {
        self.stats
            .iter()
            .map(|e| {
                let (hits, misses) = *e.value();
                (e.key().clone(), CacheStats::from_counts(hits, misses))
            })
            .collect()
    }

    pub fn reset_stats(&self) {
        self.stats.clear();
    }
}

fn decode<T: DeserializeOwned>(raw: Option<Bytes>) -> Result<Option<T>, CacheError> {
    raw.map(|bytes| serde_json::from_slice(&bytes))
        .transpose()
        .map_err(CacheError::from)
}
