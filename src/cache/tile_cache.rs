//! LRU tile cache with a parallel remote fetcher.
//!
//! # Concurrency
//!
//! The LRU map sits behind a single mutex. Remote fetches run through a
//! semaphore of `W` permits (default 50), so a large batch fans out without
//! stampeding the object store. Per-fetch accounting (requests, hits,
//! misses, timing, peak concurrency) lives behind its own mutex and is
//! only touched in short scopes.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::store::{ObjectStore, TileFormat};

/// Remote fetch connect timeout.
const FETCH_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Remote fetch read timeout.
const FETCH_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall wait per tile in a batch, including retries.
const FETCH_OVERALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Retry attempts on transient failures (5xx, network errors).
const FETCH_MAX_ATTEMPTS: u32 = 3;

/// Cache key for one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub dataset_id: i64,
    pub z: u32,
    pub x: u32,
    pub y: u32,
    pub format: TileFormat,
}

impl TileKey {
    pub fn new(dataset_id: i64, z: u32, x: u32, y: u32, format: TileFormat) -> Self {
        Self {
            dataset_id,
            z,
            x,
            y,
            format,
        }
    }

    /// The object store key this tile lives under.
    pub fn object_key(&self) -> String {
        crate::store::tile_key(self.dataset_id, self.z, self.x, self.y, self.format)
    }

    /// Short `z/x/y.format` form used in batch responses.
    pub fn coordinate(&self) -> String {
        format!("{}/{}/{}.{}", self.z, self.x, self.y, self.format.ext())
    }
}

/// Cache performance counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub avg_fetch_ms: f64,
    pub max_concurrent: usize,
}

#[derive(Debug, Default)]
struct StatsInner {
    total_requests: u64,
    cache_hits: u64,
    cache_misses: u64,
    avg_fetch_ms: f64,
    max_concurrent: usize,
    current_concurrent: usize,
}

/// Bounded LRU of tile bytes plus parallel fetch pool.
pub struct TileCache {
    cache: Mutex<LruCache<TileKey, Bytes>>,
    stats: Mutex<StatsInner>,
    permits: Arc<Semaphore>,
    http: reqwest::Client,
    capacity: usize,
}

impl TileCache {
    /// Create a cache holding up to `capacity` tiles with `workers`
    /// concurrent fetch permits.
    pub fn new(capacity: usize, workers: usize) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(FETCH_CONNECT_TIMEOUT)
            .timeout(FETCH_READ_TIMEOUT)
            .build()
            .expect("reqwest client");

        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            stats: Mutex::new(StatsInner::default()),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            http,
            capacity: capacity.max(1),
        }
    }

    /// Get a tile, marking it recently used. Counts a hit or miss.
    pub async fn get(&self, key: &TileKey) -> Option<Bytes> {
        let hit = {
            let mut cache = self.cache.lock().await;
            cache.get(key).cloned()
        };

        let mut stats = self.stats.lock().await;
        if hit.is_some() {
            stats.cache_hits += 1;
        } else {
            stats.cache_misses += 1;
        }
        hit
    }

    /// Store a tile, evicting the oldest entry on overflow.
    pub async fn put(&self, key: TileKey, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut cache = self.cache.lock().await;
        cache.put(key, data);
    }

    /// Drop cached tiles, optionally only those of one dataset.
    ///
    /// Returns the number of entries removed.
    pub async fn clear(&self, dataset_id: Option<i64>) -> usize {
        let mut cache = self.cache.lock().await;
        match dataset_id {
            None => {
                let cleared = cache.len();
                cache.clear();
                cleared
            }
            Some(id) => {
                let doomed: Vec<TileKey> = cache
                    .iter()
                    .filter(|(k, _)| k.dataset_id == id)
                    .map(|(k, _)| *k)
                    .collect();
                for key in &doomed {
                    cache.pop(key);
                }
                doomed.len()
            }
        }
    }

    /// Fetch a set of tiles, consulting the cache first and fanning misses
    /// out through the fetch pool. Successful fetches are cached.
    ///
    /// The returned map covers every requested key; unfetchable tiles map
    /// to `None`.
    pub async fn fetch_many(
        &self,
        store: &ObjectStore,
        keys: &[TileKey],
    ) -> HashMap<TileKey, Option<Bytes>> {
        let mut results: HashMap<TileKey, Option<Bytes>> = HashMap::with_capacity(keys.len());
        let mut to_fetch: Vec<(TileKey, String)> = Vec::new();

        for key in keys {
            if results.contains_key(key) {
                continue;
            }
            if let Some(cached) = self.get(key).await {
                results.insert(*key, Some(cached));
            } else {
                match store.public_url(&key.object_key()) {
                    Some(url) => to_fetch.push((*key, url)),
                    None => {
                        results.insert(*key, None);
                    }
                }
            }
        }

        if to_fetch.is_empty() {
            return results;
        }

        debug!(count = to_fetch.len(), "fetching tiles from object store");
        let fetches = to_fetch.into_iter().map(|(key, url)| async move {
            let data = tokio::time::timeout(FETCH_OVERALL_TIMEOUT, self.fetch_one(&url))
                .await
                .ok()
                .flatten();
            if let Some(ref bytes) = data {
                self.put(key, bytes.clone()).await;
            }
            (key, data)
        });

        for (key, data) in futures::future::join_all(fetches).await {
            results.insert(key, data);
        }
        results
    }

    /// One HTTP fetch under a pool permit, with bounded retry on 5xx and
    /// network errors (backoff 0.3 * 2^n s).
    async fn fetch_one(&self, url: &str) -> Option<Bytes> {
        let _permit = self.permits.acquire().await.ok()?;

        {
            let mut stats = self.stats.lock().await;
            stats.current_concurrent += 1;
            stats.max_concurrent = stats.max_concurrent.max(stats.current_concurrent);
        }
        let started = Instant::now();

        let mut attempt = 0u32;
        let outcome = loop {
            match self.http.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    break resp.bytes().await.ok();
                }
                Ok(resp) if resp.status().is_server_error() && attempt + 1 < FETCH_MAX_ATTEMPTS => {
                    let delay = Duration::from_millis(300 * (1 << attempt));
                    warn!(url, status = %resp.status(), "tile fetch failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Ok(resp) => {
                    debug!(url, status = %resp.status(), "tile fetch miss");
                    break None;
                }
                Err(e) if attempt + 1 < FETCH_MAX_ATTEMPTS => {
                    let delay = Duration::from_millis(300 * (1 << attempt));
                    warn!(url, error = %e, "tile fetch error, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(url, error = %e, "tile fetch failed");
                    break None;
                }
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut stats = self.stats.lock().await;
        stats.current_concurrent -= 1;
        if outcome.is_some() {
            stats.total_requests += 1;
            stats.avg_fetch_ms = if stats.avg_fetch_ms == 0.0 {
                elapsed_ms
            } else {
                (stats.avg_fetch_ms + elapsed_ms) / 2.0
            };
        }
        outcome
    }

    /// Snapshot the performance counters.
    pub async fn stats(&self) -> CacheStats {
        let entries = self.cache.lock().await.len();
        let stats = self.stats.lock().await;
        CacheStats {
            entries,
            capacity: self.capacity,
            total_requests: stats.total_requests,
            cache_hits: stats.cache_hits,
            cache_misses: stats.cache_misses,
            avg_fetch_ms: stats.avg_fetch_ms,
            max_concurrent: stats.max_concurrent,
        }
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(dataset: i64, z: u32, x: u32, y: u32) -> TileKey {
        TileKey::new(dataset, z, x, y, TileFormat::Png)
    }

    #[tokio::test]
    async fn test_basic_get_put() {
        let cache = TileCache::new(10, 2);
        let k = key(1, 0, 0, 0);

        assert!(cache.get(&k).await.is_none());

        cache.put(k, Bytes::from_static(b"tile")).await;
        assert_eq!(cache.get(&k).await, Some(Bytes::from_static(b"tile")));
    }

    #[tokio::test]
    async fn test_lru_eviction_order() {
        let cache = TileCache::new(2, 2);

        cache.put(key(1, 0, 0, 0), Bytes::from_static(b"a")).await;
        cache.put(key(1, 0, 0, 1), Bytes::from_static(b"b")).await;

        // Touch the first entry so the second becomes LRU.
        cache.get(&key(1, 0, 0, 0)).await;
        cache.put(key(1, 0, 0, 2), Bytes::from_static(b"c")).await;

        assert!(cache.get(&key(1, 0, 0, 0)).await.is_some());
        assert!(cache.get(&key(1, 0, 0, 1)).await.is_none());
        assert!(cache.get(&key(1, 0, 0, 2)).await.is_some());
    }

    #[tokio::test]
    async fn test_hit_miss_accounting() {
        let cache = TileCache::new(10, 2);
        let k = key(1, 0, 0, 0);

        cache.get(&k).await;
        cache.put(k, Bytes::from_static(b"x")).await;
        cache.get(&k).await;
        cache.get(&k).await;

        let stats = cache.stats().await;
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.capacity, 10);
    }

    #[tokio::test]
    async fn test_clear_by_dataset() {
        let cache = TileCache::new(10, 2);
        cache.put(key(1, 0, 0, 0), Bytes::from_static(b"a")).await;
        cache.put(key(1, 1, 0, 0), Bytes::from_static(b"b")).await;
        cache.put(key(2, 0, 0, 0), Bytes::from_static(b"c")).await;

        assert_eq!(cache.clear(Some(1)).await, 2);
        assert_eq!(cache.len().await, 1);
        assert!(cache.get(&key(2, 0, 0, 0)).await.is_some());

        assert_eq!(cache.clear(None).await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_fetch_many_cache_hits_skip_network() {
        let cache = TileCache::new(10, 2);
        let store = ObjectStore::disabled();

        let keys = [key(1, 0, 0, 0), key(1, 0, 1, 0)];
        cache.put(keys[0], Bytes::from_static(b"hot")).await;

        let results = cache.fetch_many(&store, &keys).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[&keys[0]], Some(Bytes::from_static(b"hot")));
        // Disabled store has no public URL: the miss resolves to None
        // without any fetch attempt.
        assert_eq!(results[&keys[1]], None);
        assert_eq!(cache.stats().await.total_requests, 0);
    }

    #[tokio::test]
    async fn test_fetch_many_all_cached_second_round() {
        let cache = TileCache::new(10, 2);
        let store = ObjectStore::disabled();

        let keys = [key(3, 2, 1, 1)];
        cache.put(keys[0], Bytes::from_static(b"warm")).await;

        let first = cache.fetch_many(&store, &keys).await;
        let second = cache.fetch_many(&store, &keys).await;
        assert_eq!(first[&keys[0]], second[&keys[0]]);
        assert_eq!(cache.stats().await.total_requests, 0);
    }

    #[tokio::test]
    async fn test_empty_payload_not_cached() {
        let cache = TileCache::new(10, 2);
        let k = key(1, 0, 0, 0);
        cache.put(k, Bytes::new()).await;
        assert!(cache.get(&k).await.is_none());
    }

    #[test]
    fn test_key_strings() {
        let k = key(7, 3, 1, 2);
        assert_eq!(k.object_key(), "tiles/7/3/1/2.png");
        assert_eq!(k.coordinate(), "3/1/2.png");
    }
}
