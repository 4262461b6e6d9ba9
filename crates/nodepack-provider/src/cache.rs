//! Keyed cache with TTL expiration and single-flight refresh.
//!
//! Zone and subnet discovery results change rarely but are fetched on every
//! provisioning pass, so they are held in a [`TtlCache`] for a short time.
//! Entries expire lazily on read and eagerly when [`TtlCache::run_cleanup`]
//! sweeps the cache.
//!
//! [`TtlCache::get_or_try_fetch`] allows at most one in-flight fetch per
//! key: concurrent callers for the same key wait on a per-key async lock
//! and re-check the cache once they acquire it.
//!
//! Hits, misses and expirations are counted and emitted as `tracing`
//! fields.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nodepack_core::config::CacheConfig;
use tracing::{debug, info};

use crate::error::ProviderResult;

/// Default time-to-live for entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Default interval between cleanup sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

/// Timing settings for a [`TtlCache`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheSettings {
    /// Time-to-live applied by [`TtlCache::set`].
    pub ttl: Duration,
    /// Cadence of [`TtlCache::run_cleanup`] sweeps.
    pub cleanup_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl CacheSettings {
    /// Parse the `[cache]` section of a config file.
    pub fn from_config(config: &CacheConfig) -> ProviderResult<Self> {
        Ok(Self {
            ttl: config.ttl()?,
            cleanup_interval: config.cleanup_interval()?,
        })
    }
}

/// Counters accumulated over the cache's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct Inner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    stats: CacheStats,
}

/// Internally synchronized key/value cache with per-entry expiry.
pub struct TtlCache<K, V> {
    name: &'static str,
    settings: CacheSettings,
    inner: Mutex<Inner<K, V>>,
    /// Per-key locks serializing fetches.
    in_flight: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K, V> fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug,
    V: Clone,
{
    /// Create an empty cache. `name` labels its log lines.
    pub fn new(name: &'static str, settings: CacheSettings) -> Self {
        Self {
            name,
            settings,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up `key`. Expired entries count as misses and are removed.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        let now = Instant::now();

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                inner.stats.misses += 1;
                debug!(cache = self.name, key = ?key, misses = inner.stats.misses, "cache miss");
                return None;
            }
        };

        if expired {
            inner.entries.remove(key);
            inner.stats.misses += 1;
            inner.stats.expirations += 1;
            debug!(cache = self.name, key = ?key, misses = inner.stats.misses, "cache miss (expired)");
            return None;
        }

        inner.stats.hits += 1;
        debug!(cache = self.name, key = ?key, hits = inner.stats.hits, "cache hit");
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Insert or replace `key` with the default TTL.
    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.settings.ttl);
    }

    /// Insert or replace `key`, expiring after `ttl`.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.lock().entries.insert(key, CacheEntry { value, expires_at });
    }

    /// Drop `key` regardless of its TTL. Returns whether it was present.
    pub fn expire(&self, key: &K) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Remove every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.lock();
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - inner.entries.len();
        inner.stats.expirations += removed as u64;
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    /// Return the cached value for `key`, or run `fetch` and cache its
    /// result with the default TTL.
    ///
    /// Only one fetch per key runs at a time. Failed fetches are not
    /// cached and the error is returned to the caller that ran the fetch.
    pub async fn get_or_try_fetch<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let gate = self.fetch_gate(&key);
        let result = {
            let _guard = gate.lock().await;
            // Another caller may have filled the entry while we waited.
            match self.fresh(&key) {
                Some(value) => Ok(value),
                None => fetch().await.inspect(|value| self.set(key.clone(), value.clone())),
            }
        };
        self.release_gate(&key, gate);
        result
    }

    /// Unexpired value for `key`, counted as a hit when present.
    fn fresh(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        let now = Instant::now();
        let value = inner
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())?;
        inner.stats.hits += 1;
        Some(value)
    }

    fn fetch_gate(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.entry(key.clone()).or_default().clone()
    }

    fn release_gate(&self, key: &K, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // The map and `gate` are the only holders when nobody is waiting.
        if Arc::strong_count(&gate) <= 2 {
            in_flight.remove(key);
        }
    }

    /// Sweep expired entries every `cleanup_interval` until `shutdown`
    /// changes.
    pub async fn run_cleanup(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = self.settings.cleanup_interval;
        debug!(
            cache = self.name,
            interval_ms = interval.as_millis() as u64,
            "cache cleanup started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let removed = self.purge_expired();
                    if removed > 0 {
                        info!(cache = self.name, removed, remaining = self.len(), "purged expired cache entries");
                    }
                }
                _ = shutdown.changed() => {
                    debug!(cache = self.name, "cache cleanup shutting down");
                    break;
                }
            }
        }
    }
}
