//! Response cache with LRU eviction and per-entry TTL.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use conduit_config::CacheSection;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Entry stored in the cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Serialized response text.
    pub value: String,

    /// Human-readable label (normalized request text), matched by
    /// [`ResponseCache::invalidate`].
    pub label: String,

    pub created_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    /// A TTL too large to represent as a deadline never expires.
    fn is_expired(&self, now: Instant) -> bool {
        self.created_at
            .checked_add(self.ttl)
            .is_some_and(|deadline| now >= deadline)
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
    pub evictions: u64,
    pub enabled: bool,
}

/// Fingerprint-keyed response cache.
///
/// Expired entries are dropped when touched and count as misses. A disabled
/// cache misses every lookup and ignores writes.
pub struct ResponseCache {
    lru: RwLock<LruCache<String, CacheEntry>>,
    capacity: usize,
    default_ttl: Duration,
    enabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::from_section(&CacheSection::default())
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("capacity", &self.capacity)
            .field("default_ttl", &self.default_ttl)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl ResponseCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            lru: RwLock::new(LruCache::new(cap)),
            capacity: cap.get(),
            default_ttl,
            enabled: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_section(section: &CacheSection) -> Self {
        let cache = Self::new(section.max_entries, Duration::from_secs(section.ttl_secs));
        cache.set_enabled(section.enabled);
        cache
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a fingerprint.
    pub async fn get(&self, fingerprint: &str) -> Option<String> {
        if !self.is_enabled() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // `LruCache::get` promotes the entry, so a write lock is needed.
        let mut lru = self.lru.write().await;
        let now = Instant::now();

        let expired = match lru.get(fingerprint) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(fingerprint, "cache hit");
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            lru.pop(fingerprint);
            debug!(fingerprint, "cache entry expired");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value under `fingerprint` with an explicit TTL.
    pub async fn set(&self, fingerprint: impl Into<String>, label: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        if !self.is_enabled() {
            return;
        }

        let key = fingerprint.into();
        let entry = CacheEntry {
            value: value.into(),
            label: label.into(),
            created_at: Instant::now(),
            ttl,
        };

        let mut lru = self.lru.write().await;
        // `push` returns the displaced pair: the same key on replace, the LRU
        // victim on eviction.
        if let Some((old_key, _)) = lru.push(key.clone(), entry)
            && old_key != key
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(evicted = %old_key, "cache eviction");
        }
    }

    /// Store a value with the default TTL.
    pub async fn insert(&self, fingerprint: impl Into<String>, label: impl Into<String>, value: impl Into<String>) {
        self.set(fingerprint, label, value, self.default_ttl).await;
    }

    /// Remove entries whose fingerprint or label matches a glob pattern.
    ///
    /// `*` clears everything. A pattern that does not parse as a glob is
    /// matched literally. Returns the number of entries removed.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let mut lru = self.lru.write().await;

        if pattern == "*" {
            let removed = lru.len();
            lru.clear();
            debug!(removed, "cache cleared");
            return removed;
        }

        let glob = glob::Pattern::new(pattern).ok();
        let matches = |s: &str| match &glob {
            Some(p) => p.matches(s),
            None => s == pattern,
        };

        let doomed: Vec<String> = lru
            .iter()
            .filter(|(key, entry)| matches(key) || matches(&entry.label))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            lru.pop(key);
        }
        debug!(pattern, removed = doomed.len(), "cache invalidated");
        doomed.len()
    }

    /// Drop every expired entry. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let mut lru = self.lru.write().await;
        let now = Instant::now();
        let expired: Vec<String> = lru
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            lru.pop(key);
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.lru.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            size: self.len().await,
            capacity: self.capacity,
            evictions: self.evictions.load(Ordering::Relaxed),
            enabled: self.is_enabled(),
        }
    }
}
