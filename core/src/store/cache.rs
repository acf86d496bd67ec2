//! Bounded in-process cache with least-recently-accessed eviction and lazy
//! expiry. Private to [`super::NovelDataStore`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use time::OffsetDateTime;

pub const DEFAULT_MAX_SIZE: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub expires_at: Option<Instant>,
    pub created_at: OffsetDateTime,
    pub last_accessed: OffsetDateTime,
    // Monotonic access order; wall-clock stamps can tie within one tick.
    access_seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug)]
pub struct Cache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    max_size: usize,
    default_ttl: Option<Duration>,
    seq: u64,
}

impl<V: Clone> Default for Cache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE, Some(DEFAULT_TTL))
    }
}

impl<V: Clone> Cache<V> {
    pub fn new(max_size: usize, default_ttl: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            max_size: max_size.max(1),
            default_ttl,
            seq: 0,
        }
    }

    /// Return a clone of the cached value, purging it first if it expired.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let now = Instant::now();
        let expired = self.entries.get(key)?.is_expired(now);
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.seq += 1;
        let seq = self.seq;
        let entry = self.entries.get_mut(key)?;
        entry.access_seq = seq;
        entry.last_accessed = OffsetDateTime::now_utc();
        Some(entry.value.clone())
    }

    /// Insert or replace `key`. `ttl` overrides the default lifetime.
    pub fn set(&mut self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        if self.entries.len() >= self.max_size && !self.entries.contains_key(&key) {
            self.evict();
        }
        let expires_at = ttl.or(self.default_ttl).map(|ttl| Instant::now() + ttl);
        let now = OffsetDateTime::now_utc();
        self.seq += 1;
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                expires_at,
                created_at: now,
                last_accessed: now,
                access_seq: self.seq,
            },
        );
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn evict(&mut self) {
        let oldest = self
            .entries
            .values()
            .min_by_key(|entry| entry.access_seq)
            .map(|entry| entry.key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}
