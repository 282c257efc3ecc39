//! Cache store adapter.
//!
//! In-process TTL cache over a bounded LRU. Backs the orchestrator dedupe
//! cache, synthesis response cache and rate counters.

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use super::{lock_poisoned, StoreHealth, StoreResult};

/// Default entry capacity
const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
enum CacheValue {
    Text(String),
    Counter(i64),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: CacheValue,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// The cache adapter
pub struct CacheStore {
    inner: Mutex<LruCache<String, Entry>>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl CacheStore {
    /// Create a cache bounded to `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Fetch a text value; expired entries are evicted on read
    pub fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Utc::now();
        let mut cache = self.inner.lock().map_err(|_| lock_poisoned("cache"))?;
        match cache.get(key) {
            Some(entry) if entry.expired(now) => {
                cache.pop(key);
                Ok(None)
            }
            Some(entry) => match &entry.value {
                CacheValue::Text(text) => Ok(Some(text.clone())),
                CacheValue::Counter(count) => Ok(Some(count.to_string())),
                CacheValue::List(_) => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Whether a live entry exists for the key
    pub fn contains(&self, key: &str) -> StoreResult<bool> {
        let now = Utc::now();
        let mut cache = self.inner.lock().map_err(|_| lock_poisoned("cache"))?;
        match cache.get(key) {
            Some(entry) if entry.expired(now) => {
                cache.pop(key);
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    /// Store a text value with a TTL
    pub fn set_ex(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: std::time::Duration,
    ) -> StoreResult<()> {
        let mut cache = self.inner.lock().map_err(|_| lock_poisoned("cache"))?;
        cache.put(
            key.into(),
            Entry {
                value: CacheValue::Text(value.into()),
                expires_at: Utc::now() + Duration::from_std(ttl).unwrap_or(Duration::zero()),
            },
        );
        Ok(())
    }

    /// Delete an entry; true when one existed
    pub fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut cache = self.inner.lock().map_err(|_| lock_poisoned("cache"))?;
        Ok(cache.pop(key).is_some())
    }

    /// Increment a counter, creating it with the TTL when absent; returns the
    /// new value. The TTL is not refreshed on subsequent increments.
    pub fn incr(&self, key: &str, ttl: std::time::Duration) -> StoreResult<i64> {
        let now = Utc::now();
        let mut cache = self.inner.lock().map_err(|_| lock_poisoned("cache"))?;
        let next = match cache.get(key) {
            Some(entry) if !entry.expired(now) => match entry.value {
                CacheValue::Counter(count) => count + 1,
                _ => 1,
            },
            _ => 1,
        };
        let expires_at = match cache.get(key) {
            Some(entry) if !entry.expired(now) && matches!(entry.value, CacheValue::Counter(_)) => {
                entry.expires_at
            }
            _ => now + Duration::from_std(ttl).unwrap_or(Duration::zero()),
        };
        cache.put(
            key.to_string(),
            Entry {
                value: CacheValue::Counter(next),
                expires_at,
            },
        );
        Ok(next)
    }

    /// Push to the front of a bounded list, trimming to `bound`; returns the
    /// list length after the push. Used for orchestrator batching.
    pub fn list_push_bounded(
        &self,
        key: &str,
        value: impl Into<String>,
        bound: usize,
        ttl: std::time::Duration,
    ) -> StoreResult<usize> {
        let now = Utc::now();
        let mut cache = self.inner.lock().map_err(|_| lock_poisoned("cache"))?;
        let mut list = match cache.pop(key) {
            Some(entry) if !entry.expired(now) => match entry.value {
                CacheValue::List(list) => list,
                _ => VecDeque::new(),
            },
            _ => VecDeque::new(),
        };
        list.push_front(value.into());
        list.truncate(bound.max(1));
        let len = list.len();
        cache.put(
            key.to_string(),
            Entry {
                value: CacheValue::List(list),
                expires_at: now + Duration::from_std(ttl).unwrap_or(Duration::zero()),
            },
        );
        Ok(len)
    }

    /// Snapshot of a bounded list, newest first
    pub fn list_get(&self, key: &str) -> StoreResult<Vec<String>> {
        let now = Utc::now();
        let mut cache = self.inner.lock().map_err(|_| lock_poisoned("cache"))?;
        match cache.get(key) {
            Some(entry) if entry.expired(now) => {
                cache.pop(key);
                Ok(vec![])
            }
            Some(entry) => match &entry.value {
                CacheValue::List(list) => Ok(list.iter().cloned().collect()),
                _ => Ok(vec![]),
            },
            None => Ok(vec![]),
        }
    }

    /// Health probe (in-process, so this measures lock latency)
    pub fn health(&self) -> StoreHealth {
        StoreHealth::probe(|| {
            let _cache = self.inner.lock().map_err(|_| lock_poisoned("cache"))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn test_set_get_roundtrip() {
        let cache = CacheStore::default();
        cache
            .set_ex("k", "v", StdDuration::from_secs(60))
            .unwrap();
        assert_eq!(cache.get("k").unwrap().as_deref(), Some("v"));
        assert!(cache.contains("k").unwrap());
        assert!(cache.delete("k").unwrap());
        assert_eq!(cache.get("k").unwrap(), None);
    }

    #[test]
    fn test_expired_entries_are_gone() {
        let cache = CacheStore::default();
        cache.set_ex("k", "v", StdDuration::ZERO).unwrap();
        assert_eq!(cache.get("k").unwrap(), None);
        assert!(!cache.contains("k").unwrap());
    }

    #[test]
    fn test_incr_counts_up() {
        let cache = CacheStore::default();
        assert_eq!(cache.incr("hits", StdDuration::from_secs(60)).unwrap(), 1);
        assert_eq!(cache.incr("hits", StdDuration::from_secs(60)).unwrap(), 2);
        assert_eq!(cache.incr("hits", StdDuration::from_secs(60)).unwrap(), 3);
    }

    #[test]
    fn test_list_push_bounded_trims() {
        let cache = CacheStore::default();
        for i in 0..5 {
            cache
                .list_push_bounded("turns", format!("t{i}"), 3, StdDuration::from_secs(60))
                .unwrap();
        }
        let list = cache.list_get("turns").unwrap();
        assert_eq!(list, vec!["t4", "t3", "t2"]);
    }

    #[test]
    fn test_lru_bound_evicts_oldest() {
        let cache = CacheStore::new(2);
        cache.set_ex("a", "1", StdDuration::from_secs(60)).unwrap();
        cache.set_ex("b", "2", StdDuration::from_secs(60)).unwrap();
        cache.set_ex("c", "3", StdDuration::from_secs(60)).unwrap();
        assert_eq!(cache.get("a").unwrap(), None);
        assert_eq!(cache.get("c").unwrap().as_deref(), Some("3"));
    }
}
