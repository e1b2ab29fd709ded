//! In-process LRU cache of recent policy decisions.
//!
//! Values are `Option<Policy>` so a miss in the database ("known absent")
//! is cached distinctly from a key that was never looked up.

use std::num::NonZeroUsize;

use lru::LruCache;

use super::graph::Policy;

pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Cache key: the fields a policy can be matched on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecisionKey {
    pub url: String,
    pub file_hash: String,
    pub mime_type: String,
    pub rule_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct DecisionCache {
    inner: LruCache<DecisionKey, Option<Policy>>,
    stats: CacheStats,
}

impl DecisionCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            inner: LruCache::new(capacity),
            stats: CacheStats::default(),
        }
    }

    /// O(1). The outer `Option` is hit/miss; the inner is the cached
    /// decision, which may itself be "no policy matches".
    pub fn get(&mut self, key: &DecisionKey) -> Option<Option<Policy>> {
        match self.inner.get(key) {
            Some(decision) => {
                self.stats.hits += 1;
                Some(decision.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// O(1). Counts an eviction when inserting a new key at capacity.
    pub fn put(&mut self, key: DecisionKey, decision: Option<Policy>) {
        if self.inner.len() == self.inner.cap().get() && !self.inner.contains(&key) {
            self.stats.evictions += 1;
        }
        self.inner.put(key, decision);
    }

    /// Drop every cached decision. Called on any policy mutation so cached
    /// reads can never disagree with a cold read.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(url: &str) -> DecisionKey {
        DecisionKey {
            url: url.to_string(),
            file_hash: String::new(),
            mime_type: String::new(),
            rule_name: String::new(),
        }
    }

    #[test]
    fn counts_hits_and_misses() {
        let mut cache = DecisionCache::new(4);
        assert!(cache.get(&key("a")).is_none());
        cache.put(key("a"), None);
        assert_eq!(cache.get(&key("a")), Some(None));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn known_absent_is_distinct_from_unknown() {
        let mut cache = DecisionCache::new(4);
        cache.put(key("miss-in-db"), None);
        // A cached "no match" is a hit.
        assert_eq!(cache.get(&key("miss-in-db")), Some(None));
        // An unknown key is a miss.
        assert!(cache.get(&key("never-seen")).is_none());
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = DecisionCache::new(2);
        cache.put(key("a"), None);
        cache.put(key("b"), None);
        cache.get(&key("a"));
        cache.put(key("c"), None);
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.get(&key("b")).is_none(), "b was least recently used");
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("c")).is_some());
    }

    #[test]
    fn overwriting_a_key_is_not_an_eviction() {
        let mut cache = DecisionCache::new(2);
        cache.put(key("a"), None);
        cache.put(key("b"), None);
        cache.put(key("a"), None);
        assert_eq!(cache.stats().evictions, 0);
    }
}
