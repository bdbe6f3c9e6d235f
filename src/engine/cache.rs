//! Bounded TTL cache with priority tiers.
//!
//! Entries carry a `CachePriority` and an estimated byte size. When the cache
//! is over its entry bound the victim is the lowest-priority entry, and the
//! least recently accessed one within that tier.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Eviction tier. Lower tiers go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePriority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    last_access: Instant,
    size_bytes: usize,
    priority: CachePriority,
}

/// Snapshot of a cache's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub estimated_bytes: usize,
}

#[derive(Debug)]
pub struct PriorityCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    ttl: Duration,
    max_entries: usize,
    configured_max: usize,
}

impl<K, V> PriorityCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries,
            configured_max: max_entries,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Look up `key` as of `now`, dropping it if it has expired.
    pub fn get_at(&mut self, key: &K, now: Instant) -> Option<V> {
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => self.is_expired(entry, now),
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.last_access = now;
        Some(entry.value.clone())
    }

    pub fn insert(&mut self, key: K, value: V, size_bytes: usize, priority: CachePriority) -> usize {
        self.insert_at(key, value, size_bytes, priority, Instant::now())
    }

    /// Insert or replace an entry, then evict until within bounds.
    ///
    /// Returns the number of entries evicted.
    pub fn insert_at(
        &mut self,
        key: K,
        value: V,
        size_bytes: usize,
        priority: CachePriority,
        now: Instant,
    ) -> usize {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                last_access: now,
                size_bytes,
                priority,
            },
        );
        self.enforce_bound()
    }

    /// Raise an entry's priority; never lowers it.
    pub fn promote(&mut self, key: &K, priority: CachePriority) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.priority = entry.priority.max(priority);
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Keep only entries whose key satisfies `keep`. Returns how many were dropped.
    pub fn retain_keys<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|k, _| keep(k));
        before - self.entries.len()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn purge_expired(&mut self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.inserted_at) < ttl);
        before - self.entries.len()
    }

    /// Drop every entry with a priority strictly below `priority`.
    pub fn evict_below(&mut self, priority: CachePriority) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.priority >= priority);
        before - self.entries.len()
    }

    /// Halve the permitted entry count and evict down to it.
    pub fn shrink(&mut self) -> usize {
        self.max_entries = (self.configured_max / 2).max(1);
        self.enforce_bound()
    }

    /// Return to the configured entry bound.
    pub fn restore(&mut self) {
        self.max_entries = self.configured_max;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn estimated_bytes(&self) -> usize {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            max_entries: self.max_entries,
            estimated_bytes: self.estimated_bytes(),
        }
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) >= self.ttl
    }

    fn victim(&self) -> Option<K> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| (e.priority, e.last_access))
            .map(|(k, _)| k.clone())
    }

    fn enforce_bound(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.max_entries {
            match self.victim() {
                Some(key) => {
                    self.entries.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max: usize) -> PriorityCache<&'static str, u32> {
        PriorityCache::new(Duration::from_secs(300), max)
    }

    #[test]
    fn test_get_hits_and_misses() {
        let mut c = cache(4);
        c.insert("a", 1, 8, CachePriority::Normal);
        assert_eq!(c.get(&"a"), Some(1));
        assert_eq!(c.get(&"b"), None);
    }

    #[test]
    fn test_expired_entries_are_dropped_on_read() {
        let mut c = cache(4);
        let t0 = Instant::now();
        c.insert_at("a", 1, 8, CachePriority::High, t0);
        assert_eq!(c.get_at(&"a", t0 + Duration::from_secs(299)), Some(1));
        assert_eq!(c.get_at(&"a", t0 + Duration::from_secs(300)), None);
        assert!(c.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let mut c = cache(4);
        let t0 = Instant::now();
        c.insert_at("old", 1, 8, CachePriority::High, t0);
        c.insert_at("new", 2, 8, CachePriority::High, t0 + Duration::from_secs(200));
        assert_eq!(c.purge_expired_at(t0 + Duration::from_secs(301)), 1);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_bound_evicts_lowest_priority_first() {
        let mut c = cache(2);
        let t0 = Instant::now();
        c.insert_at("high", 1, 8, CachePriority::High, t0);
        c.insert_at("low", 2, 8, CachePriority::Low, t0 + Duration::from_secs(1));
        let evicted = c.insert_at("normal", 3, 8, CachePriority::Normal, t0 + Duration::from_secs(2));

        assert_eq!(evicted, 1);
        assert_eq!(c.len(), 2);
        assert!(c.get_at(&"low", t0 + Duration::from_secs(3)).is_none());
    }

    #[test]
    fn test_lru_within_same_priority() {
        let mut c = cache(2);
        let t0 = Instant::now();
        c.insert_at("a", 1, 8, CachePriority::Normal, t0);
        c.insert_at("b", 2, 8, CachePriority::Normal, t0 + Duration::from_secs(1));
        // Touch "a" so "b" becomes least recently used.
        c.get_at(&"a", t0 + Duration::from_secs(2));
        c.insert_at("c", 3, 8, CachePriority::Normal, t0 + Duration::from_secs(3));

        let now = t0 + Duration::from_secs(4);
        assert!(c.get_at(&"a", now).is_some());
        assert!(c.get_at(&"b", now).is_none());
        assert!(c.get_at(&"c", now).is_some());
    }

    #[test]
    fn test_evict_below_and_shrink_restore() {
        let mut c = cache(8);
        for (i, key) in ["a", "b", "c", "d"].into_iter().enumerate() {
            let prio = if i % 2 == 0 { CachePriority::Low } else { CachePriority::High };
            c.insert(key, i as u32, 100, prio);
        }
        assert_eq!(c.evict_below(CachePriority::Normal), 2);
        assert_eq!(c.estimated_bytes(), 200);

        c.shrink();
        assert_eq!(c.max_entries(), 4);
        c.restore();
        assert_eq!(c.max_entries(), 8);
    }

    #[test]
    fn test_promote_protects_entry() {
        let mut c = cache(2);
        let t0 = Instant::now();
        c.insert_at("prefetched", 1, 8, CachePriority::Low, t0);
        c.insert_at("other", 2, 8, CachePriority::Normal, t0 + Duration::from_secs(1));
        c.promote(&"prefetched", CachePriority::High);
        c.insert_at("new", 3, 8, CachePriority::Normal, t0 + Duration::from_secs(2));

        let now = t0 + Duration::from_secs(3);
        assert!(c.get_at(&"prefetched", now).is_some());
        assert!(c.get_at(&"other", now).is_none());
    }

    #[test]
    fn test_retain_keys() {
        let mut c = cache(8);
        c.insert("price:AAPL", 1, 8, CachePriority::High);
        c.insert("portfolio", 2, 8, CachePriority::High);
        assert_eq!(c.retain_keys(|k| !k.starts_with("price")), 1);
        assert_eq!(c.len(), 1);
    }
}
