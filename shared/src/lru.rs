use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    last_used: u64,
}

/// Bounded map with least-recently-used eviction and a hard time-to-live.
/// An entry is served only within `ttl` of its insertion; after that a `get`
/// removes it and misses, regardless of how recently it was read. Time is
/// passed in by the caller so behavior is deterministic under test.
pub struct TtlLruCache<K: Eq + Hash + Clone, V> {
    entries: HashMap<K, Entry<V>>,
    capacity: usize,
    ttl: Duration,
    clock: u64,
}

impl<K: Eq + Hash + Clone, V> TtlLruCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            ttl,
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or refresh. Refreshing restarts the TTL window.
    pub fn insert(&mut self, key: K, value: V, now: Instant) {
        self.clock += 1;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_one();
        }
        self.entries.insert(
            key,
            Entry { value, inserted_at: now, last_used: self.clock },
        );
    }

    pub fn get(&mut self, key: &K, now: Instant) -> Option<&V> {
        let expired = match self.entries.get(key) {
            Some(entry) => now.duration_since(entry.inserted_at) > self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.clock += 1;
        let entry = self.entries.get_mut(key).unwrap();
        entry.last_used = self.clock;
        Some(&entry.value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone());
        if let Some(k) = victim {
            self.entries.remove(&k);
        }
    }
}
