// Result Cache - bounded strict LRU
// HashMap for lookup + BTreeMap of access stamps for eviction order

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;

/// Strict LRU: every hit refreshes recency, the least recently used entry is
/// evicted first. Capacity 0 disables caching.
pub struct LruCache<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: BTreeMap::new(),
            clock: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let stamp = self.tick();
        match self.entries.get_mut(key) {
            Some((value, last_used)) => {
                self.order.remove(last_used);
                *last_used = stamp;
                self.order.insert(stamp, key.clone());
                self.hits += 1;
                Some(value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }

        let stamp = self.tick();
        if let Some((_, old_stamp)) = self.entries.insert(key.clone(), (value, stamp)) {
            self.order.remove(&old_stamp);
        }
        self.order.insert(stamp, key);

        while self.entries.len() > self.capacity {
            match self.order.pop_first() {
                Some((_, oldest)) => {
                    self.entries.remove(&oldest);
                    self.evictions += 1;
                }
                None => break,
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

impl<K, V> fmt::Display for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LruCache(size={}/{}, hits={}, misses={}, evictions={})",
            self.entries.len(),
            self.capacity,
            self.hits,
            self.misses,
            self.evictions
        )
    }
}
