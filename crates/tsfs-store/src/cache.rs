//! LRU cache of decoded B-tree nodes and the registry used for monitoring.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::btree::node::Node;

/// Counters of one node cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of nodes inserted.
    pub insertions: u64,
    /// Number of nodes evicted.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculates the cache hit rate as a ratio of hits to total accesses.
    ///
    /// Returns 0.0 if there have been no cache accesses.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct LruState {
    lookup: HashMap<u64, (Arc<Node>, u64)>,
    // access tick -> node address, oldest first
    order: BTreeMap<u64, u64>,
    tick: u64,
}

/// LRU cache of nodes keyed by page address.
///
/// Counters are relaxed atomics: they are for monitoring and may lag
/// slightly under concurrency.
pub struct NodeCache {
    name: String,
    capacity: usize,
    state: Mutex<LruState>,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

impl NodeCache {
    /// Creates an empty cache holding at most `capacity` nodes.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        debug!(cache = %name, capacity, "created node cache");
        Self {
            name,
            capacity: capacity.max(1),
            state: Mutex::new(LruState {
                lookup: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Name of the tree this cache serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up `addr`, counting a hit or a miss.
    pub fn get(&self, addr: u64) -> Option<Arc<Node>> {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        let found = match state.lookup.get_mut(&addr) {
            Some((node, last)) => {
                let old = std::mem::replace(last, tick);
                Some((Arc::clone(node), old))
            }
            None => None,
        };
        match found {
            Some((node, old)) => {
                state.order.remove(&old);
                state.order.insert(tick, addr);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(node)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts or replaces `addr`, evicting the least recently used node
    /// when full.
    pub fn insert(&self, addr: u64, node: Arc<Node>) {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        if let Some((_, old)) = state.lookup.insert(addr, (node, tick)) {
            state.order.remove(&old);
        } else {
            self.insertions.fetch_add(1, Ordering::Relaxed);
        }
        state.order.insert(tick, addr);

        while state.lookup.len() > self.capacity {
            let Some((_, victim)) = state.order.pop_first() else {
                break;
            };
            state.lookup.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops `addr` from the cache.
    pub fn remove(&self, addr: u64) {
        let mut state = self.state.lock();
        if let Some((_, tick)) = state.lookup.remove(&addr) {
            state.order.remove(&tick);
        }
    }

    /// Drops every cached node. Counters are kept.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.lookup.clear();
        state.order.clear();
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.state.lock().lookup.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counter values.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the counters. Cached nodes stay.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.insertions.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        debug!(cache = %self.name, "reset node cache counters");
    }
}

/// Enumerates the live node caches of one store instance.
///
/// Holds weak references only; a cache disappears from the registry once
/// its tree is dropped.
#[derive(Default)]
pub struct CacheRegistry {
    caches: Mutex<Vec<Weak<NodeCache>>>,
}

impl CacheRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `cache` to the registry.
    pub fn register(&self, cache: &Arc<NodeCache>) {
        self.caches.lock().push(Arc::downgrade(cache));
    }

    /// Live caches, pruning dropped ones.
    pub fn live(&self) -> Vec<Arc<NodeCache>> {
        let mut caches = self.caches.lock();
        caches.retain(|w| w.strong_count() > 0);
        caches.iter().filter_map(Weak::upgrade).collect()
    }

    /// `(name, stats)` of every live cache.
    pub fn snapshot(&self) -> Vec<(String, CacheStats)> {
        self.live()
            .iter()
            .map(|c| (c.name().to_string(), c.stats()))
            .collect()
    }

    /// Resets the counters of every live cache.
    pub fn reset_all(&self) {
        for cache in self.live() {
            cache.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(addr: u64) -> Arc<Node> {
        Arc::new(Node::leaf(addr))
    }

    #[test]
    fn test_hit_and_miss_counting() {
        let cache = NodeCache::new("t", 4);
        assert!(cache.get(1).is_none());
        cache.insert(1, node(1));
        assert_eq!(cache.get(1).unwrap().addr, 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.insertions, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = NodeCache::new("t", 2);
        cache.insert(1, node(1));
        cache.insert(2, node(2));
        cache.get(1);
        cache.insert(3, node(3));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replace_does_not_count_insertion() {
        let cache = NodeCache::new("t", 2);
        cache.insert(1, node(1));
        cache.insert(1, node(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().insertions, 1);
    }

    #[test]
    fn test_reset_keeps_contents() {
        let cache = NodeCache::new("t", 2);
        cache.insert(1, node(1));
        cache.get(1);
        cache.reset();
        assert_eq!(cache.stats(), CacheStats::default());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_registry_drops_dead_caches() {
        let registry = CacheRegistry::new();
        let a = Arc::new(NodeCache::new("a", 2));
        {
            let b = Arc::new(NodeCache::new("b", 2));
            registry.register(&a);
            registry.register(&b);
            assert_eq!(registry.live().len(), 2);
        }
        let names: Vec<String> = registry.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a".to_string()]);
    }

    #[test]
    fn test_registry_reset_all() {
        let registry = CacheRegistry::new();
        let a = Arc::new(NodeCache::new("a", 2));
        registry.register(&a);
        a.get(9);
        assert_eq!(a.stats().misses, 1);
        registry.reset_all();
        assert_eq!(a.stats().misses, 0);
    }
}
