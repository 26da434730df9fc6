//! Least-recently-used cache with time, byte and count budgets.
//!
//! Entries expire a fixed time after they were inserted. Over budget, the
//! least recently used entries are evicted until both the byte and the entry
//! ceilings hold again. A single item larger than the whole byte budget is
//! never retained.
//!
//! Time is read from `tokio::time::Instant`, so a paused test runtime
//! controls expiry.

use crate::config::CacheBudget;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    size: u64,
    inserted: Instant,
    tick: u64,
}

/// Bounded LRU cache.
#[derive(Debug)]
pub struct LruCache<K, V> {
    budget: CacheBudget,
    entries: HashMap<K, Entry<V>>,
    /// Recency order: lowest tick is the least recently used.
    order: BTreeMap<u64, K>,
    next_tick: u64,
    bytes: u64,
}

impl<K, V> LruCache<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(budget: CacheBudget) -> Self {
        Self {
            budget,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            bytes: 0,
        }
    }

    pub fn budget(&self) -> CacheBudget {
        self.budget
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Summed size of the live entries.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<V> {
        if self.is_expired(key) {
            self.remove(key);
            return None;
        }
        let tick = self.bump();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.clone());
        Some(entry.value.clone())
    }

    /// Check for a live entry without changing its recency.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key) && !self.is_expired(key)
    }

    /// Insert or replace an entry of `size` bytes.
    ///
    /// Returns false if the item alone exceeds the byte budget; it is not
    /// stored then.
    pub fn insert(&mut self, key: K, value: V, size: u64) -> bool {
        self.remove(&key);
        if size > self.budget.max_bytes || self.budget.max_entries == 0 {
            return false;
        }

        let tick = self.bump();
        self.order.insert(tick, key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                size,
                inserted: Instant::now(),
                tick,
            },
        );
        self.bytes += size;

        self.purge_expired();
        while self.bytes > self.budget.max_bytes || self.entries.len() > self.budget.max_entries {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                self.bytes -= entry.size;
            }
        }
        true
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.bytes -= entry.size;
        Some(entry.value)
    }

    /// Drop every expired entry.
    pub fn purge_expired(&mut self) {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| e.inserted.elapsed() >= self.budget.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.bytes = 0;
    }

    fn is_expired(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.inserted.elapsed() >= self.budget.ttl)
    }

    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }
}
