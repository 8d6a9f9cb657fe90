//! Short-lived in-memory page cache.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct Slot<V> {
    value: V,
    inserted: Instant,
    last_used: u64,
}

/// Map with a time-to-live and a capacity bound.
///
/// Expired entries read as missing. When full, the least recently used
/// entry is dropped.
#[derive(Debug)]
pub struct MemoryCache<K, V> {
    slots: HashMap<K, Slot<V>>,
    ttl: Duration,
    capacity: usize,
    clock: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> MemoryCache<K, V> {
    /// Create an empty cache.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            slots: HashMap::with_capacity(capacity),
            ttl,
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Live value for `key`.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let expired = self
            .slots
            .get(key)
            .is_some_and(|slot| slot.inserted.elapsed() >= self.ttl);
        if expired {
            self.slots.remove(key);
            return None;
        }

        let now = self.tick();
        self.slots.get_mut(key).map(|slot| {
            slot.last_used = now;
            slot.value.clone()
        })
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, key: K, value: V) {
        if !self.slots.contains_key(&key) && self.slots.len() >= self.capacity {
            self.purge_expired();
            if self.slots.len() >= self.capacity {
                let oldest = self
                    .slots
                    .iter()
                    .min_by_key(|(_, slot)| slot.last_used)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    self.slots.remove(&oldest);
                }
            }
        }

        let now = self.tick();
        self.slots.insert(
            key,
            Slot {
                value,
                inserted: Instant::now(),
                last_used: now,
            },
        );
    }

    /// Drop every entry matching `predicate`.
    pub fn invalidate_where(&mut self, mut predicate: impl FnMut(&K) -> bool) {
        self.slots.retain(|key, _| !predicate(key));
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn purge_expired(&mut self) {
        let ttl = self.ttl;
        self.slots.retain(|_, slot| slot.inserted.elapsed() < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let mut cache = MemoryCache::new(Duration::from_secs(30), 4);
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_least_recently_used_goes_first() {
        let mut cache = MemoryCache::new(Duration::from_secs(30), 2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));

        cache.insert("c", 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));

        cache.invalidate_where(|key| *key == "a");
        assert_eq!(cache.get(&"a"), None);
    }
}
